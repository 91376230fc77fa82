//! Per-device synchronization batch.
//!
//! Write acknowledgements with the to-sync flag are enrolled here and
//! flushed in epochs. The batch is the triple (pending sub-requests,
//! oldest arrival, summed written size); the owning worker's mutex guards
//! every access. Threshold and wakeup computations are pure so they can
//! be pinned down by unit tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{MINSLEEP, SyncThresholds};
use crate::request::{ReqContainer, SubRequest};

/// Pending synchronization work of one device.
pub(crate) struct SyncBatch {
    entries: Vec<SubRequest>,
    /// Arrival time of the oldest enrolled release.
    oldest: Option<Instant>,
    /// Summed written sizes of the enrolled releases.
    bytes: u64,
}

impl SyncBatch {
    pub(crate) fn new() -> Self {
        SyncBatch {
            entries: Vec::new(),
            oldest: None,
            bytes: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }

    pub(crate) fn oldest(&self) -> Option<Instant> {
        self.oldest
    }

    /// Snapshot of the enrolled `(request, index)` pairs, in order.
    pub(crate) fn snapshot(&self) -> Vec<(Arc<ReqContainer>, usize)> {
        self.entries
            .iter()
            .map(|e| (e.reqc.clone(), e.medium_index))
            .collect()
    }

    /// Whether a release of `medium` for the same request is already
    /// enrolled. Duplicates are coalesced at enrollment; the second copy
    /// shares the first one's response.
    pub(crate) fn contains_medium(
        &self,
        req_id: u64,
        medium: &crate::types::ResourceId,
    ) -> bool {
        self.entries.iter().any(|e| {
            e.reqc.req_id == req_id
                && e.reqc.release().tosync[e.medium_index].medium == *medium
        })
    }

    /// Enroll a release sub-request. Arrival order is preserved.
    pub(crate) fn push(&mut self, sub: SubRequest) {
        let written = sub.reqc.release().tosync[sub.medium_index].size_written;
        let arrival = sub.reqc.received_at;
        self.bytes += written;
        match self.oldest {
            Some(oldest) if oldest <= arrival => {}
            _ => self.oldest = Some(arrival),
        }
        self.entries.push(sub);
    }

    /// Remove the entries selected by `pred`, fixing up size and oldest.
    pub(crate) fn remove_where(
        &mut self,
        mut pred: impl FnMut(&SubRequest) -> bool,
    ) -> Vec<SubRequest> {
        let mut removed = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            if pred(&self.entries[i]) {
                removed.push(self.entries.remove(i));
            } else {
                i += 1;
            }
        }
        if !removed.is_empty() {
            for sub in &removed {
                self.bytes -=
                    sub.reqc.release().tosync[sub.medium_index].size_written;
            }
            self.oldest = self.entries.iter().map(|e| e.reqc.received_at).min();
        }
        removed
    }

    /// Take every entry, resetting the triple to empty.
    pub(crate) fn take_all(&mut self) -> Vec<SubRequest> {
        self.bytes = 0;
        self.oldest = None;
        std::mem::take(&mut self.entries)
    }
}

/// Whether any of the three flush thresholds is reached. All thresholds
/// are inclusive.
pub(crate) fn thresholds_reached(
    batch: &SyncBatch,
    thresholds: &SyncThresholds,
    now: Instant,
) -> bool {
    if batch.is_empty() {
        return false;
    }
    if batch.len() >= thresholds.nb_req {
        return true;
    }
    if batch.bytes() >= thresholds.wsize {
        return true;
    }
    match batch.oldest() {
        Some(oldest) => oldest + thresholds.time <= now,
        None => false,
    }
}

/// Next wakeup deadline of the worker.
///
/// With an empty batch the worker sleeps a full sync period; otherwise it
/// wakes at the oldest entry's deadline, but never sooner than
/// `MINSLEEP` from now.
pub(crate) fn wakeup_date(batch: &SyncBatch, sync_time: Duration, now: Instant) -> Instant {
    match batch.oldest() {
        None => now + sync_time,
        Some(oldest) => {
            let deadline = oldest + sync_time;
            let floor = now + MINSLEEP;
            if deadline < floor { floor } else { deadline }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::request::ReleaseElt;
    use crate::request::ReqContainer;
    use crate::types::{Family, ResourceId};

    fn release_sub(req_id: u64, sizes: &[u64], index: usize) -> SubRequest {
        let media = sizes
            .iter()
            .enumerate()
            .map(|(i, size)| ReleaseElt {
                medium: ResourceId::new(Family::Tape, format!("T{i}")),
                size_written: *size,
                nb_obj: 1,
                client_rc: 0,
                to_sync: true,
            })
            .collect();
        SubRequest::new(ReqContainer::new_release(req_id, 0, media), index)
    }

    fn thresholds(nb_req: usize, time: Duration, wsize: u64) -> SyncThresholds {
        SyncThresholds {
            time,
            nb_req,
            wsize,
        }
    }

    #[test]
    fn triple_tracks_enrollments() {
        let mut batch = SyncBatch::new();
        assert!(batch.is_empty());
        batch.push(release_sub(1, &[100], 0));
        batch.push(release_sub(2, &[50], 0));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.bytes(), 150);
        assert!(batch.oldest().is_some());

        let taken = batch.take_all();
        assert_eq!(taken.len(), 2);
        assert!(batch.is_empty());
        assert_eq!(batch.bytes(), 0);
        assert_eq!(batch.oldest(), None);
    }

    #[test]
    fn duplicate_enrollment_is_detected() {
        let mut batch = SyncBatch::new();
        let sub = release_sub(7, &[10, 20], 1);
        let enrolled = ResourceId::new(Family::Tape, "T1");
        let other = ResourceId::new(Family::Tape, "T0");
        assert!(!batch.contains_medium(7, &enrolled));
        batch.push(sub);
        assert!(batch.contains_medium(7, &enrolled));
        assert!(!batch.contains_medium(7, &other));
        assert!(!batch.contains_medium(8, &enrolled));
    }

    #[test]
    fn count_threshold_is_inclusive() {
        let mut batch = SyncBatch::new();
        let t = thresholds(2, Duration::from_secs(600), u64::MAX);
        batch.push(release_sub(1, &[1], 0));
        assert!(!thresholds_reached(&batch, &t, Instant::now()));
        batch.push(release_sub(2, &[1], 0));
        assert!(thresholds_reached(&batch, &t, Instant::now()));
    }

    #[test]
    fn size_threshold_is_inclusive() {
        let mut batch = SyncBatch::new();
        let t = thresholds(100, Duration::from_secs(600), 4096);
        batch.push(release_sub(1, &[4096], 0));
        assert!(thresholds_reached(&batch, &t, Instant::now()));
    }

    #[test]
    fn time_threshold_counts_from_oldest_arrival() {
        let mut batch = SyncBatch::new();
        let t = thresholds(100, Duration::from_millis(50), u64::MAX);
        batch.push(release_sub(1, &[1], 0));
        let now = Instant::now();
        assert!(!thresholds_reached(&batch, &t, now));
        assert!(thresholds_reached(&batch, &t, now + Duration::from_millis(60)));
    }

    #[test]
    fn empty_batch_never_flushes() {
        let batch = SyncBatch::new();
        let t = thresholds(1, Duration::ZERO, 0);
        assert!(!thresholds_reached(&batch, &t, Instant::now()));
    }

    #[test]
    fn wakeup_respects_minsleep() {
        let mut batch = SyncBatch::new();
        let now = Instant::now();

        // Empty batch: a full period from now.
        let d = wakeup_date(&batch, Duration::from_millis(200), now);
        assert_eq!(d, now + Duration::from_millis(200));

        // A deadline already in the past is clamped to now + MINSLEEP.
        batch.push(release_sub(1, &[1], 0));
        let late = now + Duration::from_secs(10);
        let d = wakeup_date(&batch, Duration::from_millis(1), late);
        assert_eq!(d, late + MINSLEEP);
    }

    #[test]
    fn remove_where_fixes_the_triple() {
        let mut batch = SyncBatch::new();
        batch.push(release_sub(1, &[100], 0));
        batch.push(release_sub(2, &[50], 0));
        let removed = batch.remove_where(|sub| sub.reqc.req_id == 1);
        assert_eq!(removed.len(), 1);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.bytes(), 50);
    }
}
