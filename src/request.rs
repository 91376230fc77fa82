//! Request containers and sub-request fan-out.
//!
//! A client request is normalized at admission into a [`ReqContainer`]:
//! an immutable header plus kind-specific parameters and a mutex-guarded
//! completion state. Workers receive [`SubRequest`] envelopes bound to
//! one medium of the request; the request itself is shared and dropped by
//! whichever sub-request terminates last (the container is the pure data
//! payload, never an owner of workers or queues).

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::proto::reply::{AllocElt, Response};
use crate::proto::request::{ReleaseElt, RequestKind};
use crate::types::{FsType, MediumInfo, ResourceId};

/// Status of one sub-request. Transitions are monotone except that
/// `Todo -> Cancel` is legal; every non-`Todo` status is terminal.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SubStatus {
    #[default]
    Todo,
    Done,
    Error,
    Cancel,
}

impl SubStatus {
    pub fn is_terminal(self) -> bool {
        self != SubStatus::Todo
    }
}

/// Read or write allocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RwKind {
    Read,
    Write,
}

pub(crate) struct FormatParams {
    pub(crate) medium_id: ResourceId,
    pub(crate) fs_type: FsType,
    /// Clear the admin lock once the format succeeds.
    pub(crate) unlock: bool,
    pub(crate) state: Mutex<FormatState>,
}

#[derive(Default)]
pub(crate) struct FormatState {
    /// Medium row bound at admission; the worker takes it on load. `None`
    /// once transferred to a device.
    pub(crate) medium: Option<MediumInfo>,
}

/// One medium slot of an allocation request.
#[derive(Default)]
pub(crate) struct MediumSlot {
    pub(crate) status: SubStatus,
    /// Assigned medium row, DSS-locked by the dispatcher; taken by the
    /// worker when it loads. `None` when the slot rides the worker's
    /// currently mounted medium.
    pub(crate) medium: Option<MediumInfo>,
    /// Pre-allocated response slot the owning worker fills after claiming
    /// the sub-request.
    pub(crate) result: Option<AllocElt>,
}

pub(crate) struct AllocParams {
    pub(crate) rw: RwKind,
    pub(crate) n_required: usize,
    /// Ordered candidate media (read allocations).
    pub(crate) candidates: Vec<ResourceId>,
    /// Tag filter (write allocations).
    pub(crate) tags: Vec<String>,
    /// Minimum free space wanted (write allocations).
    pub(crate) min_size: u64,
    pub(crate) state: Mutex<AllocState>,
}

#[derive(Default)]
pub(crate) struct AllocState {
    /// Cumulative return code; the first non-zero value wins.
    pub(crate) rc: i32,
    /// Cursor into `candidates`; media before it are tried or assigned.
    pub(crate) next_candidate: usize,
    pub(crate) media: SmallVec<[MediumSlot; 4]>,
}

pub(crate) struct ReleaseParams {
    /// Media to synchronize before acknowledging, in arrival order.
    pub(crate) tosync: Vec<ReleaseElt>,
    /// Media acknowledged without synchronization.
    pub(crate) nosync: Vec<ReleaseElt>,
    pub(crate) state: Mutex<ReleaseState>,
}

#[derive(Default)]
pub(crate) struct ReleaseState {
    pub(crate) rc: i32,
    pub(crate) status: SmallVec<[SubStatus; 4]>,
}

pub(crate) enum Payload {
    Format(FormatParams),
    Alloc(AllocParams),
    Release(ReleaseParams),
}

/// A normalized client request.
pub struct ReqContainer {
    pub req_id: u64,
    /// Client socket the responses must reach; opaque to the engine.
    pub socket_id: u64,
    pub received_at: Instant,
    pub(crate) payload: Payload,
}

impl ReqContainer {
    pub(crate) fn new_format(
        req_id: u64,
        socket_id: u64,
        medium: MediumInfo,
        fs_type: FsType,
        unlock: bool,
    ) -> Arc<Self> {
        Arc::new(ReqContainer {
            req_id,
            socket_id,
            received_at: Instant::now(),
            payload: Payload::Format(FormatParams {
                medium_id: medium.id.clone(),
                fs_type,
                unlock,
                state: Mutex::new(FormatState {
                    medium: Some(medium),
                }),
            }),
        })
    }

    pub(crate) fn new_read_alloc(
        req_id: u64,
        socket_id: u64,
        n_required: usize,
        candidates: Vec<ResourceId>,
    ) -> Arc<Self> {
        Arc::new(ReqContainer {
            req_id,
            socket_id,
            received_at: Instant::now(),
            payload: Payload::Alloc(AllocParams {
                rw: RwKind::Read,
                n_required,
                candidates,
                tags: Vec::new(),
                min_size: 0,
                state: Mutex::new(AllocState {
                    media: std::iter::repeat_with(MediumSlot::default)
                        .take(n_required)
                        .collect(),
                    ..AllocState::default()
                }),
            }),
        })
    }

    pub(crate) fn new_write_alloc(
        req_id: u64,
        socket_id: u64,
        n_required: usize,
        tags: Vec<String>,
        min_size: u64,
    ) -> Arc<Self> {
        Arc::new(ReqContainer {
            req_id,
            socket_id,
            received_at: Instant::now(),
            payload: Payload::Alloc(AllocParams {
                rw: RwKind::Write,
                n_required,
                candidates: Vec::new(),
                tags,
                min_size,
                state: Mutex::new(AllocState {
                    media: std::iter::repeat_with(MediumSlot::default)
                        .take(n_required)
                        .collect(),
                    ..AllocState::default()
                }),
            }),
        })
    }

    pub(crate) fn new_release(req_id: u64, socket_id: u64, media: Vec<ReleaseElt>) -> Arc<Self> {
        let (tosync, nosync): (Vec<_>, Vec<_>) = media.into_iter().partition(|e| e.to_sync);
        let n_tosync = tosync.len();
        Arc::new(ReqContainer {
            req_id,
            socket_id,
            received_at: Instant::now(),
            payload: Payload::Release(ReleaseParams {
                tosync,
                nosync,
                state: Mutex::new(ReleaseState {
                    status: std::iter::repeat_n(SubStatus::Todo, n_tosync).collect(),
                    ..ReleaseState::default()
                }),
            }),
        })
    }

    pub fn kind(&self) -> RequestKind {
        match &self.payload {
            Payload::Format(_) => RequestKind::Format,
            Payload::Alloc(p) => match p.rw {
                RwKind::Read => RequestKind::Read,
                RwKind::Write => RequestKind::Write,
            },
            Payload::Release(_) => RequestKind::Release,
        }
    }

    /// Cumulative return code of the request (first non-zero observed).
    pub fn rc(&self) -> i32 {
        match &self.payload {
            Payload::Format(_) => 0,
            Payload::Alloc(p) => p.state.lock().rc,
            Payload::Release(p) => p.state.lock().rc,
        }
    }

    pub(crate) fn alloc(&self) -> &AllocParams {
        match &self.payload {
            Payload::Alloc(p) => p,
            _ => unreachable!("not an allocation request"),
        }
    }

    pub(crate) fn release(&self) -> &ReleaseParams {
        match &self.payload {
            Payload::Release(p) => p,
            _ => unreachable!("not a release request"),
        }
    }

    pub(crate) fn format(&self) -> &FormatParams {
        match &self.payload {
            Payload::Format(p) => p,
            _ => unreachable!("not a format request"),
        }
    }
}

impl std::fmt::Debug for ReqContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqContainer")
            .field("req_id", &self.req_id)
            .field("socket_id", &self.socket_id)
            .field("kind", &self.kind())
            .finish()
    }
}

/// Outcome of updating the completion state of one sub-request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CompletionOutcome {
    /// This update recorded the first error of the request.
    pub(crate) first_error: bool,
    /// Every sub-request now has a terminal status.
    pub(crate) ended: bool,
}

impl AllocParams {
    fn is_ended(state: &AllocState) -> bool {
        state.media.iter().all(|s| s.status.is_terminal())
    }

    /// Record a successful allocation of slot `index`.
    ///
    /// Returns the final allocation response when this was the last slot
    /// and no error was recorded.
    pub(crate) fn complete_done(
        &self,
        index: usize,
        elt: AllocElt,
        req: &ReqContainer,
    ) -> (CompletionOutcome, Option<Response>) {
        let mut state = self.state.lock();
        state.media[index].status = SubStatus::Done;
        state.media[index].result = Some(elt);
        let ended = Self::is_ended(&state);
        let response = if ended && state.rc == 0 {
            Some(self.build_response(&mut state, req))
        } else {
            None
        };
        (
            CompletionOutcome {
                first_error: false,
                ended,
            },
            response,
        )
    }

    /// Record a fatal error on slot `index`. Sets the cumulative rc if
    /// this is the first failure; sibling workers observe it and cancel.
    pub(crate) fn complete_error(&self, index: usize, rc: i32) -> CompletionOutcome {
        let mut state = self.state.lock();
        let first_error = state.rc == 0;
        if first_error {
            state.rc = rc;
        }
        state.media[index].status = SubStatus::Error;
        state.media[index].medium = None;
        CompletionOutcome {
            first_error,
            ended: Self::is_ended(&state),
        }
    }

    /// Cancel slot `index` if a sibling already failed the request.
    ///
    /// Returns `None` when there is no error; otherwise the outcome plus
    /// the assigned medium whose DSS lock the caller must release.
    pub(crate) fn cancel_on_error(
        &self,
        index: usize,
    ) -> Option<(CompletionOutcome, Option<MediumInfo>)> {
        let mut state = self.state.lock();
        if state.rc == 0 {
            return None;
        }
        state.media[index].status = SubStatus::Cancel;
        let medium = state.media[index].medium.take();
        Some((
            CompletionOutcome {
                first_error: false,
                ended: Self::is_ended(&state),
            },
            medium,
        ))
    }

    /// Take the medium assigned to slot `index`, if any.
    pub(crate) fn take_medium(&self, index: usize) -> Option<MediumInfo> {
        self.state.lock().media[index].medium.take()
    }

    /// Put a medium back into slot `index` (retry paths).
    pub(crate) fn put_medium(&self, index: usize, medium: MediumInfo) {
        self.state.lock().media[index].medium = Some(medium);
    }

    /// Reset slot `index` to `Todo` for a retry on another medium.
    pub(crate) fn reset_slot(&self, index: usize) {
        let mut state = self.state.lock();
        state.media[index].status = SubStatus::Todo;
        state.media[index].result = None;
    }

    /// Next untried read candidate, without consuming it.
    pub(crate) fn peek_candidate(&self) -> Option<ResourceId> {
        let state = self.state.lock();
        self.candidates.get(state.next_candidate).cloned()
    }

    /// Next untried read candidate, advancing the shared cursor.
    pub(crate) fn next_candidate(&self) -> Option<ResourceId> {
        let mut state = self.state.lock();
        let id = self.candidates.get(state.next_candidate).cloned()?;
        state.next_candidate += 1;
        Some(id)
    }

    /// Whether a failed sub-request may be retried on another medium.
    ///
    /// Write allocations always can (the pool picks another medium), and
    /// so can any failure not attributed to the medium. A medium-bound
    /// read failure needs a spare candidate.
    pub(crate) fn can_requeue(&self, failure_on_medium: bool) -> bool {
        if self.rw == RwKind::Write || !failure_on_medium {
            return true;
        }
        let state = self.state.lock();
        state.next_candidate < self.candidates.len()
    }

    fn build_response(&self, state: &mut AllocState, req: &ReqContainer) -> Response {
        let media = state
            .media
            .iter_mut()
            .map(|s| s.result.take().expect("done slot without result"))
            .collect();
        match self.rw {
            RwKind::Read => Response::ReadAlloc {
                req_id: req.req_id,
                media,
            },
            RwKind::Write => Response::WriteAlloc {
                req_id: req.req_id,
                media,
            },
        }
    }
}

impl ReleaseParams {
    fn is_ended(state: &ReleaseState) -> bool {
        state.status.iter().all(|s| s.is_terminal())
    }

    /// Record the outcome of one synchronized medium. `rc == 0` marks the
    /// entry done, otherwise error with first-error bookkeeping.
    pub(crate) fn complete(&self, index: usize, rc: i32) -> CompletionOutcome {
        let mut state = self.state.lock();
        let mut first_error = false;
        if rc == 0 {
            state.status[index] = SubStatus::Done;
        } else {
            if state.rc == 0 {
                state.rc = rc;
                first_error = true;
            }
            state.status[index] = SubStatus::Error;
        }
        CompletionOutcome {
            first_error,
            ended: Self::is_ended(&state),
        }
    }

    /// Cancel entry `index` if a sibling already failed the request.
    pub(crate) fn cancel_on_error(&self, index: usize) -> Option<CompletionOutcome> {
        let mut state = self.state.lock();
        if state.rc == 0 {
            return None;
        }
        state.status[index] = SubStatus::Cancel;
        Some(CompletionOutcome {
            first_error: false,
            ended: Self::is_ended(&state),
        })
    }

    /// The release response acknowledging every synchronized medium.
    pub(crate) fn build_response(&self, req: &ReqContainer) -> Response {
        Response::Release {
            req_id: req.req_id,
            media: self.tosync.iter().map(|e| e.medium.clone()).collect(),
        }
    }
}

/// The unit of work handed to a device worker: one medium of one request.
pub(crate) struct SubRequest {
    pub(crate) reqc: Arc<ReqContainer>,
    /// Index of the medium within the owning request.
    pub(crate) medium_index: usize,
    /// Set when an error was attributed to the medium.
    pub(crate) failure_on_medium: bool,
}

impl SubRequest {
    pub(crate) fn new(reqc: Arc<ReqContainer>, medium_index: usize) -> Self {
        SubRequest {
            reqc,
            medium_index,
            failure_on_medium: false,
        }
    }
}

impl std::fmt::Debug for SubRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubRequest")
            .field("req_id", &self.reqc.req_id)
            .field("kind", &self.reqc.kind())
            .field("medium_index", &self.medium_index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AddrType, Family};
    use std::path::PathBuf;

    fn alloc_elt(name: &str) -> AllocElt {
        AllocElt {
            medium: ResourceId::new(Family::Tape, name),
            root_path: PathBuf::from("/mnt/lrs-st0"),
            fs_type: FsType::Ltfs,
            addr_type: AddrType::Path,
            avail_size: 0,
        }
    }

    #[test]
    fn last_done_slot_builds_the_response() {
        let req = ReqContainer::new_read_alloc(
            1,
            0,
            2,
            vec![
                ResourceId::new(Family::Tape, "T1"),
                ResourceId::new(Family::Tape, "T2"),
            ],
        );
        let alloc = req.alloc();

        let (out, resp) = alloc.complete_done(0, alloc_elt("T1"), &req);
        assert!(!out.ended);
        assert!(resp.is_none());

        let (out, resp) = alloc.complete_done(1, alloc_elt("T2"), &req);
        assert!(out.ended);
        match resp.unwrap() {
            Response::ReadAlloc { req_id, media } => {
                assert_eq!(req_id, 1);
                assert_eq!(media.len(), 2);
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn first_error_wins_and_cancels_siblings() {
        let req = ReqContainer::new_write_alloc(2, 0, 2, Vec::new(), 0);
        let alloc = req.alloc();

        let out = alloc.complete_error(0, -libc::EIO);
        assert!(out.first_error);
        assert!(!out.ended);
        assert_eq!(req.rc(), -libc::EIO);

        // A later error does not overwrite the first rc.
        let out = alloc.complete_error(0, -libc::ENOSPC);
        assert!(!out.first_error);
        assert_eq!(req.rc(), -libc::EIO);

        let (out, _medium) = alloc.cancel_on_error(1).unwrap();
        assert!(out.ended);
    }

    #[test]
    fn read_candidates_are_consumed_in_order() {
        let req = ReqContainer::new_read_alloc(
            3,
            0,
            1,
            vec![
                ResourceId::new(Family::Tape, "T1"),
                ResourceId::new(Family::Tape, "T2"),
            ],
        );
        let alloc = req.alloc();
        assert_eq!(alloc.next_candidate().unwrap().name, "T1");
        // One spare candidate left: a medium failure can requeue.
        assert!(alloc.can_requeue(true));
        assert_eq!(alloc.next_candidate().unwrap().name, "T2");
        assert!(!alloc.can_requeue(true));
        assert!(alloc.can_requeue(false));
        assert_eq!(alloc.next_candidate(), None);
    }

    #[test]
    fn release_completion_tracks_every_tosync_medium() {
        let elt = |name: &str| ReleaseElt {
            medium: ResourceId::new(Family::Disk, name),
            size_written: 10,
            nb_obj: 1,
            client_rc: 0,
            to_sync: true,
        };
        let req = ReqContainer::new_release(4, 0, vec![elt("d0"), elt("d1")]);
        let release = req.release();

        let out = release.complete(0, 0);
        assert!(!out.ended);
        let out = release.complete(1, 0);
        assert!(out.ended);
        match release.build_response(&req) {
            Response::Release { media, .. } => assert_eq!(media.len(), 2),
            other => panic!("unexpected response {other:?}"),
        }
    }
}
