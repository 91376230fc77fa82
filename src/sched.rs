//! Dispatcher and retry plane.
//!
//! The scheduler admits client requests, fans them out into sub-requests
//! and routes those to device workers. Three queues tie the planes
//! together: *incoming* for fresh sub-requests, *retry* for sub-requests
//! that could not progress on their assigned medium but whose request can
//! still succeed, and *responses* for everything going back to clients.
//! Requeued formats always travel through the retry queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use nix::errno::Errno;
use parking_lot::Mutex;

use crate::config::Config;
use crate::dev::{AccessMask, Device, DeviceCtx, DeviceSet, FormatIndex};
use crate::dss::{Dss, Entity, hostname};
use crate::ldm::AdapterRegistry;
use crate::proto::reply::{RespContainer, Response};
use crate::proto::request::{Message, Operation, RequestKind};
use crate::queue::TsQueue;
use crate::request::{ReqContainer, SubRequest};
use crate::types::{AdmStatus, Family, FsStatus, MediumInfo, ResourceId};

fn neg(errno: Errno) -> i32 {
    -(errno as i32)
}

/// The three queues shared between the dispatcher and the workers.
pub(crate) struct SchedQueues {
    pub(crate) incoming: TsQueue<SubRequest>,
    pub(crate) retry: TsQueue<SubRequest>,
    pub(crate) responses: TsQueue<RespContainer>,
}

impl SchedQueues {
    pub(crate) fn new() -> Self {
        SchedQueues {
            incoming: TsQueue::new(),
            retry: TsQueue::new(),
            responses: TsQueue::new(),
        }
    }

    /// Queue the single error response of a failed request.
    pub(crate) fn push_error(&self, reqc: &ReqContainer, rc: i32) {
        self.responses.push(RespContainer {
            socket_id: reqc.socket_id,
            resp: Response::Error {
                req_id: reqc.req_id,
                kind: reqc.kind(),
                rc,
            },
        });
    }

    pub(crate) fn push_response(&self, socket_id: u64, resp: Response) {
        self.responses.push(RespContainer { socket_id, resp });
    }
}

/// The Local Resource Scheduler of one resource family on this host.
pub struct Scheduler {
    family: Family,
    config: Arc<Config>,
    dss: Arc<dyn Dss>,
    queues: Arc<SchedQueues>,
    running: Arc<AtomicBool>,
    formats: FormatIndex,
    peers: Arc<Mutex<Vec<Device>>>,
    devices: DeviceSet,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Build a scheduler for `family` on this host. Devices are not
    /// loaded yet; call [`Scheduler::load_devices`].
    pub fn new(
        family: Family,
        config: Config,
        dss: Arc<dyn Dss>,
        registry: AdapterRegistry,
    ) -> Result<Self, Errno> {
        config.validate().map_err(|e| {
            error!("invalid configuration: {}", e);
            Errno::EINVAL
        })?;
        let config = Arc::new(config);
        let queues = Arc::new(SchedQueues::new());
        let running = Arc::new(AtomicBool::new(true));
        let formats = FormatIndex::new();
        let peers = Arc::new(Mutex::new(Vec::new()));
        let ctx = DeviceCtx {
            config: Arc::clone(&config),
            registry: Arc::new(registry),
            dss: Arc::clone(&dss),
            queues: Arc::clone(&queues),
            formats: formats.clone(),
            running: Arc::clone(&running),
            peers: Arc::clone(&peers),
        };
        let host = hostname();
        Ok(Scheduler {
            family,
            config,
            dss,
            queues,
            running,
            formats,
            peers,
            devices: DeviceSet::new(ctx, family, host),
            dispatcher: Mutex::new(None),
        })
    }

    /// Load every usable device of this family from the DSS and start
    /// their workers.
    pub fn load_devices(&self) -> Result<(), Errno> {
        self.devices.load()
    }

    pub fn devices(&self) -> &DeviceSet {
        &self.devices
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn handle(&self) -> SchedHandle {
        SchedHandle {
            queues: Arc::clone(&self.queues),
            running: Arc::clone(&self.running),
            peers: Arc::clone(&self.peers),
            dss: Arc::clone(&self.dss),
            family: self.family,
        }
    }

    /// Pop one outbound response, waiting up to `timeout`.
    pub fn pop_response(&self, timeout: Duration) -> Option<RespContainer> {
        self.queues.responses.pop_timeout(timeout)
    }

    /// Start the background dispatcher thread.
    pub fn start(&self) -> std::io::Result<()> {
        let mut guard = self.dispatcher.lock();
        if guard.is_some() {
            return Ok(());
        }
        let sched = self.handle();
        let handle = thread::Builder::new()
            .name(format!("lrs-sched-{}", self.family))
            .spawn(move || {
                while sched.running.load(Ordering::Acquire) {
                    if sched.run_once() == 0 {
                        thread::sleep(Duration::from_millis(10));
                    }
                }
            })?;
        *guard = Some(handle);
        Ok(())
    }

    /// One dispatching pass over the retry and incoming queues. Returns
    /// the number of sub-requests assigned. Exposed so embedders driving
    /// the engine synchronously (and the test suite) can pump the
    /// dispatcher themselves.
    pub fn run_once(&self) -> usize {
        self.handle().run_once()
    }

    /// Shut the engine down: force pending sync epochs out, stop every
    /// worker, join the dispatcher.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        for device in self.devices.list() {
            device.notify();
        }
        if let Some(handle) = self.dispatcher.lock().take() {
            let _ = handle.join();
        }
        self.devices.clear();
    }

    /// Admit one decoded client request.
    pub fn push_request(&self, socket_id: u64, msg: Message) {
        let req_id = msg.req_id;
        match msg.op {
            Operation::Ping => {
                self.queues.push_response(socket_id, Response::Ping { req_id });
            }
            Operation::Notify { target, add_device } => {
                self.admit_notify(socket_id, req_id, target, add_device);
            }
            Operation::Format {
                medium,
                fs_type,
                unlock,
            } => {
                self.admit_format(socket_id, req_id, medium, fs_type, unlock);
            }
            Operation::ReadAlloc {
                n_required,
                candidates,
            } => {
                if n_required == 0
                    || candidates.len() < n_required
                    || candidates.iter().any(|c| c.family != self.family)
                {
                    self.reject(socket_id, req_id, RequestKind::Read, neg(Errno::EINVAL));
                    return;
                }
                let reqc =
                    ReqContainer::new_read_alloc(req_id, socket_id, n_required, candidates);
                for index in 0..n_required {
                    self.queues
                        .incoming
                        .push(SubRequest::new(Arc::clone(&reqc), index));
                }
            }
            Operation::WriteAlloc {
                n_required,
                family,
                tags,
                min_size,
            } => {
                if n_required == 0 || family != self.family {
                    self.reject(socket_id, req_id, RequestKind::Write, neg(Errno::EINVAL));
                    return;
                }
                let reqc =
                    ReqContainer::new_write_alloc(req_id, socket_id, n_required, tags, min_size);
                for index in 0..n_required {
                    self.queues
                        .incoming
                        .push(SubRequest::new(Arc::clone(&reqc), index));
                }
            }
            Operation::Release { media } => {
                self.admit_release(socket_id, req_id, media);
            }
        }
    }

    fn reject(&self, socket_id: u64, req_id: u64, kind: RequestKind, rc: i32) {
        self.queues.push_response(
            socket_id,
            Response::Error { req_id, kind, rc },
        );
    }

    fn admit_notify(&self, socket_id: u64, req_id: u64, target: ResourceId, add_device: bool) {
        if !add_device || target.family != self.family {
            self.reject(socket_id, req_id, RequestKind::Notify, neg(Errno::ENOTSUP));
            return;
        }
        match self.devices.add(&target.name) {
            Ok(()) => {
                info!("device '{}' registered", target.name);
                self.queues
                    .push_response(socket_id, Response::Notify { req_id });
            }
            Err(e) => self.reject(socket_id, req_id, RequestKind::Notify, neg(e)),
        }
    }

    fn admit_format(
        &self,
        socket_id: u64,
        req_id: u64,
        medium: ResourceId,
        fs_type: crate::types::FsType,
        unlock: bool,
    ) {
        if medium.family != self.family {
            self.reject(socket_id, req_id, RequestKind::Format, neg(Errno::EINVAL));
            return;
        }
        if !self.formats.insert(&medium) {
            warn!("medium '{}' is already being formatted", medium.name);
            self.reject(socket_id, req_id, RequestKind::Format, neg(Errno::EEXIST));
            return;
        }

        let admitted = self.dss.media_get(&medium).and_then(|mut row| {
            if row.adm_status == AdmStatus::Failed {
                return Err(Errno::EPERM);
            }
            match self.dss.lock(&Entity::Medium(medium.clone())) {
                Ok(()) => {}
                // The lock is ours already when the medium sits in one of
                // our drives; the owning worker formats it in place.
                Err(Errno::EEXIST) if self.find_device_holding(&medium).is_some() => {}
                Err(e) => return Err(e),
            }
            row.fs_type = fs_type;
            Ok(row)
        });
        match admitted {
            Ok(row) => {
                let reqc = ReqContainer::new_format(req_id, socket_id, row, fs_type, unlock);
                self.queues.incoming.push(SubRequest::new(reqc, 0));
            }
            Err(e) => {
                self.formats.remove(&medium);
                self.reject(socket_id, req_id, RequestKind::Format, neg(e));
            }
        }
    }

    fn admit_release(
        &self,
        socket_id: u64,
        req_id: u64,
        media: Vec<crate::proto::request::ReleaseElt>,
    ) {
        let reqc = ReqContainer::new_release(req_id, socket_id, media);
        let release = reqc.release();

        // Media released without sync only mark the client I/O done.
        for elt in &release.nosync {
            if let Some(device) = self.find_device_holding(&elt.medium) {
                device.release_ongoing_io();
            }
        }

        if release.tosync.is_empty() {
            self.queues
                .push_response(socket_id, release.build_response(&reqc));
            return;
        }

        for index in 0..release.tosync.len() {
            let elt = &release.tosync[index];
            let enrolled = self
                .find_device_holding(&elt.medium)
                .filter(|d| d.is_release_ready())
                .map(|d| d.push_sync(SubRequest::new(Arc::clone(&reqc), index)))
                .unwrap_or(false);
            if !enrolled {
                warn!(
                    "release: no device holds medium '{}', failing request {}",
                    elt.medium.name, req_id
                );
                let outcome = release.complete(index, neg(Errno::ENODEV));
                if outcome.first_error {
                    self.queues.push_error(&reqc, neg(Errno::ENODEV));
                }
            }
        }
    }

    fn find_device_holding(&self, medium: &ResourceId) -> Option<Device> {
        self.peers
            .lock()
            .iter()
            .find(|d| d.loaded_medium().as_ref() == Some(medium))
            .cloned()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.running.load(Ordering::Acquire) {
            self.stop();
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("family", &self.family)
            .field("devices", &self.devices.len())
            .finish()
    }
}

/// Dispatching state shared with the dispatcher thread.
struct SchedHandle {
    queues: Arc<SchedQueues>,
    running: Arc<AtomicBool>,
    peers: Arc<Mutex<Vec<Device>>>,
    dss: Arc<dyn Dss>,
    family: Family,
}

impl SchedHandle {
    fn devices(&self) -> Vec<Device> {
        self.peers.lock().clone()
    }

    /// One pass: try to place every queued sub-request once; the ones no
    /// worker can take yet go back to the retry plane.
    fn run_once(&self) -> usize {
        let mut pending: Vec<SubRequest> = self.queues.retry.drain();
        pending.extend(self.queues.incoming.drain());

        let mut assigned = 0;
        for sub in pending {
            match self.dispatch_sub(sub) {
                DispatchOutcome::Assigned | DispatchOutcome::Resolved => assigned += 1,
                DispatchOutcome::NoWorker(sub) => self.queues.retry.push(sub),
            }
        }
        assigned
    }

    fn dispatch_sub(&self, sub: SubRequest) -> DispatchOutcome {
        match sub.reqc.kind() {
            RequestKind::Format => self.dispatch_format(sub),
            RequestKind::Read => self.dispatch_read(sub),
            RequestKind::Write => self.dispatch_write(sub),
            other => {
                error!("unexpected {} sub-request in dispatch queue", other);
                DispatchOutcome::Resolved
            }
        }
    }

    /// A format is pinned to its medium: prefer the device already
    /// holding it, then an empty device, then any ready device (the
    /// worker swaps media itself).
    fn dispatch_format(&self, sub: SubRequest) -> DispatchOutcome {
        let target = sub.reqc.format().medium_id.clone();
        let devices: Vec<Device> = self
            .devices()
            .into_iter()
            .filter(|d| d.access().contains(AccessMask::FORMAT))
            .collect();

        let preferred = devices
            .iter()
            .find(|d| d.loaded_medium().as_ref() == Some(&target) && d.reserve())
            .or_else(|| {
                devices
                    .iter()
                    .find(|d| d.loaded_medium().is_none() && d.reserve())
            })
            .or_else(|| devices.iter().find(|d| d.reserve()));

        match preferred {
            Some(device) => {
                debug!(
                    "dispatch: format '{}' to device '{}'",
                    target.name,
                    device.id().name
                );
                device.assign(sub);
                DispatchOutcome::Assigned
            }
            None => DispatchOutcome::NoWorker(sub),
        }
    }

    fn dispatch_read(&self, sub: SubRequest) -> DispatchOutcome {
        let reqc = sub.reqc.clone();
        let index = sub.medium_index;
        let alloc = reqc.alloc();
        let devices: Vec<Device> = self
            .devices()
            .into_iter()
            .filter(|d| d.access().contains(AccessMask::READ))
            .collect();

        // Retry with a still-locked medium from a failed device.
        if let Some(medium) = alloc.take_medium(index) {
            let Some(device) = devices.iter().find(|d| d.reserve()) else {
                alloc.put_medium(index, medium);
                return DispatchOutcome::NoWorker(sub);
            };
            alloc.put_medium(index, medium);
            device.assign(sub);
            return DispatchOutcome::Assigned;
        }

        loop {
            // Ride a drive that already holds the next candidate.
            let ride = devices.iter().find(|d| {
                alloc
                    .peek_candidate()
                    .is_some_and(|c| d.loaded_medium() == Some(c))
            });
            if let Some(device) = ride {
                if device.reserve() {
                    let _ = alloc.next_candidate();
                    device.assign(sub);
                    return DispatchOutcome::Assigned;
                }
                // The holder is busy; wait for it rather than moving the
                // medium between drives.
                return DispatchOutcome::NoWorker(sub);
            }

            let Some(device) = devices.iter().find(|d| d.reserve()) else {
                return DispatchOutcome::NoWorker(sub);
            };

            let Some(candidate) = alloc.peek_candidate() else {
                device.unreserve();
                let outcome = alloc.complete_error(index, neg(Errno::ENODEV));
                if outcome.first_error {
                    self.queues.push_error(&reqc, neg(Errno::ENODEV));
                    self.cancel_peers(reqc.req_id);
                }
                return DispatchOutcome::Resolved;
            };

            match self.acquire_medium(&candidate) {
                Ok(row) => {
                    let _ = alloc.next_candidate();
                    alloc.put_medium(index, row);
                    device.assign(sub);
                    return DispatchOutcome::Assigned;
                }
                // Locked elsewhere: the medium is in use, not bad. Keep
                // the candidate and try again later.
                Err(Errno::EWOULDBLOCK) | Err(Errno::EEXIST) => {
                    device.unreserve();
                    return DispatchOutcome::NoWorker(sub);
                }
                Err(e) => {
                    debug!(
                        "dispatch: candidate '{}' unusable ({}), trying next",
                        candidate.name, e
                    );
                    let _ = alloc.next_candidate();
                    device.unreserve();
                    continue;
                }
            }
        }
    }

    fn dispatch_write(&self, sub: SubRequest) -> DispatchOutcome {
        let reqc = sub.reqc.clone();
        let index = sub.medium_index;
        let alloc = reqc.alloc();
        let devices: Vec<Device> = self
            .devices()
            .into_iter()
            .filter(|d| d.access().contains(AccessMask::WRITE))
            .collect();

        // Ride a mounted medium that satisfies the request.
        let ride = devices.iter().find(|d| {
            d.loaded_medium()
                .and_then(|id| self.dss.media_get(&id).ok())
                .is_some_and(|m| Self::writable(&m, &alloc.tags, alloc.min_size))
                && d.reserve()
        });
        if let Some(device) = ride {
            device.assign(sub);
            return DispatchOutcome::Assigned;
        }

        let Some(device) = devices.iter().find(|d| d.reserve()) else {
            return DispatchOutcome::NoWorker(sub);
        };

        let loaded: Vec<ResourceId> = devices.iter().filter_map(|d| d.loaded_medium()).collect();
        let chosen = self
            .dss
            .media_list(self.family)
            .unwrap_or_default()
            .into_iter()
            .filter(|m| Self::writable(m, &alloc.tags, alloc.min_size))
            .filter(|m| !loaded.contains(&m.id))
            .find(|m| self.dss.lock(&Entity::Medium(m.id.clone())).is_ok());

        match chosen {
            Some(row) => {
                debug!(
                    "dispatch: write on medium '{}' via device '{}'",
                    row.id.name,
                    device.id().name
                );
                alloc.put_medium(index, row);
                device.assign(sub);
                DispatchOutcome::Assigned
            }
            None => {
                device.unreserve();
                let outcome = alloc.complete_error(index, neg(Errno::ENOSPC));
                if outcome.first_error {
                    self.queues.push_error(&reqc, neg(Errno::ENOSPC));
                    self.cancel_peers(reqc.req_id);
                }
                DispatchOutcome::Resolved
            }
        }
    }

    fn writable(medium: &MediumInfo, tags: &[String], min_size: u64) -> bool {
        medium.adm_status == AdmStatus::Unlocked
            && medium.fs_status != FsStatus::Full
            && !medium.fs_label.is_empty()
            && medium.has_tags(tags)
            && medium.stats.phys_free >= min_size
    }

    /// Fetch a candidate row and take its distributed lock.
    fn acquire_medium(&self, id: &ResourceId) -> Result<MediumInfo, Errno> {
        let row = self.dss.media_get(id)?;
        if row.adm_status != AdmStatus::Unlocked {
            return Err(Errno::EPERM);
        }
        self.dss.lock(&Entity::Medium(id.clone()))?;
        Ok(row)
    }

    fn cancel_peers(&self, req_id: u64) {
        for device in self.devices() {
            device.clear_ongoing_io(req_id);
            device.notify();
        }
    }
}

enum DispatchOutcome {
    /// Handed to a worker.
    Assigned,
    /// Terminally resolved here (error response emitted).
    Resolved,
    /// No worker can take it yet; back to the retry plane.
    NoWorker(SubRequest),
}
