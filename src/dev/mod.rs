//! Device set and per-device shared state.
//!
//! Each drive is owned by exactly one worker thread; everyone else — the
//! dispatcher, sibling workers, the admin paths — goes through the
//! [`Device`] handle, which only touches the shared state under the
//! device mutex and wakes the worker through its condvar.

pub(crate) mod sync;
pub(crate) mod worker;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::{error, info, warn};
use nix::errno::Errno;
use parking_lot::{Condvar, Mutex};

use crate::config::Config;
use crate::dss::{Dss, Entity};
use crate::ldm::AdapterRegistry;
use crate::request::SubRequest;
use crate::sched::SchedQueues;
use crate::types::{AdmStatus, DeviceInfo, Family, MediumInfo, OpStatus, ResourceId};

use sync::SyncBatch;

bitflags! {
    /// Which sub-schedulers currently hold access to a device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AccessMask: u32 {
        const READ   = 1 << 0;
        const WRITE  = 1 << 1;
        const FORMAT = 1 << 2;
    }
}

/// Lifecycle of the worker thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ThreadState {
    Running,
    /// Stop requested; the worker drains and exits.
    Stopping,
    Stopped,
}

/// Media currently being formatted, engine-wide. Prevents two format
/// requests for the same medium from racing.
#[derive(Clone, Debug, Default)]
pub struct FormatIndex(Arc<Mutex<HashSet<ResourceId>>>);

impl FormatIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a medium; false if a format is already ongoing.
    pub fn insert(&self, id: &ResourceId) -> bool {
        self.0.lock().insert(id.clone())
    }

    pub fn remove(&self, id: &ResourceId) {
        self.0.lock().remove(id);
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.0.lock().contains(id)
    }
}

/// Context shared by every worker of one scheduler.
#[derive(Clone)]
pub(crate) struct DeviceCtx {
    pub(crate) config: Arc<Config>,
    pub(crate) registry: Arc<AdapterRegistry>,
    pub(crate) dss: Arc<dyn Dss>,
    pub(crate) queues: Arc<SchedQueues>,
    pub(crate) formats: FormatIndex,
    /// Cleared when the engine shuts down; forces pending syncs out.
    pub(crate) running: Arc<AtomicBool>,
    /// Every device of the scheduler, for cross-worker cancellation.
    pub(crate) peers: Arc<Mutex<Vec<Device>>>,
}

/// Mutable state of one device, guarded by the device mutex.
pub(crate) struct DeviceState {
    pub(crate) info: DeviceInfo,
    pub(crate) op_status: OpStatus,
    /// Loaded medium, if any. Exclusively owned by this worker.
    pub(crate) medium: Option<MediumInfo>,
    /// Mount path; `Some` exactly when `op_status == Mounted`.
    pub(crate) mnt_path: Option<PathBuf>,
    /// Single-slot inbox.
    pub(crate) sub_request: Option<SubRequest>,
    /// The dispatcher reserved this device for an assignment in flight.
    pub(crate) ongoing_scheduled: bool,
    /// Request id of the client I/O in flight on this device.
    pub(crate) ongoing_io: Option<u64>,
    pub(crate) needs_sync: bool,
    pub(crate) sync: SyncBatch,
    /// Last non-zero client rc seen on release; forces an errorless
    /// flush.
    pub(crate) last_client_rc: i32,
    pub(crate) technology: Option<String>,
    pub(crate) thread: ThreadState,
    /// Fatal-error status word of the worker.
    pub(crate) thread_status: i32,
}

pub(crate) struct DeviceShared {
    pub(crate) id: ResourceId,
    pub(crate) dev_path: PathBuf,
    pub(crate) state: Mutex<DeviceState>,
    pub(crate) cond: Condvar,
    /// [`AccessMask`] bits; written atomically by the dispatchers.
    pub(crate) access: AtomicU32,
    pub(crate) ctx: DeviceCtx,
}

/// Handle to one device, cloneable and shared with the dispatcher.
#[derive(Clone)]
pub struct Device {
    pub(crate) shared: Arc<DeviceShared>,
}

impl Device {
    pub fn id(&self) -> &ResourceId {
        &self.shared.id
    }

    pub fn family(&self) -> Family {
        self.shared.id.family
    }

    pub fn op_status(&self) -> OpStatus {
        self.shared.state.lock().op_status
    }

    /// Technology of the drive (e.g. LTO generation), when the model is
    /// mapped by the configuration.
    pub fn technology(&self) -> Option<String> {
        self.shared.state.lock().technology.clone()
    }

    /// Identifier of the loaded medium, if any.
    pub fn loaded_medium(&self) -> Option<ResourceId> {
        self.shared.state.lock().medium.as_ref().map(|m| m.id.clone())
    }

    pub fn access(&self) -> AccessMask {
        AccessMask::from_bits_truncate(self.shared.access.load(Ordering::Acquire))
    }

    pub fn set_access(&self, mask: AccessMask) {
        self.shared.access.store(mask.bits(), Ordering::Release);
    }

    /// A device is dispatchable iff its thread runs, the device is admin
    /// unlocked and operational, its inbox is free, no client I/O is in
    /// flight and no sync flush is pending.
    pub fn is_sched_ready(&self) -> bool {
        let state = self.shared.state.lock();
        state.thread == ThreadState::Running
            && state.ongoing_io.is_none()
            && !state.needs_sync
            && state.sub_request.is_none()
            && !state.ongoing_scheduled
            && state.op_status != OpStatus::Failed
            && state.info.adm_status == AdmStatus::Unlocked
    }

    pub fn is_online(&self) -> bool {
        let state = self.shared.state.lock();
        state.thread == ThreadState::Running && state.info.adm_status == AdmStatus::Unlocked
    }

    /// A device can take release enrollments until its thread stops.
    pub(crate) fn is_release_ready(&self) -> bool {
        self.shared.state.lock().thread != ThreadState::Stopped
    }

    /// Reserve the device for an assignment the dispatcher is preparing.
    pub(crate) fn reserve(&self) -> bool {
        let mut state = self.shared.state.lock();
        let ready = state.thread == ThreadState::Running
            && state.ongoing_io.is_none()
            && !state.needs_sync
            && state.sub_request.is_none()
            && !state.ongoing_scheduled
            && state.op_status != OpStatus::Failed
            && state.info.adm_status == AdmStatus::Unlocked;
        if ready {
            state.ongoing_scheduled = true;
        }
        ready
    }

    pub(crate) fn unreserve(&self) {
        self.shared.state.lock().ongoing_scheduled = false;
    }

    /// Hand a sub-request to the worker. The device must have been
    /// reserved by the caller.
    pub(crate) fn assign(&self, sub: SubRequest) {
        {
            let mut state = self.shared.state.lock();
            debug_assert!(state.sub_request.is_none());
            state.sub_request = Some(sub);
            state.ongoing_scheduled = false;
        }
        self.notify();
    }

    /// Enroll a release sub-request into the sync batch.
    ///
    /// Duplicates for the same `(request, medium)` are coalesced; they
    /// share the response of the first enrollment. Returns false when the
    /// worker is already stopped.
    pub(crate) fn push_sync(&self, sub: SubRequest) -> bool {
        let reqc = sub.reqc.clone();
        let index = sub.medium_index;
        // The tosync list itself is immutable request data.
        let medium = reqc.release().tosync[index].medium.clone();
        let client_rc = reqc.release().tosync[index].client_rc;

        let duplicate = {
            let mut state = self.shared.state.lock();
            if state.thread == ThreadState::Stopped {
                return false;
            }
            if state.sync.contains_medium(reqc.req_id, &medium) {
                true
            } else {
                if client_rc != 0 {
                    state.last_client_rc = client_rc;
                }
                // The release acknowledges the client I/O on this device.
                state.ongoing_io = None;
                state.sync.push(sub);
                false
            }
        };

        if duplicate {
            info!(
                "release: duplicate for medium '{}' of request {} coalesced",
                medium.name, reqc.req_id
            );
            let outcome = reqc.release().complete(index, 0);
            if outcome.ended && reqc.rc() == 0 {
                self.shared
                    .ctx
                    .queues
                    .push_response(reqc.socket_id, reqc.release().build_response(&reqc));
            }
            return true;
        }
        self.notify();
        true
    }

    /// Clear the in-flight I/O marker if it belongs to `req_id`.
    pub(crate) fn clear_ongoing_io(&self, req_id: u64) {
        let mut state = self.shared.state.lock();
        if state.ongoing_io == Some(req_id) {
            state.ongoing_io = None;
        }
    }

    /// Mark the client I/O on this device done, whoever started it.
    pub(crate) fn release_ongoing_io(&self) {
        self.shared.state.lock().ongoing_io = None;
    }

    /// Wake the worker.
    pub(crate) fn notify(&self) {
        self.shared.cond.notify_all();
    }

    /// Ask the worker to drain and exit.
    pub fn signal_stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.thread == ThreadState::Running {
                state.thread = ThreadState::Stopping;
            }
        }
        self.notify();
    }

    /// Ask the worker to exit with an error status.
    pub fn signal_stop_on_error(&self, rc: i32) {
        {
            let mut state = self.shared.state.lock();
            if state.thread_status == 0 {
                state.thread_status = rc;
            }
            if state.thread == ThreadState::Running {
                state.thread = ThreadState::Stopping;
            }
        }
        self.notify();
    }

    /// Wait until the worker reaches `Stopped`, up to `timeout`.
    pub(crate) fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.thread != ThreadState::Stopped {
            if self.shared.cond.wait_until(&mut state, deadline).timed_out() {
                return state.thread == ThreadState::Stopped;
            }
        }
        true
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.shared.id)
            .field("op_status", &self.op_status())
            .finish()
    }
}

struct DeviceEntry {
    device: Device,
    handle: Option<JoinHandle<i32>>,
}

/// All devices of one scheduler, with their worker threads.
pub struct DeviceSet {
    entries: Mutex<Vec<DeviceEntry>>,
    ctx: DeviceCtx,
    family: Family,
    host: String,
}

impl DeviceSet {
    pub(crate) fn new(ctx: DeviceCtx, family: Family, host: String) -> Self {
        DeviceSet {
            entries: Mutex::new(Vec::new()),
            ctx,
            family,
            host,
        }
    }

    /// Load every usable device of `(family, host)` from the DSS, take
    /// their distributed locks and start their workers. Partial failures
    /// keep the other devices alive; the first error is reported once
    /// everything was attempted. No usable device at all is `ENXIO`.
    pub fn load(&self) -> Result<(), Errno> {
        let devices = self.ctx.dss.get_usable_devices(self.family, &self.host)?;
        let mut first_err = None;
        for info in devices {
            if let Err(rc) = self.start_one(info) {
                first_err.get_or_insert(rc);
            }
        }
        if self.entries.lock().is_empty() {
            return Err(first_err.unwrap_or(Errno::ENXIO));
        }
        match first_err {
            Some(rc) => Err(rc),
            None => Ok(()),
        }
    }

    /// Register one device by serial and start its worker.
    pub fn add(&self, serial: &str) -> Result<(), Errno> {
        let mut found = self
            .ctx
            .dss
            .device_get(self.family, serial)?
            .into_iter()
            .filter(|d| d.host == self.host && d.adm_status == AdmStatus::Unlocked);
        let info = found.next().ok_or_else(|| {
            info!(
                "Device ({}:{}) not found: check device status and host",
                self.family, serial
            );
            Errno::ENXIO
        })?;
        if self.get(&info.id).is_some() {
            return Err(Errno::EEXIST);
        }
        self.start_one(info)
    }

    fn start_one(&self, info: DeviceInfo) -> Result<(), Errno> {
        // Sanity-check the on-host device before taking the lock.
        // Families without drive control skip the query.
        if let Ok(drive) = self.ctx.registry.drive(info.id.family) {
            let state = drive.query(&info.path).inspect_err(|e| {
                error!(
                    "cannot query device '{}' at '{}': {}",
                    info.id.name,
                    info.path.display(),
                    e
                );
            })?;
            if let Some(serial) = &state.serial {
                if info.id.family == Family::Tape && serial != &info.id.name {
                    error!(
                        "device '{}' reports serial '{}', refusing to use it",
                        info.id.name, serial
                    );
                    return Err(Errno::EINVAL);
                }
            }
        }

        self.ctx.dss.lock(&Entity::Device(info.id.clone()))?;

        let technology = info
            .model
            .as_deref()
            .and_then(|m| self.ctx.config.technology_of(m))
            .map(str::to_string);

        let shared = Arc::new(DeviceShared {
            id: info.id.clone(),
            dev_path: info.path.clone(),
            state: Mutex::new(DeviceState {
                info,
                op_status: OpStatus::Empty,
                medium: None,
                mnt_path: None,
                sub_request: None,
                ongoing_scheduled: false,
                ongoing_io: None,
                needs_sync: false,
                sync: SyncBatch::new(),
                last_client_rc: 0,
                technology,
                thread: ThreadState::Running,
                thread_status: 0,
            }),
            cond: Condvar::new(),
            access: AtomicU32::new(0),
            ctx: self.ctx.clone(),
        });
        let device = Device {
            shared: Arc::clone(&shared),
        };
        // A single scheduler serves every request class for now; the
        // fair-share dispatcher narrows these masks.
        device.set_access(AccessMask::all());

        let name = format!("lrs-dev-{}", device.id().name);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || worker::worker_main(shared))
            .map_err(|_| Errno::EAGAIN)
            .inspect_err(|_| {
                let _ = crate::dss::device_release(self.ctx.dss.as_ref(), device.id());
            })?;

        self.ctx.peers.lock().push(device.clone());
        self.entries.lock().push(DeviceEntry {
            device,
            handle: Some(handle),
        });
        Ok(())
    }

    pub fn get(&self, id: &ResourceId) -> Option<Device> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.device.id() == id)
            .map(|e| e.device.clone())
    }

    pub fn list(&self) -> Vec<Device> {
        self.entries.lock().iter().map(|e| e.device.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove one device, waiting briefly for its worker to drain.
    /// `EAGAIN` when the worker is still busy past the wait; callers
    /// retry later with [`DeviceSet::retry_del`].
    pub fn try_del(&self, id: &ResourceId) -> Result<(), Errno> {
        let device = self.get(id).ok_or(Errno::ENXIO)?;
        device.signal_stop();
        if !device.wait_stopped(Duration::from_millis(100)) {
            return Err(Errno::EAGAIN);
        }
        self.join_one(id)
    }

    /// Second chance of [`DeviceSet::try_del`] once the worker had time
    /// to drain.
    pub fn retry_del(&self, id: &ResourceId) -> Result<(), Errno> {
        let device = self.get(id).ok_or(Errno::ENXIO)?;
        if !device.wait_stopped(Duration::ZERO) {
            return Err(Errno::EAGAIN);
        }
        self.join_one(id)
    }

    fn join_one(&self, id: &ResourceId) -> Result<(), Errno> {
        let entry = {
            let mut entries = self.entries.lock();
            let pos = entries
                .iter()
                .position(|e| e.device.id() == id)
                .ok_or(Errno::ENXIO)?;
            entries.swap_remove(pos)
        };
        self.ctx.peers.lock().retain(|d| d.id() != id);
        if let Some(handle) = entry.handle {
            match handle.join() {
                Ok(status) if status < 0 => {
                    error!(
                        "device thread '{}' terminated with error {}",
                        id.name,
                        Errno::from_raw(-status)
                    );
                }
                Ok(_) => {}
                Err(_) => warn!("device thread '{}' panicked", id.name),
            }
        }
        Ok(())
    }

    /// Stop every worker: signal them all first so they drain
    /// concurrently, then join them one by one.
    pub fn clear(&self) {
        for device in self.list() {
            device.signal_stop();
        }
        loop {
            let id = match self.entries.lock().last() {
                Some(entry) => entry.device.id().clone(),
                None => break,
            };
            let device = self.get(&id);
            if let Some(device) = device {
                device.wait_stopped(Duration::from_secs(60));
            }
            let _ = self.join_one(&id);
        }
    }
}

impl std::fmt::Debug for DeviceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSet")
            .field("family", &self.family)
            .field("host", &self.host)
            .field("devices", &self.len())
            .finish()
    }
}
