//! Per-device worker.
//!
//! One cooperative worker per drive. The worker owns its device record,
//! the loaded medium, a single-slot inbox and the sync batch; it drives
//! the adapters through the empty/loaded/mounted lifecycle and decides,
//! on every failure, whether the drive, the medium or both are at fault.
//!
//! Lock discipline: the device mutex guards all shared device state and
//! stays held across blocking adapter calls (suspension never releases
//! it); the request completion mutex is only ever taken on its own,
//! never nested under the device mutex.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Instant, SystemTime};

use log::{debug, error, info, warn};
use nix::errno::Errno;

use super::{DeviceCtx, DeviceShared, ThreadState};
use crate::dss::{LdmOperation, LogRecord, MediaFields, device_release, media_release};
use crate::ldm::scsi::{ScsiPolicy, control_path_lock};
use crate::ldm::{ElementKind, LibAddr, LibraryAdapter};
use crate::proto::reply::{AllocElt, Response};
use crate::request::RwKind;
use crate::types::{AdmStatus, FsStatus, MediumInfo, OpStatus, ResourceId};

use super::sync::{thresholds_reached, wakeup_date};

fn neg(errno: Errno) -> i32 {
    -(errno as i32)
}

/// Outcome of one handler run.
enum Handled {
    /// The inbox slot was consumed.
    Done,
    /// The sub-request stays parked in the inbox for a later attempt;
    /// the worker sleeps until its next deadline before retrying.
    Parked,
}

/// Failure attribution of a load attempt.
struct LoadError {
    rc: i32,
    /// The drive is at fault; the worker must stop.
    on_dev: bool,
    /// The medium is at fault; it was marked failed and unlocked.
    on_medium: bool,
    /// Transient library refusal (drive-to-drive move); retry later.
    can_retry: bool,
    /// The medium handed back to the caller when it was not consumed.
    medium: Option<MediumInfo>,
}

pub(crate) fn worker_main(shared: Arc<DeviceShared>) -> i32 {
    Worker { dev: shared }.run()
}

struct Worker {
    dev: Arc<DeviceShared>,
}

impl Worker {
    fn ctx(&self) -> &DeviceCtx {
        &self.dev.ctx
    }

    fn id(&self) -> &ResourceId {
        &self.dev.id
    }

    fn dev_path(&self) -> &PathBuf {
        &self.dev.dev_path
    }

    /// Main worker loop.
    fn run(&self) -> i32 {
        loop {
            self.cancel_inbox_on_error();
            self.remove_canceled_sync();
            self.check_needs_sync();

            {
                let mut state = self.dev.state.lock();
                if state.thread == ThreadState::Stopping
                    && state.ongoing_io.is_none()
                    && state.sub_request.is_none()
                    && state.sync.is_empty()
                {
                    debug!("device thread '{}': switching to stopped", self.id().name);
                    state.thread = ThreadState::Stopped;
                }
                if state.thread == ThreadState::Stopped {
                    break;
                }
            }

            let (idle, needs_sync, kind) = {
                let state = self.dev.state.lock();
                (
                    state.ongoing_io.is_none(),
                    state.needs_sync,
                    state.sub_request.as_ref().map(|s| s.reqc.kind()),
                )
            };

            let mut parked = false;
            if idle {
                if needs_sync {
                    if let Err(rc) = self.dev_sync() {
                        error!(
                            "device thread '{}': fatal error syncing device",
                            self.id().name
                        );
                        self.set_fatal(rc);
                        break;
                    }
                }

                if let Some(kind) = kind {
                    let handled = match kind {
                        crate::proto::RequestKind::Format => self.handle_format(),
                        crate::proto::RequestKind::Read | crate::proto::RequestKind::Write => {
                            self.handle_read_write()
                        }
                        other => {
                            error!(
                                "device thread '{}': invalid kind ({}) in inbox",
                                self.id().name,
                                other
                            );
                            self.dev.state.lock().sub_request = None;
                            Ok(Handled::Done)
                        }
                    };
                    match handled {
                        Ok(Handled::Done) => {}
                        Ok(Handled::Parked) => parked = true,
                        Err(rc) => {
                            error!(
                                "device thread '{}': fatal error handling sub-request",
                                self.id().name
                            );
                            self.set_fatal(rc);
                            break;
                        }
                    }
                }
            }

            self.wait_for_signal(parked);
        }

        self.thread_end();
        let status = {
            let mut state = self.dev.state.lock();
            state.thread = ThreadState::Stopped;
            state.thread_status
        };
        self.dev.cond.notify_all();
        status
    }

    fn set_fatal(&self, rc: i32) {
        let mut state = self.dev.state.lock();
        if state.thread_status == 0 {
            state.thread_status = rc;
        }
    }

    /// Suspend until the next wakeup deadline or an external signal.
    ///
    /// The check below closes the window between the handler returning
    /// and this wait: anything that arrived in between is handled right
    /// away instead of sleeping on it. A parked sub-request does not
    /// count as fresh work; it is retried at the next deadline.
    fn wait_for_signal(&self, parked: bool) {
        let sync_time = self.ctx().config.sync_for(self.id().family).time;
        let mut state = self.dev.state.lock();
        let idle = state.ongoing_io.is_none();
        let fresh_work = (idle && state.needs_sync)
            || (idle && !parked && state.sub_request.is_some())
            || (state.thread == ThreadState::Stopping
                && idle
                && state.sub_request.is_none()
                && state.sync.is_empty());
        if fresh_work {
            return;
        }
        let deadline = wakeup_date(&state.sync, sync_time, Instant::now());
        self.dev.cond.wait_until(&mut state, deadline);
    }

    /// Drop the inbox sub-request if its parent request already failed on
    /// a sibling device.
    fn cancel_inbox_on_error(&self) {
        let pending = {
            let state = self.dev.state.lock();
            match &state.sub_request {
                Some(sub) if sub.reqc.kind() != crate::proto::RequestKind::Format => {
                    Some((sub.reqc.clone(), sub.medium_index))
                }
                _ => None,
            }
        };
        let Some((reqc, index)) = pending else {
            return;
        };
        if let Some((_, medium)) = reqc.alloc().cancel_on_error(index) {
            debug!(
                "device thread '{}': dropping canceled sub-request of request {}",
                self.id().name,
                reqc.req_id
            );
            if let Some(medium) = medium {
                let _ = media_release(self.ctx().dss.as_ref(), &medium.id);
            }
            self.dev.state.lock().sub_request = None;
        }
    }

    /// Drain sync entries canceled by an error observed on a sibling
    /// device of the same request.
    fn remove_canceled_sync(&self) {
        let entries = {
            let state = self.dev.state.lock();
            state.sync.snapshot()
        };
        if entries.is_empty() {
            return;
        }

        let mut canceled = Vec::new();
        for (reqc, index) in entries {
            if reqc.release().cancel_on_error(index).is_some() {
                canceled.push((reqc.req_id, index));
            }
        }
        if canceled.is_empty() {
            return;
        }

        let mut state = self.dev.state.lock();
        state
            .sync
            .remove_where(|sub| canceled.contains(&(sub.reqc.req_id, sub.medium_index)));
    }

    /// Evaluate the three flush thresholds and the forced-flush
    /// conditions.
    fn check_needs_sync(&self) {
        let thresholds = self.ctx().config.sync_for(self.id().family);
        let running = self.ctx().running.load(Ordering::Acquire);
        let mut state = self.dev.state.lock();
        if state.needs_sync {
            return;
        }
        let mut needs = thresholds_reached(&state.sync, &thresholds, Instant::now());
        needs |= !running && !state.sync.is_empty();
        needs |= state.thread == ThreadState::Stopping && !state.sync.is_empty();
        // A client error triggers an epoch without I/O sync; only the
        // medium and device state are updated.
        needs |= state.last_client_rc != 0;
        state.needs_sync = needs;
    }

    /// One sync epoch: flush the medium, persist its new state, answer
    /// every enrolled release.
    fn dev_sync(&self) -> Result<(), i32> {
        let mut rc;
        {
            let mut state = self.dev.state.lock();
            let client_rc = state.last_client_rc;
            state.last_client_rc = 0;

            if client_rc == 0 {
                rc = match (&state.medium, &state.mnt_path) {
                    (Some(medium), Some(mnt)) => {
                        let sync_rc = self
                            .ctx()
                            .registry
                            .io(medium.fs_type)
                            .and_then(|ioa| ioa.medium_sync(mnt));
                        debug!(
                            "sync: medium={} rc={:?}",
                            medium.id.name,
                            sync_rc.as_ref().err()
                        );
                        sync_rc.map_or_else(|e| neg(e), |_| 0)
                    }
                    // The batch was canceled from under us; nothing to
                    // flush.
                    _ => 0,
                };
            } else {
                // Do not sync on error as we don't know what happened on
                // the medium. This stops the device thread.
                rc = client_rc;
            }

            if state.medium.is_some() {
                let size_written = state.sync.bytes();
                let nb_new_obj = state.sync.len() as i64;
                if let Err(rc2) = self.media_update(&mut state, size_written, rc, nb_new_obj) {
                    error!("Cannot update media information");
                    if rc == 0 {
                        rc = rc2;
                    }
                }
            }
        }

        self.clean_tosync(rc);
        if rc != 0 { Err(rc) } else { Ok(()) }
    }

    /// Update the loaded medium's stats and persist them. Called with the
    /// device mutex held.
    fn media_update(
        &self,
        state: &mut super::DeviceState,
        size_written: u64,
        media_rc: i32,
        nb_new_obj: i64,
    ) -> Result<(), i32> {
        let mnt = state.mnt_path.clone();
        let medium = state.medium.as_mut().expect("media_update without medium");
        let mut fields = MediaFields::empty();
        let mut rc = 0;

        if medium.fs_status == FsStatus::Empty && media_rc == 0 {
            medium.fs_status = FsStatus::Used;
            fields |= MediaFields::FS_STATUS;
        }

        let space = self
            .ctx()
            .registry
            .fs(medium.fs_type)
            .and_then(|fsa| fsa.df(mnt.as_deref().unwrap_or(self.dev_path())));
        match space {
            Ok(space) => {
                medium.stats.phys_used = space.used;
                medium.stats.phys_free = space.avail;
                fields |= MediaFields::PHYS_USED | MediaFields::PHYS_FREE;
                if medium.stats.phys_free == 0 {
                    medium.fs_status = FsStatus::Full;
                    fields |= MediaFields::FS_STATUS;
                }
            }
            Err(e) => {
                rc = neg(e);
                error!("Cannot retrieve media usage information");
                error!("setting medium '{}' to failed", medium.id.name);
                medium.adm_status = AdmStatus::Failed;
                fields |= MediaFields::ADM_STATUS;
            }
        }

        // The update row carries deltas in the *_ADD fields.
        let mut update = medium.clone();
        if media_rc != 0 {
            error!("setting medium '{}' to failed", medium.id.name);
            medium.adm_status = AdmStatus::Failed;
            update.adm_status = AdmStatus::Failed;
            fields |= MediaFields::ADM_STATUS;
        } else {
            if nb_new_obj != 0 {
                medium.stats.nb_obj += nb_new_obj as u64;
                update.stats.nb_obj = nb_new_obj as u64;
                fields |= MediaFields::NB_OBJ_ADD;
            }
            if size_written != 0 {
                medium.stats.logc_used += size_written;
                update.stats.logc_used = size_written;
                fields |= MediaFields::LOGC_USED_ADD;
            }
        }

        if let Err(e) = self.ctx().dss.media_set(&update, fields) {
            if rc == 0 {
                rc = neg(e);
            }
        }
        if rc != 0 { Err(rc) } else { Ok(()) }
    }

    /// Flush the sync batch: mark every enrolled sub-request done or in
    /// error, emit the per-request responses, reset the triple.
    fn clean_tosync(&self, rc: i32) {
        let entries = {
            let mut state = self.dev.state.lock();
            let entries = state.sync.take_all();
            state.needs_sync = false;
            entries
        };

        for sub in entries {
            let release = sub.reqc.release();
            let outcome = release.complete(sub.medium_index, rc);
            if outcome.first_error {
                self.ctx().queues.push_error(&sub.reqc, rc);
            }
            if outcome.ended && sub.reqc.rc() == 0 {
                self.ctx()
                    .queues
                    .push_response(sub.reqc.socket_id, release.build_response(&sub.reqc));
            }
        }
    }

    // ---- adapter plumbing ----------------------------------------------

    fn scsi(&self) -> ScsiPolicy {
        ScsiPolicy::new(self.ctx().config.scsi)
    }

    fn emit_log(&self, op: LdmOperation, medium: Option<&ResourceId>, rc: i32, message: String) {
        self.ctx().dss.emit_log(LogRecord {
            device: self.id().clone(),
            medium: medium.cloned(),
            op,
            rc,
            message,
            time: SystemTime::now(),
        });
    }

    /// Open the library managing this device's family.
    fn lib_open(&self) -> Result<Arc<dyn LibraryAdapter>, Errno> {
        let lib = Arc::clone(self.ctx().registry.lib(self.id().family)?);
        let lib_device = self.ctx().config.lib_device.clone();
        self.scsi().retry("lib_open", || {
            let _serial = control_path_lock();
            lib.open(&lib_device)
        })?;
        Ok(lib)
    }

    fn lib_close(&self, lib: &Arc<dyn LibraryAdapter>) -> Result<(), Errno> {
        let _serial = control_path_lock();
        lib.close()
    }

    fn lib_move(
        &self,
        lib: &Arc<dyn LibraryAdapter>,
        src: &LibAddr,
        dst: &LibAddr,
    ) -> Result<(), Errno> {
        self.scsi().retry("media_move", || {
            let _serial = control_path_lock();
            lib.move_medium(src, dst)
        })
    }

    fn lib_lookup_drive(&self, lib: &Arc<dyn LibraryAdapter>) -> Result<LibAddr, Errno> {
        self.scsi().retry("drive_lookup", || {
            let _serial = control_path_lock();
            lib.drive_lookup(&self.id().name)
        })
    }

    fn lib_lookup_medium(
        &self,
        lib: &Arc<dyn LibraryAdapter>,
        label: &str,
    ) -> Result<LibAddr, Errno> {
        self.scsi().retry("medium_lookup", || {
            let _serial = control_path_lock();
            lib.medium_lookup(label)
        })
    }

    /// Mark `medium` failed in the DSS, then release its lock. The lock
    /// is kept when the status write fails, so a lingering lock always
    /// flags an inconsistent row.
    fn fail_release_medium(&self, medium: &MediumInfo) {
        error!("setting medium '{}' to failed", medium.id.name);
        let mut update = medium.clone();
        update.adm_status = AdmStatus::Failed;
        match self.ctx().dss.media_set(&update, MediaFields::ADM_STATUS) {
            Err(e) => {
                error!(
                    "Warning we keep medium {} locked because we can't set it to failed: {}",
                    medium.id.name, e
                );
            }
            Ok(()) => {
                if let Err(e) = media_release(self.ctx().dss.as_ref(), &medium.id) {
                    error!(
                        "Error when releasing medium {} after setting it to status failed: {}",
                        medium.id.name, e
                    );
                }
            }
        }
    }

    // ---- device state transitions --------------------------------------

    /// Unmount the medium but leave it loaded and locked.
    fn dev_umount(&self) -> Result<(), i32> {
        let (medium_name, fs_type, mnt) = {
            let state = self.dev.state.lock();
            let medium = state.medium.as_ref().expect("umount without medium");
            (
                medium.id.name.clone(),
                medium.fs_type,
                state.mnt_path.clone().expect("umount without mount path"),
            )
        };
        info!(
            "umount: medium '{}' in device '{}' mounted at '{}'",
            medium_name,
            self.dev_path().display(),
            mnt.display()
        );

        let rc = self
            .ctx()
            .registry
            .fs(fs_type)
            .and_then(|fsa| fsa.umount(self.dev_path(), &mnt))
            .map_or_else(|e| neg(e), |_| 0);
        // Unmounting flushes the filesystem: pending syncs resolve here.
        self.clean_tosync(rc);

        let mut state = self.dev.state.lock();
        if rc != 0 {
            state.op_status = OpStatus::Failed;
            error!(
                "Failed to unmount device '{}' mounted at '{}'",
                self.dev_path().display(),
                mnt.display()
            );
            return Err(rc);
        }
        state.op_status = OpStatus::Loaded;
        state.mnt_path = None;
        Ok(())
    }

    /// Unload the medium from the drive, release its lock.
    fn dev_unload(&self) -> Result<(), i32> {
        let medium_id = {
            let state = self.dev.state.lock();
            state.medium.as_ref().expect("unload without medium").id.clone()
        };
        debug!(
            "unload: '{}' from '{}'",
            medium_id.name,
            self.dev_path().display()
        );

        let lib = match self.lib_open() {
            Ok(lib) => lib,
            Err(e) => {
                self.emit_log(
                    LdmOperation::LibraryOpen,
                    Some(&medium_id),
                    neg(e),
                    format!("unable to open library to unload '{}'", medium_id.name),
                );
                self.dev.state.lock().op_status = OpStatus::Failed;
                return Err(neg(e));
            }
        };

        // Unthread the medium before asking the library to pick it up.
        if let Ok(drive) = self.ctx().registry.drive(self.id().family) {
            if let Err(e) = drive.eject(self.dev_path()) {
                self.emit_log(
                    LdmOperation::DeviceUnload,
                    Some(&medium_id),
                    neg(e),
                    "drive eject failed".to_string(),
                );
                let _ = self.lib_close(&lib);
                self.dev.state.lock().op_status = OpStatus::Failed;
                error!("Drive eject failed: {}", e);
                return Err(neg(e));
            }
        }

        let unloaded = self
            .lib_lookup_drive(&lib)
            .and_then(|src| self.lib_move(&lib, &src, &LibAddr::unknown()));
        if let Err(e) = unloaded {
            // The error may originate from a defective medium too; the
            // drive takes the blame pending a finer diagnosis.
            self.emit_log(
                LdmOperation::DeviceUnload,
                Some(&medium_id),
                neg(e),
                "media move failed".to_string(),
            );
            let _ = self.lib_close(&lib);
            self.dev.state.lock().op_status = OpStatus::Failed;
            error!("Media move failed: {}", e);
            return Err(neg(e));
        }

        let medium = {
            let mut state = self.dev.state.lock();
            state.op_status = OpStatus::Empty;
            state.medium.take().expect("unload without medium")
        };

        if let Err(e) = self.lib_close(&lib) {
            self.dev.state.lock().op_status = OpStatus::Failed;
            error!("Unable to close lib: {}", e);
            return Err(neg(e));
        }

        media_release(self.ctx().dss.as_ref(), &medium.id).map_err(neg)?;
        Ok(())
    }

    /// Load `medium` into the drive, with failure attribution.
    fn dev_load(&self, medium: MediumInfo) -> Result<(), LoadError> {
        debug!(
            "load: '{}' into '{}'",
            medium.id.name,
            self.dev_path().display()
        );

        let lib = match self.lib_open() {
            Ok(lib) => lib,
            Err(e) => {
                self.emit_log(
                    LdmOperation::LibraryOpen,
                    Some(&medium.id),
                    neg(e),
                    format!("unable to open library to load '{}'", medium.id.name),
                );
                self.dev.state.lock().op_status = OpStatus::Failed;
                return Err(LoadError {
                    rc: neg(e),
                    on_dev: true,
                    on_medium: false,
                    can_retry: false,
                    medium: Some(medium),
                });
            }
        };

        let medium_addr = match self.lib_lookup_medium(&lib, &medium.id.name) {
            Ok(addr) => addr,
            Err(e) => {
                self.emit_log(
                    LdmOperation::MediumLookup,
                    Some(&medium.id),
                    neg(e),
                    "media lookup failed".to_string(),
                );
                self.fail_release_medium(&medium);
                let _ = self.lib_close(&lib);
                error!("Media lookup failed: {}", e);
                return Err(LoadError {
                    rc: neg(e),
                    on_dev: false,
                    on_medium: true,
                    can_retry: false,
                    medium: None,
                });
            }
        };

        let drive_addr = match self.lib_lookup_drive(&lib) {
            Ok(addr) => addr,
            Err(e) => {
                self.emit_log(
                    LdmOperation::DriveLookup,
                    Some(&medium.id),
                    neg(e),
                    "drive lookup failed".to_string(),
                );
                let _ = self.lib_close(&lib);
                self.dev.state.lock().op_status = OpStatus::Failed;
                return Err(LoadError {
                    rc: neg(e),
                    on_dev: true,
                    on_medium: false,
                    can_retry: false,
                    medium: Some(medium),
                });
            }
        };

        if let Err(e) = self.lib_move(&lib, &medium_addr, &drive_addr) {
            // Some libraries refuse drive-to-drive movements: the library
            // state changed between the scan and this assignment. Signal
            // busy and let the caller retry later.
            if e == Errno::EINVAL
                && medium_addr.kind == ElementKind::Drive
                && drive_addr.kind == ElementKind::Drive
            {
                debug!("Failed to move a medium from one drive to another, trying again later");
                let _ = self.lib_close(&lib);
                return Err(LoadError {
                    rc: neg(Errno::EBUSY),
                    on_dev: false,
                    on_medium: false,
                    can_retry: true,
                    medium: Some(medium),
                });
            }
            self.emit_log(
                LdmOperation::DeviceLoad,
                Some(&medium.id),
                neg(e),
                "media move failed".to_string(),
            );
            self.dev.state.lock().op_status = OpStatus::Failed;
            self.fail_release_medium(&medium);
            let _ = self.lib_close(&lib);
            error!("Media move failed: {}", e);
            return Err(LoadError {
                rc: neg(e),
                on_dev: true,
                on_medium: true,
                can_retry: false,
                medium: None,
            });
        }

        // Some drive families need an explicit load once the library
        // dropped the medium in the mouth.
        if let Ok(drive) = self.ctx().registry.drive(self.id().family) {
            if let Err(e) = drive.load(self.dev_path()) {
                self.emit_log(
                    LdmOperation::DeviceLoad,
                    Some(&medium.id),
                    neg(e),
                    "drive load failed".to_string(),
                );
                self.dev.state.lock().op_status = OpStatus::Failed;
                self.fail_release_medium(&medium);
                let _ = self.lib_close(&lib);
                error!("Drive load failed: {}", e);
                return Err(LoadError {
                    rc: neg(e),
                    on_dev: true,
                    on_medium: true,
                    can_retry: false,
                    medium: None,
                });
            }
        }

        {
            let mut state = self.dev.state.lock();
            state.op_status = OpStatus::Loaded;
            state.medium = Some(medium);
        }

        if let Err(e) = self.lib_close(&lib) {
            self.dev.state.lock().op_status = OpStatus::Failed;
            error!("Unable to close lib: {}", e);
            return Err(LoadError {
                rc: neg(e),
                on_dev: true,
                on_medium: false,
                can_retry: false,
                medium: None,
            });
        }
        Ok(())
    }

    /// Umount and unload whatever the drive holds.
    fn dev_empty(&self) -> Result<(), i32> {
        let op_status = self.dev.state.lock().op_status;
        match op_status {
            OpStatus::Empty => return Ok(()),
            OpStatus::Mounted => self.dev_umount()?,
            OpStatus::Loaded => {}
            OpStatus::Failed => {
                error!(
                    "We cannot empty device '{}' which is in '{}' op status",
                    self.dev_path().display(),
                    op_status
                );
                return Err(neg(Errno::EINVAL));
            }
        }
        if self.dev.state.lock().op_status == OpStatus::Loaded {
            return self.dev_unload();
        }
        Ok(())
    }

    /// Mount point of this device: `<mount_prefix><device basename>`.
    fn mount_point(&self) -> Result<PathBuf, i32> {
        let basename = self
            .dev_path()
            .file_name()
            .ok_or_else(|| {
                error!("Unable to get dev path basename");
                neg(Errno::EINVAL)
            })?
            .to_os_string();
        let mut path = self.ctx().config.mount_prefix.clone().into_os_string();
        path.push(basename);
        Ok(PathBuf::from(path))
    }

    /// Mount the loaded medium.
    fn dev_mount(&self) -> Result<(), i32> {
        let (medium_name, fs_type, fs_label) = {
            let state = self.dev.state.lock();
            let medium = state.medium.as_ref().expect("mount without medium");
            (medium.id.name.clone(), medium.fs_type, medium.fs_label.clone())
        };
        let fsa = self.ctx().registry.fs(fs_type).map_err(neg)?;

        // The device may already expose a mounted filesystem.
        if let Ok(Some(mnt)) = fsa.mounted(self.dev_path()) {
            let mut state = self.dev.state.lock();
            state.op_status = OpStatus::Mounted;
            state.mnt_path = Some(mnt);
            return Ok(());
        }

        let mnt_root = self.mount_point()?;
        info!(
            "mount: medium '{}' in device '{}' ('{}') as '{}'",
            medium_name,
            self.dev_path().display(),
            self.id().name,
            mnt_root.display()
        );

        fsa.mount(self.dev_path(), &mnt_root, &fs_label).map_err(|e| {
            error!(
                "Failed to mount '{}' in device '{}'",
                medium_name,
                self.dev_path().display()
            );
            neg(e)
        })?;

        let mut state = self.dev.state.lock();
        state.op_status = OpStatus::Mounted;
        state.mnt_path = Some(mnt_root);
        Ok(())
    }

    /// Whether the mounted filesystem accepts writes.
    fn dev_mount_is_writable(&self) -> Result<bool, i32> {
        let (fs_type, mnt) = {
            let state = self.dev.state.lock();
            let medium = state.medium.as_ref().expect("df without medium");
            (
                medium.fs_type,
                state.mnt_path.clone().expect("df without mount path"),
            )
        };
        let space = self
            .ctx()
            .registry
            .fs(fs_type)
            .and_then(|fsa| fsa.df(&mnt))
            .map_err(|e| {
                error!("Cannot retrieve media usage information");
                neg(e)
            })?;
        Ok(!space.flags.contains(crate::types::FsSpaceFlags::READONLY))
    }

    /// Format the loaded medium and persist its new stats.
    fn dev_format(&self, unlock: bool) -> Result<(), i32> {
        let (medium_name, fs_type) = {
            let state = self.dev.state.lock();
            let medium = state.medium.as_ref().expect("format without medium");
            (medium.id.name.clone(), medium.fs_type)
        };
        debug!("format: medium '{}'", medium_name);

        let fsa = self.ctx().registry.fs(fs_type).map_err(neg)?;
        let space = fsa.format(self.dev_path(), &medium_name).map_err(|e| {
            error!("Cannot format medium '{}'", medium_name);
            neg(e)
        })?;

        let update = {
            let mut state = self.dev.state.lock();
            let medium = state.medium.as_mut().expect("format without medium");
            // The medium id doubles as the filesystem label.
            medium.fs_label = medium.id.name.clone();
            medium.stats.nb_obj = 0;
            medium.stats.logc_used = 0;
            medium.stats.phys_used = space.used;
            medium.stats.phys_free = space.avail;
            medium.fs_status = FsStatus::Empty;
            if unlock {
                debug!(
                    "Removing admin lock on medium '{}' after format as requested by client",
                    medium_name
                );
                medium.adm_status = AdmStatus::Unlocked;
            }
            medium.clone()
        };

        let mut fields = MediaFields::FS_LABEL
            | MediaFields::NB_OBJ
            | MediaFields::LOGC_USED
            | MediaFields::PHYS_USED
            | MediaFields::PHYS_FREE
            | MediaFields::FS_STATUS;
        if unlock {
            fields |= MediaFields::ADM_STATUS;
        }
        self.ctx().dss.media_set(&update, fields).map_err(|e| {
            error!(
                "Failed to update state of medium '{}' after format",
                medium_name
            );
            neg(e)
        })
    }

    // ---- request handlers ----------------------------------------------

    /// Handle the format sub-request sitting in the inbox.
    fn handle_format(&self) -> Result<Handled, i32> {
        let reqc = {
            let state = self.dev.state.lock();
            state
                .sub_request
                .as_ref()
                .expect("handle_format without inbox")
                .reqc
                .clone()
        };
        let format = reqc.format();
        let target = format.medium_id.clone();

        let already_loaded = {
            let state = self.dev.state.lock();
            state.op_status == OpStatus::Loaded
                && state.medium.as_ref().is_some_and(|m| m.id == target)
        };

        if already_loaded {
            info!(
                "medium {} to format is already loaded into device {}",
                target.name,
                self.id().name
            );
            format.state.lock().medium = None;
        } else {
            if let Err(rc) = self.dev_empty() {
                // The drive is failing; another device can still format
                // the medium.
                let sub = self.dev.state.lock().sub_request.take();
                if let Some(sub) = sub {
                    self.ctx().queues.retry.push(sub);
                }
                error!(
                    "Unable to empty device '{}' to format medium '{}', format request is requeued",
                    self.id().name, target.name
                );
                return Err(rc);
            }

            let medium = match format.state.lock().medium.take() {
                Some(medium) => medium,
                // Requeued after a worker died with the medium loaded:
                // re-acquire the row.
                None => match self.reacquire_medium(&target) {
                    Ok(medium) => medium,
                    Err(e) => {
                        self.ctx().queues.push_error(&reqc, neg(e));
                        self.format_finish(&target);
                        return Ok(Handled::Done);
                    }
                },
            };

            match self.dev_load(medium) {
                Ok(()) => {}
                Err(le) if le.can_retry => {
                    warn!("Trying to load a busy medium to format, try again later");
                    if let Some(medium) = le.medium {
                        format.state.lock().medium = Some(medium);
                    }
                    return Ok(Handled::Parked);
                }
                Err(le) => {
                    // A format request releases its medium on a
                    // device-only failure: the request goes back through
                    // admission with a fresh lock.
                    if let Some(medium) = le.medium {
                        let _ = media_release(self.ctx().dss.as_ref(), &medium.id);
                    }
                    self.ctx().queues.push_error(&reqc, le.rc);
                    if le.on_dev {
                        error!(
                            "Error when loading medium to format in device {}",
                            self.id().name
                        );
                        self.format_finish(&target);
                        return Err(le.rc);
                    }
                    error!(
                        "Error on medium only when loading to format in device {}",
                        self.id().name
                    );
                    self.format_finish(&target);
                    return Ok(Handled::Done);
                }
            }
        }

        let rc = self.dev_format(format.unlock).err().unwrap_or(0);
        if rc != 0 {
            self.ctx().queues.push_error(&reqc, rc);
            self.format_finish(&target);
            return Err(rc);
        }

        self.ctx().queues.push_response(
            reqc.socket_id,
            Response::Format {
                req_id: reqc.req_id,
                medium: target.clone(),
            },
        );
        self.format_finish(&target);
        Ok(Handled::Done)
    }

    /// Terminal bookkeeping of a format sub-request: unregister the
    /// medium from the ongoing-format index, free the inbox slot.
    fn format_finish(&self, target: &ResourceId) {
        self.ctx().formats.remove(target);
        self.dev.state.lock().sub_request = None;
    }

    /// Fetch and lock a medium row again (format requeued from a dead
    /// worker).
    fn reacquire_medium(&self, id: &ResourceId) -> Result<MediumInfo, Errno> {
        let medium = self.ctx().dss.media_get(id)?;
        self.ctx()
            .dss
            .lock(&crate::dss::Entity::Medium(id.clone()))?;
        Ok(medium)
    }

    /// Handle a read or write allocation sub-request.
    fn handle_read_write(&self) -> Result<Handled, i32> {
        let mut sub = {
            let mut state = self.dev.state.lock();
            state
                .sub_request
                .take()
                .expect("handle_read_write without inbox")
        };
        let reqc = sub.reqc.clone();
        let index = sub.medium_index;
        let alloc = reqc.alloc();

        if let Some((_, medium)) = alloc.cancel_on_error(index) {
            if let Some(medium) = medium {
                let _ = media_release(self.ctx().dss.as_ref(), &medium.id);
            }
            return Ok(Handled::Done);
        }

        let mut failure_on_device = false;
        let mut failure_on_medium = sub.failure_on_medium;
        let mut io_ended = false;
        let mut rc: i32 = 0;
        let mut mount_needed = true;

        match alloc.take_medium(index) {
            None => {
                // Ride the medium already in this drive.
                debug!("riding current medium of device '{}'", self.id().name);
                let op_status = self.dev.state.lock().op_status;
                match op_status {
                    OpStatus::Mounted => mount_needed = false,
                    OpStatus::Loaded => {}
                    _ => {
                        error!(
                            "empty device '{}' received a {} request without medium",
                            self.id().name,
                            reqc.kind()
                        );
                        failure_on_medium = true;
                        io_ended = true;
                        rc = neg(Errno::EINVAL);
                    }
                }
            }
            Some(medium) => {
                if let Err(e) = self.dev_empty() {
                    error!(
                        "Error when emptying device {} to {} on medium {}",
                        self.id().name,
                        reqc.kind(),
                        medium.id.name
                    );
                    // The medium keeps its lock; the retry plane can hand
                    // it to another device as-is.
                    alloc.put_medium(index, medium);
                    failure_on_device = true;
                    io_ended = true;
                    rc = e;
                } else {
                    debug!(
                        "Will load '{}' in device '{}'",
                        medium.id.name,
                        self.id().name
                    );
                    match self.dev_load(medium) {
                        Ok(()) => {}
                        Err(le) if le.can_retry => {
                            warn!(
                                "Trying to load a busy medium to {}, try again later",
                                reqc.kind()
                            );
                            if let Some(medium) = le.medium {
                                alloc.put_medium(index, medium);
                            }
                            self.dev.state.lock().sub_request = Some(sub);
                            return Ok(Handled::Parked);
                        }
                        Err(le) => {
                            error!(
                                "Error when loading medium in device {} to {} it",
                                self.id().name,
                                reqc.kind()
                            );
                            rc = le.rc;
                            io_ended = true;
                            failure_on_device |= le.on_dev;
                            failure_on_medium |= le.on_medium;
                            if let Some(medium) = le.medium {
                                alloc.put_medium(index, medium);
                            }
                        }
                    }
                }
            }
        }

        if rc == 0 && mount_needed {
            if let Err(e) = self.dev_mount() {
                rc = e;
                failure_on_device = true;
                failure_on_medium = true;
                io_ended = true;
                error!(
                    "Error when mounting medium in device '{}' for {}, will try another \
                     medium if possible",
                    self.id().name,
                    reqc.kind()
                );
                // Fail the medium early so the dispatcher cannot pick it
                // again.
                let medium = {
                    let mut state = self.dev.state.lock();
                    state.op_status = OpStatus::Failed;
                    state.medium.take()
                };
                if let Some(medium) = medium {
                    self.fail_release_medium(&medium);
                }
            }
        }

        // LTFS cunningly mounts almost-full tapes read-only, and so would
        // damaged disks. Mark the medium full, then find a new one.
        if rc == 0 && alloc.rw == RwKind::Write {
            match self.dev_mount_is_writable() {
                Ok(true) => {}
                Ok(false) => {
                    let full_row = {
                        let mut state = self.dev.state.lock();
                        let medium = state.medium.as_mut().expect("mounted without medium");
                        medium.fs_status = FsStatus::Full;
                        medium.clone()
                    };
                    warn!(
                        "Medium '{}' OK but mounted R/O, marking full and retrying...",
                        full_row.id.name
                    );
                    failure_on_medium = true;
                    io_ended = true;
                    rc = neg(Errno::ENOSPC);
                    if let Err(e) = self.ctx().dss.media_set(&full_row, MediaFields::FS_STATUS) {
                        error!(
                            "Unable to update DSS medium '{}' status to FULL",
                            full_row.id.name
                        );
                        rc = neg(e);
                        failure_on_device = true;
                    }
                }
                Err(e) => {
                    rc = e;
                    failure_on_device = true;
                    failure_on_medium = true;
                    io_ended = true;
                }
            }
        }

        // Fill in the result or route the retry.
        let mut requeued = false;
        if let Some((_, medium)) = alloc.cancel_on_error(index) {
            if let Some(medium) = medium {
                let _ = media_release(self.ctx().dss.as_ref(), &medium.id);
            }
            io_ended = true;
        } else if rc == 0 {
            let elt = {
                let state = self.dev.state.lock();
                let medium = state.medium.as_ref().expect("result without medium");
                AllocElt {
                    medium: medium.id.clone(),
                    root_path: state.mnt_path.clone().expect("result without mount path"),
                    fs_type: medium.fs_type,
                    addr_type: medium.addr_type,
                    avail_size: medium.stats.phys_free,
                }
            };
            let (_, response) = alloc.complete_done(index, elt, &reqc);
            if let Some(response) = response {
                self.ctx().queues.push_response(reqc.socket_id, response);
            }
        } else if alloc.can_requeue(failure_on_medium) {
            sub.failure_on_medium = failure_on_medium;
            alloc.reset_slot(index);
            requeued = true;
            self.ctx().queues.retry.push(sub);
        } else {
            let outcome = alloc.complete_error(index, rc);
            if outcome.first_error {
                self.ctx().queues.push_error(&reqc, rc);
                self.cancel_peers(reqc.req_id);
            }
        }

        {
            let mut state = self.dev.state.lock();
            if !io_ended && !requeued {
                state.ongoing_io = Some(reqc.req_id);
            }
        }

        if failure_on_device { Err(rc) } else { Ok(Handled::Done) }
    }

    /// Reset the in-flight I/O marker of every sibling that already
    /// answered for this failed request, and wake them so they observe
    /// the cancellation.
    fn cancel_peers(&self, req_id: u64) {
        let peers: Vec<_> = self.ctx().peers.lock().clone();
        for peer in peers {
            peer.clear_ongoing_io(req_id);
            peer.notify();
        }
    }

    // ---- teardown -------------------------------------------------------

    /// Orderly teardown: cancel the pending format, unmount, unload,
    /// release the device. Every state change and lock release is
    /// persisted before the in-memory state is dropped.
    fn thread_end(&self) {
        {
            let mut state = self.dev.state.lock();
            if state.thread == ThreadState::Running {
                state.thread = ThreadState::Stopping;
            }
        }
        self.cancel_pending_inbox();
        self.end_mounted_medium();
        self.end_loaded_medium();
        self.end_device();
    }

    /// Resolve whatever is left in the inbox.
    fn cancel_pending_inbox(&self) {
        let sub = {
            let mut state = self.dev.state.lock();
            state.sub_request.take()
        };
        let Some(sub) = sub else { return };

        if sub.reqc.kind() != crate::proto::RequestKind::Format {
            // Device-level failure: hand the allocation to another
            // worker through the retry plane.
            self.ctx().queues.retry.push(sub);
            return;
        }

        let reqc = sub.reqc.clone();
        let format = reqc.format();
        let target = format.medium_id.clone();
        let status = self.dev.state.lock().thread_status;
        let pending_medium = format.state.lock().medium.take();

        if status != 0 && pending_medium.is_none() {
            // The medium was already transferred to this failing device.
            self.ctx().formats.remove(&target);
            self.ctx().queues.push_error(&reqc, status);
            return;
        }

        let mut rc = 0;
        match pending_medium {
            Some(medium) => {
                self.ctx().formats.remove(&medium.id);
                if let Err(e) = media_release(self.ctx().dss.as_ref(), &medium.id) {
                    rc = neg(e);
                    self.fail_release_medium(&medium);
                }
            }
            None => {
                self.ctx().formats.remove(&target);
            }
        }

        if rc == 0 {
            self.ctx().queues.retry.push(sub);
        } else {
            self.ctx().queues.push_error(&reqc, rc);
        }
    }

    /// Unmount the mounted medium, or mark it failed when that is no
    /// longer possible.
    fn end_mounted_medium(&self) {
        if self.dev.state.lock().op_status != OpStatus::Mounted {
            return;
        }
        let status = self.dev.state.lock().thread_status;
        if status == 0 {
            if let Err(rc) = self.dev_umount() {
                error!(
                    "Unable to umount medium in device '{}' at exit",
                    self.id().name
                );
                self.set_fatal(rc);
            }
        }
        let status = self.dev.state.lock().thread_status;
        if status != 0 {
            let medium = self.dev.state.lock().medium.take();
            if let Some(medium) = medium {
                self.fail_release_medium(&medium);
            }
        }
    }

    /// Release the loaded medium's lock, or mark it failed.
    fn end_loaded_medium(&self) {
        if self.dev.state.lock().op_status != OpStatus::Loaded {
            return;
        }
        let status = self.dev.state.lock().thread_status;
        if status == 0 {
            let medium_id = self
                .dev
                .state
                .lock()
                .medium
                .as_ref()
                .map(|m| m.id.clone());
            if let Some(medium_id) = medium_id {
                match media_release(self.ctx().dss.as_ref(), &medium_id) {
                    Ok(()) => {
                        self.dev.state.lock().medium = None;
                    }
                    Err(e) => {
                        error!(
                            "Unable to release DSS lock of medium '{}' of device '{}' at exit",
                            medium_id.name,
                            self.id().name
                        );
                        self.set_fatal(neg(e));
                    }
                }
            }
        }
        let status = self.dev.state.lock().thread_status;
        if status != 0 {
            let medium = self.dev.state.lock().medium.take();
            if let Some(medium) = medium {
                self.fail_release_medium(&medium);
            }
        }
    }

    /// Release the device lock; on error persist the failed status
    /// first.
    fn end_device(&self) {
        let status = self.dev.state.lock().thread_status;
        if status == 0 {
            if let Err(e) = device_release(self.ctx().dss.as_ref(), self.id()) {
                error!(
                    "Unable to release DSS lock of device '{}' at exit",
                    self.id().name
                );
                self.set_fatal(neg(e));
            }
        }

        let status = self.dev.state.lock().thread_status;
        if status != 0 {
            self.clean_tosync(status);
            {
                let mut state = self.dev.state.lock();
                state.op_status = OpStatus::Failed;
                state.info.adm_status = AdmStatus::Failed;
            }
            error!("setting device '{}' to failed", self.id().name);
            match self
                .ctx()
                .dss
                .device_update_adm_status(self.id(), AdmStatus::Failed)
            {
                Err(e) => {
                    error!(
                        "Unable to set device '{}' to failed into DSS, we don't release the \
                         corresponding DSS lock: {}",
                        self.id().name,
                        e
                    );
                }
                Ok(()) => {
                    if let Err(e) = device_release(self.ctx().dss.as_ref(), self.id()) {
                        error!(
                            "Unable to release DSS lock of device '{}' at device exit: {}",
                            self.id().name,
                            e
                        );
                    }
                }
            }
        }

        self.dev.state.lock().ongoing_io = None;
    }
}
