//! Persistent-store surface consumed by the engine.
//!
//! The engine never talks to a database directly; it goes through the
//! [`Dss`] trait, which mirrors the CRUD operations, the distributed lock
//! and the append-only log table the store provides. [`MemDss`] is a
//! process-local reference implementation for embedders without a store
//! and for the test suite.

use std::collections::HashMap;
use std::time::SystemTime;

use bitflags::bitflags;
use nix::errno::Errno;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{AdmStatus, DeviceInfo, DssLock, Family, MediumInfo, ResourceId};

bitflags! {
    /// Fields of a medium row touched by a `media_set` update.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MediaFields: u32 {
        const FS_STATUS     = 1 << 0;
        const FS_LABEL      = 1 << 1;
        const ADM_STATUS    = 1 << 2;
        const PHYS_USED     = 1 << 3;
        const PHYS_FREE     = 1 << 4;
        /// Add to the logical used byte counter.
        const LOGC_USED_ADD = 1 << 5;
        /// Overwrite the logical used byte counter.
        const LOGC_USED     = 1 << 6;
        /// Add to the object counter.
        const NB_OBJ_ADD    = 1 << 7;
        /// Overwrite the object counter.
        const NB_OBJ        = 1 << 8;
    }
}

/// Entity addressed by the distributed lock.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Entity {
    Device(ResourceId),
    Medium(ResourceId),
}

/// Adapter operation recorded by a DSS log row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LdmOperation {
    LibraryOpen,
    LibraryScan,
    DriveLookup,
    MediumLookup,
    DeviceLoad,
    DeviceUnload,
}

/// One row of the append-only log table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub device: ResourceId,
    pub medium: Option<ResourceId>,
    pub op: LdmOperation,
    /// Negative errno of the failed operation.
    pub rc: i32,
    pub message: String,
    pub time: SystemTime,
}

/// Persistent-store operations the engine requires.
///
/// Locks are exclusive per entity: at most one `(hostname, owner)` holds
/// a given device or medium. Re-locking an entity this process already
/// holds fails with `EEXIST` (the engine tracks its own in-flight
/// assignments and never re-locks), locking an entity held elsewhere
/// fails with `EWOULDBLOCK`, and unlocking an entity not held fails with
/// `ENOLCK`.
pub trait Dss: Send + Sync {
    /// All admin-unlocked devices of `family` owned by `host`.
    fn get_usable_devices(&self, family: Family, host: &str) -> Result<Vec<DeviceInfo>, Errno>;

    /// Devices matching `(family, serial)`, any admin status.
    fn device_get(&self, family: Family, serial: &str) -> Result<Vec<DeviceInfo>, Errno>;

    /// Persist a device administrative status change.
    fn device_update_adm_status(&self, id: &ResourceId, status: AdmStatus) -> Result<(), Errno>;

    /// One medium row.
    fn media_get(&self, id: &ResourceId) -> Result<MediumInfo, Errno>;

    /// All media rows of `family`.
    fn media_list(&self, family: Family) -> Result<Vec<MediumInfo>, Errno>;

    /// Persist the fields of `medium` selected by `fields`.
    fn media_set(&self, medium: &MediumInfo, fields: MediaFields) -> Result<(), Errno>;

    /// Take the distributed lock on `entity` for this host/process.
    fn lock(&self, entity: &Entity) -> Result<(), Errno>;

    /// Release the distributed lock on `entity`.
    fn unlock(&self, entity: &Entity) -> Result<(), Errno>;

    /// Append a record to the log table. Failures are swallowed by
    /// callers; logging never aborts an operation.
    fn emit_log(&self, record: LogRecord);
}

/// Convenience wrappers shared by the engine code.
pub(crate) fn device_release(dss: &dyn Dss, id: &ResourceId) -> Result<(), Errno> {
    log::debug!("unlock: device '{}'", id.name);
    dss.unlock(&Entity::Device(id.clone()))
}

pub(crate) fn media_release(dss: &dyn Dss, id: &ResourceId) -> Result<(), Errno> {
    log::debug!("unlock: medium '{}'", id.name);
    dss.unlock(&Entity::Medium(id.clone()))
}

/// In-memory store: a plain map guarded by a mutex. Lock ownership is
/// tracked per entity with the hostname/pid recorded in the row.
#[derive(Default)]
pub struct MemDss {
    inner: Mutex<MemDssInner>,
}

#[derive(Default)]
struct MemDssInner {
    devices: HashMap<ResourceId, DeviceInfo>,
    media: HashMap<ResourceId, MediumInfo>,
    locks: HashMap<Entity, DssLock>,
    logs: Vec<LogRecord>,
}

impl MemDss {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a device row.
    pub fn insert_device(&self, device: DeviceInfo) {
        self.inner.lock().devices.insert(device.id.clone(), device);
    }

    /// Insert or replace a medium row.
    pub fn insert_medium(&self, medium: MediumInfo) {
        self.inner.lock().media.insert(medium.id.clone(), medium);
    }

    /// Snapshot of the log table.
    pub fn logs(&self) -> Vec<LogRecord> {
        self.inner.lock().logs.clone()
    }

    /// Current lock holder of `entity`, if any.
    pub fn lock_holder(&self, entity: &Entity) -> Option<DssLock> {
        self.inner.lock().locks.get(entity).cloned()
    }

    fn own_lock() -> DssLock {
        DssLock {
            hostname: hostname(),
            owner: std::process::id(),
            timestamp: SystemTime::now(),
        }
    }
}

/// Name of this host as the DSS knows it.
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

impl std::fmt::Debug for MemDss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemDss")
            .field("devices", &inner.devices.len())
            .field("media", &inner.media.len())
            .field("locks", &inner.locks.len())
            .field("logs", &inner.logs.len())
            .finish()
    }
}

impl Dss for MemDss {
    fn get_usable_devices(&self, family: Family, host: &str) -> Result<Vec<DeviceInfo>, Errno> {
        let inner = self.inner.lock();
        let mut devices: Vec<_> = inner
            .devices
            .values()
            .filter(|d| {
                d.id.family == family && d.host == host && d.adm_status == AdmStatus::Unlocked
            })
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.id.name.cmp(&b.id.name));
        Ok(devices)
    }

    fn device_get(&self, family: Family, serial: &str) -> Result<Vec<DeviceInfo>, Errno> {
        let inner = self.inner.lock();
        Ok(inner
            .devices
            .values()
            .filter(|d| d.id.family == family && d.id.name == serial)
            .cloned()
            .collect())
    }

    fn device_update_adm_status(&self, id: &ResourceId, status: AdmStatus) -> Result<(), Errno> {
        let mut inner = self.inner.lock();
        let device = inner.devices.get_mut(id).ok_or(Errno::ENXIO)?;
        device.adm_status = status;
        Ok(())
    }

    fn media_get(&self, id: &ResourceId) -> Result<MediumInfo, Errno> {
        self.inner.lock().media.get(id).cloned().ok_or(Errno::ENXIO)
    }

    fn media_list(&self, family: Family) -> Result<Vec<MediumInfo>, Errno> {
        let inner = self.inner.lock();
        let mut media: Vec<_> = inner
            .media
            .values()
            .filter(|m| m.id.family == family)
            .cloned()
            .collect();
        media.sort_by(|a, b| a.id.name.cmp(&b.id.name));
        Ok(media)
    }

    fn media_set(&self, medium: &MediumInfo, fields: MediaFields) -> Result<(), Errno> {
        let mut inner = self.inner.lock();
        let row = inner
            .media
            .entry(medium.id.clone())
            .or_insert_with(|| medium.clone());
        if fields.contains(MediaFields::FS_STATUS) {
            row.fs_status = medium.fs_status;
        }
        if fields.contains(MediaFields::FS_LABEL) {
            row.fs_label = medium.fs_label.clone();
        }
        if fields.contains(MediaFields::ADM_STATUS) {
            row.adm_status = medium.adm_status;
        }
        if fields.contains(MediaFields::PHYS_USED) {
            row.stats.phys_used = medium.stats.phys_used;
        }
        if fields.contains(MediaFields::PHYS_FREE) {
            row.stats.phys_free = medium.stats.phys_free;
        }
        if fields.contains(MediaFields::LOGC_USED) {
            row.stats.logc_used = medium.stats.logc_used;
        } else if fields.contains(MediaFields::LOGC_USED_ADD) {
            row.stats.logc_used += medium.stats.logc_used;
        }
        if fields.contains(MediaFields::NB_OBJ) {
            row.stats.nb_obj = medium.stats.nb_obj;
        } else if fields.contains(MediaFields::NB_OBJ_ADD) {
            row.stats.nb_obj += medium.stats.nb_obj;
        }
        Ok(())
    }

    fn lock(&self, entity: &Entity) -> Result<(), Errno> {
        let mut inner = self.inner.lock();
        let own = Self::own_lock();
        match inner.locks.get(entity) {
            None => {
                inner.locks.insert(entity.clone(), own);
                Ok(())
            }
            Some(held) if held.hostname == own.hostname && held.owner == own.owner => {
                Err(Errno::EEXIST)
            }
            Some(_) => Err(Errno::EWOULDBLOCK),
        }
    }

    fn unlock(&self, entity: &Entity) -> Result<(), Errno> {
        let mut inner = self.inner.lock();
        match inner.locks.remove(entity) {
            Some(_) => Ok(()),
            None => Err(Errno::ENOLCK),
        }
    }

    fn emit_log(&self, record: LogRecord) {
        self.inner.lock().logs.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FsType;

    fn medium(name: &str) -> MediumInfo {
        MediumInfo::new(ResourceId::new(Family::Tape, name), FsType::Ltfs)
    }

    #[test]
    fn media_set_honors_field_mask() {
        let dss = MemDss::new();
        dss.insert_medium(medium("T1"));

        let mut update = medium("T1");
        update.fs_label = "T1".to_string();
        update.stats.logc_used = 100;
        update.stats.nb_obj = 3;
        dss.media_set(
            &update,
            MediaFields::FS_LABEL | MediaFields::LOGC_USED_ADD | MediaFields::NB_OBJ_ADD,
        )
        .unwrap();
        dss.media_set(&update, MediaFields::LOGC_USED_ADD).unwrap();

        let row = dss.media_get(&update.id).unwrap();
        assert_eq!(row.fs_label, "T1");
        assert_eq!(row.stats.logc_used, 200);
        assert_eq!(row.stats.nb_obj, 3);
        // Untouched fields keep their value.
        assert_eq!(row.adm_status, AdmStatus::Unlocked);
    }

    #[test]
    fn lock_is_exclusive() {
        let dss = MemDss::new();
        let entity = Entity::Medium(ResourceId::new(Family::Tape, "T1"));
        dss.lock(&entity).unwrap();
        assert_eq!(dss.lock(&entity), Err(Errno::EEXIST));
        dss.unlock(&entity).unwrap();
        assert_eq!(dss.unlock(&entity), Err(Errno::ENOLCK));
        dss.lock(&entity).unwrap();
    }
}
