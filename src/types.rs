//! Resource model shared by every part of the engine.
//!
//! Devices and media are identified by a `(family, name)` pair. The device
//! record carries the host-side view of a drive, the medium record the
//! persisted view of a removable storage unit. Both are plain data: all
//! concurrency control lives with their owners (worker thread, DSS).

use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Resource family. Determines which library/drive adapters manage motion
/// and which filesystem types are meaningful for the media.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Family {
    /// Magnetic tape moved by a mechanical library.
    Tape,
    /// Directory-backed disk storage; motion is a no-op.
    Disk,
    /// RADOS pool exposed through a librados gateway.
    RadosPool,
}

impl Family {
    /// Stable textual name, used in logs and DSS filters.
    pub fn as_str(self) -> &'static str {
        match self {
            Family::Tape => "tape",
            Family::Disk => "disk",
            Family::RadosPool => "rados_pool",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a device or medium: family plus unique name.
///
/// For tape drives the name is the drive serial number; for tapes it is
/// the cartridge barcode.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct ResourceId {
    pub family: Family,
    pub name: String,
}

impl ResourceId {
    pub fn new(family: Family, name: impl Into<String>) -> Self {
        ResourceId {
            family,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family, self.name)
    }
}

/// Administrative status of a resource, persisted in the DSS.
///
/// `Failed` is terminal until an administrator resets it; only `Unlocked`
/// resources are eligible for scheduling.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum AdmStatus {
    #[default]
    Unlocked,
    Locked,
    Failed,
}

impl AdmStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AdmStatus::Unlocked => "unlocked",
            AdmStatus::Locked => "locked",
            AdmStatus::Failed => "failed",
        }
    }
}

/// Operational status of a drive. In-memory state owned by the device
/// worker; `Mounted` implies a loaded medium and a non-empty mount path.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum OpStatus {
    #[default]
    Empty,
    Loaded,
    Mounted,
    Failed,
}

impl OpStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OpStatus::Empty => "empty",
            OpStatus::Loaded => "loaded",
            OpStatus::Mounted => "mounted",
            OpStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filesystem status of a medium.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum FsStatus {
    /// Formatted, nothing written yet.
    #[default]
    Empty,
    /// Contains at least one object.
    Used,
    /// No usable space left.
    Full,
}

/// Filesystem type exposed by a medium once mounted.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum FsType {
    #[default]
    Posix,
    Ltfs,
    Rados,
}

impl FsType {
    pub fn as_str(self) -> &'static str {
        match self {
            FsType::Posix => "POSIX",
            FsType::Ltfs => "LTFS",
            FsType::Rados => "RADOS",
        }
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extent addressing scheme used on a medium.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum AddrType {
    #[default]
    Path,
    Hash1,
    Opaque,
}

bitflags! {
    /// Properties reported by a filesystem space query.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FsSpaceFlags: u32 {
        /// Filesystem is mounted read-only. LTFS mounts almost-full tapes
        /// this way even though `avail` is non-zero.
        const READONLY = 1 << 0;
    }
}

/// Result of a filesystem space query (`df`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FsSpace {
    /// Physically used bytes.
    pub used: u64,
    /// Physically available bytes.
    pub avail: u64,
    pub flags: FsSpaceFlags,
}

/// Distributed lock as recorded in the DSS.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DssLock {
    pub hostname: String,
    /// Owner pid on `hostname`.
    pub owner: u32,
    pub timestamp: SystemTime,
}

/// Device record: the DSS row plus the host-side paths the worker keeps
/// up to date.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: ResourceId,
    /// Vendor model string; not every family reports one.
    pub model: Option<String>,
    pub adm_status: AdmStatus,
    /// Host owning the device.
    pub host: String,
    /// Control path of the drive on `host`.
    pub path: PathBuf,
    pub lock: Option<DssLock>,
}

/// Usage counters of a medium.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MediumStats {
    /// Physically used bytes on the medium.
    pub phys_used: u64,
    /// Physically free bytes on the medium.
    pub phys_free: u64,
    /// Logically used bytes (sum of object sizes).
    pub logc_used: u64,
    /// Number of objects stored.
    pub nb_obj: u64,
}

/// Medium record as persisted in the DSS.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MediumInfo {
    pub id: ResourceId,
    pub fs_type: FsType,
    pub fs_status: FsStatus,
    /// Filesystem label; set by format and always equal to the medium name.
    pub fs_label: String,
    pub addr_type: AddrType,
    pub tags: Vec<String>,
    pub stats: MediumStats,
    pub adm_status: AdmStatus,
    pub lock: Option<DssLock>,
}

impl MediumInfo {
    /// Minimal unformatted medium, used at admission before the first
    /// format completes.
    pub fn new(id: ResourceId, fs_type: FsType) -> Self {
        MediumInfo {
            id,
            fs_type,
            fs_status: FsStatus::Empty,
            fs_label: String::new(),
            addr_type: AddrType::Path,
            tags: Vec::new(),
            stats: MediumStats::default(),
            adm_status: AdmStatus::Unlocked,
            lock: None,
        }
    }

    /// True if the medium carries every tag in `wanted`.
    pub fn has_tags(&self, wanted: &[String]) -> bool {
        wanted.iter().all(|t| self.tags.iter().any(|m| m == t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_id_equality_is_componentwise() {
        let a = ResourceId::new(Family::Tape, "L5-0042");
        let b = ResourceId::new(Family::Tape, "L5-0042");
        let c = ResourceId::new(Family::Disk, "L5-0042");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn display_forms() {
        let id = ResourceId::new(Family::RadosPool, "pool0");
        assert_eq!(id.to_string(), "rados_pool:pool0");
        assert_eq!(OpStatus::Mounted.to_string(), "mounted");
    }

    #[test]
    fn tag_matching() {
        let mut m = MediumInfo::new(ResourceId::new(Family::Tape, "T1"), FsType::Ltfs);
        m.tags = vec!["archive".to_string(), "tier2".to_string()];
        assert!(m.has_tags(&[]));
        assert!(m.has_tags(&["tier2".to_string()]));
        assert!(!m.has_tags(&["tier1".to_string()]));
    }
}
