//! Local device manager: the adapter facade.
//!
//! Four capability surfaces — library, drive, filesystem, I/O — selected
//! at runtime by resource family or filesystem type through the
//! [`AdapterRegistry`]. The engine only ever sees these traits; concrete
//! SCSI/LTFS drivers plug in through the registry, and the built-in
//! POSIX/dummy implementations cover directory-backed media.

pub mod io;
pub mod posix;
pub mod scsi;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::errno::Errno;

use crate::types::{Family, FsSpace, FsType};

/// Kind of a library element.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ElementKind {
    #[default]
    Unknown,
    Drive,
    Slot,
    Arm,
    ImpExp,
}

/// Address of an element inside a library.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LibAddr {
    pub kind: ElementKind,
    /// Opaque element address, meaningful to the library only.
    pub addr: u64,
}

impl LibAddr {
    pub fn unknown() -> Self {
        LibAddr::default()
    }

    pub fn drive(addr: u64) -> Self {
        LibAddr {
            kind: ElementKind::Drive,
            addr,
        }
    }

    pub fn slot(addr: u64) -> Self {
        LibAddr {
            kind: ElementKind::Slot,
            addr,
        }
    }
}

impl fmt::Display for LibAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ElementKind::Unknown => "unknown",
            ElementKind::Drive => "drive",
            ElementKind::Slot => "slot",
            ElementKind::Arm => "arm",
            ElementKind::ImpExp => "impexp",
        };
        write!(f, "{}:{:#x}", kind, self.addr)
    }
}

/// State of a drive as reported by the system.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DriveState {
    pub model: Option<String>,
    pub serial: Option<String>,
    pub family: Option<Family>,
}

/// Mechanical library: moves media between slots and drives.
///
/// Two consecutive [`drive_lookup`](Self::drive_lookup) calls on a stable
/// library return identical addresses; callers observing an inconsistency
/// must [`close`](Self::close) and [`open`](Self::open) again.
pub trait LibraryAdapter: Send + Sync {
    /// Open the library control device.
    fn open(&self, ctrl_path: &Path) -> Result<(), Errno>;

    /// Close the library control device.
    fn close(&self) -> Result<(), Errno>;

    /// Locate the drive holding `serial`.
    fn drive_lookup(&self, serial: &str) -> Result<LibAddr, Errno>;

    /// Locate the medium labeled `label`.
    fn medium_lookup(&self, label: &str) -> Result<LibAddr, Errno>;

    /// Move a medium from `src` to `dst`.
    fn move_medium(&self, src: &LibAddr, dst: &LibAddr) -> Result<(), Errno>;

    /// Dump the whole element status as an opaque blob.
    fn scan(&self) -> Result<String, Errno>;
}

/// Drive control on the local host.
pub trait DriveAdapter: Send + Sync {
    /// Resolve a drive serial to its on-host device path.
    fn lookup(&self, serial: &str) -> Result<PathBuf, Errno>;

    /// Query model/serial/family of the drive at `path`.
    fn query(&self, path: &Path) -> Result<DriveState, Errno>;

    /// Load the medium sitting in the drive mouth. No-op on families
    /// where the library performs the motion.
    fn load(&self, path: &Path) -> Result<(), Errno>;

    /// Eject the medium from the drive. Same no-op rule as `load`.
    fn eject(&self, path: &Path) -> Result<(), Errno>;
}

/// Filesystem of a mounted medium.
pub trait FsAdapter: Send + Sync {
    /// Mount the medium in `dev_path` at `mnt_path`. Must refuse when the
    /// on-medium label does not match `label`.
    fn mount(&self, dev_path: &Path, mnt_path: &Path, label: &str) -> Result<(), Errno>;

    /// Unmount the filesystem mounted at `mnt_path`.
    fn umount(&self, dev_path: &Path, mnt_path: &Path) -> Result<(), Errno>;

    /// Format the medium in `dev_path`, labeling it `label`.
    fn format(&self, dev_path: &Path, label: &str) -> Result<FsSpace, Errno>;

    /// Mount point of the medium if the device already exposes one.
    fn mounted(&self, dev_path: &Path) -> Result<Option<PathBuf>, Errno>;

    /// Space usage of the filesystem at `mnt_path`.
    fn df(&self, mnt_path: &Path) -> Result<FsSpace, Errno>;

    /// Read the on-medium label.
    fn get_label(&self, dev_path: &Path) -> Result<String, Errno>;
}

/// Byte-level object I/O on a mounted medium.
pub trait IoAdapter: Send + Sync {
    /// Open the object at `addr` under `root`.
    fn open(&self, root: &Path, addr: &str, write: bool) -> Result<Box<dyn IoHandle>, Errno>;

    /// Delete the object at `addr` under `root`.
    fn del(&self, root: &Path, addr: &str) -> Result<(), Errno>;

    /// Flush every write on the medium mounted at `root` to stable
    /// storage.
    fn medium_sync(&self, root: &Path) -> Result<(), Errno>;

    /// Chunk size the backend prefers; 0 when unknown.
    fn preferred_io_size(&self, root: &Path) -> u64;
}

/// An open object.
pub trait IoHandle: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Errno>;
    fn write(&mut self, buf: &[u8]) -> Result<usize, Errno>;
}

/// Runtime selection of adapters by family and filesystem type.
///
/// Built-in implementations are registered by [`AdapterRegistry::new`];
/// additional families plug in through the `register_*` methods at
/// construction time, before the registry is shared with the workers.
pub struct AdapterRegistry {
    lib: Vec<(Family, Arc<dyn LibraryAdapter>)>,
    drive: Vec<(Family, Arc<dyn DriveAdapter>)>,
    fs: Vec<(FsType, Arc<dyn FsAdapter>)>,
    io: Vec<(FsType, Arc<dyn IoAdapter>)>,
}

impl AdapterRegistry {
    /// Registry with the built-in POSIX and motionless-library adapters.
    pub fn new() -> Self {
        let mut registry = AdapterRegistry {
            lib: Vec::new(),
            drive: Vec::new(),
            fs: Vec::new(),
            io: Vec::new(),
        };
        registry.register_lib(Family::Disk, Arc::new(posix::DummyLibrary::new()));
        registry.register_drive(Family::Disk, Arc::new(posix::DirDrive::new()));
        registry.register_fs(FsType::Posix, Arc::new(posix::PosixFs::new()));
        registry.register_io(FsType::Posix, Arc::new(posix::PosixIo::new()));
        registry
    }

    pub fn register_lib(&mut self, family: Family, adapter: Arc<dyn LibraryAdapter>) {
        self.lib.retain(|(f, _)| *f != family);
        self.lib.push((family, adapter));
    }

    pub fn register_drive(&mut self, family: Family, adapter: Arc<dyn DriveAdapter>) {
        self.drive.retain(|(f, _)| *f != family);
        self.drive.push((family, adapter));
    }

    pub fn register_fs(&mut self, fs_type: FsType, adapter: Arc<dyn FsAdapter>) {
        self.fs.retain(|(f, _)| *f != fs_type);
        self.fs.push((fs_type, adapter));
    }

    pub fn register_io(&mut self, fs_type: FsType, adapter: Arc<dyn IoAdapter>) {
        self.io.retain(|(f, _)| *f != fs_type);
        self.io.push((fs_type, adapter));
    }

    pub fn lib(&self, family: Family) -> Result<&Arc<dyn LibraryAdapter>, Errno> {
        self.lib
            .iter()
            .find(|(f, _)| *f == family)
            .map(|(_, a)| a)
            .ok_or(Errno::ENOSYS)
    }

    pub fn drive(&self, family: Family) -> Result<&Arc<dyn DriveAdapter>, Errno> {
        self.drive
            .iter()
            .find(|(f, _)| *f == family)
            .map(|(_, a)| a)
            .ok_or(Errno::ENOSYS)
    }

    pub fn fs(&self, fs_type: FsType) -> Result<&Arc<dyn FsAdapter>, Errno> {
        self.fs
            .iter()
            .find(|(f, _)| *f == fs_type)
            .map(|(_, a)| a)
            .ok_or(Errno::ENOSYS)
    }

    pub fn io(&self, fs_type: FsType) -> Result<&Arc<dyn IoAdapter>, Errno> {
        self.io
            .iter()
            .find(|(f, _)| *f == fs_type)
            .map(|(_, a)| a)
            .ok_or(Errno::ENOSYS)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("lib", &self.lib.iter().map(|(f, _)| f).collect::<Vec<_>>())
            .field(
                "drive",
                &self.drive.iter().map(|(f, _)| f).collect::<Vec<_>>(),
            )
            .field("fs", &self.fs.iter().map(|(f, _)| f).collect::<Vec<_>>())
            .field("io", &self.io.iter().map(|(f, _)| f).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_covers_disk_posix() {
        let registry = AdapterRegistry::new();
        assert!(registry.lib(Family::Disk).is_ok());
        assert!(registry.drive(Family::Disk).is_ok());
        assert!(registry.fs(FsType::Posix).is_ok());
        assert!(registry.io(FsType::Posix).is_ok());
        assert_eq!(registry.lib(Family::Tape).err(), Some(Errno::ENOSYS));
    }

    #[test]
    fn register_replaces_per_key() {
        let mut registry = AdapterRegistry::new();
        registry.register_fs(FsType::Posix, Arc::new(posix::PosixFs::new()));
        assert_eq!(registry.fs.iter().filter(|(f, _)| *f == FsType::Posix).count(), 1);
    }
}
