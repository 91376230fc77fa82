//! Built-in adapters for directory-backed media.
//!
//! A "disk" medium is a directory; the library performs no motion and the
//! drive has no mouth to load. Mounting materializes as a symlink from
//! the computed mount point to the medium directory, which keeps the
//! whole lifecycle runnable without privileges.

use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs as unix_fs;
use std::path::{Path, PathBuf};

use log::debug;
use nix::errno::Errno;
use nix::sys::statvfs::{FsFlags, statvfs};

use super::{DriveAdapter, DriveState, FsAdapter, IoAdapter, IoHandle, LibAddr, LibraryAdapter};
use crate::types::{Family, FsSpace, FsSpaceFlags};

/// Label file inside a directory medium.
const LABEL_FILE: &str = ".lrs_label";

fn io_errno(err: &std::io::Error) -> Errno {
    err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

/// Library adapter for families where no mechanical motion exists.
#[derive(Debug, Default)]
pub struct DummyLibrary;

impl DummyLibrary {
    pub fn new() -> Self {
        DummyLibrary
    }
}

impl LibraryAdapter for DummyLibrary {
    fn open(&self, _ctrl_path: &Path) -> Result<(), Errno> {
        Ok(())
    }

    fn close(&self) -> Result<(), Errno> {
        Ok(())
    }

    fn drive_lookup(&self, _serial: &str) -> Result<LibAddr, Errno> {
        Ok(LibAddr::unknown())
    }

    fn medium_lookup(&self, _label: &str) -> Result<LibAddr, Errno> {
        Ok(LibAddr::unknown())
    }

    fn move_medium(&self, _src: &LibAddr, _dst: &LibAddr) -> Result<(), Errno> {
        Ok(())
    }

    fn scan(&self) -> Result<String, Errno> {
        Ok("[]".to_string())
    }
}

/// Drive adapter for directory media: the serial is the directory path.
#[derive(Debug, Default)]
pub struct DirDrive;

impl DirDrive {
    pub fn new() -> Self {
        DirDrive
    }
}

impl DriveAdapter for DirDrive {
    fn lookup(&self, serial: &str) -> Result<PathBuf, Errno> {
        let path = PathBuf::from(serial);
        if path.is_dir() {
            Ok(path)
        } else {
            Err(Errno::ENOENT)
        }
    }

    fn query(&self, path: &Path) -> Result<DriveState, Errno> {
        if !path.is_dir() {
            return Err(Errno::ENOENT);
        }
        Ok(DriveState {
            model: None,
            serial: Some(path.to_string_lossy().into_owned()),
            family: Some(Family::Disk),
        })
    }

    fn load(&self, _path: &Path) -> Result<(), Errno> {
        Ok(())
    }

    fn eject(&self, _path: &Path) -> Result<(), Errno> {
        Ok(())
    }
}

fn statvfs_space(path: &Path) -> Result<FsSpace, Errno> {
    let st = statvfs(path)?;
    let frsize = st.fragment_size() as u64;
    let mut flags = FsSpaceFlags::empty();
    if st.flags().contains(FsFlags::ST_RDONLY) {
        flags |= FsSpaceFlags::READONLY;
    }
    Ok(FsSpace {
        used: (st.blocks() as u64 - st.blocks_free() as u64) * frsize,
        avail: st.blocks_available() as u64 * frsize,
        flags,
    })
}

/// POSIX filesystem adapter over a directory medium.
#[derive(Debug, Default)]
pub struct PosixFs;

impl PosixFs {
    pub fn new() -> Self {
        PosixFs
    }

    fn read_label(dev_path: &Path) -> Result<String, Errno> {
        let mut label = String::new();
        fs::File::open(dev_path.join(LABEL_FILE))
            .and_then(|mut f| f.read_to_string(&mut label))
            .map_err(|e| io_errno(&e))?;
        Ok(label.trim_end().to_string())
    }
}

impl FsAdapter for PosixFs {
    fn mount(&self, dev_path: &Path, mnt_path: &Path, label: &str) -> Result<(), Errno> {
        let on_medium = Self::read_label(dev_path)?;
        if on_medium != label {
            debug!(
                "mount refused: label '{}' does not match requested '{}'",
                on_medium, label
            );
            return Err(Errno::EINVAL);
        }

        match fs::symlink_metadata(mnt_path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                // Stale mount point from a previous run.
                fs::remove_file(mnt_path).map_err(|e| io_errno(&e))?;
            }
            Ok(_) => return Err(Errno::EEXIST),
            Err(_) => {}
        }
        if let Some(parent) = mnt_path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_errno(&e))?;
        }
        unix_fs::symlink(dev_path, mnt_path).map_err(|e| io_errno(&e))
    }

    fn umount(&self, _dev_path: &Path, mnt_path: &Path) -> Result<(), Errno> {
        match fs::symlink_metadata(mnt_path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                fs::remove_file(mnt_path).map_err(|e| io_errno(&e))
            }
            Ok(_) => Err(Errno::EINVAL),
            Err(e) => Err(io_errno(&e)),
        }
    }

    fn format(&self, dev_path: &Path, label: &str) -> Result<FsSpace, Errno> {
        if !dev_path.is_dir() {
            return Err(Errno::ENOENT);
        }
        let label_path = dev_path.join(LABEL_FILE);
        if label_path.exists() {
            return Err(Errno::EEXIST);
        }
        fs::File::create(&label_path)
            .and_then(|mut f| f.write_all(label.as_bytes()))
            .map_err(|e| io_errno(&e))?;
        statvfs_space(dev_path)
    }

    fn mounted(&self, _dev_path: &Path) -> Result<Option<PathBuf>, Errno> {
        // Directory media leave no kernel mount record.
        Ok(None)
    }

    fn df(&self, mnt_path: &Path) -> Result<FsSpace, Errno> {
        statvfs_space(mnt_path)
    }

    fn get_label(&self, dev_path: &Path) -> Result<String, Errno> {
        Self::read_label(dev_path)
    }
}

/// POSIX object I/O: objects are plain files under the mount root.
#[derive(Debug, Default)]
pub struct PosixIo;

impl PosixIo {
    pub fn new() -> Self {
        PosixIo
    }
}

struct PosixHandle {
    file: fs::File,
}

impl IoHandle for PosixHandle {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Errno> {
        self.file.read(buf).map_err(|e| io_errno(&e))
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, Errno> {
        self.file.write(buf).map_err(|e| io_errno(&e))
    }
}

impl IoAdapter for PosixIo {
    fn open(&self, root: &Path, addr: &str, write: bool) -> Result<Box<dyn IoHandle>, Errno> {
        let path = root.join(addr);
        let file = if write {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| io_errno(&e))?;
            }
            fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
        } else {
            fs::File::open(&path)
        }
        .map_err(|e| io_errno(&e))?;
        Ok(Box::new(PosixHandle { file }))
    }

    fn del(&self, root: &Path, addr: &str) -> Result<(), Errno> {
        fs::remove_file(root.join(addr)).map_err(|e| io_errno(&e))
    }

    fn medium_sync(&self, root: &Path) -> Result<(), Errno> {
        let dir = fs::File::open(root).map_err(|e| io_errno(&e))?;
        dir.sync_all().map_err(|e| io_errno(&e))
    }

    fn preferred_io_size(&self, root: &Path) -> u64 {
        statvfs(root).map(|st| st.block_size() as u64).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn format_then_mount_with_matching_label() {
        let medium = TempDir::new().unwrap();
        let mnt_parent = TempDir::new().unwrap();
        let mnt = mnt_parent.path().join("lrs-d0");

        let fsa = PosixFs::new();
        let space = fsa.format(medium.path(), "d0").unwrap();
        assert!(space.avail > 0);
        assert_eq!(fsa.get_label(medium.path()).unwrap(), "d0");

        fsa.mount(medium.path(), &mnt, "d0").unwrap();
        assert!(mnt.exists());
        fsa.umount(medium.path(), &mnt).unwrap();
        assert!(!mnt.exists());
    }

    #[test]
    fn mount_refuses_label_mismatch() {
        let medium = TempDir::new().unwrap();
        let mnt_parent = TempDir::new().unwrap();
        let mnt = mnt_parent.path().join("lrs-d1");

        let fsa = PosixFs::new();
        fsa.format(medium.path(), "d1").unwrap();
        assert_eq!(
            fsa.mount(medium.path(), &mnt, "other"),
            Err(Errno::EINVAL)
        );
    }

    #[test]
    fn double_format_is_rejected() {
        let medium = TempDir::new().unwrap();
        let fsa = PosixFs::new();
        fsa.format(medium.path(), "d2").unwrap();
        assert_eq!(fsa.format(medium.path(), "d2"), Err(Errno::EEXIST));
    }

    #[test]
    fn io_objects_round_trip() {
        let medium = TempDir::new().unwrap();
        let ioa = PosixIo::new();

        let mut h = ioa.open(medium.path(), "obj/1", true).unwrap();
        h.write(b"payload").unwrap();
        drop(h);

        let mut h = ioa.open(medium.path(), "obj/1", false).unwrap();
        let mut buf = [0u8; 16];
        let n = h.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"payload");

        ioa.medium_sync(medium.path()).unwrap();
        ioa.del(medium.path(), "obj/1").unwrap();
        assert_eq!(
            ioa.open(medium.path(), "obj/1", false).err(),
            Some(Errno::ENOENT)
        );
    }
}
