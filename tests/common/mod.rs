//! Shared harness for the engine scenarios: scripted adapters over an
//! in-memory store.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use parking_lot::Mutex;

use lrs::{
    AdapterRegistry, Config, DeviceInfo, DriveAdapter, DriveState, ElementKind, Family, FsAdapter,
    FsSpace, FsSpaceFlags, FsStatus, FsType, IoAdapter, IoHandle, LibAddr, LibraryAdapter, MemDss,
    MediumInfo, Message, RespContainer, ResourceId, Response, Scheduler, hostname,
};

pub const FAMILY: Family = Family::Tape;

/// Scripted mechanical library.
#[derive(Default)]
pub struct MockLib {
    pub state: Mutex<MockLibState>,
}

#[derive(Default)]
pub struct MockLibState {
    /// Current location of each medium.
    pub media: HashMap<String, LibAddr>,
    /// Drive address of each device serial.
    pub drives: HashMap<String, LibAddr>,
    /// Media whose lookup fails with EIO.
    pub fail_lookup: HashSet<String>,
    /// Refuse drive-to-drive movements like some real libraries do.
    pub refuse_drive_to_drive: bool,
    pub moves: Vec<(LibAddr, LibAddr)>,
    next_free_slot: u64,
}

impl MockLibState {
    fn free_slot(&mut self) -> LibAddr {
        self.next_free_slot += 1;
        LibAddr::slot(1000 + self.next_free_slot)
    }
}

impl LibraryAdapter for MockLib {
    fn open(&self, _ctrl_path: &Path) -> Result<(), Errno> {
        Ok(())
    }

    fn close(&self) -> Result<(), Errno> {
        Ok(())
    }

    fn drive_lookup(&self, serial: &str) -> Result<LibAddr, Errno> {
        self.state
            .lock()
            .drives
            .get(serial)
            .copied()
            .ok_or(Errno::ENOENT)
    }

    fn medium_lookup(&self, label: &str) -> Result<LibAddr, Errno> {
        let state = self.state.lock();
        if state.fail_lookup.contains(label) {
            return Err(Errno::EIO);
        }
        state.media.get(label).copied().ok_or(Errno::ENOENT)
    }

    fn move_medium(&self, src: &LibAddr, dst: &LibAddr) -> Result<(), Errno> {
        let mut state = self.state.lock();
        if state.refuse_drive_to_drive
            && src.kind == ElementKind::Drive
            && dst.kind == ElementKind::Drive
        {
            return Err(Errno::EINVAL);
        }
        let dst = if dst.kind == ElementKind::Unknown {
            state.free_slot()
        } else {
            *dst
        };
        let name = state
            .media
            .iter()
            .find(|(_, addr)| **addr == *src)
            .map(|(name, _)| name.clone())
            .ok_or(Errno::ENOENT)?;
        state.media.insert(name, dst);
        state.moves.push((*src, dst));
        Ok(())
    }

    fn scan(&self) -> Result<String, Errno> {
        Ok("[]".to_string())
    }
}

/// Drive control stub: every device exists and loads/ejects cleanly.
#[derive(Default)]
pub struct MockDrive;

impl DriveAdapter for MockDrive {
    fn lookup(&self, serial: &str) -> Result<PathBuf, Errno> {
        Ok(PathBuf::from(format!("/dev/mock/{serial}")))
    }

    fn query(&self, path: &Path) -> Result<DriveState, Errno> {
        Ok(DriveState {
            model: Some("MOCK-TD5".to_string()),
            serial: path.file_name().map(|n| n.to_string_lossy().into_owned()),
            family: Some(FAMILY),
        })
    }

    fn load(&self, _path: &Path) -> Result<(), Errno> {
        Ok(())
    }

    fn eject(&self, _path: &Path) -> Result<(), Errno> {
        Ok(())
    }
}

/// Scripted filesystem adapter.
#[derive(Default)]
pub struct MockFs {
    pub state: Mutex<MockFsState>,
}

#[derive(Default)]
pub struct MockFsState {
    /// Mounted label per mount path.
    pub mounted: HashMap<PathBuf, String>,
    /// Media mounted read-only despite free space.
    pub readonly_media: HashSet<String>,
    /// Labels whose mount fails with EIO.
    pub fail_mount: HashSet<String>,
    pub formats: Vec<String>,
    pub space: FsSpace,
}

impl MockFs {
    pub fn new() -> Self {
        let fs = MockFs::default();
        fs.state.lock().space = FsSpace {
            used: 0,
            avail: 1 << 40,
            flags: FsSpaceFlags::empty(),
        };
        fs
    }
}

impl FsAdapter for MockFs {
    fn mount(&self, _dev_path: &Path, mnt_path: &Path, label: &str) -> Result<(), Errno> {
        let mut state = self.state.lock();
        if state.fail_mount.contains(label) {
            return Err(Errno::EIO);
        }
        state.mounted.insert(mnt_path.to_path_buf(), label.to_string());
        Ok(())
    }

    fn umount(&self, _dev_path: &Path, mnt_path: &Path) -> Result<(), Errno> {
        self.state
            .lock()
            .mounted
            .remove(mnt_path)
            .map(|_| ())
            .ok_or(Errno::EINVAL)
    }

    fn format(&self, _dev_path: &Path, label: &str) -> Result<FsSpace, Errno> {
        let mut state = self.state.lock();
        state.formats.push(label.to_string());
        Ok(state.space)
    }

    fn mounted(&self, _dev_path: &Path) -> Result<Option<PathBuf>, Errno> {
        Ok(None)
    }

    fn df(&self, mnt_path: &Path) -> Result<FsSpace, Errno> {
        let state = self.state.lock();
        let mut space = state.space;
        if let Some(label) = state.mounted.get(mnt_path) {
            if state.readonly_media.contains(label) {
                space.flags |= FsSpaceFlags::READONLY;
            }
        }
        Ok(space)
    }

    fn get_label(&self, _dev_path: &Path) -> Result<String, Errno> {
        Err(Errno::ENOSYS)
    }
}

/// I/O adapter recording every medium sync.
#[derive(Default)]
pub struct MockIo {
    pub syncs: Mutex<Vec<PathBuf>>,
    pub fail_sync: Mutex<bool>,
}

impl IoAdapter for MockIo {
    fn open(&self, _root: &Path, _addr: &str, _write: bool) -> Result<Box<dyn IoHandle>, Errno> {
        Err(Errno::ENOSYS)
    }

    fn del(&self, _root: &Path, _addr: &str) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    fn medium_sync(&self, root: &Path) -> Result<(), Errno> {
        if *self.fail_sync.lock() {
            return Err(Errno::EIO);
        }
        self.syncs.lock().push(root.to_path_buf());
        Ok(())
    }

    fn preferred_io_size(&self, _root: &Path) -> u64 {
        4096
    }
}

pub struct TestBed {
    pub dss: Arc<MemDss>,
    pub lib: Arc<MockLib>,
    pub fs: Arc<MockFs>,
    pub io: Arc<MockIo>,
    pub sched: Scheduler,
}

pub fn device_id(i: usize) -> ResourceId {
    ResourceId::new(FAMILY, format!("D{i}"))
}

pub fn medium_id(name: &str) -> ResourceId {
    ResourceId::new(FAMILY, name)
}

/// A formatted medium row ready for reads and writes.
pub fn formatted_medium(name: &str) -> MediumInfo {
    let mut medium = MediumInfo::new(medium_id(name), FsType::Ltfs);
    medium.fs_label = name.to_string();
    medium.fs_status = FsStatus::Used;
    medium.stats.phys_free = 1 << 40;
    medium
}

/// Build a scheduler over `n_drives` drives and the given media, all
/// sitting in library slots.
pub fn testbed(n_drives: usize, media: Vec<MediumInfo>, config: Config) -> TestBed {
    let _ = env_logger::builder().is_test(true).try_init();

    let dss = Arc::new(MemDss::new());
    let lib = Arc::new(MockLib::default());
    let fs = Arc::new(MockFs::new());
    let io = Arc::new(MockIo::default());

    {
        let mut state = lib.state.lock();
        for i in 0..n_drives {
            let id = device_id(i);
            state.drives.insert(id.name.clone(), LibAddr::drive(100 + i as u64));
            dss.insert_device(DeviceInfo {
                id: id.clone(),
                model: Some("MOCK-TD5".to_string()),
                adm_status: Default::default(),
                host: hostname(),
                path: PathBuf::from(format!("/dev/mock/{}", id.name)),
                lock: None,
            });
        }
        for (j, medium) in media.iter().enumerate() {
            state.media.insert(medium.id.name.clone(), LibAddr::slot(j as u64));
            dss.insert_medium(medium.clone());
        }
    }

    let mut registry = AdapterRegistry::new();
    registry.register_lib(FAMILY, lib.clone());
    registry.register_drive(FAMILY, Arc::new(MockDrive));
    registry.register_fs(FsType::Ltfs, fs.clone());
    registry.register_io(FsType::Ltfs, io.clone());

    let sched = Scheduler::new(FAMILY, config, dss.clone(), registry).unwrap();
    if n_drives > 0 {
        sched.load_devices().unwrap();
    }
    sched.start().unwrap();

    TestBed {
        dss,
        lib,
        fs,
        io,
        sched,
    }
}

/// Pop responses until one for `req_id` shows up.
pub fn wait_response(sched: &Scheduler, req_id: u64, timeout: Duration) -> Response {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(std::time::Instant::now())
            .unwrap_or_else(|| panic!("no response for request {req_id} within {timeout:?}"));
        if let Some(RespContainer { resp, .. }) = sched.pop_response(remaining) {
            if resp.req_id() == req_id {
                return resp;
            }
        }
    }
}

pub fn push(sched: &Scheduler, req_id: u64, op: lrs::Operation) {
    sched.push_request(1, Message { req_id, op });
}
