//! Local Resource Scheduler device engine.
//!
//! Storage media (tapes, disks) must be loaded into a limited pool of
//! drives before any I/O is possible. This crate serializes, dispatches
//! and synchronizes client requests against that pool: one cooperative
//! worker thread per drive walks the device through its
//! load/mount/format/unmount lifecycle, write acknowledgements are
//! batched into per-medium synchronization epochs, and every failure is
//! attributed to the drive, the medium, or both.
//!
//! Socket handling, the persistent store and the low-level device
//! drivers are the embedder's concern; they plug in through the
//! [`proto`], [`Dss`] and [`ldm`] capability surfaces.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::config::{Config, DriveGeneration, MINSLEEP, ScsiConfig, SyncThresholds};
pub use crate::dev::{AccessMask, Device, DeviceSet, FormatIndex};
pub use crate::dss::{Dss, Entity, LdmOperation, LogRecord, MediaFields, MemDss, hostname};
pub use crate::ldm::scsi::{RetryClass, ScsiPolicy, classify};
pub use crate::ldm::{
    AdapterRegistry, DriveAdapter, DriveState, ElementKind, FsAdapter, IoAdapter, IoHandle,
    LibAddr, LibraryAdapter,
};
pub use crate::proto::reply::{decode_response, encode_response};
pub use crate::proto::request::{decode_request, encode_request};
pub use crate::proto::{
    AllocElt, DecodeError, Message, Operation, PROTOCOL_VERSION, ReleaseElt, RequestKind,
    RespContainer, Response,
};
pub use crate::queue::TsQueue;
pub use crate::request::{ReqContainer, RwKind, SubStatus};
pub use crate::sched::Scheduler;
pub use crate::types::{
    AddrType, AdmStatus, DeviceInfo, DssLock, Family, FsSpace, FsSpaceFlags, FsStatus, FsType,
    MediumInfo, MediumStats, OpStatus, ResourceId,
};

pub mod config;
pub mod dev;
pub mod dss;
pub mod ldm;
pub mod proto;
mod queue;
pub mod request;
pub mod sched;
pub mod types;
