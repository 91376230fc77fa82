//! Engine configuration.
//!
//! Every tunable of the engine lives here as a typed field; loading from a
//! configuration file is the embedder's concern. Builders follow the usual
//! `with_*` style and `validate` rejects values the engine cannot run with.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Family;

/// Sleep floor of the worker wakeup computation. Protects against
/// busy-looping when a release arrives almost exactly on its deadline.
pub const MINSLEEP: Duration = Duration::from_millis(10);

/// Thresholds driving the per-device synchronization batcher. A flush is
/// triggered as soon as any of the three is reached (all inclusive).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncThresholds {
    /// Flush when the oldest enrolled release is this old.
    pub time: Duration,
    /// Flush when this many releases are enrolled.
    pub nb_req: usize,
    /// Flush when the enrolled written sizes sum to this many bytes.
    pub wsize: u64,
}

impl Default for SyncThresholds {
    fn default() -> Self {
        SyncThresholds {
            time: Duration::from_millis(10_000),
            nb_req: 5,
            wsize: 1 << 30,
        }
    }
}

/// Retry policy and timeouts of the SCSI control path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScsiConfig {
    /// Retry budget per SCSI call.
    pub retry_count: u32,
    /// Delay before retrying a transient error (`EAGAIN`, `EINTR`).
    pub retry_short: Duration,
    /// Delay before retrying a busy/timeout error (`EBUSY`, `EIO`,
    /// `ETIMEDOUT`).
    pub retry_long: Duration,
    /// Initial element count per `ELEMENT_STATUS` chunk.
    pub max_element_status: u16,
    pub query_timeout: Duration,
    pub move_timeout: Duration,
    pub inquiry_timeout: Duration,
}

impl Default for ScsiConfig {
    fn default() -> Self {
        ScsiConfig {
            retry_count: 5,
            retry_short: Duration::from_secs(1),
            retry_long: Duration::from_secs(5),
            max_element_status: 64,
            query_timeout: Duration::from_millis(1_000),
            move_timeout: Duration::from_millis(300_000),
            inquiry_timeout: Duration::from_millis(10),
        }
    }
}

/// One drive generation: a technology name and the drive models that
/// belong to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveGeneration {
    /// Technology name, e.g. `LTO5`.
    pub technology: String,
    /// Vendor model strings mapped to this generation.
    pub models: Vec<String>,
}

/// Complete engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Forced I/O chunk size in bytes; 0 derives the size from the I/O
    /// adapter, falling back to the system page size.
    pub io_block_size: u64,
    /// Mount points are `<mount_prefix><device basename>`.
    pub mount_prefix: PathBuf,
    /// Control device of the mechanical library.
    pub lib_device: PathBuf,
    pub scsi: ScsiConfig,
    /// Per-family sync thresholds; families not present use the default.
    sync: HashMap<Family, SyncThresholds>,
    sync_default: SyncThresholds,
    /// Drive model to generation mapping.
    drive_generations: Vec<DriveGeneration>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            io_block_size: 0,
            mount_prefix: PathBuf::from("/mnt/lrs-"),
            lib_device: PathBuf::from("/dev/changer"),
            scsi: ScsiConfig::default(),
            sync: HashMap::new(),
            sync_default: SyncThresholds::default(),
            drive_generations: Vec::new(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sync thresholds for one family.
    pub fn with_sync(mut self, family: Family, thresholds: SyncThresholds) -> Self {
        self.sync.insert(family, thresholds);
        self
    }

    pub fn with_mount_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.mount_prefix = prefix.into();
        self
    }

    pub fn with_io_block_size(mut self, size: u64) -> Self {
        self.io_block_size = size;
        self
    }

    pub fn with_drive_generation(mut self, generation: DriveGeneration) -> Self {
        self.drive_generations.push(generation);
        self
    }

    /// Sync thresholds effective for `family`.
    pub fn sync_for(&self, family: Family) -> SyncThresholds {
        self.sync.get(&family).copied().unwrap_or(self.sync_default)
    }

    /// Technology of a drive model, if the configuration maps it.
    ///
    /// Only fair-share dispatch consumes this; an unmapped model is not an
    /// error.
    pub fn technology_of(&self, model: &str) -> Option<&str> {
        self.drive_generations
            .iter()
            .find(|g| g.models.iter().any(|m| m == model))
            .map(|g| g.technology.as_str())
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> io::Result<()> {
        if self.mount_prefix.as_os_str().is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "mount_prefix must not be empty",
            ));
        }
        for (family, t) in self
            .sync
            .iter()
            .map(|(f, t)| (Some(f), t))
            .chain(std::iter::once((None, &self.sync_default)))
        {
            if t.nb_req == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "sync_nb_req must be at least 1 (family {})",
                        family.map(|f| f.as_str()).unwrap_or("default")
                    ),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_family_thresholds_fall_back_to_default() {
        let fast = SyncThresholds {
            time: Duration::from_millis(200),
            nb_req: 3,
            wsize: 4096,
        };
        let config = Config::new().with_sync(Family::Tape, fast);
        assert_eq!(config.sync_for(Family::Tape), fast);
        assert_eq!(config.sync_for(Family::Disk), SyncThresholds::default());
    }

    #[test]
    fn technology_mapping() {
        let config = Config::new()
            .with_drive_generation(DriveGeneration {
                technology: "LTO5".to_string(),
                models: vec!["ULT3580-TD5".to_string()],
            })
            .with_drive_generation(DriveGeneration {
                technology: "LTO6".to_string(),
                models: vec!["ULT3580-TD6".to_string()],
            });
        assert_eq!(config.technology_of("ULT3580-TD6"), Some("LTO6"));
        assert_eq!(config.technology_of("UNKNOWN"), None);
    }

    #[test]
    fn validate_rejects_zero_nb_req() {
        let bad = Config::new().with_sync(
            Family::Disk,
            SyncThresholds {
                time: Duration::from_secs(1),
                nb_req: 0,
                wsize: 1,
            },
        );
        assert!(bad.validate().is_err());
        assert!(Config::new().validate().is_ok());
    }
}
