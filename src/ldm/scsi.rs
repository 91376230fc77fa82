//! SCSI control-path policy.
//!
//! Every library or drive command goes through the retry loop defined
//! here. Errors fall into three classes: transient ones retried
//! immediately, busy/timeout ones retried after a longer delay, and
//! everything else fatal. The whole control path is serialized behind one
//! process-wide mutex; some changer libraries reject concurrent commands
//! on the same control device.

use std::thread;

use log::{debug, error, warn};
use nix::errno::Errno;
use parking_lot::{Mutex, MutexGuard};

use crate::config::ScsiConfig;

/// Retry class of a control-path error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryClass {
    /// Not retriable.
    Fatal,
    /// Retry after the short delay.
    Short,
    /// Retry after the long delay.
    Long,
}

/// Classify a control-path errno.
pub fn classify(errno: Errno) -> RetryClass {
    match errno {
        Errno::EBUSY | Errno::EIO | Errno::ETIMEDOUT => RetryClass::Long,
        Errno::EAGAIN | Errno::EINTR => RetryClass::Short,
        _ => RetryClass::Fatal,
    }
}

static CONTROL_PATH: Mutex<()> = Mutex::new(());

/// Serialize a control-path command sequence. Held for the duration of
/// one adapter call, never across a worker suspension point.
pub fn control_path_lock() -> MutexGuard<'static, ()> {
    CONTROL_PATH.lock()
}

/// Retry policy around library and drive commands.
#[derive(Clone, Copy, Debug)]
pub struct ScsiPolicy {
    config: ScsiConfig,
}

impl ScsiPolicy {
    pub fn new(config: ScsiConfig) -> Self {
        ScsiPolicy { config }
    }

    /// Run `op`, retrying per error class within the configured budget.
    pub fn retry<T>(
        &self,
        opname: &str,
        mut op: impl FnMut() -> Result<T, Errno>,
    ) -> Result<T, Errno> {
        let mut budget = self.config.retry_count;
        loop {
            let errno = match op() {
                Ok(value) => return Ok(value),
                Err(errno) => errno,
            };

            let delay = match classify(errno) {
                RetryClass::Fatal => {
                    error!("{}: failed: {}", opname, errno);
                    return Err(errno);
                }
                RetryClass::Short => self.config.retry_short,
                RetryClass::Long => self.config.retry_long,
            };

            if budget == 0 {
                error!("{}: all retries failed: {}", opname, errno);
                return Err(errno);
            }
            budget -= 1;

            warn!(
                "{}: failed with {}, retry in {:?} ({} attempts left)",
                opname, errno, delay, budget
            );
            thread::sleep(delay);
            debug!("{}: retrying", opname);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_policy(retry_count: u32) -> ScsiPolicy {
        ScsiPolicy::new(ScsiConfig {
            retry_count,
            retry_short: Duration::from_millis(1),
            retry_long: Duration::from_millis(1),
            ..ScsiConfig::default()
        })
    }

    #[test]
    fn classes() {
        assert_eq!(classify(Errno::EBUSY), RetryClass::Long);
        assert_eq!(classify(Errno::EIO), RetryClass::Long);
        assert_eq!(classify(Errno::ETIMEDOUT), RetryClass::Long);
        assert_eq!(classify(Errno::EAGAIN), RetryClass::Short);
        assert_eq!(classify(Errno::EINTR), RetryClass::Short);
        assert_eq!(classify(Errno::ENOENT), RetryClass::Fatal);
    }

    #[test]
    fn fatal_error_exhausts_no_budget() {
        let mut calls = 0;
        let rc: Result<(), _> = fast_policy(5).retry("op", || {
            calls += 1;
            Err(Errno::EINVAL)
        });
        assert_eq!(rc, Err(Errno::EINVAL));
        assert_eq!(calls, 1);
    }

    #[test]
    fn transient_error_retried_within_budget() {
        let mut calls = 0;
        let rc = fast_policy(5).retry("op", || {
            calls += 1;
            if calls < 3 { Err(Errno::EAGAIN) } else { Ok(calls) }
        });
        assert_eq!(rc, Ok(3));
    }

    #[test]
    fn budget_exhaustion_returns_last_error() {
        let mut calls = 0;
        let rc: Result<(), _> = fast_policy(2).retry("op", || {
            calls += 1;
            Err(Errno::EBUSY)
        });
        assert_eq!(rc, Err(Errno::EBUSY));
        assert_eq!(calls, 3);
    }
}
