//! Recovery from destination files held open by running processes.
//!
//! Replacing a file that belongs to a running application fails on some
//! platforms. Writes are retried on a fixed delay, and after a few failed
//! attempts the processes that appear to hold the file are terminated through
//! an injectable [`ProcessTerminator`].

use anyhow::Result;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, warn};

use crate::constants::{LOCKED_FILE_KILL_AFTER, LOCKED_FILE_MAX_RETRIES, LOCKED_FILE_RETRY_DELAY};
use crate::core::UpdaterError;

/// Strategy for terminating processes that hold a file open.
pub trait ProcessTerminator: Send + Sync {
    /// Terminates processes that appear to hold `path` and returns how many
    /// were killed.
    fn terminate_holders(&self, path: &Path) -> Result<usize>;
}

/// Terminates the first process whose name or executable matches the locked
/// file's full name.
///
/// There is no portable way to ask which process holds a file, so the match
/// is made on the file name. The updater's own process is never terminated.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTerminator;

impl ProcessTerminator for SystemProcessTerminator {
    fn terminate_holders(&self, path: &Path) -> Result<usize> {
        let Some(target_name) = path.file_name() else {
            return Ok(0);
        };

        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        let current = sysinfo::get_current_pid().ok();

        let holder = system.processes().iter().find(|(pid, process)| {
            Some(**pid) != current
                && (process.name() == target_name
                    || process
                        .exe()
                        .is_some_and(|exe| exe == path || exe.file_name() == Some(target_name)))
        });

        match holder {
            Some((pid, process)) if process.kill() => {
                warn!(
                    "Terminated process {} ({}) holding {}",
                    pid,
                    process.name().to_string_lossy(),
                    path.display()
                );
                Ok(1)
            }
            _ => Ok(0),
        }
    }
}

/// Retry parameters for locked destination files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRetryPolicy {
    /// Retries after the first attempt before giving up.
    pub max_retries: u32,
    /// Failed attempts after which holders are terminated.
    pub kill_after: u32,
    /// Delay between attempts.
    pub delay: Duration,
}

impl Default for LockRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: LOCKED_FILE_MAX_RETRIES,
            kill_after: LOCKED_FILE_KILL_AFTER,
            delay: LOCKED_FILE_RETRY_DELAY,
        }
    }
}

/// Failure bookkeeping for one destination file.
///
/// Call [`record_failure`](Self::record_failure) after every failed attempt.
/// It sleeps and returns `Ok(())` while another attempt is allowed, and turns
/// the failure into [`UpdaterError::LockedFileError`] once retries are spent.
pub struct LockRetry<'a> {
    path: &'a Path,
    policy: &'a LockRetryPolicy,
    terminator: &'a dyn ProcessTerminator,
    failures: u32,
}

impl<'a> LockRetry<'a> {
    /// Starts tracking attempts for `path`.
    pub fn new(
        path: &'a Path,
        policy: &'a LockRetryPolicy,
        terminator: &'a dyn ProcessTerminator,
    ) -> Self {
        Self {
            path,
            policy,
            terminator,
            failures: 0,
        }
    }

    /// Number of failed attempts so far.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Records a failed attempt.
    pub async fn record_failure(&mut self, error: std::io::Error) -> Result<()> {
        self.failures += 1;
        warn!(
            "Attempt {} to write {} failed: {error}",
            self.failures,
            self.path.display()
        );

        if self.failures > self.policy.max_retries {
            return Err(anyhow::Error::new(error).context(UpdaterError::LockedFileError {
                path: self.path.display().to_string(),
                attempts: self.failures,
            }));
        }

        if self.failures >= self.policy.kill_after {
            match self.terminator.terminate_holders(self.path) {
                Ok(0) => debug!("No process found holding {}", self.path.display()),
                Ok(count) => debug!("Terminated {count} process(es) holding {}", self.path.display()),
                Err(e) => warn!("Failed to terminate holders of {}: {e:#}", self.path.display()),
            }
        }

        tokio::time::sleep(self.policy.delay).await;
        Ok(())
    }
}

/// Runs `op` until it succeeds or the retry policy is exhausted.
///
/// `op` must not borrow from its own captures across the returned future;
/// capture references by copy (`move || async move { .. }`).
pub async fn with_lock_retry<T, F, Fut>(
    path: &Path,
    policy: &LockRetryPolicy,
    terminator: &dyn ProcessTerminator,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    let mut retry = LockRetry::new(path, policy, terminator);
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => retry.record_failure(e).await?,
        }
    }
}
