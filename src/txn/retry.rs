//! Write-conflict retry loop

use crate::config::RetryConfig;
use crate::Result;
use std::thread;
use tracing::{debug, warn};

/// Run `op` until it completes without a write conflict
///
/// Any other error is returned immediately. Once `config.max_attempts` is
/// exhausted the last write conflict is returned.
pub fn write_conflict_retry<T, F>(
    config: &RetryConfig,
    op_name: &str,
    namespace: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt: u32 = 1;
    loop {
        match op() {
            Err(err) if err.is_write_conflict() => {
                if !config.allows_attempt(attempt + 1) {
                    warn!(op_name, namespace, attempts = attempt, "giving up after repeated write conflicts");
                    return Err(err);
                }

                let backoff = config.backoff_for(attempt);
                debug!(op_name, namespace, attempt, ?backoff, "write conflict, retrying");
                if !backoff.is_zero() {
                    thread::sleep(backoff);
                }
                attempt += 1;
            }
            other => return other,
        }
    }
}
