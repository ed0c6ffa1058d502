//! Exclusive-run gate for background jobs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{SyncError, SyncResult};

/// Single-run gate: at most one job of a kind at a time. The token releases
/// the gate on drop, whatever the job's outcome.
pub(crate) struct RunGate {
    running: Arc<AtomicBool>,
}

impl RunGate {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn try_start(&self, job: &str) -> SyncResult<RunToken> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SyncError::Conflict(job.to_string()));
        }
        Ok(RunToken {
            running: Arc::clone(&self.running),
        })
    }
}

pub(crate) struct RunToken {
    running: Arc<AtomicBool>,
}

impl Drop for RunToken {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_is_exclusive_and_released_on_drop() {
        let gate = RunGate::new();
        assert!(!gate.is_running());

        let token = gate.try_start("sync").unwrap();
        assert!(gate.is_running());
        assert!(matches!(gate.try_start("sync"), Err(SyncError::Conflict(_))));

        drop(token);
        assert!(!gate.is_running());
        gate.try_start("sync").unwrap();
    }
}
