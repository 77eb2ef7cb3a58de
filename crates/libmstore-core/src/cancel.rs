use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::RepoError;

/// Cooperative cancellation flag for long-running reads.
///
/// Diff, export and integrity walks check the token between block fetches.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Return `Cancelled` once the token has been triggered
    pub fn check(&self) -> Result<(), RepoError> {
        if self.is_cancelled() {
            Err(RepoError::Cancelled)
        } else {
            Ok(())
        }
    }
}
