use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Cooperative cancellation token.
///
/// Every top-level operation accepts an optional token and checks it at its
/// suspension points: between scoring batches and between candidate blocks.
/// Observation produces an explicit [`Error::Cancelled`]; partial results are
/// never returned.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Safe to call from any thread.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Error out if cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Check an optional token; absent tokens never cancel.
pub(crate) fn check(token: Option<&CancelToken>) -> Result<()> {
    match token {
        Some(t) => t.check(),
        None => Ok(()),
    }
}
