use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{LedgerError, LedgerResult};

/// Cooperative cancellation flag handed down from the request layer. Clones
/// share the flag.
#[derive(Debug, Clone, Default)]
pub(crate) struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn check(&self) -> LedgerResult<()> {
        if self.is_cancelled() {
            Err(LedgerError::Cancelled)
        } else {
            Ok(())
        }
    }
}
