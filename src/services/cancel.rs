use crate::domain::RuntimeError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared flag telling workers to stop issuing runtime calls.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Err once cancelled; called by workers between lifecycle phases.
    pub fn check(&self) -> Result<(), RuntimeError> {
        if self.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        Ok(())
    }
}
