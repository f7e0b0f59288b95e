use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{FlashError, FlashResult};

/// Cooperative cancellation flag shared between a programming session and
/// its owner. Engines check it between protocol steps, never mid-packet,
/// so a cancelled session may leave the target partially flashed.
#[derive(Clone, Debug, Default)]
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

    pub(crate) fn check(&self) -> FlashResult<()> {
        if self.is_cancelled() {
            Err(FlashError::Cancelled)
        } else {
            Ok(())
        }
    }
}
