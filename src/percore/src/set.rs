use parking_lot::Mutex;
use thiserror::Error;

use crate::{CoreCtx, CoreId};

#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreAttachError {
    #[error("core {0} is out of range")]
    OutOfRange(CoreId),
    #[error("core {0} is already attached")]
    AlreadyAttached(CoreId),
}

/// Tracks which cores have a live [`CoreCtx`].
///
/// One context per core at a time; tests spawn one pinned thread per
/// emulated CPU and attach from it.
#[derive(Debug)]
pub struct CoreSet {
    attached: Mutex<Vec<bool>>,
}

impl CoreSet {
    pub fn new(num_cores: usize) -> Self {
        Self {
            attached: Mutex::new(vec![false; num_cores]),
        }
    }

    pub fn num_cores(&self) -> usize {
        self.attached.lock().len()
    }

    pub fn attach(&self, id: CoreId) -> Result<CoreCtx, CoreAttachError> {
        let mut attached = self.attached.lock();
        let slot = attached
            .get_mut(id.0)
            .ok_or(CoreAttachError::OutOfRange(id))?;
        if *slot {
            return Err(CoreAttachError::AlreadyAttached(id));
        }
        *slot = true;
        Ok(CoreCtx::new(id))
    }

    /// Release a core slot after its context is gone.
    pub fn detach(&self, ctx: CoreCtx) {
        let mut attached = self.attached.lock();
        debug_assert!(attached[ctx.id().0]);
        attached[ctx.id().0] = false;
    }
}
