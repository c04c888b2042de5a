//! Bounded cache of idle transfer handles.
//!
//! Handles carry no destination affinity: whoever obtains one reconfigures
//! it from scratch. The queue is a bounded channel, so concurrent recycles
//! never overfill it; a handle that does not fit is dropped and its
//! resource goes to the reaper.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::debug;

use crate::engine::TransferEngine;
use crate::error::Result;
use crate::handle::TransferHandle;
use crate::reaper::Reaper;

pub struct Pool {
    engine: Arc<dyn TransferEngine>,
    reaper: Reaper,
    idle_tx: Sender<TransferHandle>,
    idle_rx: Receiver<TransferHandle>,
}

impl Pool {
    pub fn new(engine: Arc<dyn TransferEngine>, reaper: Reaper, capacity: usize) -> Self {
        let (idle_tx, idle_rx) = crossbeam_channel::bounded(capacity);
        Self {
            engine,
            reaper,
            idle_tx,
            idle_rx,
        }
    }

    /// An idle handle if one is queued, otherwise a fresh one.
    pub fn obtain(&self) -> Result<TransferHandle> {
        if let Ok(handle) = self.idle_rx.try_recv() {
            debug!(resource = %handle.id(), "reusing pooled transfer handle");
            return Ok(handle);
        }
        TransferHandle::create(Arc::clone(&self.engine), &self.reaper)
    }

    /// Offer `handle` back. Returns `false` when the pool was full and the
    /// handle was left to the reaper.
    pub fn recycle(&self, handle: TransferHandle) -> bool {
        let id = handle.id();
        match self.idle_tx.try_send(handle) {
            Ok(()) => {
                debug!(resource = %id, "recycled transfer handle");
                true
            }
            Err(TrySendError::Full(handle) | TrySendError::Disconnected(handle)) => {
                debug!(resource = %id, "pool full, abandoning transfer handle");
                drop(handle);
                false
            }
        }
    }

    pub fn idle(&self) -> usize {
        self.idle_rx.len()
    }

    pub fn capacity(&self) -> usize {
        self.idle_tx.capacity().unwrap_or(0)
    }

    pub fn reaper(&self) -> &Reaper {
        &self.reaper
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("idle", &self.idle())
            .field("capacity", &self.capacity())
            .finish()
    }
}
