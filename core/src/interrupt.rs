//! Cooperative interruption of blocking transfer calls.
//!
//! # Design
//! Every thread owns a [`Signal`]: an interrupt flag plus an optional waker
//! channel. [`current`] hands out an [`Interrupter`] that other threads use
//! to raise the flag. While a thread is inside a tracked blocking call
//! ([`Interruption::begin`] .. drop), raising the flag also sends on the
//! waker, which the engine selects on, so a call blocked *inside* the engine
//! unblocks instead of waiting for the next pre/post check.
//!
//! The flag is sticky like a thread interrupt status: raising it while the
//! thread is not in a call affects the next call only if it is still set
//! when that call begins. [`Interruption::check`] clears it on observation
//! so each interruption surfaces exactly once.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Signal {
    interrupted: AtomicBool,
    waker: Mutex<Option<Sender<()>>>,
}

impl Signal {
    fn waker(&self) -> MutexGuard<'_, Option<Sender<()>>> {
        self.waker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn raise(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        if let Some(waker) = self.waker().as_ref() {
            let _ = waker.try_send(());
        }
    }
}

thread_local! {
    static CURRENT: Arc<Signal> = Arc::new(Signal::default());
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Handle for interrupting one particular thread from anywhere.
#[derive(Debug, Clone)]
pub struct Interrupter {
    signal: Arc<Signal>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        self.signal.raise();
    }

    pub fn is_interrupted(&self) -> bool {
        self.signal.interrupted.load(Ordering::SeqCst)
    }
}

/// Interrupter for the calling thread. Send it to whoever may cancel.
pub fn current() -> Interrupter {
    Interrupter {
        signal: CURRENT.with(Arc::clone),
    }
}

/// Whether the calling thread's flag is raised. Does not clear it.
pub fn is_interrupted() -> bool {
    CURRENT.with(|s| s.interrupted.load(Ordering::SeqCst))
}

/// Test and clear the calling thread's flag.
pub fn interrupted() -> bool {
    CURRENT.with(|s| s.interrupted.swap(false, Ordering::SeqCst))
}

/// Whether the calling thread is inside a tracked blocking call.
pub fn in_call() -> bool {
    DEPTH.with(|d| d.get() > 0)
}

/// What a blocking engine call watches for cancellation.
///
/// `receiver()` becomes ready once the owning thread is interrupted; engines
/// put it in a `select!` next to whatever they are waiting on.
#[derive(Debug, Clone)]
pub struct CancelToken {
    signal: Option<Arc<Signal>>,
    receiver: Receiver<()>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        Self {
            signal: None,
            receiver: crossbeam_channel::never(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal
            .as_ref()
            .is_some_and(|s| s.interrupted.load(Ordering::SeqCst))
    }

    pub fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }

    /// Sleep for `timeout` or until cancelled. Returns `true` if cancelled.
    pub fn sleep(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(()) => true,
            Err(_) => self.is_cancelled(),
        }
    }
}

/// Scope of one blocking call. Balanced automatically on drop.
pub struct Interruption {
    signal: Arc<Signal>,
    token: CancelToken,
    previous: Option<Sender<()>>,
    // Bound to the thread whose signal it installed a waker on.
    _thread: PhantomData<*const ()>,
}

impl Interruption {
    pub fn begin() -> Self {
        let signal = CURRENT.with(Arc::clone);
        let (waker, receiver) = crossbeam_channel::bounded(1);
        let previous = signal.waker().replace(waker.clone());
        // A raise that ran before the waker was installed did not send.
        if signal.interrupted.load(Ordering::SeqCst) {
            let _ = waker.try_send(());
        }
        DEPTH.with(|d| d.set(d.get() + 1));
        Self {
            token: CancelToken {
                signal: Some(Arc::clone(&signal)),
                receiver,
            },
            signal,
            previous,
            _thread: PhantomData,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.signal.interrupted.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Fail with `Interrupted { transferred }` if the flag is raised,
    /// clearing it.
    pub fn check(&self, transferred: usize) -> Result<()> {
        if self.signal.interrupted.swap(false, Ordering::SeqCst) {
            return Err(Error::Interrupted { transferred });
        }
        Ok(())
    }

    /// Pass an engine result through, clearing the flag when the engine
    /// itself reported the interruption.
    pub fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(Error::Interrupted { .. }) = result {
            self.signal.interrupted.store(false, Ordering::SeqCst);
        }
        result
    }
}

impl Drop for Interruption {
    fn drop(&mut self) {
        *self.signal.waker() = self.previous.take();
        DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}
