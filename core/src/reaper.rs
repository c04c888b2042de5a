//! Exactly-once disposal of engine resources.
//!
//! # Design
//! Each live resource gets a slot in a process-wide [`Slab`], addressed by
//! index plus a generation so a recycled index can never be confused with
//! an older registration. A [`Registration`] is the owner's liveness token:
//!
//! - [`Registration::close`] disposes synchronously on the calling thread.
//! - Dropping an unclosed `Registration` queues it for the background
//!   reaper thread, which disposes it off the dropping thread.
//!
//! Whichever path removes the slot first runs the disposal callback; every
//! other path finds a missing or newer slot and does nothing. The slab lock
//! is held only while splicing the slot out, never across the callback.
//!
//! Disposal failures and panics are logged and swallowed: nobody is waiting
//! on the background path, and the reaper loop must outlive any single bad
//! resource.
//!
//! The background thread only holds the registry weakly. Once the last
//! `Reaper` clone and `Registration` are gone, the registry disposes what is
//! left and the thread exits.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use slab::Slab;
use tracing::{debug, warn};

use crate::engine::ResourceId;
use crate::error::{Error, Result};

/// Disposal callback run exactly once per registered resource.
pub type DisposeFn = Box<dyn FnOnce(ResourceId) -> Result<()> + Send>;

struct Slot {
    generation: u64,
    resource: ResourceId,
    dispose: DisposeFn,
}

#[derive(Default)]
struct Slots {
    slab: Slab<Slot>,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ticket {
    key: usize,
    generation: u64,
}

enum Message {
    Collected(Ticket),
    Sync(Sender<()>),
}

struct Inner {
    slots: Mutex<Slots>,
    queue: Mutex<Option<Sender<Message>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self) -> MutexGuard<'_, Option<Sender<Message>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self, ticket: Ticket) -> bool {
        let slot = {
            let mut slots = self.slots();
            match slots.slab.get(ticket.key) {
                Some(slot) if slot.generation == ticket.generation => slots.slab.remove(ticket.key),
                _ => return false,
            }
        };

        dispose(slot);
        true
    }

    fn close_guarded(&self, ticket: Ticket) {
        if panic::catch_unwind(AssertUnwindSafe(|| self.close(ticket))).is_err() {
            warn!(key = ticket.key, "disposal callback panicked, resource leaked");
        }
    }
}

fn dispose(slot: Slot) {
    let resource = slot.resource;
    match (slot.dispose)(resource) {
        Ok(()) => debug!(%resource, "disposed transfer resource"),
        Err(err) => warn!(%resource, error = %err, "disposal failed, resource leaked"),
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let slots = self.slots.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, slot) in std::mem::take(&mut slots.slab) {
            let resource = slot.resource;
            if panic::catch_unwind(AssertUnwindSafe(|| dispose(slot))).is_err() {
                warn!(%resource, "disposal callback panicked, resource leaked");
            }
        }
    }
}

/// Registry of live resources plus the background thread that disposes
/// abandoned ones. Cheap to clone.
#[derive(Clone)]
pub struct Reaper {
    inner: Arc<Inner>,
}

impl Reaper {
    /// A private reaper with its own background thread.
    pub fn new() -> Result<Self> {
        Self::spawn("hothttp-reaper")
    }

    /// The process-wide reaper, started on first use.
    pub fn global() -> &'static Reaper {
        static GLOBAL: OnceLock<Reaper> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            Self::spawn("hothttp-reaper").unwrap_or_else(|err| {
                warn!(error = %err, "reaper thread unavailable, disposing inline");
                Self::inline()
            })
        })
    }

    /// A reaper without a background thread: abandoned registrations are
    /// disposed on the thread that drops them.
    pub fn inline() -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(Slots::default()),
                queue: Mutex::new(None),
                worker: Mutex::new(None),
            }),
        }
    }

    fn spawn(name: &str) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let reaper = Self::inline();
        *reaper.inner.queue() = Some(tx);

        let inner = Arc::downgrade(&reaper.inner);
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(inner, rx))
            .map_err(|err| Error::Other(format!("failed to start reaper thread: {err}")))?;
        *reaper
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(worker);
        Ok(reaper)
    }

    /// Link `resource` to a new registration. `dispose` runs exactly once,
    /// when the registration is closed or after it is dropped.
    pub fn register(&self, resource: ResourceId, dispose: DisposeFn) -> Registration {
        let ticket = {
            let mut slots = self.inner.slots();
            slots.generation += 1;
            let generation = slots.generation;
            let key = slots.slab.insert(Slot {
                generation,
                resource,
                dispose,
            });
            Ticket { key, generation }
        };
        Registration {
            reaper: self.clone(),
            ticket,
            resource,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of registered resources not yet disposed.
    pub fn live(&self) -> usize {
        self.inner.slots().slab.len()
    }

    /// Block until every registration abandoned before this call has been
    /// processed by the background thread.
    pub fn sync(&self) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let sent = match self.inner.queue().as_ref() {
            Some(queue) => queue.send(Message::Sync(tx)).is_ok(),
            None => false,
        };
        if sent {
            let _ = rx.recv();
        }
    }

    /// Stop the background thread after it drains its queue. Later
    /// abandoned registrations are disposed inline.
    pub fn shutdown(&self) {
        drop(self.inner.queue().take());
        let worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }

    fn abandon(&self, ticket: Ticket) {
        {
            let queue = self.inner.queue();
            if let Some(queue) = queue.as_ref() {
                if queue.send(Message::Collected(ticket)).is_ok() {
                    return;
                }
            }
        }
        self.inner.close_guarded(ticket);
    }
}

impl std::fmt::Debug for Reaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaper").field("live", &self.live()).finish()
    }
}

fn run(inner: Weak<Inner>, rx: Receiver<Message>) {
    debug!("reaper started");
    // Ends once the sender is gone: after `shutdown()` or when the registry drops.
    while let Ok(message) = rx.recv() {
        match message {
            Message::Collected(ticket) => match inner.upgrade() {
                Some(inner) => inner.close_guarded(ticket),
                None => break,
            },
            Message::Sync(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("reaper stopped");
}

/// Liveness token for one registered resource.
pub struct Registration {
    reaper: Reaper,
    ticket: Ticket,
    resource: ResourceId,
    closed: AtomicBool,
}

impl Registration {
    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    /// Dispose now. Returns `false` if the resource was already disposed.
    pub fn close(&self) -> bool {
        self.closed.store(true, Ordering::SeqCst);
        self.reaper.inner.close(self.ticket)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            self.reaper.abandon(self.ticket);
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("resource", &self.resource)
            .field("closed", &self.is_closed())
            .finish()
    }
}
