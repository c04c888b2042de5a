//! Owned reference to one engine resource.
//!
//! # Design
//! A [`TransferHandle`] is created bound to a fresh engine resource and
//! registered with a [`Reaper`]. Dropping it hands the resource to the
//! reaper; [`TransferHandle::close`] disposes on the spot. Moving the handle
//! into the pool is a plain move, so recycling never disposes.
//!
//! The blocking calls (`configure`, `read`, `write`, `finish_output`) run
//! inside an [`Interruption`] scope: a raised interrupt flag aborts before
//! the engine is entered, and a flag still raised when the engine returns
//! turns the partial count into `Error::Interrupted`.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::engine::{ResourceId, ResponseHead, TransferEngine, TransferRequest};
use crate::error::Result;
use crate::interrupt::Interruption;
use crate::reaper::{Reaper, Registration};

pub struct TransferHandle {
    engine: Arc<dyn TransferEngine>,
    registration: Registration,
}

impl TransferHandle {
    /// Allocate a new engine resource and register it for disposal.
    pub fn create(engine: Arc<dyn TransferEngine>, reaper: &Reaper) -> Result<Self> {
        let id = engine.create()?;
        let disposer = Arc::clone(&engine);
        let registration = reaper.register(id, Box::new(move |id| disposer.dispose(id)));
        debug!(resource = %id, "created transfer handle");
        Ok(Self {
            engine,
            registration,
        })
    }

    pub fn id(&self) -> ResourceId {
        self.registration.resource()
    }

    pub fn engine(&self) -> &Arc<dyn TransferEngine> {
        &self.engine
    }

    /// Dispose the resource now instead of leaving it to the reaper.
    pub fn close(self) -> bool {
        self.registration.close()
    }

    pub fn configure(&self, request: &TransferRequest<'_>) -> Result<Option<String>> {
        let call = Interruption::begin();
        call.check(0)?;
        let rewritten = call.observe(self.engine.configure(self.id(), call.token(), request))?;
        call.check(0)?;
        Ok(rewritten)
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let call = Interruption::begin();
        call.check(0)?;
        let n = call.observe(self.engine.read(self.id(), call.token(), buf))?;
        call.check(n)?;
        trace!(resource = %self.id(), n, "read");
        Ok(n)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let call = Interruption::begin();
        call.check(0)?;
        let n = call.observe(self.engine.write(self.id(), call.token(), buf))?;
        call.check(n)?;
        trace!(resource = %self.id(), n, "wrote");
        Ok(n)
    }

    pub fn finish_output(&self) -> Result<Option<String>> {
        let call = Interruption::begin();
        call.check(0)?;
        let rewritten = call.observe(self.engine.finish_output(self.id(), call.token()))?;
        call.check(0)?;
        Ok(rewritten)
    }

    pub fn reset(&self) -> Result<()> {
        self.engine.reset(self.id())
    }

    pub fn clear_headers(&self) -> Result<()> {
        self.engine.clear_headers(self.id())
    }

    pub fn set_request_header(&self, name: &str, value: Option<&str>) -> Result<()> {
        self.engine.set_request_header(self.id(), name, value)
    }

    pub fn add_request_header(&self, name: &str, value: &str) -> Result<()> {
        self.engine.add_request_header(self.id(), name, value)
    }

    pub fn request_header(&self, name: &str) -> Result<Option<String>> {
        self.engine.request_header(self.id(), name)
    }

    pub fn request_headers(&self) -> Result<Vec<(String, String)>> {
        self.engine.request_headers(self.id())
    }

    pub fn response_head(&self) -> Result<Option<ResponseHead>> {
        self.engine.response_head(self.id())
    }
}

impl std::fmt::Debug for TransferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferHandle")
            .field("resource", &self.id())
            .finish()
    }
}
