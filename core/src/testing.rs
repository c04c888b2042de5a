//! In-memory [`TransferEngine`] for tests.
//!
//! # Design
//! [`ScriptedEngine`] answers each `configure` with the next queued
//! [`Exchange`]: optional redirect hops, a final status with headers, and a
//! body. A body can stall at a byte offset until the calling thread is
//! interrupted, which is how interruption accounting is exercised without a
//! network. Every request is logged and every disposal counted per id.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::engine::{
    Method, ResourceId, ResponseHead, StreamingMode, TransferEngine, TransferRequest,
};
use crate::error::{Error, Result};
use crate::interrupt::CancelToken;

const STALL_LIMIT: Duration = Duration::from_secs(10);

/// One intermediate response in a redirect chain.
#[derive(Debug, Clone)]
pub struct Hop {
    status: u16,
    location: String,
    headers: Vec<(String, String)>,
}

impl Hop {
    pub fn redirect(status: u16, location: &str) -> Self {
        Self {
            status,
            location: location.to_string(),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    fn head(&self) -> ResponseHead {
        let mut headers = vec![("Location".to_string(), self.location.clone())];
        headers.extend(self.headers.iter().cloned());
        head(self.status, headers)
    }
}

/// Scripted answer to one `configure` call.
#[derive(Debug, Clone)]
pub struct Exchange {
    hops: Vec<Hop>,
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    stall_at: Option<usize>,
    stall_head: bool,
    failure: Option<fn() -> Error>,
}

impl Exchange {
    pub fn status(status: u16) -> Self {
        Self {
            hops: Vec::new(),
            status,
            headers: Vec::new(),
            body: Vec::new(),
            stall_at: None,
            stall_head: false,
            failure: None,
        }
    }

    /// `configure` fails with whatever `failure` produces.
    pub fn failing(failure: fn() -> Error) -> Self {
        Self {
            failure: Some(failure),
            ..Self::status(0)
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Add a redirect hop ahead of the final response. Hops are traversed
    /// in the order added.
    pub fn after_hop(mut self, hop: Hop) -> Self {
        self.hops.push(hop);
        self
    }

    /// Block reads once `offset` body bytes have been delivered, until the
    /// reading thread is interrupted.
    pub fn stall_at(mut self, offset: usize) -> Self {
        self.stall_at = Some(offset);
        self
    }

    /// Block the response head until the caller is interrupted.
    pub fn stall_head(mut self) -> Self {
        self.stall_head = true;
        self
    }

    fn final_head(&self) -> ResponseHead {
        head(self.status, self.headers.clone())
    }
}

/// A request as the engine saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub resource: ResourceId,
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub streaming: StreamingMode,
    pub proxy: Option<String>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug)]
struct Active {
    exchange: Exchange,
    head: Option<ResponseHead>,
    pending_head: Option<ResponseHead>,
    pending_url: Option<String>,
    body_pos: usize,
    body_done: bool,
    log_index: usize,
}

#[derive(Debug, Default)]
struct Resource {
    request_headers: Vec<(String, String)>,
    active: Option<Active>,
}

#[derive(Default)]
pub struct ScriptedEngine {
    script: Mutex<VecDeque<Exchange>>,
    resources: Mutex<HashMap<ResourceId, Arc<Mutex<Resource>>>>,
    disposed: Mutex<HashMap<ResourceId, usize>>,
    log: Mutex<Vec<RecordedRequest>>,
    defaults: Mutex<Vec<(String, String)>>,
    next_id: AtomicU64,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        _ => "",
    }
}

fn head(status: u16, headers: Vec<(String, String)>) -> ResponseHead {
    let status_line = match reason(status) {
        "" => format!("HTTP/1.1 {status}"),
        phrase => format!("HTTP/1.1 {status} {phrase}"),
    };
    ResponseHead {
        status,
        status_line,
        headers,
    }
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the answer to a future `configure`.
    pub fn push(&self, exchange: Exchange) {
        locked(&self.script).push_back(exchange);
    }

    /// Request header every new resource starts with.
    pub fn default_request_header(&self, name: &str, value: &str) {
        locked(&self.defaults).push((name.to_string(), value.to_string()));
    }

    /// How many times `id` was disposed.
    pub fn disposals(&self, id: ResourceId) -> usize {
        locked(&self.disposed).get(&id).copied().unwrap_or(0)
    }

    pub fn total_disposals(&self) -> usize {
        locked(&self.disposed).values().sum()
    }

    /// Resources created and not yet disposed.
    pub fn live(&self) -> usize {
        locked(&self.resources).len()
    }

    pub fn created(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        locked(&self.log).clone()
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        locked(&self.log).last().cloned()
    }

    /// A plain GET request description with defaults.
    pub fn get(url: &str) -> TransferRequest<'_> {
        static GET: Method = Method::Get;
        TransferRequest {
            method: &GET,
            url,
            proxy: None,
            dns_servers: None,
            network_interface: None,
            streaming: StreamingMode::Unbuffered,
            read_timeout: None,
            connect_timeout: None,
            follow_redirects: true,
            max_redirects: 20,
            do_input: true,
            do_output: false,
        }
    }

    fn resource(&self, id: ResourceId) -> Result<Arc<Mutex<Resource>>> {
        locked(&self.resources)
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownResource)
    }

    fn with_resource<T>(
        &self,
        id: ResourceId,
        f: impl FnOnce(&mut Resource) -> Result<T>,
    ) -> Result<T> {
        let resource = self.resource(id)?;
        let mut guard = match resource.try_lock() {
            Ok(guard) => guard,
            Err(std::sync::TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(std::sync::TryLockError::WouldBlock) => return Err(Error::ConcurrentUse),
        };
        f(&mut guard)
    }
}

impl TransferEngine for ScriptedEngine {
    fn create(&self) -> Result<ResourceId> {
        let id = ResourceId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let resource = Resource {
            request_headers: locked(&self.defaults).clone(),
            active: None,
        };
        locked(&self.resources).insert(id, Arc::new(Mutex::new(resource)));
        Ok(id)
    }

    fn configure(
        &self,
        id: ResourceId,
        cancel: &CancelToken,
        request: &TransferRequest<'_>,
    ) -> Result<Option<String>> {
        self.with_resource(id, |res| {
            if res.active.is_some() {
                return Err(Error::IllegalState("transfer already configured"));
            }
            let exchange = locked(&self.script)
                .pop_front()
                .ok_or_else(|| Error::ConnectionRefused(request.url.to_string()))?;
            if let Some(failure) = exchange.failure {
                return Err(failure());
            }

            let log_index = {
                let mut log = locked(&self.log);
                log.push(RecordedRequest {
                    resource: id,
                    method: request.method.to_string(),
                    url: request.url.to_string(),
                    headers: res.request_headers.clone(),
                    streaming: request.streaming,
                    proxy: request.proxy.map(|p| p.to_url()),
                    body: Vec::new(),
                });
                log.len() - 1
            };

            if exchange.stall_head {
                cancel.sleep(STALL_LIMIT);
                return Err(Error::Interrupted { transferred: 0 });
            }

            let (head, rewritten) = match exchange.hops.first() {
                Some(first) if !request.follow_redirects => (first.head(), None),
                Some(_) if exchange.hops.len() > request.max_redirects as usize => {
                    return Err(Error::Transport(format!(
                        "maximum ({}) redirects followed",
                        request.max_redirects
                    )));
                }
                Some(_) => {
                    let last = exchange.hops.iter().map(|h| h.location.clone()).last();
                    (exchange.final_head(), last)
                }
                None => (exchange.final_head(), None),
            };

            let no_body = *request.method == Method::Head || !request.do_input;
            let (head, pending_head, pending_url, rewritten) = if request.do_output {
                (None, Some(head), rewritten, None)
            } else {
                (Some(head), None, None, rewritten)
            };
            res.active = Some(Active {
                exchange,
                head,
                pending_head,
                pending_url,
                body_pos: 0,
                body_done: no_body,
                log_index,
            });
            Ok(rewritten)
        })
    }

    fn read(&self, id: ResourceId, cancel: &CancelToken, buf: &mut [u8]) -> Result<usize> {
        self.with_resource(id, |res| {
            let active = res
                .active
                .as_mut()
                .ok_or(Error::IllegalState("transfer not configured"))?;
            if active.head.is_none() {
                return Err(Error::Protocol("request body not finished".into()));
            }
            if active.body_done {
                return Ok(0);
            }

            let body = &active.exchange.body;
            let limit = active.exchange.stall_at.unwrap_or(body.len()).min(body.len());
            let n = buf.len().min(limit.saturating_sub(active.body_pos));
            buf[..n].copy_from_slice(&body[active.body_pos..active.body_pos + n]);
            active.body_pos += n;

            if n < buf.len() && active.exchange.stall_at.take().is_some() {
                // Delivered everything before the stall point; wait for a cancel.
                cancel.sleep(STALL_LIMIT);
            }
            Ok(n)
        })
    }

    fn write(&self, id: ResourceId, _cancel: &CancelToken, buf: &[u8]) -> Result<usize> {
        self.with_resource(id, |res| {
            let active = res
                .active
                .as_mut()
                .ok_or(Error::IllegalState("transfer not configured"))?;
            if active.pending_head.is_none() {
                return Err(Error::Protocol("request body already finished".into()));
            }
            if let Some(entry) = locked(&self.log).get_mut(active.log_index) {
                entry.body.extend_from_slice(buf);
            }
            Ok(buf.len())
        })
    }

    fn finish_output(&self, id: ResourceId, _cancel: &CancelToken) -> Result<Option<String>> {
        self.with_resource(id, |res| {
            let active = res
                .active
                .as_mut()
                .ok_or(Error::IllegalState("transfer not configured"))?;
            if let Some(head) = active.pending_head.take() {
                active.head = Some(head);
            }
            Ok(active.pending_url.clone())
        })
    }

    fn reset(&self, id: ResourceId) -> Result<()> {
        self.with_resource(id, |res| {
            res.active = None;
            Ok(())
        })
    }

    fn clear_headers(&self, id: ResourceId) -> Result<()> {
        self.with_resource(id, |res| {
            res.request_headers.clear();
            Ok(())
        })
    }

    fn set_request_header(&self, id: ResourceId, name: &str, value: Option<&str>) -> Result<()> {
        self.with_resource(id, |res| {
            res.request_headers
                .retain(|(k, _)| !k.eq_ignore_ascii_case(name));
            if let Some(value) = value {
                res.request_headers
                    .push((name.to_string(), value.to_string()));
            }
            Ok(())
        })
    }

    fn add_request_header(&self, id: ResourceId, name: &str, value: &str) -> Result<()> {
        self.with_resource(id, |res| {
            res.request_headers
                .push((name.to_string(), value.to_string()));
            Ok(())
        })
    }

    fn request_header(&self, id: ResourceId, name: &str) -> Result<Option<String>> {
        self.with_resource(id, |res| {
            Ok(res
                .request_headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone()))
        })
    }

    fn request_headers(&self, id: ResourceId) -> Result<Vec<(String, String)>> {
        self.with_resource(id, |res| Ok(res.request_headers.clone()))
    }

    fn response_head(&self, id: ResourceId) -> Result<Option<ResponseHead>> {
        self.with_resource(id, |res| {
            Ok(res.active.as_ref().and_then(|a| a.head.clone()))
        })
    }

    fn dispose(&self, id: ResourceId) -> Result<()> {
        locked(&self.resources)
            .remove(&id)
            .ok_or(Error::UnknownResource)?;
        *locked(&self.disposed).entry(id).or_insert(0) += 1;
        Ok(())
    }
}

impl std::fmt::Debug for ScriptedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedEngine")
            .field("live", &self.live())
            .field("queued", &locked(&self.script).len())
            .finish()
    }
}
