//! [`TransferEngine`] backed by `ureq`.
//!
//! # Overview
//! Each resource is a [`Session`]: the request headers configured on it, a
//! cached `ureq::Agent` (kept while the proxy, timeout and redirect settings
//! stay the same, so sequential requests reuse its connection pool), and the
//! transfer currently in flight.
//!
//! # Design
//! - Sessions sit behind their own mutex; a second thread entering a busy
//!   session gets `Error::ConcurrentUse` instead of blocking.
//! - Every wait (response head, body chunk, upload slot) is a `select!`
//!   against the caller's cancel token, so interrupting the caller thread
//!   unblocks it with whatever was transferred so far.
//! - Request bodies are streamed once, so their first hop goes out with
//!   redirects off and the worker follows a 301/302/303 itself (see `pipe`).
//! - Header names come back lower-cased and grouped per name, the order
//!   `http::HeaderMap` iterates in.
//! - DNS server and network interface overrides are accepted and logged;
//!   `ureq` has no knobs for them.

mod errors;
mod pipe;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

use crossbeam_channel::select;
use hothttp_core::{
    CancelToken, ClientConfig, ConnectionBuilder, ConnectionFactory, Error, ProxyKind,
    ResourceId, ResponseHead, Result, TransferEngine, TransferRequest,
};
use tracing::{debug, trace};

use pipe::{BodyEvent, Pipes};

/// Settings baked into a `ureq::Agent`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AgentKey {
    proxy: Option<String>,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    max_redirects: u32,
}

impl AgentKey {
    fn for_request(request: &TransferRequest<'_>) -> Self {
        Self {
            // ureq has no socks5h scheme.
            proxy: request.proxy.map(|p| match p.kind {
                ProxyKind::Socks5h => format!("socks5://{}", p.address()),
                _ => p.to_url(),
            }),
            connect_timeout: request.connect_timeout,
            read_timeout: request.read_timeout,
            max_redirects: if request.follow_redirects {
                request.max_redirects
            } else {
                0
            },
        }
    }

    fn agent(&self) -> Result<ureq::Agent> {
        let mut config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .max_redirects(self.max_redirects)
            .max_redirects_will_error(self.max_redirects > 0)
            .timeout_connect(self.connect_timeout)
            .timeout_recv_response(self.read_timeout)
            .timeout_recv_body(self.read_timeout);
        if let Some(url) = &self.proxy {
            let proxy = ureq::Proxy::new(url).map_err(errors::from_ureq)?;
            config = config.proxy(Some(proxy));
        }
        Ok(config.build().new_agent())
    }
}

struct Transfer {
    pipes: Pipes,
    url: String,
    final_url: Option<String>,
    head: Option<ResponseHead>,
    chunk: Vec<u8>,
    pos: usize,
    finished: bool,
    deferred: Option<Error>,
}

impl Transfer {
    fn new(pipes: Pipes, url: &str) -> Self {
        Self {
            pipes,
            url: url.to_string(),
            final_url: None,
            head: None,
            chunk: Vec::new(),
            pos: 0,
            finished: false,
            deferred: None,
        }
    }

    /// Block until the head arrives. Returns the final URL if redirects
    /// moved the request.
    fn wait_head(&mut self, cancel: &CancelToken) -> Result<Option<String>> {
        if self.head.is_some() {
            return Ok(self.final_url.clone());
        }
        let received = select! {
            recv(self.pipes.head) -> msg => msg,
            recv(cancel.receiver()) -> _ => return Err(Error::Interrupted { transferred: 0 }),
        };
        let head = received
            .map_err(|_| Error::Transport("transfer worker exited".into()))??;
        self.head = Some(head.head);
        self.final_url = Some(head.final_url).filter(|url| *url != self.url);
        Ok(self.final_url.clone())
    }

    fn read(&mut self, cancel: &CancelToken, buf: &mut [u8]) -> Result<usize> {
        if self.head.is_none() {
            return Err(Error::Protocol("request body not finished".into()));
        }
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }
        let mut filled = 0;
        while filled < buf.len() {
            if self.pos < self.chunk.len() {
                let n = (buf.len() - filled).min(self.chunk.len() - self.pos);
                buf[filled..filled + n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
                self.pos += n;
                filled += n;
                continue;
            }
            if self.finished {
                break;
            }
            let event = select! {
                recv(self.pipes.body) -> event => event.unwrap_or(BodyEvent::End),
                recv(cancel.receiver()) -> _ => return Ok(filled),
            };
            match event {
                BodyEvent::Chunk(chunk) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                BodyEvent::End => self.finished = true,
                BodyEvent::Failed(err) if filled == 0 => {
                    self.finished = true;
                    return Err(err);
                }
                BodyEvent::Failed(err) => {
                    self.finished = true;
                    self.deferred = Some(err);
                    break;
                }
            }
        }
        Ok(filled)
    }

    fn write(&mut self, cancel: &CancelToken, buf: &[u8]) -> Result<usize> {
        let upload = self
            .pipes
            .upload
            .as_ref()
            .ok_or_else(|| Error::Protocol("request body already finished".into()))?;
        select! {
            send(upload, buf.to_vec()) -> sent => match sent {
                Ok(()) => Ok(buf.len()),
                Err(_) => Err(Error::Transport("request body rejected by the server".into())),
            },
            recv(cancel.receiver()) -> _ => Err(Error::Interrupted { transferred: 0 }),
        }
    }
}

#[derive(Default)]
struct Session {
    headers: Vec<(String, String)>,
    agent: Option<(AgentKey, ureq::Agent)>,
    first_hop: Option<(AgentKey, ureq::Agent)>,
    transfer: Option<Transfer>,
}

fn cached(slot: &mut Option<(AgentKey, ureq::Agent)>, key: AgentKey) -> Result<ureq::Agent> {
    match slot {
        Some((cached, agent)) if *cached == key => Ok(agent.clone()),
        _ => {
            let agent = key.agent()?;
            *slot = Some((key, agent.clone()));
            Ok(agent)
        }
    }
}

impl Session {
    fn agent(&mut self, key: AgentKey) -> Result<ureq::Agent> {
        cached(&mut self.agent, key)
    }

    /// Agent for the first hop of a request body: never follows redirects.
    fn first_hop_agent(&mut self, key: &AgentKey) -> Result<ureq::Agent> {
        let key = AgentKey {
            max_redirects: 0,
            ..key.clone()
        };
        cached(&mut self.first_hop, key)
    }

    fn transfer(&mut self) -> Result<&mut Transfer> {
        self.transfer
            .as_mut()
            .ok_or(Error::IllegalState("transfer not configured"))
    }
}

/// Engine performing real HTTP(S) transfers.
pub struct UreqEngine {
    sessions: Mutex<HashMap<ResourceId, Arc<Mutex<Session>>>>,
    next_id: AtomicU64,
    verbose: bool,
}

impl UreqEngine {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            verbose: config.debug,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<ResourceId, Arc<Mutex<Session>>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_session<T>(&self, id: ResourceId, f: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
        let session = self
            .sessions()
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownResource)?;
        let mut guard = match session.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(Error::ConcurrentUse),
        };
        f(&mut guard)
    }

    fn log_request(&self, id: ResourceId, request: &TransferRequest<'_>) {
        if self.verbose {
            debug!(resource = %id, method = %request.method, url = request.url, streaming = ?request.streaming, "starting transfer");
        } else {
            trace!(resource = %id, method = %request.method, url = request.url, "starting transfer");
        }
        if request.dns_servers.is_some() || request.network_interface.is_some() {
            debug!(
                resource = %id,
                dns_servers = request.dns_servers,
                network_interface = request.network_interface,
                "resolver and interface overrides are not supported, ignoring"
            );
        }
    }
}

impl Default for UreqEngine {
    fn default() -> Self {
        Self::new(&ClientConfig::default())
    }
}

impl TransferEngine for UreqEngine {
    fn create(&self) -> Result<ResourceId> {
        let id = ResourceId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.sessions().insert(id, Arc::default());
        Ok(id)
    }

    fn configure(
        &self,
        id: ResourceId,
        cancel: &CancelToken,
        request: &TransferRequest<'_>,
    ) -> Result<Option<String>> {
        self.log_request(id, request);
        self.with_session(id, |session| {
            if session.transfer.is_some() {
                return Err(Error::IllegalState("transfer already configured"));
            }
            let key = AgentKey::for_request(request);
            let follows = key.max_redirects > 0;

            let uri: http::Uri = request
                .url
                .parse()
                .map_err(|e| Error::MalformedUrl(format!("{}: {e}", request.url)))?;
            let method = http::Method::from_bytes(request.method.as_str().as_bytes())
                .map_err(|e| Error::Protocol(e.to_string()))?;
            let mut builder = http::Request::builder().method(method).uri(uri);
            for (name, value) in &session.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if request.do_output {
                if let Some(length) = request.streaming.declared_length() {
                    builder = builder.header("Content-Length", length.to_string());
                }
            }

            let pipes = if request.do_output && follows {
                let first_hop = session.first_hop_agent(&key)?;
                let follow = session.agent(key)?;
                pipe::spawn(first_hop, Some(follow), builder, true)?
            } else {
                pipe::spawn(session.agent(key)?, None, builder, request.do_output)?
            };
            let transfer = session.transfer.insert(Transfer::new(pipes, request.url));
            if request.do_output {
                return Ok(None);
            }
            transfer.wait_head(cancel)
        })
    }

    fn read(&self, id: ResourceId, cancel: &CancelToken, buf: &mut [u8]) -> Result<usize> {
        self.with_session(id, |session| session.transfer()?.read(cancel, buf))
    }

    fn write(&self, id: ResourceId, cancel: &CancelToken, buf: &[u8]) -> Result<usize> {
        self.with_session(id, |session| session.transfer()?.write(cancel, buf))
    }

    fn finish_output(&self, id: ResourceId, cancel: &CancelToken) -> Result<Option<String>> {
        self.with_session(id, |session| {
            let transfer = session.transfer()?;
            transfer.pipes.upload = None;
            transfer.wait_head(cancel)
        })
    }

    fn reset(&self, id: ResourceId) -> Result<()> {
        self.with_session(id, |session| {
            session.transfer = None;
            Ok(())
        })
    }

    fn clear_headers(&self, id: ResourceId) -> Result<()> {
        self.with_session(id, |session| {
            session.headers.clear();
            Ok(())
        })
    }

    fn set_request_header(&self, id: ResourceId, name: &str, value: Option<&str>) -> Result<()> {
        self.with_session(id, |session| {
            session.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
            if let Some(value) = value {
                session.headers.push((name.to_string(), value.to_string()));
            }
            Ok(())
        })
    }

    fn add_request_header(&self, id: ResourceId, name: &str, value: &str) -> Result<()> {
        self.with_session(id, |session| {
            session.headers.push((name.to_string(), value.to_string()));
            Ok(())
        })
    }

    fn request_header(&self, id: ResourceId, name: &str) -> Result<Option<String>> {
        self.with_session(id, |session| {
            Ok(session
                .headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone()))
        })
    }

    fn request_headers(&self, id: ResourceId) -> Result<Vec<(String, String)>> {
        self.with_session(id, |session| Ok(session.headers.clone()))
    }

    fn response_head(&self, id: ResourceId) -> Result<Option<ResponseHead>> {
        self.with_session(id, |session| {
            Ok(session.transfer.as_ref().and_then(|t| t.head.clone()))
        })
    }

    fn dispose(&self, id: ResourceId) -> Result<()> {
        self.sessions()
            .remove(&id)
            .map(drop)
            .ok_or(Error::UnknownResource)
    }
}

/// A connection factory over a fresh [`UreqEngine`].
pub fn factory(config: ClientConfig) -> Arc<ConnectionFactory> {
    let engine = Arc::new(UreqEngine::new(&config));
    ConnectionBuilder::new(engine).config(config).build()
}
