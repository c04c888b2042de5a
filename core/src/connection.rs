//! The request/response object applications drive.
//!
//! # Design
//! A [`Connection`] walks through [`State`]s:
//!
//! ```text
//! Unconnected --connect--> Connected --head access--> ResponseReady
//! Connected/ResponseReady --output_stream--> StreamingOutput
//! Connected/ResponseReady --input_stream--> StreamingInput
//! (any) --reset--> Reset        (handle kept, streams discarded)
//! (any) --disconnect--> Unconnected (handle recycled or abandoned)
//! ```
//!
//! Configuration, request headers included, is only mutable while
//! unconnected; `Reset` counts as unconnected. Response accessors take
//! `&self` and cache the head on first use, so they can be shared with
//! whoever only reads. Blocking work happens in `connect`, the streams, and
//! the implicit body completion done by the first response accessor.
//!
//! The handle is shared with the streams through an `Arc`; the streams keep
//! only a `Weak`. `disconnect` recycles the handle into the pool only when
//! nobody else holds it and it was never handed out through
//! [`Connection::transfer_handle`]; otherwise dropping the last reference
//! leaves it to the reaper.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, UNIX_EPOCH};

use tracing::debug;

use crate::engine::{Method, Proxy, ResponseHead, StreamingMode, TransferRequest};
use crate::error::{Error, Result};
use crate::factory::ConnectionFactory;
use crate::handle::TransferHandle;
use crate::headers::HeaderMap;
use crate::stream::{InputStream, OutputStream};
use crate::url::UrlBuf;

const DEFAULT_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unconnected,
    Connecting,
    Connected,
    ResponseReady,
    StreamingInput,
    StreamingOutput,
    /// Unconnected after `reset()`; request headers of the previous cycle
    /// are still configured.
    Reset,
}

/// Who may still touch the connection's handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Fresh, or back from the pool; no request has run on it.
    Clean,
    /// Used by at least one request; cleaned before recycling.
    Dirty,
    /// Handed out through `transfer_handle()`; never recycled.
    Exposed,
    /// Given back on `disconnect()`; the connection holds no handle.
    Recycled,
}

pub struct Connection {
    factory: Arc<ConnectionFactory>,
    url: UrlBuf,
    method: Option<Method>,
    do_input: bool,
    do_output: bool,
    streaming: StreamingMode,
    follow_redirects: bool,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    proxy: Option<Proxy>,
    handle: Option<Arc<TransferHandle>>,
    ownership: Ownership,
    state: State,
    body_pending: AtomicBool,
    head: OnceLock<ResponseHead>,
    fields: OnceLock<HeaderMap>,
    input: OnceLock<InputStream>,
    output: Option<OutputStream>,
    redirected: OnceLock<String>,
}

impl Connection {
    pub(crate) fn new(factory: Arc<ConnectionFactory>, url: &str) -> Result<Self> {
        let handle = factory.obtain()?;
        let config = factory.config();
        Ok(Self {
            url: UrlBuf::from(url),
            method: None,
            do_input: true,
            do_output: false,
            streaming: StreamingMode::Unbuffered,
            follow_redirects: config.follow_redirects,
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            proxy: None,
            handle: Some(Arc::new(handle)),
            ownership: Ownership::Clean,
            state: State::Unconnected,
            body_pending: AtomicBool::new(false),
            head: OnceLock::new(),
            fields: OnceLock::new(),
            input: OnceLock::new(),
            output: None,
            redirected: OnceLock::new(),
            factory,
        })
    }

    pub fn state(&self) -> State {
        match self.state {
            State::Connected if self.head.get().is_some() => State::ResponseReady,
            state => state,
        }
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn is_connected(&self) -> bool {
        !matches!(
            self.state,
            State::Unconnected | State::Reset | State::Connecting
        )
    }

    fn assert_unconnected(&self) -> Result<()> {
        match self.state {
            State::Unconnected | State::Reset => Ok(()),
            _ => Err(Error::IllegalState("already connected")),
        }
    }

    fn assert_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::IllegalState("can not get headers before establishing connection"))
        }
    }

    /// The bound handle, obtaining one from the pool after a `disconnect()`.
    fn bound_handle(&mut self) -> Result<&Arc<TransferHandle>> {
        if self.handle.is_none() {
            let handle = self.factory.obtain()?;
            handle.set_request_header("Expect", None)?;
            self.handle = Some(Arc::new(handle));
            self.ownership = Ownership::Clean;
        }
        self.handle
            .as_ref()
            .ok_or(Error::IllegalState("no transfer handle"))
    }

    fn connected_handle(&self) -> Result<&Arc<TransferHandle>> {
        self.assert_connected()?;
        self.handle
            .as_ref()
            .ok_or(Error::IllegalState("no transfer handle"))
    }

    // Configuration.

    /// The requested URL, or where redirects ended up once known.
    pub fn url(&self) -> &str {
        self.redirected
            .get()
            .map(String::as_str)
            .or_else(|| self.output.as_ref().and_then(OutputStream::redirected))
            .unwrap_or_else(|| self.url.as_str())
    }

    pub fn set_url(&mut self, url: &str) -> Result<()> {
        self.assert_unconnected()?;
        self.url.rewrite(url);
        Ok(())
    }

    /// The method that will be sent: the configured one, else POST when
    /// output is enabled, GET when input is, HEAD otherwise.
    pub fn request_method(&self) -> Method {
        match &self.method {
            Some(method) => method.clone(),
            None if self.do_output => Method::Post,
            None if self.do_input => Method::Get,
            None => Method::Head,
        }
    }

    /// Set the method by name, upper-cased. `HEAD` disables input and
    /// output; `POST` and `PUT` enable output.
    pub fn set_request_method(&mut self, name: &str) -> Result<()> {
        self.assert_unconnected()?;
        if name.is_empty() {
            return Err(Error::Protocol("empty request method".into()));
        }
        let method = Method::parse(name);
        match method {
            Method::Head => {
                self.do_input = false;
                self.do_output = false;
            }
            Method::Post | Method::Put => self.do_output = true,
            _ => {}
        }
        self.method = Some(method);
        Ok(())
    }

    pub fn do_input(&self) -> bool {
        self.do_input
    }

    pub fn set_do_input(&mut self, enabled: bool) -> Result<()> {
        self.assert_unconnected()?;
        self.do_input = enabled;
        Ok(())
    }

    pub fn do_output(&self) -> bool {
        self.do_output
    }

    /// Enabling output turns an explicit GET or HEAD into POST.
    pub fn set_do_output(&mut self, enabled: bool) -> Result<()> {
        self.assert_unconnected()?;
        self.do_output = enabled;
        if enabled && matches!(self.method, Some(Method::Get | Method::Head)) {
            self.method = Some(Method::Post);
        }
        Ok(())
    }

    pub fn streaming_mode(&self) -> StreamingMode {
        self.streaming
    }

    /// Declare the exact request body length.
    pub fn set_fixed_length_streaming_mode(&mut self, length: u64) -> Result<()> {
        self.assert_unconnected()?;
        self.streaming = StreamingMode::FixedLength(length);
        Ok(())
    }

    /// Stream the request body in chunks; 0 picks the default chunk size.
    pub fn set_chunked_streaming_mode(&mut self, chunk_size: usize) -> Result<()> {
        self.assert_unconnected()?;
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        self.streaming = StreamingMode::Chunked(chunk_size);
        Ok(())
    }

    pub fn instance_follow_redirects(&self) -> bool {
        self.follow_redirects
    }

    pub fn set_instance_follow_redirects(&mut self, follow: bool) -> Result<()> {
        self.assert_unconnected()?;
        self.follow_redirects = follow;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// `None` waits indefinitely.
    pub fn set_connect_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.assert_unconnected()?;
        self.connect_timeout = timeout;
        Ok(())
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.assert_unconnected()?;
        self.read_timeout = timeout;
        Ok(())
    }

    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    pub fn set_proxy(&mut self, proxy: Option<Proxy>) -> Result<()> {
        self.assert_unconnected()?;
        self.proxy = proxy;
        Ok(())
    }

    pub fn using_proxy(&self) -> bool {
        self.proxy.is_some()
    }

    /// Replace every request header called `name`. `None` removes it.
    pub fn set_request_property(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        self.assert_unconnected()?;
        self.bound_handle()?.set_request_header(name, value)
    }

    pub fn add_request_property(&mut self, name: &str, value: &str) -> Result<()> {
        self.assert_unconnected()?;
        self.bound_handle()?.add_request_header(name, value)
    }

    pub fn request_property(&mut self, name: &str) -> Result<Option<String>> {
        self.assert_unconnected()?;
        self.bound_handle()?.request_header(name)
    }

    /// Configured request headers, grouped by name.
    pub fn request_properties(&mut self) -> Result<HeaderMap> {
        self.assert_unconnected()?;
        let headers = self.bound_handle()?.request_headers()?;
        Ok(headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect())
    }

    // Lifecycle.

    /// Start the request. Does nothing when already connected.
    ///
    /// On failure, interruption included, the engine state is reset and the
    /// connection stays unconnected.
    pub fn connect(&mut self) -> Result<()> {
        if !matches!(self.state, State::Unconnected | State::Reset) {
            return Ok(());
        }
        let handle = Arc::clone(self.bound_handle()?);
        if self.ownership == Ownership::Clean {
            self.ownership = Ownership::Dirty;
        }

        let config = self.factory.config();
        let dns_servers = self.factory.dns_servers(self.url.as_str());
        let network_interface = self.factory.network_interface(self.url.as_str());
        let method = self.request_method();
        let previous = self.state;
        self.state = State::Connecting;

        let request = TransferRequest {
            method: &method,
            url: self.url.as_str(),
            proxy: self.proxy.as_ref(),
            dns_servers: dns_servers.as_deref(),
            network_interface: network_interface.as_deref(),
            streaming: self.streaming,
            read_timeout: self.read_timeout,
            connect_timeout: self.connect_timeout,
            follow_redirects: self.follow_redirects,
            max_redirects: config.max_redirects,
            do_input: self.do_input,
            do_output: self.do_output,
        };
        match handle.configure(&request) {
            Ok(rewritten) => {
                if let Some(url) = rewritten {
                    self.url.rewrite(&url);
                }
                self.body_pending.store(self.do_output, Ordering::SeqCst);
                self.state = State::Connected;
                debug!(resource = %handle.id(), %method, url = %self.url, "connected");
                Ok(())
            }
            Err(err) => {
                if let Err(reset_err) = handle.reset() {
                    debug!(resource = %handle.id(), error = %reset_err, "reset after failed connect failed");
                }
                self.state = match previous {
                    State::Reset => State::Reset,
                    _ => State::Unconnected,
                };
                debug!(resource = %handle.id(), error = %err, "connect failed");
                Err(err)
            }
        }
    }

    /// Discard streams and response state, keeping the handle and its
    /// request headers. The connection can `connect()` again afterwards.
    pub fn reset(&mut self) -> Result<()> {
        self.discard_cycle();
        if let Some(handle) = &self.handle {
            handle.reset()?;
        }
        self.state = State::Reset;
        Ok(())
    }

    /// Clear request headers, reset, and give the handle back.
    pub fn disconnect(&mut self) {
        self.discard_cycle();
        if let Some(handle) = self.handle.take() {
            self.release(handle);
        }
        self.ownership = Ownership::Recycled;
        self.state = State::Unconnected;
    }

    fn release(&self, handle: Arc<TransferHandle>) {
        let id = handle.id();
        if self.ownership == Ownership::Exposed {
            debug!(resource = %id, "handle was exposed, leaving it to the reaper");
            return;
        }
        if let Err(err) = handle.clear_headers().and_then(|()| handle.reset()) {
            debug!(resource = %id, error = %err, "handle cleanup failed, leaving it to the reaper");
            return;
        }
        match Arc::try_unwrap(handle) {
            Ok(handle) => {
                self.factory.recycle(handle);
            }
            Err(_) => debug!(resource = %id, "handle still shared, leaving it to the reaper"),
        }
    }

    fn discard_cycle(&mut self) {
        if let Some(input) = self.input.take() {
            input.close();
        }
        if let Some(output) = self.output.take() {
            if let Some(url) = output.redirected() {
                self.url.rewrite(url);
            }
            output.discard();
        }
        if let Some(url) = self.redirected.take() {
            self.url.rewrite(&url);
        }
        self.head.take();
        self.fields.take();
        self.body_pending.store(false, Ordering::SeqCst);
    }

    /// The underlying handle. The connection can no longer recycle it.
    pub fn transfer_handle(&mut self) -> Result<Arc<TransferHandle>> {
        let handle = Arc::clone(self.bound_handle()?);
        self.ownership = Ownership::Exposed;
        Ok(handle)
    }

    // Streams.

    /// Connects if needed. Fails with `HttpStatus` for status >= 400.
    pub fn input_stream(&mut self) -> Result<InputStream> {
        if !self.do_input {
            return Err(Error::Protocol(
                "input stream can not be used when do_input is false".into(),
            ));
        }
        self.connect()?;
        let status = self.response_code()?;
        if status >= 400 {
            return Err(Error::HttpStatus {
                status,
                url: self.url().to_string(),
            });
        }
        let stream = self.body_stream()?;
        self.state = State::StreamingInput;
        Ok(stream)
    }

    /// Connects if needed. Closing the stream finishes the request body.
    pub fn output_stream(&mut self) -> Result<OutputStream> {
        if !self.do_output {
            return Err(Error::Protocol(
                "output stream can not be used when do_output is false".into(),
            ));
        }
        self.connect()?;
        if let Some(output) = &self.output {
            return Ok(output.clone());
        }
        if !self.body_pending.load(Ordering::SeqCst) {
            return Err(Error::Protocol("request body already finished".into()));
        }
        let output = OutputStream::new(self.connected_handle()?, self.streaming);
        self.output = Some(output.clone());
        self.state = State::StreamingOutput;
        Ok(output)
    }

    /// Body of an error response. `None` before connecting and for any
    /// status below 400.
    pub fn error_stream(&self) -> Option<InputStream> {
        if !self.is_connected() {
            return None;
        }
        match self.response_code() {
            Ok(status) if status >= 400 => self.body_stream().ok(),
            Ok(_) => None,
            Err(err) => {
                debug!(url = %self.url(), error = %err, "no error stream, response head failed");
                None
            }
        }
    }

    fn body_stream(&self) -> Result<InputStream> {
        let handle = self.connected_handle()?;
        Ok(self
            .input
            .get_or_init(|| InputStream::new(handle))
            .clone())
    }

    // Response.

    fn finish_body(&self) -> Result<()> {
        if !self.body_pending.load(Ordering::SeqCst) {
            return Ok(());
        }
        match &self.output {
            Some(output) => output.close()?,
            None => {
                if let Some(url) = self.connected_handle()?.finish_output()? {
                    let _ = self.redirected.set(url);
                }
            }
        }
        self.body_pending.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn head(&self) -> Result<&ResponseHead> {
        self.assert_connected()?;
        if let Some(head) = self.head.get() {
            return Ok(head);
        }
        self.finish_body()?;
        let head = self
            .connected_handle()?
            .response_head()?
            .ok_or_else(|| Error::Protocol("response head not available".into()))?;
        Ok(self.head.get_or_init(|| head))
    }

    pub fn response_code(&self) -> Result<u16> {
        Ok(self.head()?.status)
    }

    /// Reason phrase of the status line, if it has one.
    pub fn response_message(&self) -> Result<Option<&str>> {
        Ok(self.head()?.reason())
    }

    /// First value of `name`, ignoring case.
    pub fn header_field(&self, name: &str) -> Result<Option<&str>> {
        Ok(self.header_fields()?.get(name))
    }

    /// Value at wire position `pos`; position 0 is the status line.
    pub fn header_field_at(&self, pos: usize) -> Result<Option<&str>> {
        Ok(self.head()?.value_at(pos))
    }

    /// Name at wire position `pos`; `None` at position 0.
    pub fn header_field_key(&self, pos: usize) -> Result<Option<&str>> {
        Ok(self.head()?.key_at(pos))
    }

    pub fn header_field_int(&self, name: &str, default: i64) -> Result<i64> {
        Ok(self
            .header_field(name)?
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default))
    }

    /// Milliseconds since the epoch for a date header, or `default` when the
    /// header is missing or not a date.
    pub fn header_field_date(&self, name: &str, default: i64) -> Result<i64> {
        Ok(self
            .header_field(name)?
            .and_then(parse_http_date)
            .unwrap_or(default))
    }

    pub fn content_length(&self) -> Result<Option<u64>> {
        Ok(self
            .header_field("Content-Length")?
            .and_then(|v| v.trim().parse().ok()))
    }

    /// Response headers grouped by name.
    pub fn header_fields(&self) -> Result<&HeaderMap> {
        let head = self.head()?;
        Ok(self.fields.get_or_init(|| {
            head.headers
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect()
        }))
    }
}

/// IMF-fixdate, RFC 850 or asctime. A date without a zone is read as GMT.
fn parse_http_date(value: &str) -> Option<i64> {
    let value = value.trim();
    let date = httpdate::parse_http_date(value)
        .or_else(|_| httpdate::parse_http_date(&format!("{value} GMT")))
        .ok()?;
    let since = date.duration_since(UNIX_EPOCH).ok()?;
    i64::try_from(since.as_millis()).ok()
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.url)
            .field("state", &self.state())
            .field("ownership", &self.ownership)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ProxyKind, TransferEngine};
    use crate::factory::ConnectionBuilder;
    use crate::interrupt;
    use crate::reaper::Reaper;
    use crate::testing::{Exchange, Hop, ScriptedEngine};
    use std::io::{Read, Write};
    use std::sync::mpsc;
    use std::thread;

    fn setup() -> (Arc<ScriptedEngine>, Arc<ConnectionFactory>) {
        let engine = Arc::new(ScriptedEngine::new());
        let factory = ConnectionBuilder::new(Arc::clone(&engine) as Arc<dyn TransferEngine>)
            .reaper(Reaper::inline())
            .build();
        (engine, factory)
    }

    fn read_all(stream: &InputStream) -> String {
        let mut body = String::new();
        let mut reader = stream;
        reader.read_to_string(&mut body).unwrap();
        body
    }

    #[test]
    fn head_request_exposes_status_line_at_position_zero() {
        let (engine, factory) = setup();
        engine.push(Exchange::status(201).header("Content-Length", "0"));

        let mut conn = factory.open("http://host/").unwrap();
        conn.set_request_method("HEAD").unwrap();
        conn.set_request_property("X-Foobar", Some("2")).unwrap();
        conn.connect().unwrap();

        assert_eq!(conn.response_code().unwrap(), 201);
        assert_eq!(conn.header_field_key(0).unwrap(), None);
        assert!(conn.header_field_at(0).unwrap().unwrap().starts_with("HTTP/"));
        assert_eq!(conn.response_message().unwrap(), Some("Created"));

        let request = engine.last_request().unwrap();
        assert_eq!(request.method, "HEAD");
        assert_eq!(request.header("x-foobar"), Some("2"));
    }

    #[test]
    fn mutators_after_connect_raise_illegal_state() {
        let (engine, factory) = setup();
        engine.push(Exchange::status(200));
        let mut conn = factory.open("http://host/").unwrap();
        conn.connect().unwrap();

        let illegal = |r: Result<()>| matches!(r, Err(Error::IllegalState(_)));
        assert!(illegal(conn.set_url("http://other/")));
        assert!(illegal(conn.set_request_method("POST")));
        assert!(illegal(conn.set_do_input(false)));
        assert!(illegal(conn.set_do_output(true)));
        assert!(illegal(conn.set_fixed_length_streaming_mode(10)));
        assert!(illegal(conn.set_chunked_streaming_mode(10)));
        assert!(illegal(conn.set_instance_follow_redirects(false)));
        assert!(illegal(conn.set_connect_timeout(Some(Duration::from_secs(1)))));
        assert!(illegal(conn.set_read_timeout(Some(Duration::from_secs(1)))));
        assert!(illegal(conn.set_proxy(None)));
        assert!(illegal(conn.set_request_property("A", Some("1"))));
        assert!(illegal(conn.add_request_property("A", "1")));
        assert!(matches!(conn.request_property("A"), Err(Error::IllegalState(_))));
        assert!(matches!(conn.request_properties(), Err(Error::IllegalState(_))));

        assert_eq!(conn.url(), "http://host/");
        assert_eq!(conn.request_method(), Method::Get);
        assert!(conn.do_input());
        assert!(!conn.do_output());
        assert_eq!(conn.streaming_mode(), StreamingMode::Unbuffered);
        assert!(conn.instance_follow_redirects());
    }

    #[test]
    fn response_access_before_connect_is_illegal() {
        let (engine, factory) = setup();
        engine.push(Exchange::status(501));
        let conn = factory.open("http://host/").unwrap();

        assert!(matches!(conn.response_code(), Err(Error::IllegalState(_))));
        assert!(matches!(conn.header_field("a"), Err(Error::IllegalState(_))));
        assert!(matches!(conn.header_field_at(0), Err(Error::IllegalState(_))));
        assert!(matches!(conn.header_fields(), Err(Error::IllegalState(_))));
        assert!(conn.error_stream().is_none());
        assert_eq!(engine.requests().len(), 0);
    }

    #[test]
    fn connect_is_idempotent() {
        let (engine, factory) = setup();
        engine.push(Exchange::status(200));
        let mut conn = factory.open("http://host/").unwrap();
        conn.connect().unwrap();
        conn.connect().unwrap();

        assert_eq!(engine.requests().len(), 1);
        assert_eq!(conn.state(), State::Connected);
        conn.response_code().unwrap();
        assert_eq!(conn.state(), State::ResponseReady);
    }

    #[test]
    fn error_stream_visibility_follows_status() {
        let (engine, factory) = setup();
        engine.push(Exchange::status(500).body("oops"));
        engine.push(Exchange::status(200).body("fine"));

        let mut conn = factory.open("http://host/").unwrap();
        conn.connect().unwrap();
        let error = conn.error_stream().expect("error stream on 500");
        assert_eq!(read_all(&error), "oops");
        assert!(matches!(
            conn.input_stream(),
            Err(Error::HttpStatus { status: 500, .. })
        ));

        let mut conn = factory.open("http://host/").unwrap();
        conn.connect().unwrap();
        assert!(conn.error_stream().is_none());
        assert_eq!(read_all(&conn.input_stream().unwrap()), "fine");
    }

    #[test]
    fn error_stream_is_absent_for_unfollowed_redirect() {
        let (engine, factory) = setup();
        engine.push(Exchange::status(200).after_hop(Hop::redirect(304, "http://host/")));
        let mut conn = factory.open("http://host/").unwrap();
        conn.set_instance_follow_redirects(false).unwrap();
        conn.connect().unwrap();

        assert_eq!(conn.response_code().unwrap(), 304);
        assert!(conn.error_stream().is_none());
    }

    #[test]
    fn error_stream_ignores_do_input() {
        let (engine, factory) = setup();
        engine.push(Exchange::status(404));
        let mut conn = factory.open("http://host/").unwrap();
        conn.set_do_input(false).unwrap();
        conn.connect().unwrap();

        assert!(conn.error_stream().is_some());
        assert!(matches!(conn.input_stream(), Err(Error::Protocol(_))));
    }

    #[test]
    fn fixed_length_body_is_sent_exactly() {
        let (engine, factory) = setup();
        engine.push(Exchange::status(200).body("Nice"));
        let body = [b'x'; 65];

        let mut conn = factory.open("http://host/").unwrap();
        conn.set_do_output(true).unwrap();
        conn.set_fixed_length_streaming_mode(65).unwrap();
        let mut out = conn.output_stream().unwrap();
        assert_eq!(conn.state(), State::StreamingOutput);
        out.write_all(&body).unwrap();
        out.close().unwrap();

        assert_eq!(conn.response_code().unwrap(), 200);
        assert_eq!(read_all(&conn.input_stream().unwrap()), "Nice");
        let request = engine.last_request().unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.body.len(), 65);
        assert_eq!(request.streaming, StreamingMode::FixedLength(65));
    }

    #[test]
    fn fixed_length_mismatch_is_a_protocol_error() {
        let (engine, factory) = setup();
        engine.push(Exchange::status(200));
        engine.push(Exchange::status(200));

        let mut conn = factory.open("http://host/").unwrap();
        conn.set_do_output(true).unwrap();
        conn.set_fixed_length_streaming_mode(4).unwrap();
        let out = conn.output_stream().unwrap();
        assert!(matches!(out.write_bytes(b"12345"), Err(Error::Protocol(_))));
        assert_eq!(out.write_bytes(b"12").unwrap(), 2);
        assert!(matches!(out.close(), Err(Error::Protocol(_))));

        let mut conn = factory.open("http://host/").unwrap();
        conn.set_do_output(true).unwrap();
        conn.set_fixed_length_streaming_mode(4).unwrap();
        let out = conn.output_stream().unwrap();
        assert_eq!(out.write_bytes(b"1234").unwrap(), 4);
        out.close().unwrap();
        assert_eq!(conn.response_code().unwrap(), 200);
    }

    #[test]
    fn response_access_finishes_an_unopened_body() {
        let (engine, factory) = setup();
        engine.push(Exchange::status(204));
        let mut conn = factory.open("http://host/").unwrap();
        conn.set_do_output(true).unwrap();
        conn.connect().unwrap();

        assert_eq!(conn.response_code().unwrap(), 204);
        assert!(engine.last_request().unwrap().body.is_empty());
        assert!(matches!(conn.output_stream(), Err(Error::Protocol(_))));
    }

    #[test]
    fn redirected_hops_do_not_leak_headers() {
        let (engine, factory) = setup();
        engine.push(
            Exchange::status(200)
                .header("foo2", "bar")
                .after_hop(Hop::redirect(302, "http://host/final").header("foo1", "bar")),
        );
        let mut conn = factory.open("http://host/start").unwrap();
        conn.connect().unwrap();

        assert_eq!(conn.response_code().unwrap(), 200);
        assert_eq!(conn.header_field("foo2").unwrap(), Some("bar"));
        assert_eq!(conn.header_field("foo1").unwrap(), None);
        assert_eq!(conn.url(), "http://host/final");
    }

    #[test]
    fn unfollowed_redirect_reports_first_hop() {
        let (engine, factory) = setup();
        engine.push(
            Exchange::status(200)
                .header("foo2", "bar")
                .after_hop(Hop::redirect(302, "http://host/final").header("foo1", "bar")),
        );
        let mut conn = factory.open("http://host/start").unwrap();
        conn.set_instance_follow_redirects(false).unwrap();
        conn.connect().unwrap();

        assert_eq!(conn.response_code().unwrap(), 302);
        assert_eq!(conn.header_field("Location").unwrap(), Some("http://host/final"));
        assert_eq!(conn.header_field("foo1").unwrap(), Some("bar"));
        assert_eq!(conn.url(), "http://host/start");
    }

    #[test]
    fn redirect_limit_is_a_transport_failure() {
        let engine = Arc::new(ScriptedEngine::new());
        let config = crate::ClientConfig {
            max_redirects: 1,
            ..Default::default()
        };
        let factory = ConnectionBuilder::new(Arc::clone(&engine) as Arc<dyn TransferEngine>)
            .reaper(Reaper::inline())
            .config(config)
            .build();
        engine.push(
            Exchange::status(200)
                .after_hop(Hop::redirect(302, "http://host/1"))
                .after_hop(Hop::redirect(302, "http://host/2")),
        );
        let mut conn = factory.open("http://host/").unwrap();

        assert!(matches!(conn.connect(), Err(Error::Transport(_))));
        assert_eq!(conn.state(), State::Unconnected);
    }

    #[test]
    fn interrupted_read_reports_partial_count() {
        let (engine, factory) = setup();
        engine.push(Exchange::status(200).body("abcdef").stall_at(3));

        let (tx, rx) = mpsc::channel();
        let reader = thread::spawn(move || {
            let mut conn = factory.open("http://host/").unwrap();
            let input = conn.input_stream().unwrap();
            tx.send(interrupt::current()).unwrap();
            let mut buf = [0u8; 6];
            let result = input.read_bytes(&mut buf);
            let flag_after = interrupt::is_interrupted();
            let rest = input.read_bytes(&mut buf).unwrap();
            (result, flag_after, buf[..rest].to_vec())
        });

        let interrupter = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(50));
        interrupter.interrupt();

        let (result, flag_after, rest) = reader.join().unwrap();
        assert!(matches!(result, Err(Error::Interrupted { transferred: 3 })));
        assert!(!flag_after);
        assert_eq!(rest, b"def");
    }

    #[test]
    fn interrupted_connect_stays_unconnected() {
        let (engine, factory) = setup();
        engine.push(Exchange::status(200).stall_head());
        engine.push(Exchange::status(200));

        let (tx, rx) = mpsc::channel();
        let worker = thread::spawn(move || {
            let mut conn = factory.open("http://host/").unwrap();
            tx.send(interrupt::current()).unwrap();
            let first = conn.connect();
            let state = conn.state();
            let second = conn.connect().and_then(|()| conn.response_code());
            (first, state, second)
        });

        let interrupter = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(50));
        interrupter.interrupt();

        let (first, state, second) = worker.join().unwrap();
        assert!(matches!(first, Err(Error::Interrupted { transferred: 0 })));
        assert_eq!(state, State::Unconnected);
        assert_eq!(second.unwrap(), 200);
    }

    #[test]
    fn concurrent_entry_is_detected() {
        let (engine, factory) = setup();
        engine.push(Exchange::status(200).body("abcdef").stall_at(1));

        let mut conn = factory.open("http://host/").unwrap();
        let handle = conn.transfer_handle().unwrap();
        let input = conn.input_stream().unwrap();

        let (tx, rx) = mpsc::channel();
        let reader = thread::spawn(move || {
            tx.send(interrupt::current()).unwrap();
            let mut buf = [0u8; 4];
            input.read_bytes(&mut buf)
        });
        let interrupter = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(50));

        assert!(matches!(handle.request_headers(), Err(Error::ConcurrentUse)));
        interrupter.interrupt();
        assert!(matches!(
            reader.join().unwrap(),
            Err(Error::Interrupted { transferred: 1 })
        ));
    }

    #[test]
    fn reset_keeps_headers_and_hands_out_new_streams() {
        let (engine, factory) = setup();
        engine.push(Exchange::status(200).body("one"));
        engine.push(Exchange::status(200).body("two"));

        let mut conn = factory.open("http://host/").unwrap();
        conn.set_request_property("X-Keep", Some("yes")).unwrap();
        let first = conn.input_stream().unwrap();
        assert_eq!(conn.state(), State::StreamingInput);

        conn.reset().unwrap();
        assert_eq!(conn.state(), State::Reset);
        assert!(first.is_closed());
        assert!(matches!(first.read_bytes(&mut [0u8; 1]), Err(Error::Closed)));
        assert_eq!(conn.request_property("x-keep").unwrap().as_deref(), Some("yes"));
        assert!(matches!(conn.response_code(), Err(Error::IllegalState(_))));

        let second = conn.input_stream().unwrap();
        assert!(!second.is_same(&first));
        assert_eq!(read_all(&second), "two");
        assert_eq!(engine.last_request().unwrap().header("X-Keep"), Some("yes"));
    }

    #[test]
    fn stream_close_is_idempotent() {
        let (engine, factory) = setup();
        engine.push(Exchange::status(200).body("body"));
        let mut conn = factory.open("http://host/").unwrap();
        conn.set_do_output(true).unwrap();
        let out = conn.output_stream().unwrap();
        out.close().unwrap();
        out.close().unwrap();
        assert!(matches!(out.write_bytes(b"x"), Err(Error::Closed)));

        let input = conn.input_stream().unwrap();
        input.close();
        input.close();
        assert!(matches!(input.read_bytes(&mut [0u8; 1]), Err(Error::Closed)));
        assert!(conn.input_stream().unwrap().is_same(&input));

        let err = (&input).read(&mut [0u8; 1]).unwrap_err();
        assert!(matches!(Error::from_io(&err), Some(Error::Closed)));
    }

    #[test]
    fn interrupted_body_close_is_retried_by_response_access() {
        let (engine, factory) = setup();
        engine.push(Exchange::status(200).body("done"));
        let mut conn = factory.open("http://host/").unwrap();
        conn.set_do_output(true).unwrap();
        let out = conn.output_stream().unwrap();
        out.write_bytes(b"x").unwrap();

        interrupt::current().interrupt();
        assert!(matches!(out.close(), Err(Error::Interrupted { transferred: 0 })));
        assert!(!out.is_finished());
        assert!(matches!(out.write_bytes(b"y"), Err(Error::Closed)));

        assert_eq!(conn.response_code().unwrap(), 200);
        assert!(out.is_finished());
        out.close().unwrap();
        assert_eq!(read_all(&conn.input_stream().unwrap()), "done");
        assert_eq!(engine.last_request().unwrap().body, b"x");
    }

    #[test]
    fn redirect_after_request_body_rewrites_url() {
        let (engine, factory) = setup();
        for _ in 0..2 {
            engine.push(
                Exchange::status(200)
                    .header("foo2", "bar")
                    .after_hop(Hop::redirect(302, "http://host/final")),
            );
        }

        let mut conn = factory.open("http://host/start").unwrap();
        conn.set_do_output(true).unwrap();
        let out = conn.output_stream().unwrap();
        out.write_bytes(b"x").unwrap();
        assert_eq!(conn.url(), "http://host/start");
        out.close().unwrap();
        assert_eq!(conn.url(), "http://host/final");
        assert_eq!(conn.header_field("foo2").unwrap(), Some("bar"));
        conn.reset().unwrap();
        assert_eq!(conn.url(), "http://host/final");

        let mut conn = factory.open("http://host/start").unwrap();
        conn.set_do_output(true).unwrap();
        conn.connect().unwrap();
        assert_eq!(conn.url(), "http://host/start");
        assert_eq!(conn.response_code().unwrap(), 200);
        assert_eq!(conn.url(), "http://host/final");
    }

    #[test]
    fn handle_bound_after_disconnect_drops_expect() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.default_request_header("Expect", "100-continue");
        let factory = ConnectionBuilder::new(Arc::clone(&engine) as Arc<dyn TransferEngine>)
            .reaper(Reaper::inline())
            .build();
        engine.push(Exchange::status(200));

        let mut conn = factory.open("http://host/").unwrap();
        drop(conn.transfer_handle().unwrap());
        conn.disconnect();
        assert_eq!(factory.pool().idle(), 0);

        conn.connect().unwrap();
        assert_eq!(conn.ownership(), Ownership::Dirty);
        assert_eq!(engine.last_request().unwrap().header("Expect"), None);
    }

    #[test]
    fn error_stream_is_absent_when_the_head_fails() {
        let (engine, factory) = setup();
        engine.push(Exchange::status(500).body("late"));
        let mut conn = factory.open("http://host/").unwrap();
        conn.set_do_output(true).unwrap();
        conn.set_fixed_length_streaming_mode(4).unwrap();
        let out = conn.output_stream().unwrap();
        out.write_bytes(b"12").unwrap();

        assert!(conn.error_stream().is_none());
        assert!(matches!(conn.response_code(), Err(Error::Protocol(_))));
        assert!(!out.is_finished());
    }

    #[test]
    fn date_headers_parse_to_epoch_millis() {
        let (engine, factory) = setup();
        engine.push(
            Exchange::status(200)
                .header("Date", "Sun, 06 Nov 1994 08:49:37 GMT")
                .header("Expires", "Sunday, 06-Nov-94 08:49:37 GMT")
                .header("Last-Modified", "Sun Nov  6 08:49:37 1994")
                .header("X-Zoneless", "Sun, 06 Nov 1994 08:49:37")
                .header("X-Garbage", "yesterday"),
        );
        let mut conn = factory.open("http://host/").unwrap();
        conn.connect().unwrap();

        let expected = 784_111_777_000;
        assert_eq!(conn.header_field_date("date", -1).unwrap(), expected);
        assert_eq!(conn.header_field_date("expires", -1).unwrap(), expected);
        assert_eq!(conn.header_field_date("last-modified", -1).unwrap(), expected);
        assert_eq!(conn.header_field_date("x-zoneless", -1).unwrap(), expected);
        assert_eq!(conn.header_field_date("x-garbage", -1).unwrap(), -1);
        assert_eq!(conn.header_field_date("hubla-wubla", -1).unwrap(), -1);
    }

    #[test]
    fn disconnect_recycles_a_clean_handle() {
        let (engine, factory) = setup();
        engine.push(Exchange::status(200).body("first"));
        engine.push(Exchange::status(200).body("second"));

        let mut conn = factory.open("http://host/a").unwrap();
        conn.set_request_property("X-First", Some("1")).unwrap();
        assert_eq!(read_all(&conn.input_stream().unwrap()), "first");
        let first_id = engine.last_request().unwrap().resource;
        conn.disconnect();
        assert_eq!(conn.ownership(), Ownership::Recycled);
        assert_eq!(conn.state(), State::Unconnected);
        assert_eq!(factory.pool().idle(), 1);

        let mut other = factory.open("http://host/b").unwrap();
        assert_eq!(read_all(&other.input_stream().unwrap()), "second");
        let request = engine.last_request().unwrap();
        assert_eq!(request.resource, first_id);
        assert_eq!(request.header("X-First"), None);
        assert_eq!(engine.created(), 1);
        assert_eq!(engine.total_disposals(), 0);
    }

    #[test]
    fn disconnected_connection_binds_a_new_handle() {
        let (engine, factory) = setup();
        engine.push(Exchange::status(200));
        let mut conn = factory.open("http://host/").unwrap();
        conn.disconnect();
        conn.disconnect();

        conn.set_request_property("A", Some("1")).unwrap();
        assert_eq!(conn.ownership(), Ownership::Clean);
        conn.connect().unwrap();
        assert_eq!(conn.ownership(), Ownership::Dirty);
        assert_eq!(conn.response_code().unwrap(), 200);
        assert_eq!(engine.created(), 1);
    }

    #[test]
    fn exposed_handle_is_never_recycled() {
        let (engine, factory) = setup();
        engine.push(Exchange::status(200));
        let mut conn = factory.open("http://host/").unwrap();
        let handle = conn.transfer_handle().unwrap();
        let id = handle.id();
        conn.connect().unwrap();
        conn.disconnect();

        assert_eq!(factory.pool().idle(), 0);
        assert_eq!(engine.disposals(id), 0);
        drop(handle);
        assert_eq!(engine.disposals(id), 1);
    }

    #[test]
    fn dropped_connection_disposes_exactly_once() {
        let (engine, factory) = setup();
        engine.push(Exchange::status(200).body("x"));
        let mut conn = factory.open("http://host/").unwrap();
        let input = conn.input_stream().unwrap();
        drop(conn);

        assert_eq!(engine.total_disposals(), 1);
        assert!(matches!(input.read_bytes(&mut [0u8; 1]), Err(Error::Closed)));
        drop(factory);
        assert_eq!(engine.total_disposals(), 1);
    }

    #[test]
    fn method_defaults_follow_io_flags() {
        let (_engine, factory) = setup();
        let mut conn = factory.open("http://host/").unwrap();
        assert_eq!(conn.request_method(), Method::Get);
        conn.set_do_output(true).unwrap();
        assert_eq!(conn.request_method(), Method::Post);
        conn.set_do_output(false).unwrap();
        conn.set_do_input(false).unwrap();
        assert_eq!(conn.request_method(), Method::Head);

        conn.set_request_method("put").unwrap();
        assert_eq!(conn.request_method(), Method::Put);
        assert!(conn.do_output());

        conn.set_request_method("head").unwrap();
        assert!(!conn.do_input() && !conn.do_output());
        conn.set_do_output(true).unwrap();
        assert_eq!(conn.request_method(), Method::Post);

        conn.set_request_method("propfind").unwrap();
        assert_eq!(conn.request_method().as_str(), "PROPFIND");
        assert!(matches!(conn.set_request_method(""), Err(Error::Protocol(_))));
    }

    #[test]
    fn header_views_differ_in_grouping() {
        let (engine, factory) = setup();
        engine.push(
            Exchange::status(200)
                .header("Set-Cookie", "a=1")
                .header("X-Other", "x")
                .header("set-cookie", "b=2")
                .header("Content-Length", "12"),
        );
        let mut conn = factory.open("http://host/").unwrap();
        conn.connect().unwrap();

        let fields = conn.header_fields().unwrap();
        assert_eq!(fields.get_all("SET-COOKIE"), ["a=1", "b=2"]);
        assert_eq!(conn.header_field_key(3).unwrap(), Some("set-cookie"));
        assert_eq!(conn.header_field_at(3).unwrap(), Some("b=2"));
        assert_eq!(conn.header_field_at(5).unwrap(), None);
        assert_eq!(conn.header_field_int("content-length", -1).unwrap(), 12);
        assert_eq!(conn.header_field_int("x-other", -1).unwrap(), -1);
        assert_eq!(conn.content_length().unwrap(), Some(12));
    }

    #[test]
    fn request_properties_keep_addition_order() {
        let (_engine, factory) = setup();
        let mut conn = factory.open("http://host/").unwrap();
        conn.add_request_property("Accept", "text/html").unwrap();
        conn.add_request_property("X-A", "1").unwrap();
        conn.add_request_property("accept", "*/*").unwrap();

        let props = conn.request_properties().unwrap();
        assert_eq!(props.get_all("ACCEPT"), ["text/html", "*/*"]);
        conn.set_request_property("Accept", None).unwrap();
        assert_eq!(conn.request_property("accept").unwrap(), None);
    }

    #[test]
    fn proxy_is_passed_to_the_engine() {
        let (engine, factory) = setup();
        engine.push(Exchange::status(200));
        let mut conn = factory.open("http://host/").unwrap();
        conn.set_proxy(Some(Proxy::new(ProxyKind::Socks5, "127.0.0.1", 1080)))
            .unwrap();
        assert!(conn.using_proxy());
        conn.connect().unwrap();

        assert_eq!(
            engine.last_request().unwrap().proxy.as_deref(),
            Some("socks5://127.0.0.1:1080")
        );
    }

    #[test]
    fn failed_connect_resets_the_engine() {
        let (engine, factory) = setup();
        engine.push(Exchange::failing(|| Error::Resolution("nowhere".into())));
        engine.push(Exchange::status(200));
        let mut conn = factory.open("http://nowhere/").unwrap();

        assert!(matches!(conn.connect(), Err(Error::Resolution(_))));
        assert_eq!(conn.state(), State::Unconnected);
        conn.set_url("http://somewhere/").unwrap();
        conn.connect().unwrap();
        assert_eq!(conn.response_code().unwrap(), 200);
    }
}
