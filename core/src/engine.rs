//! The seam between the connection core and the component doing real I/O.
//!
//! # Design
//! A [`TransferEngine`] owns opaque per-transfer resources and addresses
//! them by [`ResourceId`], the way a native library hands out pointers. The
//! core never touches the wire: it configures a resource, moves body bytes
//! through it, and reads back the response head. Creating and disposing
//! resources is the engine's job; deciding *when* to dispose is the core's
//! (see `handle` and `reaper`).
//!
//! Blocking calls receive a [`CancelToken`]. An engine waiting on the
//! network selects on the token's receiver so a cross-thread interrupt
//! unblocks it.

use std::fmt;
use std::num::NonZeroU64;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::interrupt::CancelToken;

/// Identifier of one engine-side transfer resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(NonZeroU64);

impl ResourceId {
    /// `raw` of zero is bumped to one; zero is never a valid id.
    pub fn new(raw: u64) -> Self {
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Request method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Head,
    /// Any other token, stored upper-cased.
    Custom(String),
}

impl Method {
    pub fn parse(name: &str) -> Self {
        let upper = name.to_ascii_uppercase();
        match upper.as_str() {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "HEAD" => Method::Head,
            _ => Method::Custom(upper),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Head => "HEAD",
            Method::Custom(name) => name,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a request body is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamingMode {
    /// The engine picks the framing; not recommended when the size is known.
    #[default]
    Unbuffered,
    /// Exactly this many bytes must be written before the body is finished.
    FixedLength(u64),
    /// Chunked framing with the given chunk size hint.
    Chunked(usize),
}

impl StreamingMode {
    pub fn declared_length(self) -> Option<u64> {
        match self {
            StreamingMode::FixedLength(len) => Some(len),
            _ => None,
        }
    }

    pub fn chunk_size(self) -> Option<usize> {
        match self {
            StreamingMode::Chunked(size) => Some(size),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    HttpPlain,
    HttpConnect,
    HttpsPlain,
    HttpsConnect,
    Socks4,
    Socks4a,
    Socks5,
    Socks5h,
}

impl ProxyKind {
    /// URL scheme understood by common proxy configuration syntax.
    pub fn scheme(self) -> &'static str {
        match self {
            ProxyKind::HttpPlain | ProxyKind::HttpConnect => "http",
            ProxyKind::HttpsPlain | ProxyKind::HttpsConnect => "https",
            ProxyKind::Socks4 => "socks4",
            ProxyKind::Socks4a => "socks4a",
            ProxyKind::Socks5 => "socks5",
            ProxyKind::Socks5h => "socks5h",
        }
    }
}

/// Proxy descriptor: type plus an unresolved address.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Proxy {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
}

impl Proxy {
    pub fn new(kind: ProxyKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            host: host.into(),
            port,
        }
    }

    /// `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `scheme://host:port`.
    pub fn to_url(&self) -> String {
        format!("{}://{}:{}", self.kind.scheme(), self.host, self.port)
    }
}

/// Everything the engine needs to start one request.
#[derive(Debug, Clone)]
pub struct TransferRequest<'a> {
    pub method: &'a Method,
    pub url: &'a str,
    pub proxy: Option<&'a Proxy>,
    pub dns_servers: Option<&'a str>,
    pub network_interface: Option<&'a str>,
    pub streaming: StreamingMode,
    pub read_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub follow_redirects: bool,
    /// Upper bound on followed hops; exceeding it is a transport failure.
    pub max_redirects: u32,
    pub do_input: bool,
    pub do_output: bool,
}

/// Response status and headers of the final hop, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub status_line: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// Value at `pos`: 0 is the status line, `n` is the n-th header.
    pub fn value_at(&self, pos: usize) -> Option<&str> {
        match pos {
            0 => Some(&self.status_line),
            n => self.headers.get(n - 1).map(|(_, v)| v.as_str()),
        }
    }

    /// Name at `pos`; absent for the status line.
    pub fn key_at(&self, pos: usize) -> Option<&str> {
        match pos {
            0 => None,
            n => self.headers.get(n - 1).map(|(k, _)| k.as_str()),
        }
    }

    /// First value of `name`, ignoring case.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Reason phrase after the status code, when the status line is HTTP/x.
    pub fn reason(&self) -> Option<&str> {
        let rest = self.status_line.strip_prefix("HTTP/")?;
        let (_, after_version) = rest.split_once(' ')?;
        let (_, phrase) = after_version.split_once(' ')?;
        (!phrase.is_empty()).then_some(phrase)
    }
}

/// Operations the core needs from whoever performs network transfers.
///
/// Calls on one resource are expected from one thread at a time; engines
/// that notice a second thread entering report `Error::ConcurrentUse`.
pub trait TransferEngine: Send + Sync + 'static {
    /// Allocate a fresh resource with empty request headers.
    fn create(&self) -> Result<ResourceId>;

    /// Start the request. For requests without a body this blocks until the
    /// response head arrives; with a body it returns once the body can be
    /// written. Returns the final URL when redirects moved the request.
    fn configure(
        &self,
        id: ResourceId,
        cancel: &CancelToken,
        request: &TransferRequest<'_>,
    ) -> Result<Option<String>>;

    /// Read response body bytes. Blocks until `buf` is full, the body ends
    /// or `cancel` fires; returns the count read so far (0 at end of body).
    fn read(&self, id: ResourceId, cancel: &CancelToken, buf: &mut [u8]) -> Result<usize>;

    /// Write request body bytes. Returns early with a partial count when
    /// `cancel` fires.
    fn write(&self, id: ResourceId, cancel: &CancelToken, buf: &[u8]) -> Result<usize>;

    /// End the request body and wait for the response head. Returns the
    /// final URL when redirects moved the request.
    fn finish_output(&self, id: ResourceId, cancel: &CancelToken) -> Result<Option<String>>;

    /// Drop transient request/response state; request headers survive.
    fn reset(&self, id: ResourceId) -> Result<()>;

    fn clear_headers(&self, id: ResourceId) -> Result<()>;

    /// Replace every request header called `name`; `None` removes them.
    fn set_request_header(&self, id: ResourceId, name: &str, value: Option<&str>) -> Result<()>;

    fn add_request_header(&self, id: ResourceId, name: &str, value: &str) -> Result<()>;

    fn request_header(&self, id: ResourceId, name: &str) -> Result<Option<String>>;

    /// Request headers in addition order.
    fn request_headers(&self, id: ResourceId) -> Result<Vec<(String, String)>>;

    /// The final hop's response head, or `None` before it has arrived.
    fn response_head(&self, id: ResourceId) -> Result<Option<ResponseHead>>;

    /// Release the resource. Called exactly once per id, by the reaper.
    fn dispose(&self, id: ResourceId) -> Result<()>;

    fn response_header_at(&self, id: ResourceId, pos: usize) -> Result<Option<String>> {
        Ok(self
            .response_head(id)?
            .and_then(|h| h.value_at(pos).map(str::to_string)))
    }

    fn response_header_key_at(&self, id: ResourceId, pos: usize) -> Result<Option<String>> {
        Ok(self
            .response_head(id)?
            .and_then(|h| h.key_at(pos).map(str::to_string)))
    }

    fn response_header(&self, id: ResourceId, name: &str) -> Result<Option<String>> {
        Ok(self
            .response_head(id)?
            .and_then(|h| h.value(name).map(str::to_string)))
    }

    /// Integer value of `name`, or `default` when absent or unparsable.
    fn response_header_int(&self, id: ResourceId, name: &str, default: i64) -> Result<i64> {
        let value = self.response_header(id, name)?;
        Ok(value
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default))
    }

    /// Status code of the final hop, 0 before the head has arrived.
    fn response_code(&self, id: ResourceId) -> Result<u16> {
        Ok(self.response_head(id)?.map_or(0, |h| h.status))
    }
}
