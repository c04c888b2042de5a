//! Channels between a caller thread and the worker running one transfer.
//!
//! # Design
//! `ureq` is blocking and cannot be woken from outside, so each transfer
//! runs on its own worker thread. The caller side only ever waits on
//! channels, which it can `select!` together with a cancel token:
//!
//! - request body chunks flow caller -> worker through [`UploadReader`],
//! - the response head comes back once on a `bounded(1)` channel,
//! - body bytes come back as [`BodyEvent`]s on a small bounded channel.
//!
//! Dropping the caller side makes the worker's next send fail, which ends
//! it. A worker blocked inside a socket read is abandoned until its own
//! read timeout (if any) fires.
//!
//! A request body is streamed once and can not be replayed. Such requests go
//! out with redirects off; a 301, 302 or 303 answer is then followed as a GET
//! through the redirect-following agent, and a 307 or 308 answer fails with
//! `Error::RetryImpossible`.

use std::io::{self, Read};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use hothttp_core::{Error, ResponseHead, Result};
use http::header::{AUTHORIZATION, CONTENT_LENGTH, LOCATION, TRANSFER_ENCODING};
use tracing::{debug, trace};
use ureq::{ResponseExt, SendBody};

use crate::errors;

const BODY_CHUNK: usize = 16 * 1024;
const BODY_QUEUE: usize = 4;
const UPLOAD_QUEUE: usize = 4;

pub(crate) enum BodyEvent {
    Chunk(Vec<u8>),
    End,
    Failed(Error),
}

/// What the worker reports once the response head is in.
pub(crate) struct Head {
    pub head: ResponseHead,
    pub final_url: String,
}

/// `Read` over chunks written by the caller. The body ends when the sending
/// side is dropped.
struct UploadReader {
    rx: Receiver<Vec<u8>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl Read for UploadReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.chunk.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Caller-side ends of a running transfer.
pub(crate) struct Pipes {
    pub head: Receiver<Result<Head>>,
    pub body: Receiver<BodyEvent>,
    pub upload: Option<Sender<Vec<u8>>>,
}

/// Start `request` on a worker thread.
///
/// `follow` is the agent that takes over after a redirect answered a request
/// body; `agent` must then not follow redirects itself.
pub(crate) fn spawn(
    agent: ureq::Agent,
    follow: Option<ureq::Agent>,
    request: http::request::Builder,
    with_body: bool,
) -> Result<Pipes> {
    let (head_tx, head_rx) = crossbeam_channel::bounded(1);
    let (body_tx, body_rx) = crossbeam_channel::bounded(BODY_QUEUE);
    let (upload_tx, upload_rx) = if with_body {
        let (tx, rx) = crossbeam_channel::bounded(UPLOAD_QUEUE);
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };

    thread::Builder::new()
        .name("hothttp-transfer".into())
        .spawn(move || run(agent, follow, request, upload_rx, head_tx, body_tx))
        .map_err(|err| Error::Other(format!("failed to start transfer thread: {err}")))?;

    Ok(Pipes {
        head: head_rx,
        body: body_rx,
        upload: upload_tx,
    })
}

fn run(
    agent: ureq::Agent,
    follow: Option<ureq::Agent>,
    request: http::request::Builder,
    upload: Option<Receiver<Vec<u8>>>,
    head_tx: Sender<Result<Head>>,
    body_tx: Sender<BodyEvent>,
) {
    let uri = request.uri_ref().cloned().unwrap_or_default();
    let headers = request.headers_ref().cloned().unwrap_or_default();
    let result = match upload {
        Some(rx) => {
            let reader = UploadReader {
                rx,
                chunk: Vec::new(),
                pos: 0,
            };
            request
                .body(SendBody::from_owned_reader(reader))
                .map_err(|e| Error::Protocol(e.to_string()))
                .and_then(|req| agent.run(req).map_err(errors::from_ureq))
        }
        None => request
            .body(())
            .map_err(|e| Error::Protocol(e.to_string()))
            .and_then(|req| agent.run(req).map_err(errors::from_ureq)),
    };

    let result = match follow {
        Some(follow) => result.and_then(|response| after_body(response, &follow, &uri, &headers)),
        None => result,
    };
    let response = match result {
        Ok(response) => response,
        Err(err) => {
            let _ = head_tx.send(Err(err));
            return;
        }
    };

    let status = response.status();
    let status_line = match status.canonical_reason() {
        Some(reason) => format!("{:?} {} {}", response.version(), status.as_u16(), reason),
        None => format!("{:?} {}", response.version(), status.as_u16()),
    };
    let headers = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let head = Head {
        head: ResponseHead {
            status: status.as_u16(),
            status_line,
            headers,
        },
        final_url: response.get_uri().to_string(),
    };
    if head_tx.send(Ok(head)).is_err() {
        return;
    }

    let mut reader = response.into_body().into_reader();
    loop {
        let mut chunk = vec![0u8; BODY_CHUNK];
        let event = match reader.read(&mut chunk) {
            Ok(0) => BodyEvent::End,
            Ok(n) => {
                chunk.truncate(n);
                BodyEvent::Chunk(chunk)
            }
            Err(err) => BodyEvent::Failed(errors::from_io(err)),
        };
        let last = !matches!(event, BodyEvent::Chunk(_));
        if body_tx.send(event).is_err() || last {
            break;
        }
    }
    trace!("transfer worker finished");
}

/// Follow a redirect that answered a request body.
fn after_body(
    response: http::Response<ureq::Body>,
    follow: &ureq::Agent,
    uri: &http::Uri,
    headers: &http::HeaderMap,
) -> Result<http::Response<ureq::Body>> {
    let status = response.status().as_u16();
    match status {
        307 | 308 => Err(Error::RetryImpossible { status }),
        301..=303 => {
            let Some(location) = response.headers().get(LOCATION) else {
                return Ok(response);
            };
            let location = location
                .to_str()
                .map_err(|_| Error::Protocol("location header is not ascii".into()))?;
            let target = resolve(uri, location)?;
            debug!(status, location = %target, "following redirect as GET after request body");

            let mut request = http::Request::builder().method(http::Method::GET).uri(target);
            for (name, value) in headers {
                if name != CONTENT_LENGTH && name != TRANSFER_ENCODING && name != AUTHORIZATION {
                    request = request.header(name, value);
                }
            }
            let request = request
                .body(())
                .map_err(|e| Error::Protocol(e.to_string()))?;
            follow.run(request).map_err(errors::from_ureq)
        }
        _ => Ok(response),
    }
}

/// Resolve a `Location` value against the request it answered.
fn resolve(base: &http::Uri, location: &str) -> Result<http::Uri> {
    let scheme = base.scheme_str().unwrap_or("http");
    let authority = base.authority().map(|a| a.as_str()).unwrap_or_default();
    let target = if location.contains("://") {
        location.to_string()
    } else if location.starts_with("//") {
        format!("{scheme}:{location}")
    } else if location.starts_with('/') {
        format!("{scheme}://{authority}{location}")
    } else {
        let path = base.path();
        let dir = &path[..path.rfind('/').map_or(0, |i| i + 1)];
        let dir = if dir.is_empty() { "/" } else { dir };
        format!("{scheme}://{authority}{dir}{location}")
    };
    target
        .parse()
        .map_err(|e| Error::MalformedUrl(format!("{target}: {e}")))
}
