//! Blocking HTTP(S) connection core.
//!
//! # Overview
//! Applications configure a [`Connection`], connect it, and read the
//! response through a URL-connection style API. The wire work is done by a
//! [`TransferEngine`] supplied by the caller (see the `hothttp-engine`
//! crate); this crate owns everything around it:
//!
//! - the connection state machine and its ordering rules,
//! - the case-insensitive, ordered [`HeaderMap`],
//! - cross-thread interruption of blocking calls ([`interrupt`]),
//! - exactly-once disposal of engine resources ([`Reaper`]),
//! - a bounded [`Pool`] of idle handles shared by a [`ConnectionFactory`].
//!
//! # Design
//! - The core performs no I/O of its own, which keeps it testable against
//!   the in-memory engine in [`testing`] (feature `test-util`).
//! - Handles are RAII: dropping the last reference schedules disposal on
//!   the reaper thread, so forgetting `disconnect()` never leaks.
//! - Response accessors take `&self` and cache what they fetch.

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod factory;
pub mod handle;
pub mod headers;
pub mod interrupt;
pub mod pool;
pub mod reaper;
pub mod stream;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod url;

pub use config::ClientConfig;
pub use connection::{Connection, Ownership, State};
pub use engine::{
    Method, Proxy, ProxyKind, ResourceId, ResponseHead, StreamingMode, TransferEngine,
    TransferRequest,
};
pub use error::{Error, Result, TimeoutKind};
pub use factory::{ConnectionBuilder, ConnectionFactory, DnsSource, InterfaceSource, ProxySource};
pub use handle::TransferHandle;
pub use headers::HeaderMap;
pub use interrupt::{CancelToken, Interrupter};
pub use pool::Pool;
pub use reaper::Reaper;
pub use stream::{InputStream, OutputStream};
pub use url::UrlBuf;
