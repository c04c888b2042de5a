//! Entry point: builds connections that share one engine, pool and reaper.

use std::sync::Arc;

use tracing::debug;

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::engine::{Proxy, TransferEngine};
use crate::error::{Error, Result};
use crate::handle::TransferHandle;
use crate::pool::Pool;
use crate::reaper::Reaper;
use crate::url::UrlBuf;

/// Picks resolver addresses for a target URL.
pub trait DnsSource: Send + Sync {
    fn dns_servers(&self, url: &str) -> Option<String>;
}

impl<F> DnsSource for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn dns_servers(&self, url: &str) -> Option<String> {
        self(url)
    }
}

/// Picks the network interface a request to `url` should leave through.
pub trait InterfaceSource: Send + Sync {
    fn network_interface(&self, url: &str) -> Option<String>;
}

impl<F> InterfaceSource for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn network_interface(&self, url: &str) -> Option<String> {
        self(url)
    }
}

/// Picks the proxy, if any, for `url`.
pub trait ProxySource: Send + Sync {
    fn proxy(&self, url: &str) -> Option<Proxy>;
}

impl<F> ProxySource for F
where
    F: Fn(&str) -> Option<Proxy> + Send + Sync,
{
    fn proxy(&self, url: &str) -> Option<Proxy> {
        self(url)
    }
}

pub struct ConnectionBuilder {
    engine: Arc<dyn TransferEngine>,
    reaper: Option<Reaper>,
    config: ClientConfig,
    pool_capacity: Option<usize>,
    dns: Option<Box<dyn DnsSource>>,
    interface: Option<Box<dyn InterfaceSource>>,
    proxy: Option<Box<dyn ProxySource>>,
}

impl ConnectionBuilder {
    pub fn new(engine: Arc<dyn TransferEngine>) -> Self {
        Self {
            engine,
            reaper: None,
            config: ClientConfig::default(),
            pool_capacity: None,
            dns: None,
            interface: None,
            proxy: None,
        }
    }

    /// Defaults to [`Reaper::global`].
    pub fn reaper(mut self, reaper: Reaper) -> Self {
        self.reaper = Some(reaper);
        self
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides `ClientConfig::pool_capacity`.
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = Some(capacity);
        self
    }

    pub fn dns_source(mut self, source: impl DnsSource + 'static) -> Self {
        self.dns = Some(Box::new(source));
        self
    }

    pub fn interface_source(mut self, source: impl InterfaceSource + 'static) -> Self {
        self.interface = Some(Box::new(source));
        self
    }

    pub fn proxy_source(mut self, source: impl ProxySource + 'static) -> Self {
        self.proxy = Some(Box::new(source));
        self
    }

    pub fn build(self) -> Arc<ConnectionFactory> {
        let reaper = self.reaper.unwrap_or_else(|| Reaper::global().clone());
        let capacity = self.pool_capacity.unwrap_or(self.config.pool_capacity);
        debug!(capacity, "building connection factory");
        Arc::new(ConnectionFactory {
            pool: Pool::new(self.engine, reaper, capacity),
            config: self.config,
            dns: self.dns,
            interface: self.interface,
            proxy: self.proxy,
        })
    }
}

pub struct ConnectionFactory {
    pool: Pool,
    config: ClientConfig,
    dns: Option<Box<dyn DnsSource>>,
    interface: Option<Box<dyn InterfaceSource>>,
    proxy: Option<Box<dyn ProxySource>>,
}

impl ConnectionFactory {
    /// A new unconnected connection to `url`, bound to a pooled or fresh
    /// handle. Only `http` and `https` are accepted.
    pub fn open(self: &Arc<Self>, url: &str) -> Result<Connection> {
        let parsed = UrlBuf::from(url);
        match parsed.scheme() {
            Some(scheme)
                if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") => {}
            Some(scheme) => return Err(Error::UnsupportedProtocol(scheme.to_string())),
            None => return Err(Error::MalformedUrl(url.to_string())),
        }

        let mut conn = Connection::new(Arc::clone(self), url)?;
        if let Some(source) = &self.proxy {
            conn.set_proxy(source.proxy(url))?;
        }
        conn.set_request_property("Expect", None)?;
        Ok(conn)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub(crate) fn obtain(&self) -> Result<TransferHandle> {
        self.pool.obtain()
    }

    pub(crate) fn recycle(&self, handle: TransferHandle) -> bool {
        self.pool.recycle(handle)
    }

    pub(crate) fn dns_servers(&self, url: &str) -> Option<String> {
        match &self.dns {
            Some(source) => source.dns_servers(url),
            None => self.config.dns_servers.clone(),
        }
    }

    pub(crate) fn network_interface(&self, url: &str) -> Option<String> {
        match &self.interface {
            Some(source) => source.network_interface(url),
            None => self.config.network_interface.clone(),
        }
    }
}

impl std::fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ProxyKind;
    use crate::testing::{Exchange, ScriptedEngine};

    fn builder(engine: &Arc<ScriptedEngine>) -> ConnectionBuilder {
        ConnectionBuilder::new(Arc::clone(engine) as Arc<dyn TransferEngine>).reaper(Reaper::inline())
    }

    #[test]
    fn only_http_schemes_are_accepted() {
        let engine = Arc::new(ScriptedEngine::new());
        let factory = builder(&engine).build();

        assert!(factory.open("HTTPS://host/").is_ok());
        assert!(matches!(
            factory.open("ftp://host/file"),
            Err(Error::UnsupportedProtocol(s)) if s == "ftp"
        ));
        assert!(matches!(factory.open("host/path"), Err(Error::MalformedUrl(_))));
    }

    #[test]
    fn sources_feed_the_request() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.push(Exchange::status(200));
        let factory = builder(&engine)
            .proxy_source(|url: &str| {
                url.contains("via-proxy")
                    .then(|| Proxy::new(ProxyKind::HttpPlain, "proxy", 8080))
            })
            .dns_source(|_: &str| Some("10.0.0.53".to_string()))
            .build();

        let mut conn = factory.open("http://via-proxy/").unwrap();
        assert!(conn.using_proxy());
        conn.connect().unwrap();
        assert_eq!(
            engine.last_request().unwrap().proxy.as_deref(),
            Some("http://proxy:8080")
        );
        assert_eq!(factory.dns_servers("http://any/").as_deref(), Some("10.0.0.53"));

        let conn = factory.open("http://direct/").unwrap();
        assert!(!conn.using_proxy());
    }

    #[test]
    fn expect_header_is_removed() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.default_request_header("Expect", "100-continue");
        engine.default_request_header("User-Agent", "hothttp");
        let factory = builder(&engine).build();

        let mut conn = factory.open("http://host/").unwrap();
        assert_eq!(conn.request_property("Expect").unwrap(), None);
        assert_eq!(conn.request_property("user-agent").unwrap().as_deref(), Some("hothttp"));
    }

    #[test]
    fn pool_capacity_comes_from_config_unless_overridden() {
        let engine = Arc::new(ScriptedEngine::new());
        let config = ClientConfig {
            pool_capacity: 7,
            ..Default::default()
        };
        assert_eq!(builder(&engine).config(config.clone()).build().pool().capacity(), 7);
        assert_eq!(
            builder(&engine).config(config).pool_capacity(1).build().pool().capacity(),
            1
        );
    }
}
