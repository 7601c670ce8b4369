//! Proxied transport to etcd pods.
//!
//! Control plane nodes are not directly addressable from the
//! orchestrator. A [`ProxyDialer`] turns a logical endpoint name
//! (`etcd-<node>`) and a port into a byte stream by going through
//! some indirection: cluster DNS, an HTTP CONNECT proxy, or a static
//! table for local setups.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Byte stream returned by a dialer.
pub trait ProxyStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;

/// Dial a named endpoint through the cluster's indirection layer.
#[tonic::async_trait]
pub trait ProxyDialer: Send + Sync {
    async fn dial(&self, endpoint: &str, port: u16) -> io::Result<BoxedStream>;
}

// ── DnsDialer ────────────────────────────────────────────────────────

/// Resolves `<endpoint>.<domain>` through cluster service discovery.
#[derive(Debug, Clone)]
pub struct DnsDialer {
    domain: String,
}

impl DnsDialer {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
        }
    }

    fn target(&self, endpoint: &str, port: u16) -> String {
        let domain = self.domain.trim_matches('.');
        if domain.is_empty() {
            format!("{endpoint}:{port}")
        } else {
            format!("{endpoint}.{domain}:{port}")
        }
    }
}

#[tonic::async_trait]
impl ProxyDialer for DnsDialer {
    async fn dial(&self, endpoint: &str, port: u16) -> io::Result<BoxedStream> {
        let target = self.target(endpoint, port);
        let stream = TcpStream::connect(&target).await?;
        stream.set_nodelay(true)?;
        debug!(%endpoint, %target, "dialed via cluster DNS");
        Ok(Box::new(stream))
    }
}

// ── ConnectProxyDialer ───────────────────────────────────────────────

/// Tunnels through an HTTP proxy with `CONNECT endpoint:port`.
#[derive(Debug, Clone)]
pub struct ConnectProxyDialer {
    proxy_addr: String,
}

impl ConnectProxyDialer {
    pub fn new(proxy_addr: impl Into<String>) -> Self {
        Self {
            proxy_addr: proxy_addr.into(),
        }
    }
}

#[tonic::async_trait]
impl ProxyDialer for ConnectProxyDialer {
    async fn dial(&self, endpoint: &str, port: u16) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(&self.proxy_addr).await?;
        stream.set_nodelay(true)?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(io::Error::other)?;

        // The tunnel is only handed out once the connection task yields it.
        let proxy = self.proxy_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(%proxy, error = %e, "proxy connection closed");
            }
        });

        let authority = format!("{endpoint}:{port}");
        let req = http::Request::builder()
            .method(http::Method::CONNECT)
            .uri(authority.as_str())
            .header(http::header::HOST, authority.as_str())
            .body(Empty::<Bytes>::new())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let resp = sender.send_request(req).await.map_err(io::Error::other)?;
        if !resp.status().is_success() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("proxy refused CONNECT to {authority}: status {}", resp.status()),
            ));
        }

        let upgraded = hyper::upgrade::on(resp).await.map_err(io::Error::other)?;
        debug!(%endpoint, proxy = %self.proxy_addr, "tunnel established");
        Ok(Box::new(TokioIo::new(upgraded)))
    }
}

// ── StaticDialer ─────────────────────────────────────────────────────

/// Fixed endpoint → address table. The requested port is ignored in
/// favour of the mapped address.
#[derive(Debug, Clone, Default)]
pub struct StaticDialer {
    endpoints: HashMap<String, SocketAddr>,
}

impl StaticDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>, addr: SocketAddr) -> Self {
        self.endpoints.insert(endpoint.into(), addr);
        self
    }

    pub fn insert(&mut self, endpoint: impl Into<String>, addr: SocketAddr) {
        self.endpoints.insert(endpoint.into(), addr);
    }
}

impl FromIterator<(String, SocketAddr)> for StaticDialer {
    fn from_iter<T: IntoIterator<Item = (String, SocketAddr)>>(iter: T) -> Self {
        Self {
            endpoints: iter.into_iter().collect(),
        }
    }
}

#[tonic::async_trait]
impl ProxyDialer for StaticDialer {
    async fn dial(&self, endpoint: &str, _port: u16) -> io::Result<BoxedStream> {
        let addr = self.endpoints.get(endpoint).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no static address for {endpoint}"),
            )
        })?;
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
