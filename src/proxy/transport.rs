//! Outbound transport through upstream HTTP proxies
//!
//! Issues a plain `GET` in absolute form to the proxy and collects the whole
//! response. Failures carry a socket-style error code (`ETIMEDOUT`,
//! `ECONNREFUSED`, ...) which the dispatcher matches against the configured
//! set of proxy-breaking errors.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HOST, PROXY_AUTHORIZATION};
use hyper::{HeaderMap, Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, instrument};
use url::Url;

use crate::error::{Result, RotatorError};

/// Outbound call failure with a socket-style code
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct TransportError {
    pub code: String,
    pub message: String,
}

impl TransportError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new("ETIMEDOUT", format!("request timed out after {}ms", after.as_millis()))
    }

    pub fn from_io(err: &io::Error) -> Self {
        Self::new(io_error_code(err.kind()), err.to_string())
    }

    pub fn from_hyper(err: &hyper::Error) -> Self {
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            if let Some(io_err) = cause.downcast_ref::<io::Error>() {
                return Self::new(io_error_code(io_err.kind()), err.to_string());
            }
            source = cause.source();
        }

        let code = if err.is_timeout() {
            "ETIMEDOUT"
        } else if err.is_incomplete_message() || err.is_canceled() || err.is_closed() {
            "ECONNRESET"
        } else {
            "EUNKNOWN"
        };
        Self::new(code, err.to_string())
    }
}

/// Map an I/O error kind to the conventional socket error code
pub fn io_error_code(kind: io::ErrorKind) -> &'static str {
    match kind {
        io::ErrorKind::TimedOut => "ETIMEDOUT",
        io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
        io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof => "ECONNRESET",
        io::ErrorKind::ConnectionAborted => "ECONNABORTED",
        io::ErrorKind::BrokenPipe => "EPIPE",
        io::ErrorKind::NotConnected => "ENOTCONN",
        io::ErrorKind::AddrNotAvailable => "EADDRNOTAVAIL",
        io::ErrorKind::HostUnreachable => "EHOSTUNREACH",
        io::ErrorKind::NetworkUnreachable => "ENETUNREACH",
        _ => "EUNKNOWN",
    }
}

/// Parsed proxy endpoint: `host:port` or `http://[user:pass@]host:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    /// Base64 `user:pass` for `Proxy-Authorization`
    pub credentials: Option<String>,
}

impl ProxyEndpoint {
    pub fn parse(raw: &str) -> Result<Self> {
        let candidate = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{}", raw)
        };

        let url = Url::parse(&candidate).map_err(|e| {
            RotatorError::InvalidConfig(format!("invalid proxy address {}: {}", raw, e))
        })?;

        if url.scheme() != "http" {
            return Err(RotatorError::InvalidConfig(format!(
                "unsupported proxy scheme {} in {}",
                url.scheme(),
                raw
            )));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| RotatorError::InvalidConfig(format!("proxy {} has no host", raw)))?;

        let credentials = if url.username().is_empty() {
            None
        } else {
            let pair = format!("{}:{}", url.username(), url.password().unwrap_or(""));
            Some(BASE64.encode(pair.as_bytes()))
        };

        Ok(Self {
            host: host.to_string(),
            port: url.port_or_known_default().unwrap_or(80),
            credentials,
        })
    }

    /// `host:port` to dial
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Upstream answer, fully buffered
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Issues forwarded GET requests through a given proxy
#[async_trait]
pub trait ForwardTransport: Send + Sync {
    async fn get(
        &self,
        proxy: &str,
        target: &Url,
        timeout: Duration,
    ) -> std::result::Result<UpstreamResponse, TransportError>;
}

/// HTTP/1.1 transport built on a hyper client connection per call
#[derive(Debug, Clone, Copy, Default)]
pub struct HyperTransport;

impl HyperTransport {
    pub fn new() -> Self {
        Self
    }

    async fn send(
        proxy: &str,
        target: &Url,
    ) -> std::result::Result<UpstreamResponse, TransportError> {
        let endpoint =
            ProxyEndpoint::parse(proxy).map_err(|e| TransportError::new("EINVAL", e.to_string()))?;

        let stream = TcpStream::connect(endpoint.authority())
            .await
            .map_err(|e| TransportError::from_io(&e))?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| TransportError::from_hyper(&e))?;

        // Spawn connection handler
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Connection ended: {}", e);
            }
        });

        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(target.as_str())
            .header(HOST, host_header(target));

        if let Some(credentials) = &endpoint.credentials {
            builder = builder.header(PROXY_AUTHORIZATION, format!("Basic {}", credentials));
        }

        let request = builder
            .body(Full::new(Bytes::new()))
            .map_err(|e| TransportError::new("EINVAL", format!("failed to build request: {}", e)))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| TransportError::from_hyper(&e))?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| TransportError::from_hyper(&e))?
            .to_bytes();

        Ok(UpstreamResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}

#[async_trait]
impl ForwardTransport for HyperTransport {
    #[instrument(skip(self, target), fields(target = %target))]
    async fn get(
        &self,
        proxy: &str,
        target: &Url,
        timeout: Duration,
    ) -> std::result::Result<UpstreamResponse, TransportError> {
        tokio::time::timeout(timeout, Self::send(proxy, target))
            .await
            .map_err(|_| TransportError::timeout(timeout))?
    }
}

fn host_header(target: &Url) -> String {
    let host = target.host_str().unwrap_or_default();
    match target.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}
