//! Proxy server implementation
//! Accepts HTTP/HTTPS connections and forwards requests through the mapping table

use crate::certificate;
use crate::rewrite::ClientInfo;
use crate::table::{Dispatch, MappingTable};
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, LOCATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Default HTTPS listen address
pub const DEFAULT_HTTPS_BIND: &str = "127.0.0.1:8443";

/// Proxy server configuration
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// HTTPS listen address, `None` to disable HTTPS
    pub https_bind: Option<String>,
    /// Additional plaintext HTTP listen address
    pub http_bind: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            https_bind: Some(DEFAULT_HTTPS_BIND.to_string()),
            http_bind: None,
        }
    }
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    table: Arc<MappingTable>,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(config: ProxyConfig, table: Arc<MappingTable>) -> Self {
        Self { config, table }
    }

    /// Bind every configured listener, then serve until one of them fails
    ///
    /// Certificate generation and bind failures are returned before any
    /// listener starts accepting connections.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let https = match self.config.https_bind.as_deref() {
            Some(bind) => {
                let cert = certificate::generate().context("failed to make certificate")?;
                let acceptor = cert.tls_acceptor().context("failed to configure TLS")?;
                let listener = Self::bind(bind).await?;
                Some((listener, acceptor))
            }
            None => None,
        };

        let http = match self.config.http_bind.as_deref() {
            Some(bind) => Some(Self::bind(bind).await?),
            None => None,
        };

        let mut tasks = JoinSet::new();

        if let Some((listener, acceptor)) = https {
            info!("HTTPS server listening on {}", listener.local_addr()?);
            tasks.spawn(self.clone().serve_https(listener, acceptor));
        }

        if let Some(listener) = http {
            info!("HTTP server listening on {}", listener.local_addr()?);
            tasks.spawn(self.clone().serve_http(listener));
        }

        if tasks.is_empty() {
            bail!("no listeners configured: HTTPS is disabled and no HTTP address was given");
        }

        while let Some(result) = tasks.join_next().await {
            result.context("listener task aborted")??;
        }

        Ok(())
    }

    async fn bind(addr: &str) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("unable to listen on `{}`", addr))
    }

    /// Serve plaintext HTTP connections from `listener`
    pub async fn serve_http(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let table = self.table.clone();
            let client = ClientInfo {
                remote_addr,
                tls: false,
            };

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, client, table).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Serve TLS connections from `listener`
    pub async fn serve_https(
        self: Arc<Self>,
        listener: TcpListener,
        acceptor: TlsAcceptor,
    ) -> Result<()> {
        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let table = self.table.clone();
            let acceptor = acceptor.clone();
            let client = ClientInfo {
                remote_addr,
                tls: true,
            };

            tokio::spawn(async move {
                let stream = match acceptor.accept(stream).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!("TLS handshake error from {}: {}", remote_addr, e);
                        return;
                    }
                };

                if let Err(e) = Self::handle_connection(stream, client, table).await {
                    debug!("HTTPS connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handle a single connection
    async fn handle_connection<I>(io: I, client: ClientInfo, table: Arc<MappingTable>) -> Result<()>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(
                TokioIo::new(io),
                service_fn(move |req| {
                    let table = table.clone();
                    async move { Ok::<_, Infallible>(Self::handle_request(&table, req, client).await) }
                }),
            )
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Handle an incoming request and log its outcome
    pub async fn handle_request(
        table: &MappingTable,
        req: Request<Incoming>,
        client: ClientInfo,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let started = Instant::now();
        let method = req.method().clone();
        let uri = req.uri().clone();
        let version = req.version();

        let response = Self::process_request(table, req, &client).await;

        info!(
            "\"{} {} {:?}\" from {} - {} in {:?}",
            method,
            uri,
            version,
            client.remote_addr,
            response.status().as_u16(),
            started.elapsed()
        );

        response
    }

    /// Route the request and forward it upstream
    async fn process_request(
        table: &MappingTable,
        req: Request<Incoming>,
        client: &ClientInfo,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        match table.dispatch(req.uri().path()) {
            Dispatch::Forward { forwarder, suffix } => {
                match forwarder.forward(req, &suffix, client).await {
                    Ok(response) => response.map(BoxBody::new),
                    Err(e) => {
                        error!("proxy error for {}: {}", forwarder.mapping(), e);
                        Self::text_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
                    }
                }
            }
            Dispatch::Redirect(path) => {
                let location = match req.uri().query() {
                    Some(query) => format!("{}?{}", path, query),
                    None => path,
                };
                Self::redirect_response(&location)
            }
            Dispatch::NotFound => Self::text_response(StatusCode::NOT_FOUND, "404 page not found"),
        }
    }

    /// Create text response
    fn text_response(status: StatusCode, body: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
        let mut response = Response::new(Self::full_body(Bytes::from(body.to_string())));
        *response.status_mut() = status;
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }

    /// Create redirect response
    fn redirect_response(location: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
        let mut response = Self::text_response(StatusCode::MOVED_PERMANENTLY, "");
        if let Ok(value) = HeaderValue::from_str(location) {
            response.headers_mut().insert(LOCATION, value);
        }
        response
    }

    /// Create full body
    fn full_body(bytes: Bytes) -> BoxBody<Bytes, hyper::Error> {
        Full::new(bytes).map_err(|never| match never {}).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.https_bind.as_deref(), Some(DEFAULT_HTTPS_BIND));
        assert!(config.http_bind.is_none());
    }

    #[test]
    fn test_text_response() {
        let response = ProxyServer::text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn test_redirect_response() {
        let response = ProxyServer::redirect_response("/docs/?page=2");
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers().get(LOCATION).unwrap(), "/docs/?page=2");
    }
}
