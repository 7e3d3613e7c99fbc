//! Front server
//! Accepts HTTP(S) connections and hands each request to the handler its host resolves to

use crate::certificate::CertificateManager;
use crate::config::ServerConfig;
use crate::dispatch::{Dispatcher, Handler};
use crate::error::Error;
use crate::response::{redirect_response, text_response, Body};
use crate::shutdown::Shutdown;
use anyhow::{anyhow, Context, Result};
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Which listener a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Listener {
    /// Plain HTTP, serving requests directly
    Http,
    /// Plain HTTP while HTTPS is enabled: redirect everything
    HttpRedirect,
    Https,
}

/// The HTTP front door
pub struct FrontServer {
    config: ServerConfig,
    dispatcher: Dispatcher,
    certs: Option<Arc<CertificateManager>>,
}

impl FrontServer {
    /// Create a new front server. HTTPS is served only when `certs` is set.
    pub fn new(
        config: ServerConfig,
        dispatcher: Dispatcher,
        certs: Option<Arc<CertificateManager>>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            certs,
        }
    }

    /// Bind the configured listeners and serve until shutdown
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) -> Result<()> {
        let http_listener = TcpListener::bind(self.config.http_addr)
            .await
            .with_context(|| format!("Failed to bind HTTP listener on {}", self.config.http_addr))?;
        info!("HTTP server listening on {}", self.config.http_addr);

        let Some(certs) = self.certs.clone() else {
            return self.accept_loop(http_listener, Listener::Http, None, shutdown.subscribe()).await;
        };

        let https_listener = TcpListener::bind(self.config.https_addr)
            .await
            .with_context(|| format!("Failed to bind HTTPS listener on {}", self.config.https_addr))?;
        info!("HTTPS server listening on {}", self.config.https_addr);

        let acceptor = TlsAcceptor::from(certs.server_config());

        let http = self
            .clone()
            .accept_loop(http_listener, Listener::HttpRedirect, None, shutdown.subscribe());
        let https = self
            .clone()
            .accept_loop(https_listener, Listener::Https, Some(acceptor), shutdown.subscribe());

        tokio::try_join!(http, https)?;
        Ok(())
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        kind: Listener,
        acceptor: Option<TlsAcceptor>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.recv() => {
                    info!(listener = ?kind, "Listener stopping");
                    return Ok(());
                }
            };
            let (stream, remote_addr) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    match accept_backoff(&e) {
                        Some(delay) => {
                            warn!(listener = ?kind, "Accept error: {}; retrying in {:?}", e, delay);
                            tokio::time::sleep(delay).await;
                        }
                        None => debug!(listener = ?kind, "Accept error: {}", e),
                    }
                    continue;
                }
            };
            let server = self.clone();
            let acceptor = acceptor.clone();

            tokio::spawn(async move {
                let result = match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls) => server.handle_connection(tls, remote_addr, kind).await,
                        Err(e) => Err(anyhow!("TLS handshake failed: {}", e)),
                    },
                    None => server.handle_connection(stream, remote_addr, kind).await,
                };

                if let Err(e) = result {
                    debug!("Connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handle a single connection
    async fn handle_connection<S>(
        self: Arc<Self>,
        stream: S,
        remote_addr: SocketAddr,
        kind: Listener,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        http1::Builder::new()
            .preserve_header_case(true)
            .serve_connection(
                TokioIo::new(stream),
                service_fn(move |req| {
                    let server = self.clone();
                    async move { server.handle_request(req, remote_addr, kind).await }
                }),
            )
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Handle incoming request
    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        kind: Listener,
    ) -> Result<Response<Body>, Infallible> {
        match self.process_request(req, remote_addr, kind).await {
            Ok(response) => Ok(response),
            Err(e) => {
                error!("Request error: {}", e);
                Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"))
            }
        }
    }

    /// Process request
    async fn process_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        kind: Listener,
    ) -> Result<Response<Body>> {
        debug!("{} {} from {}", req.method(), req.uri().path(), remote_addr);

        let host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(|h| h.to_string())
            .or_else(|| req.uri().authority().map(|a| a.to_string()));

        // No host is an ordinary miss for the dispatcher.
        let host = host.unwrap_or_default();

        if kind == Listener::HttpRedirect && !host.is_empty() {
            return Ok(Self::https_redirect(&req, &host, self.config.https_addr.port()));
        }

        let handler = match self.dispatcher.dispatch(&host) {
            Ok(handler) => handler,
            Err(Error::NotFound(_)) => return Ok(text_response(StatusCode::NOT_FOUND, "Not found.")),
            Err(e) => return Err(e.into()),
        };

        match handler {
            Handler::Files(files) => {
                let path = req.uri().path().to_string();
                let query = req.uri().query().map(|q| q.to_string());
                Ok(files.serve(&path, query.as_deref()).await)
            }
            Handler::Forward(forwarder) => {
                forwarder
                    .forward(req, remote_addr, kind == Listener::Https)
                    .await
            }
        }
    }

    /// Send plain-HTTP clients to the HTTPS listener
    fn https_redirect<B>(req: &Request<B>, host: &str, https_port: u16) -> Response<Body> {
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return text_response(StatusCode::BAD_REQUEST, "Use HTTPS");
        }

        let host = strip_port(host);
        let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let location = if https_port == 443 {
            format!("https://{}{}", host, path)
        } else {
            format!("https://{}:{}{}", host, https_port, path)
        };

        redirect_response(StatusCode::FOUND, &location)
    }
}

/// Pause before accepting again after `err`. Errors tied to a single
/// connection retry at once; anything else (out of file descriptors, etc.)
/// backs off so the loop does not spin.
fn accept_backoff(err: &io::Error) -> Option<Duration> {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted => None,
        _ => Some(ACCEPT_BACKOFF),
    }
}

/// Drop a `:port` suffix, keeping bracketed IPv6 literals intact
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        host.split(':').next().unwrap_or(host)
    }
}
