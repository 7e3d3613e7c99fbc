//! Reverse-proxy handler
//! Forwards a request to a single backend over HTTP/1.1 and relays the response

use crate::response::{text_response, Body};
use crate::rules::Backend;
use anyhow::{Context, Result};
use http_body_util::BodyExt;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::{debug, error};

/// Headers that only apply to a single connection and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Forwards requests to one backend
#[derive(Debug, Clone)]
pub struct Forwarder {
    backend: Backend,
}

impl Forwarder {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Path and query sent upstream: backend prefix joined with the request path
    fn upstream_uri(&self, uri: &Uri) -> Result<Uri> {
        let path = uri.path();
        let mut target = if self.backend.path_prefix.is_empty() {
            path.to_string()
        } else if path == "/" {
            format!("{}/", self.backend.path_prefix)
        } else {
            format!("{}{}", self.backend.path_prefix, path)
        };

        if let Some(q) = uri.query() {
            target.push('?');
            target.push_str(q);
        }

        target.parse().context("Invalid upstream URI")
    }

    /// Proxy the request to the backend
    pub async fn forward<B>(
        &self,
        req: Request<B>,
        remote_addr: SocketAddr,
        is_https: bool,
    ) -> Result<Response<Body>>
    where
        B: hyper::body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        let uri = self.upstream_uri(&parts.uri)?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);

        let original_host = headers
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(|h| h.to_string());
        if original_host.is_none() {
            headers.insert(HOST, HeaderValue::from_str(&self.backend.authority)?);
        }

        let client_ip = remote_addr.ip().to_string();
        let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{}, {}", prior, client_ip),
            None => client_ip,
        };
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_str(&forwarded_for)?);
        if let Some(host) = &original_host {
            headers.insert(X_FORWARDED_HOST, HeaderValue::from_str(host)?);
        }
        headers.insert(
            X_FORWARDED_PROTO,
            HeaderValue::from_static(if is_https { "https" } else { "http" }),
        );

        let mut proxy_req = Request::builder()
            .method(parts.method)
            .uri(uri)
            .version(Version::HTTP_11)
            .body(body)
            .context("Failed to build proxy request")?;
        *proxy_req.headers_mut() = headers;

        debug!(backend = %self.backend.authority, uri = %proxy_req.uri(), "Proxying request");

        let stream = match TcpStream::connect(&self.backend.authority).await {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to connect to backend {}: {}", self.backend.authority, e);
                return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
            }
        };

        let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(stream)).await {
            Ok(pair) => pair,
            Err(e) => {
                error!("Failed to establish connection to backend {}: {}", self.backend.authority, e);
                return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
            }
        };

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Backend connection error: {}", e);
            }
        });

        let response = match sender.send_request(proxy_req).await {
            Ok(r) => r,
            Err(e) => {
                error!("Failed to send request to backend {}: {}", self.backend.authority, e);
                return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
            }
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarder(address: &str) -> Forwarder {
        Forwarder::new(Backend::parse(address).unwrap())
    }

    #[test]
    fn test_upstream_uri_plain() {
        let f = forwarder("localhost:8080");
        let uri: Uri = "/users?id=1".parse().unwrap();
        assert_eq!(f.upstream_uri(&uri).unwrap(), "/users?id=1");
    }

    #[test]
    fn test_upstream_uri_with_prefix() {
        let f = forwarder("http://localhost:8080/app/");
        let uri: Uri = "/users".parse().unwrap();
        assert_eq!(f.upstream_uri(&uri).unwrap(), "/app/users");

        let root: Uri = "/".parse().unwrap();
        assert_eq!(f.upstream_uri(&root).unwrap(), "/app/");
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-private"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("accept"));
    }
}
