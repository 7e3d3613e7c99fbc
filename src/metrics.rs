//! Prometheus metrics
//!
//! - `webfront_hits` (counter, label `host`): matched requests per rule host
//! - `webfront_reloads_total` (counter): successful rule reloads
//! - `webfront_rules` (gauge): rules in the installed set

use crate::dispatch::HitRecorder;
use crate::response::{full_body, Body};
use anyhow::{Context, Result};
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Hit recorder backed by the `metrics` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusHits;

impl HitRecorder for PrometheusHits {
    fn record_hit(&self, host: &str) {
        metrics::counter!("webfront_hits", "host" => host.to_string()).increment(1);
    }
}

/// Note a successful reload
pub fn record_reload(rules: usize) {
    metrics::counter!("webfront_reloads_total").increment(1);
    metrics::gauge!("webfront_rules").set(rules as f64);
}

/// Install the process-wide Prometheus recorder
pub fn install_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    metrics::describe_counter!("webfront_hits", "Cumulative hits since startup.");
    metrics::describe_counter!("webfront_reloads_total", "Successful rule reloads.");
    metrics::describe_gauge!("webfront_rules", "Rules in the installed rule set.");

    Ok(handle)
}

/// Serve the text exposition on every path of `addr` until shutdown
pub async fn serve_metrics(
    addr: SocketAddr,
    handle: PrometheusHandle,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics listener on {}", addr))?;
    info!("Metrics listening on {}", addr);

    loop {
        let (stream, remote_addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.recv() => return Ok(()),
        };
        let handle = handle.clone();

        tokio::spawn(async move {
            let service = service_fn(move |_req: Request<hyper::body::Incoming>| {
                let handle = handle.clone();
                async move { Ok::<_, Infallible>(render(&handle)) }
            });

            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("Metrics connection error from {}: {}", remote_addr, e);
            }
        });
    }
}

fn render(handle: &PrometheusHandle) -> Response<Body> {
    let mut response = Response::new(full_body(handle.render()));
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[test]
    fn test_hits_rendered_per_host() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            PrometheusHits.record_hit("example.com");
            PrometheusHits.record_hit("example.com");
            PrometheusHits.record_hit("example.org");
            record_reload(3);
        });

        let text = handle.render();
        assert!(text.contains(r#"webfront_hits{host="example.com"} 2"#));
        assert!(text.contains(r#"webfront_hits{host="example.org"} 1"#));
        assert!(text.contains("webfront_rules 3"));
    }
}
