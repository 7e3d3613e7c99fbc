//! Host-based request dispatch

use crate::error::{Error, Result};
use crate::files::FileServer;
use crate::proxy::Forwarder;
use crate::rules::{normalize_host, Rule, Target};
use crate::table::RuleTable;
use std::sync::Arc;
use tracing::debug;

/// Side channel told about every matched request.
///
/// Implementations must not block; the call sits on the request path.
pub trait HitRecorder: Send + Sync {
    fn record_hit(&self, host: &str);
}

/// Recorder that drops every hit
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHits;

impl HitRecorder for NoopHits {
    fn record_hit(&self, _host: &str) {}
}

/// What to do with a matched request
#[derive(Debug, Clone)]
pub enum Handler {
    Files(FileServer),
    Forward(Forwarder),
}

impl Handler {
    fn for_rule(rule: &Rule) -> Self {
        match rule.target() {
            Target::ServeFiles(root) => Handler::Files(FileServer::new(root.clone())),
            Target::ForwardTo(backend) => Handler::Forward(Forwarder::new(backend.clone())),
        }
    }
}

/// Resolves request hosts against the current rule table
#[derive(Clone)]
pub struct Dispatcher {
    table: Arc<RuleTable>,
    hits: Arc<dyn HitRecorder>,
}

impl Dispatcher {
    pub fn new(table: Arc<RuleTable>, hits: Arc<dyn HitRecorder>) -> Self {
        Self { table, hits }
    }

    pub fn table(&self) -> &Arc<RuleTable> {
        &self.table
    }

    /// Find the first rule, in file order, whose host equals the request
    /// host or is a parent domain of it. Records a hit on match.
    pub fn resolve(&self, raw_host: &str) -> Result<Arc<Rule>> {
        let host = normalize_host(raw_host);
        let snapshot = self.table.snapshot();

        match snapshot.find(&host) {
            Some(rule) => {
                self.hits.record_hit(rule.host());
                debug!(host = %host, rule = %rule.host(), "matched rule");
                Ok(rule.clone())
            }
            None => Err(Error::NotFound(host)),
        }
    }

    /// Resolve and bind the handler for the matched rule
    pub fn dispatch(&self, raw_host: &str) -> Result<Handler> {
        self.resolve(raw_host).map(|rule| Handler::for_rule(&rule))
    }
}
