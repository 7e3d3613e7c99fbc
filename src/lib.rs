//! Webfront - an HTTP front door driven by a rule file
//!
//! Each request is matched by its host against an ordered rule list and
//! either served from a directory or reverse-proxied to a backend:
//! - First-match-wins host routing (exact host or any subdomain)
//! - Rule file polled and hot-swapped without blocking requests
//! - HTTPS with certificates limited to hosts the rules cover
//! - Prometheus hit counters

pub mod certificate;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod files;
pub mod metrics;
pub mod policy;
pub mod proxy;
pub mod reloader;
pub mod response;
pub mod rules;
pub mod server;
pub mod shutdown;
pub mod table;

pub use certificate::CertificateManager;
pub use config::ServerConfig;
pub use dispatch::{Dispatcher, Handler, HitRecorder, NoopHits};
pub use error::{Error, Result};
pub use policy::HostPolicy;
pub use reloader::{ReloadOutcome, Reloader};
pub use rules::{Backend, Rule, RuleSet, RuleSource, Target};
pub use server::FrontServer;
pub use shutdown::Shutdown;
pub use table::RuleTable;
