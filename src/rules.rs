//! Rule definitions and the on-disk rule source
//!
//! The rule file is a JSON array of records, for example:
//!
//! ```text
//! [
//!     {"Host": "example.com", "Serve": "/var/www"},
//!     {"Host": "example.org", "Forward": "localhost:8080"}
//! ]
//! ```
//!
//! Record order is kept exactly as written: routing is first-match-wins.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use url::Url;

/// Where a matched request goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Serve static content rooted at the given directory
    ServeFiles(PathBuf),
    /// Reverse-proxy to a backend
    ForwardTo(Backend),
}

/// A parsed forwarding address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    /// `host:port` to connect to
    pub authority: String,
    /// Path prefix joined in front of the request path, without trailing slash
    pub path_prefix: String,
}

impl Backend {
    /// Parse `host:port`, bare `host`, or an `http://` URL with optional path prefix
    pub fn parse(address: &str) -> std::result::Result<Self, String> {
        let address = address.trim();
        if address.is_empty() {
            return Err("empty forward address".to_string());
        }

        let url_text = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };

        let url = Url::parse(&url_text).map_err(|e| format!("bad forward address {:?}: {}", address, e))?;
        if url.scheme() != "http" {
            return Err(format!("unsupported forward scheme {:?}", url.scheme()));
        }

        let host = url
            .host_str()
            .ok_or_else(|| format!("forward address {:?} has no host", address))?;
        let port = url.port().unwrap_or(80);

        Ok(Self {
            authority: format!("{}:{}", host, port),
            path_prefix: url.path().trim_end_matches('/').to_string(),
        })
    }
}

/// One routing entry. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    host: String,
    target: Target,
}

impl Rule {
    /// Build a rule; the host gets the same case and trailing-dot folding as request hosts
    pub fn new(host: &str, target: Target) -> std::result::Result<Self, String> {
        let host = host.trim();
        let host = host.strip_suffix('.').unwrap_or(host).to_ascii_lowercase();
        if host.is_empty() {
            return Err("empty Host".to_string());
        }
        if host.contains(|c: char| c == '/' || c == ':' || c.is_whitespace()) {
            return Err(format!("Host {:?} must be a bare hostname", host));
        }
        Ok(Self { host, target })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// True if `host` equals the rule host or is a subdomain of it
    pub fn matches(&self, host: &str) -> bool {
        match host.strip_suffix(self.host.as_str()) {
            Some("") => true,
            Some(rest) => rest.ends_with('.'),
            None => false,
        }
    }
}

/// An ordered, immutable rule list plus the source mtime it was loaded at
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Arc<Rule>>,
    modified: Option<SystemTime>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>, modified: Option<SystemTime>) -> Self {
        Self {
            rules: rules.into_iter().map(Arc::new).collect(),
            modified,
        }
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn modified(&self) -> Option<SystemTime> {
        self.modified
    }

    /// First rule in source order matching an already-normalized host
    pub fn find(&self, host: &str) -> Option<&Arc<Rule>> {
        self.rules.iter().find(|rule| rule.matches(host))
    }

    /// Whether a source with the given mtime should replace this set
    pub fn is_older_than(&self, modified: SystemTime) -> bool {
        match self.modified {
            Some(loaded) => modified > loaded,
            None => true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RuleRecord {
    #[serde(rename = "Host", default)]
    host: String,
    #[serde(rename = "Serve", default)]
    serve: Option<String>,
    #[serde(rename = "Forward", default)]
    forward: Option<String>,
}

impl RuleRecord {
    fn into_rule(self) -> std::result::Result<Rule, String> {
        let serve = self.serve.filter(|s| !s.is_empty());
        let forward = self.forward.filter(|s| !s.is_empty());

        let target = match (serve, forward) {
            (Some(root), None) => Target::ServeFiles(PathBuf::from(root)),
            (None, Some(address)) => Target::ForwardTo(Backend::parse(&address)?),
            (Some(_), Some(_)) => return Err("both Serve and Forward set".to_string()),
            (None, None) => return Err("one of Serve or Forward is required".to_string()),
        };

        Rule::new(&self.host, target)
    }
}

/// Parse rule records from JSON text, preserving order
pub fn parse_rules(text: &str) -> std::result::Result<Vec<Rule>, String> {
    let records: Vec<RuleRecord> = serde_json::from_str(text).map_err(|e| e.to_string())?;

    records
        .into_iter()
        .enumerate()
        .map(|(i, record)| record.into_rule().map_err(|e| format!("bad rule #{}: {}", i, e)))
        .collect()
}

/// A rule file on disk
#[derive(Debug, Clone)]
pub struct RuleSource {
    path: PathBuf,
}

impl RuleSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Modification time of the rule file
    pub fn modified(&self) -> Result<SystemTime> {
        std::fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .map_err(|source| self.unavailable(source))
    }

    /// Whether the file changed since `current` was loaded
    pub fn has_changed(&self, current: &RuleSet) -> Result<bool> {
        Ok(current.is_older_than(self.modified()?))
    }

    /// Stat and parse the file into a candidate rule set.
    ///
    /// The mtime is taken before reading, so an edit racing the read is
    /// picked up again on the next check.
    pub fn load(&self) -> Result<RuleSet> {
        let modified = self.modified()?;
        let text = std::fs::read_to_string(&self.path).map_err(|source| self.unavailable(source))?;
        let rules = parse_rules(&text).map_err(|reason| Error::Parse {
            path: self.path.clone(),
            reason,
        })?;
        Ok(RuleSet::new(rules, Some(modified)))
    }

    fn unavailable(&self, source: std::io::Error) -> Error {
        Error::SourceUnavailable {
            path: self.path.clone(),
            source,
        }
    }
}

/// Normalize a raw `Host` value for matching.
///
/// Strips a `:port` suffix (bracketed IPv6 literals keep their address),
/// lower-cases ASCII, and drops one trailing dot.
pub fn normalize_host(raw: &str) -> String {
    let raw = raw.trim();
    let host = if let Some(rest) = raw.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else {
        raw.split(':').next().unwrap_or(raw)
    };
    let host = host.strip_suffix('.').unwrap_or(host);
    host.to_ascii_lowercase()
}
