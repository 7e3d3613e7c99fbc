//! Certificate issuance allow-list derived from the rule table

use crate::error::{Error, Result};
use crate::table::RuleTable;
use std::sync::Arc;

/// Decides which host names may receive a certificate.
///
/// Stricter than routing: only a rule's exact host or its `www.` form is
/// allowed, never arbitrary subdomains.
#[derive(Debug, Clone)]
pub struct HostPolicy {
    table: Arc<RuleTable>,
}

impl HostPolicy {
    pub fn new(table: Arc<RuleTable>) -> Self {
        Self { table }
    }

    pub fn is_allowed(&self, hostname: &str) -> bool {
        let host = hostname.trim();
        let host = host.strip_suffix('.').unwrap_or(host).to_ascii_lowercase();
        let bare = host.strip_prefix("www.");

        self.table
            .snapshot()
            .rules()
            .iter()
            .any(|rule| rule.host() == host || Some(rule.host()) == bare)
    }

    /// Like [`is_allowed`](Self::is_allowed) but yields the declined host as an error
    pub fn check(&self, hostname: &str) -> Result<()> {
        if self.is_allowed(hostname) {
            Ok(())
        } else {
            Err(Error::PolicyDenied(hostname.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Rule, RuleSet, Target};
    use std::path::PathBuf;

    fn policy(hosts: &[&str]) -> (HostPolicy, Arc<RuleTable>) {
        let rules = hosts
            .iter()
            .map(|h| Rule::new(h, Target::ServeFiles(PathBuf::from("/srv"))).unwrap())
            .collect();
        let table = Arc::new(RuleTable::new(RuleSet::new(rules, None)));
        (HostPolicy::new(table.clone()), table)
    }

    #[test]
    fn test_exact_and_www_allowed() {
        let (p, _) = policy(&["example.com"]);
        assert!(p.is_allowed("example.com"));
        assert!(p.is_allowed("www.example.com"));
        assert!(p.is_allowed("WWW.Example.com"));
    }

    #[test]
    fn test_other_subdomains_denied() {
        let (p, _) = policy(&["example.com"]);
        assert!(!p.is_allowed("sub.example.com"));
        assert!(!p.is_allowed("www.www.example.com"));
        assert!(!p.is_allowed("notexample.com"));
        assert!(!p.is_allowed("com"));
    }

    #[test]
    fn test_rule_for_www_host_does_not_allow_bare() {
        let (p, _) = policy(&["www.example.net"]);
        assert!(p.is_allowed("www.example.net"));
        assert!(!p.is_allowed("example.net"));
    }

    #[test]
    fn test_check_carries_host() {
        let (p, _) = policy(&["example.com"]);
        assert!(p.check("www.example.com").is_ok());
        match p.check("evil.org") {
            Err(Error::PolicyDenied(host)) => assert_eq!(host, "evil.org"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_follows_installs() {
        let (p, table) = policy(&["example.com"]);
        table.install(RuleSet::new(
            vec![Rule::new("example.org", Target::ServeFiles(PathBuf::from("/srv"))).unwrap()],
            None,
        ));
        assert!(!p.is_allowed("example.com"));
        assert!(p.is_allowed("www.example.org"));
    }
}
