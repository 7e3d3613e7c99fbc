//! Periodic rule file polling
//!
//! Polling keeps freshness simple: a shorter interval notices edits sooner
//! at the cost of one `stat` per tick. Nothing is parsed unless the file's
//! mtime moved past the one recorded in the installed rule set.

use crate::error::{Error, Result};
use crate::metrics;
use crate::rules::RuleSource;
use crate::table::RuleTable;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, trace, warn};

/// Result of one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Unchanged,
    Reloaded { rules: usize },
}

/// Background task that keeps the rule table in step with its source
#[derive(Debug)]
pub struct Reloader {
    source: RuleSource,
    table: Arc<RuleTable>,
    interval: Duration,
}

impl Reloader {
    pub fn new(source: RuleSource, table: Arc<RuleTable>, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::InvalidConfig("poll interval must be positive".to_string()));
        }
        Ok(Self {
            source,
            table,
            interval,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Check the source once and install new rules if it changed.
    ///
    /// On error the installed table is left as it was.
    pub fn tick(&self) -> Result<ReloadOutcome> {
        let current = self.table.snapshot();
        if !self.source.has_changed(&current)? {
            return Ok(ReloadOutcome::Unchanged);
        }

        let rules = RuleTable::load(&self.source)?;
        let count = rules.len();
        self.table.install(rules);
        metrics::record_reload(count);

        Ok(ReloadOutcome::Reloaded { rules: count })
    }

    /// Poll until `shutdown` fires
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the initial load already happened.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => {
                    info!("Rule reloader stopping");
                    return;
                }
            }

            let this = self.clone();
            match tokio::task::spawn_blocking(move || this.tick()).await {
                Ok(Ok(ReloadOutcome::Unchanged)) => {
                    trace!(path = %self.source.path().display(), "rules unchanged");
                }
                Ok(Ok(ReloadOutcome::Reloaded { rules })) => {
                    info!(path = %self.source.path().display(), rules, "Reloaded rules");
                }
                Ok(Err(e)) => {
                    warn!("Rule reload failed, keeping current rules: {}", e);
                }
                Err(e) => {
                    error!("Rule reload task failed: {}", e);
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) on the current runtime
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(Arc::new(self).run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Dispatcher, NoopHits};
    use crate::rules::Target;
    use std::fs::{File, FileTimes};
    use std::path::{Path, PathBuf};
    use std::time::SystemTime;
    use tempfile::TempDir;

    // Writes the file and pushes its mtime forward so coarse filesystem
    // timestamps still register as a change.
    fn write_rules(path: &Path, text: &str, age_offset: u64) {
        std::fs::write(path, text).unwrap();
        let mtime = SystemTime::now() + Duration::from_secs(age_offset);
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_times(FileTimes::new().set_modified(mtime))
            .unwrap();
    }

    fn setup(text: &str) -> (TempDir, PathBuf, Arc<RuleTable>, Reloader) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        write_rules(&path, text, 0);
        let source = RuleSource::new(&path);
        let table = Arc::new(RuleTable::open(&source).unwrap());
        let reloader = Reloader::new(source, table.clone(), Duration::from_millis(10)).unwrap();
        (dir, path, table, reloader)
    }

    #[test]
    fn test_zero_interval_rejected() {
        let table = Arc::new(RuleTable::new(Default::default()));
        let result = Reloader::new(RuleSource::new("rules.json"), table, Duration::ZERO);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_unchanged_source_is_idempotent() {
        let (_dir, _path, table, reloader) =
            setup(r#"[{"Host": "example.com", "Serve": "/var/www"}]"#);
        let before = table.snapshot();

        assert_eq!(reloader.tick().unwrap(), ReloadOutcome::Unchanged);
        assert_eq!(reloader.tick().unwrap(), ReloadOutcome::Unchanged);

        assert!(Arc::ptr_eq(&before, &table.snapshot()));
        assert_eq!(table.generation(), 1);
    }

    #[test]
    fn test_changed_source_installs() {
        let (_dir, path, table, reloader) =
            setup(r#"[{"Host": "example.com", "Serve": "/var/www"}]"#);

        write_rules(
            &path,
            r#"[{"Host": "example.org", "Forward": "localhost:8080"},
                {"Host": "example.net", "Serve": "/srv"}]"#,
            60,
        );

        assert_eq!(reloader.tick().unwrap(), ReloadOutcome::Reloaded { rules: 2 });
        assert_eq!(table.generation(), 2);
        assert_eq!(table.snapshot().rules()[0].host(), "example.org");

        assert_eq!(reloader.tick().unwrap(), ReloadOutcome::Unchanged);
        assert_eq!(table.generation(), 2);
    }

    #[test]
    fn test_parse_error_keeps_previous_rules() {
        let (_dir, path, table, reloader) =
            setup(r#"[{"Host": "example.com", "Serve": "/var/www"}]"#);
        let dispatcher = Dispatcher::new(table.clone(), Arc::new(NoopHits));

        write_rules(&path, r#"[{"Host": "example.com""#, 60);

        assert!(matches!(reloader.tick(), Err(Error::Parse { .. })));
        let rule = dispatcher.resolve("www.example.com").unwrap();
        assert_eq!(rule.target(), &Target::ServeFiles(PathBuf::from("/var/www")));
        assert_eq!(table.generation(), 1);
    }

    #[test]
    fn test_missing_source_keeps_previous_rules() {
        let (_dir, path, table, reloader) =
            setup(r#"[{"Host": "example.com", "Serve": "/var/www"}]"#);
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(reloader.tick(), Err(Error::SourceUnavailable { .. })));
        assert_eq!(table.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_run_picks_up_changes_and_stops() {
        let (_dir, path, table, reloader) =
            setup(r#"[{"Host": "example.com", "Serve": "/var/www"}]"#);
        let shutdown = crate::shutdown::Shutdown::new();
        let handle = reloader.spawn(shutdown.subscribe());

        write_rules(&path, r#"[{"Host": "example.org", "Serve": "/srv"}]"#, 60);

        let mut reloaded = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if table.snapshot().rules()[0].host() == "example.org" {
                reloaded = true;
                break;
            }
        }
        assert!(reloaded);

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
