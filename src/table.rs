//! The shared rule table
//!
//! Readers take an `Arc` to the current [`RuleSet`] without locking; the
//! reloader publishes a replacement with a single pointer swap. A reader
//! therefore always sees one complete rule set, never a mix of two.

use crate::error::Result;
use crate::rules::{RuleSet, RuleSource};
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Concurrency-safe holder of the current rule set
#[derive(Debug)]
pub struct RuleTable {
    current: ArcSwap<RuleSet>,
    generation: AtomicU64,
}

impl RuleTable {
    /// Create a table with `initial` already installed
    pub fn new(initial: RuleSet) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            generation: AtomicU64::new(1),
        }
    }

    /// Load the first rule set from `source` and build a table from it.
    /// Failure here must stop startup.
    pub fn open(source: &RuleSource) -> Result<Self> {
        Ok(Self::new(Self::load(source)?))
    }

    /// Parse a candidate rule set. Does not touch any table.
    pub fn load(source: &RuleSource) -> Result<RuleSet> {
        source.load()
    }

    /// Atomically publish `rules` as the current set
    pub fn install(&self, rules: RuleSet) {
        self.current.store(Arc::new(rules));
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// The currently installed rule set
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    /// Number of installs so far, counting the initial one
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}
