//! N+1 load detection.
//!
//! Loading one owner's collection at a time inside a loop costs one round trip
//! per owner. [`N1Tracker`] counts single-owner collection loads per
//! `(entity type, field)` and warns once a pair reaches the threshold; the fix
//! is to load the owners together with `UnitOfWork::load_all` or
//! `UnitOfWork::populate`.

use serde::Serialize;
use std::collections::HashMap;

/// Where a single-owner load was requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadSite {
    pub entity: &'static str,
    pub field: &'static str,
    pub file: &'static str,
    pub line: u32,
}

/// Summary of recorded loads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct N1Stats {
    /// Single-owner loads recorded
    pub total_loads: usize,
    /// Distinct `(entity, field)` pairs loaded
    pub relations_loaded: usize,
    /// Pairs at or above the threshold
    pub potential_n1: usize,
}

/// Counts single-owner collection loads per relation.
#[derive(Debug, Clone)]
pub struct N1Tracker {
    counts: HashMap<(&'static str, &'static str), usize>,
    threshold: usize,
    enabled: bool,
    sites: Vec<LoadSite>,
}

impl Default for N1Tracker {
    fn default() -> Self {
        Self::new(3)
    }
}

impl N1Tracker {
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self {
            counts: HashMap::new(),
            threshold: threshold.max(1),
            enabled: true,
            sites: Vec::new(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Record one single-owner load. Returns true when this load crossed the
    /// threshold and a warning was emitted.
    #[track_caller]
    pub fn record_load(&mut self, entity: &'static str, field: &'static str) -> bool {
        if !self.enabled {
            return false;
        }
        let caller = std::panic::Location::caller();
        self.sites.push(LoadSite {
            entity,
            field,
            file: caller.file(),
            line: caller.line(),
        });
        let count = self.counts.entry((entity, field)).or_insert(0);
        *count += 1;
        if *count != self.threshold {
            return false;
        }

        tracing::warn!(
            target: "joinery::n1",
            entity = entity,
            field = field,
            loads = self.threshold,
            "N+1 load pattern detected; load owners together with UnitOfWork::populate or load_all"
        );
        for site in self
            .sites
            .iter()
            .filter(|s| s.entity == entity && s.field == field)
            .take(5)
        {
            tracing::debug!(target: "joinery::n1", file = site.file, line = site.line, "load site");
        }
        true
    }

    pub fn count_for(&self, entity: &str, field: &str) -> usize {
        self.counts
            .iter()
            .find(|((e, f), _)| *e == entity && *f == field)
            .map_or(0, |(_, c)| *c)
    }

    pub fn stats(&self) -> N1Stats {
        N1Stats {
            total_loads: self.counts.values().sum(),
            relations_loaded: self.counts.len(),
            potential_n1: self.counts.values().filter(|c| **c >= self.threshold).count(),
        }
    }

    pub fn sites(&self) -> &[LoadSite] {
        &self.sites
    }

    pub fn reset(&mut self) {
        self.counts.clear();
        self.sites.clear();
    }
}
