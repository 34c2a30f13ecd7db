use crate::corpus::{Corpus, CorpusError};
use crate::coverage::{CoverageError, CoverageMap};
use crate::executor::ExecutionResult;
use crate::modification::ModificationKind;
use crate::vector::TestVector;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Errors a rule can hit while handling a result.
#[derive(Error, Debug)]
pub enum FeedbackError {
    #[error("Corpus operation failed within feedback: {0}")]
    Corpus(#[from] CorpusError),
    #[error("Coverage operation failed within feedback: {0}")]
    Coverage(#[from] CoverageError),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Per-run information the rules need besides the result.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext {
    /// Whether accepted vectors may be written to a corpus. Off while replaying.
    pub persist: bool,
}

impl Default for RuleContext {
    fn default() -> Self {
        Self { persist: true }
    }
}

/// One stage of the archival chain.
///
/// Results arrive from many workers at once, so every method takes `&self`
/// and implementations keep their state behind locks or atomics.
pub trait Rule: Send + Sync {
    fn name(&self) -> &'static str;
    fn applies(&self, result: &ExecutionResult) -> bool;
    fn on_apply(&self, result: &ExecutionResult, context: &RuleContext)
    -> Result<(), FeedbackError>;
    fn on_decline(&self, result: &ExecutionResult);
    /// A one-line summary, or `None` before the rule has seen anything.
    fn report(&self) -> Option<String>;
}

/// Runs every rule, in order, on every result.
#[derive(Default)]
pub struct RuleChain {
    rules: Vec<Arc<dyn Rule>>,
}

impl RuleChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `rule` to the end of the chain.
    pub fn with_rule(mut self, rule: Arc<dyn Rule>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Returns the names of the rules that applied. Rule failures are logged
    /// and never stop the rest of the chain.
    pub fn apply(&self, result: &ExecutionResult, context: &RuleContext) -> Vec<&'static str> {
        let mut applied = Vec::new();
        for rule in &self.rules {
            if rule.applies(result) {
                if let Err(e) = rule.on_apply(result, context) {
                    tracing::warn!("Rule '{}' failed on {}: {}", rule.name(), result.id, e);
                }
                applied.push(rule.name());
            } else {
                rule.on_decline(result);
            }
        }
        applied
    }

    /// Summaries of every rule that has one, keyed by rule name.
    pub fn reports(&self) -> BTreeMap<String, String> {
        self.rules
            .iter()
            .filter_map(|rule| rule.report().map(|r| (rule.name().to_string(), r)))
            .collect()
    }
}

/// Counters kept for one modification kind.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindStats {
    /// Occurrences in executed vectors.
    pub applied: u64,
    /// Occurrences in archived vectors.
    pub archived: u64,
    /// New locations found by vectors containing this kind.
    pub score: u64,
}

impl KindStats {
    /// Fraction of applications that ended up archived. Zero before any.
    pub fn archive_rate(&self) -> f64 {
        if self.applied == 0 {
            0.0
        } else {
            self.archived as f64 / self.applied as f64
        }
    }

    /// Smoothed archive rate, never below `floor`.
    pub fn weight(&self, floor: f64) -> f64 {
        let rate = (self.archived as f64 + 1.0) / (self.applied as f64 + 2.0);
        rate.max(floor)
    }
}

/// Archive statistics per modification kind, shared with the mutator.
#[derive(Debug, Default)]
pub struct ModificationStats {
    kinds: Mutex<BTreeMap<ModificationKind, KindStats>>,
}

impl ModificationStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts every occurrence in `kinds`; `new_locations` is credited once per distinct kind.
    pub fn record(
        &self,
        kinds: impl IntoIterator<Item = ModificationKind>,
        archived: bool,
        new_locations: usize,
    ) {
        let mut stats = lock(&self.kinds);
        let mut credited = Vec::new();
        for kind in kinds {
            let entry = stats.entry(kind).or_default();
            entry.applied += 1;
            if archived {
                entry.archived += 1;
                if !credited.contains(&kind) {
                    entry.score += new_locations as u64;
                    credited.push(kind);
                }
            }
        }
    }

    pub fn get(&self, kind: ModificationKind) -> KindStats {
        lock(&self.kinds).get(&kind).copied().unwrap_or_default()
    }

    /// Counters for every kind, including kinds never applied.
    pub fn snapshot(&self) -> BTreeMap<ModificationKind, KindStats> {
        let stats = lock(&self.kinds);
        ModificationKind::ALL
            .iter()
            .map(|kind| (*kind, stats.get(kind).copied().unwrap_or_default()))
            .collect()
    }

    /// Selection weight of every kind, in [`ModificationKind::ALL`] order.
    pub fn weights(&self, floor: f64) -> Vec<(ModificationKind, f64)> {
        let stats = lock(&self.kinds);
        ModificationKind::ALL
            .iter()
            .map(|kind| {
                let weight = stats.get(kind).copied().unwrap_or_default().weight(floor);
                (*kind, weight)
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct CoverageCounters {
    executed: u64,
    archived: u64,
    declined: u64,
    persisted: u64,
}

/// Archives a vector if and only if it reached a location never seen before.
pub struct CoverageRule {
    coverage: Arc<CoverageMap>,
    stats: Arc<ModificationStats>,
    archive: Arc<dyn Corpus>,
    counters: Mutex<CoverageCounters>,
}

impl CoverageRule {
    pub fn new(
        coverage: Arc<CoverageMap>,
        stats: Arc<ModificationStats>,
        archive: Arc<dyn Corpus>,
    ) -> Self {
        Self {
            coverage,
            stats,
            archive,
            counters: Mutex::new(CoverageCounters::default()),
        }
    }

    pub fn coverage(&self) -> &Arc<CoverageMap> {
        &self.coverage
    }

    pub fn stats(&self) -> &Arc<ModificationStats> {
        &self.stats
    }

    pub fn executed(&self) -> u64 {
        lock(&self.counters).executed
    }

    pub fn archived(&self) -> u64 {
        lock(&self.counters).archived
    }

    /// Writes the coverage artifact into `dir`.
    pub fn save_coverage(&self, dir: &Path) -> Result<(), FeedbackError> {
        self.coverage.save(dir)?;
        Ok(())
    }

    fn persistable(result: &ExecutionResult, new_locations: usize) -> TestVector {
        let mut vector = result
            .cleaned
            .clone()
            .unwrap_or_else(|| (*result.vector).clone());
        vector
            .metadata
            .insert("new-locations".to_string(), new_locations.to_string());
        vector
            .metadata
            .insert("status".to_string(), result.status.label().to_string());
        vector
    }
}

impl Rule for CoverageRule {
    fn name(&self) -> &'static str {
        "coverage"
    }

    fn applies(&self, result: &ExecutionResult) -> bool {
        self.coverage.has_novel(&result.trace)
    }

    fn on_apply(
        &self,
        result: &ExecutionResult,
        context: &RuleContext,
    ) -> Result<(), FeedbackError> {
        // Another worker may have merged the same locations since `applies`.
        let new_locations = self.coverage.merge(&result.trace);
        let archived = new_locations > 0;
        self.stats
            .record(result.vector.modification_kinds(), archived, new_locations);
        {
            let mut counters = lock(&self.counters);
            counters.executed += 1;
            if archived {
                counters.archived += 1;
            } else {
                counters.declined += 1;
            }
        }
        if !archived || !context.persist {
            return Ok(());
        }

        tracing::info!(
            "Vector {} reached {} new locations ({} total)",
            result.vector.id(),
            new_locations,
            self.coverage.len()
        );
        let added = self.archive.add(Self::persistable(result, new_locations))?;
        if added {
            lock(&self.counters).persisted += 1;
        }
        Ok(())
    }

    fn on_decline(&self, result: &ExecutionResult) {
        self.stats.record(result.vector.modification_kinds(), false, 0);
        let mut counters = lock(&self.counters);
        counters.executed += 1;
        counters.declined += 1;
    }

    fn report(&self) -> Option<String> {
        let counters = lock(&self.counters);
        if counters.executed == 0 {
            return None;
        }
        Some(format!(
            "executed {}, archived {} ({} persisted), declined {}, {} locations",
            counters.executed,
            counters.archived,
            counters.persisted,
            counters.declined,
            self.coverage.len()
        ))
    }
}
