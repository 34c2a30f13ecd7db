//! Point-in-time view of a fuzzing campaign.

use crate::corpus::Corpus;
use crate::coverage::CoverageMap;
use crate::feedback::{ModificationStats, RuleChain};
use crate::pool::{PoolStats, ServerPool};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct KindReport {
    pub applied: u64,
    pub archived: u64,
    pub score: u64,
    pub archive_rate: f64,
}

/// Snapshot of a campaign, serialized as the JSON report.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Report {
    pub elapsed_secs: f64,
    pub running: bool,
    /// Vectors handed to a worker.
    pub runs: u64,
    /// Runs whose result went through the rule chain.
    pub settled: u64,
    /// Dispatch attempts that found the pool exhausted and waited.
    pub backoffs: u64,
    pub executions_per_sec: f64,
    pub replay_pending: usize,
    pub coverage: usize,
    pub corpora: BTreeMap<String, usize>,
    pub modifications: BTreeMap<String, KindReport>,
    pub pool: PoolStats,
    pub rules: BTreeMap<String, String>,
    pub fatal: Option<String>,
}

impl Report {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Writes the report as pretty-printed JSON to `path`.
    pub fn write_to(&self, path: &Path) -> Result<(), anyhow::Error> {
        let json = self
            .to_json()
            .map_err(|e| anyhow::anyhow!("Failed to serialize report: {}", e))?;
        fs::write(path, json)
            .map_err(|e| anyhow::anyhow!("Failed to write report to {:?}: {}", path, e))?;
        Ok(())
    }

    /// One line for periodic logging.
    pub fn summary(&self) -> String {
        let corpora: Vec<String> = self
            .corpora
            .iter()
            .map(|(name, size)| format!("{name} {size}"))
            .collect();
        format!(
            "runs {} (settled {}), {:.1} exec/s, coverage {}, {}, pool {}/{} busy, {} restarts",
            self.runs,
            self.settled,
            self.executions_per_sec,
            self.coverage,
            corpora.join(", "),
            self.pool.busy,
            self.pool.capacity,
            self.pool.restarts
        )
    }
}

/// Scheduler-side counters at the moment a report is taken.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    pub elapsed: Duration,
    pub running: bool,
    pub runs: u64,
    pub settled: u64,
    pub backoffs: u64,
    pub replay_pending: usize,
    pub fatal: Option<String>,
}

/// Everything a report is read from.
pub struct ReportSources {
    pub stats: Arc<ModificationStats>,
    pub coverage: Arc<CoverageMap>,
    pub corpora: Vec<(String, Arc<dyn Corpus>)>,
    pub rules: Arc<RuleChain>,
    pub pool: Arc<ServerPool>,
}

impl ReportSources {
    pub fn collect(&self, progress: Progress) -> Report {
        let elapsed_secs = progress.elapsed.as_secs_f64();
        let executions_per_sec = if elapsed_secs > 0.0 {
            progress.settled as f64 / elapsed_secs
        } else {
            0.0
        };
        let modifications = self
            .stats
            .snapshot()
            .into_iter()
            .map(|(kind, stats)| {
                (
                    kind.to_string(),
                    KindReport {
                        applied: stats.applied,
                        archived: stats.archived,
                        score: stats.score,
                        archive_rate: stats.archive_rate(),
                    },
                )
            })
            .collect();
        Report {
            elapsed_secs,
            running: progress.running,
            runs: progress.runs,
            settled: progress.settled,
            backoffs: progress.backoffs,
            executions_per_sec,
            replay_pending: progress.replay_pending,
            coverage: self.coverage.len(),
            corpora: self
                .corpora
                .iter()
                .map(|(name, corpus)| (name.clone(), corpus.len()))
                .collect(),
            modifications,
            pool: self.pool.stats(),
            rules: self.rules.reports(),
            fatal: progress.fatal,
        }
    }
}
