//! Triage rules: keep every distinct vector that crashed or hung a server.

use crate::corpus::Corpus;
use crate::executor::{ExecutionResult, ExecutionStatus};
use crate::feedback::{FeedbackError, Rule, RuleContext};
use crate::vector::VectorId;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Default severity level for crashes detected by `CrashRule`.
/// Higher values indicate more severe findings.
pub const DEFAULT_CRASH_SEVERITY: u8 = 10;
pub const DEFAULT_TIMEOUT_SEVERITY: u8 = 5;

/// A finding worth keeping, derived from one execution result.
#[derive(Debug, Clone, PartialEq)]
pub struct BugReport {
    pub vector_id: VectorId,
    /// A human-readable description of the finding.
    pub description: String,
    /// MD5 of the vector id, used for deduplication.
    pub input_hash: String,
    pub severity: u8,
    pub status: ExecutionStatus,
}

impl BugReport {
    fn from_result(result: &ExecutionResult, severity: u8) -> Self {
        let description = match &result.status {
            ExecutionStatus::Crash(detail) => detail.clone(),
            ExecutionStatus::Timeout => {
                let hung: Vec<String> = result
                    .outcomes
                    .iter()
                    .filter(|o| o.status == ExecutionStatus::Timeout)
                    .map(|o| o.server.to_string())
                    .collect();
                format!("execution timed out on server(s) {}", hung.join(", "))
            }
            other => other.label().to_string(),
        };
        Self {
            vector_id: result.vector.id().clone(),
            description,
            input_hash: format!("{:x}", md5::compute(result.vector.id().as_str())),
            severity,
            status: result.status.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct TriageState {
    seen: HashSet<String>,
    hits: u64,
    last: Option<BugReport>,
}

/// Shared bookkeeping of the crash and timeout rules.
struct Triage {
    label: &'static str,
    severity: u8,
    store: Arc<dyn Corpus>,
    state: Mutex<TriageState>,
}

impl Triage {
    fn new(label: &'static str, severity: u8, store: Arc<dyn Corpus>) -> Self {
        Self {
            label,
            severity,
            store,
            state: Mutex::new(TriageState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TriageState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stores the vector if its hash is new. Findings are kept even while replaying.
    fn record(&self, result: &ExecutionResult) -> Result<(), FeedbackError> {
        let report = BugReport::from_result(result, self.severity);
        let fresh = {
            let mut state = self.lock();
            state.hits += 1;
            state.last = Some(report.clone());
            state.seen.insert(report.input_hash.clone())
        };
        if !fresh {
            tracing::debug!("Duplicate {} for vector {}", self.label, report.vector_id);
            return Ok(());
        }

        tracing::warn!(
            "New {} (severity {}) from vector {}: {}",
            self.label,
            report.severity,
            report.vector_id,
            report.description
        );
        let mut vector = (*result.vector).clone();
        vector
            .metadata
            .insert("description".to_string(), report.description.clone());
        vector
            .metadata
            .insert("severity".to_string(), report.severity.to_string());
        vector
            .metadata
            .insert("status".to_string(), report.status.label().to_string());
        self.store.add(vector)?;
        Ok(())
    }

    fn unique(&self) -> usize {
        self.lock().seen.len()
    }

    fn last(&self) -> Option<BugReport> {
        self.lock().last.clone()
    }

    fn report(&self) -> Option<String> {
        let state = self.lock();
        if state.hits == 0 {
            return None;
        }
        Some(format!(
            "{} hits, {} unique",
            state.hits,
            state.seen.len()
        ))
    }
}

/// Archives every crash-class result into its own store, once per vector.
pub struct CrashRule {
    triage: Triage,
}

impl CrashRule {
    pub fn new(store: Arc<dyn Corpus>) -> Self {
        Self {
            triage: Triage::new("crash", DEFAULT_CRASH_SEVERITY, store),
        }
    }

    /// Number of distinct vectors recorded.
    pub fn unique(&self) -> usize {
        self.triage.unique()
    }

    pub fn last_report(&self) -> Option<BugReport> {
        self.triage.last()
    }
}

impl Rule for CrashRule {
    fn name(&self) -> &'static str {
        "crash"
    }

    fn applies(&self, result: &ExecutionResult) -> bool {
        result.status.is_crash()
    }

    fn on_apply(&self, result: &ExecutionResult, _context: &RuleContext) -> Result<(), FeedbackError> {
        self.triage.record(result)
    }

    fn on_decline(&self, _result: &ExecutionResult) {}

    fn report(&self) -> Option<String> {
        self.triage.report()
    }
}

/// Archives every timed-out result into its own store, once per vector.
pub struct TimeoutRule {
    triage: Triage,
}

impl TimeoutRule {
    pub fn new(store: Arc<dyn Corpus>) -> Self {
        Self {
            triage: Triage::new("timeout", DEFAULT_TIMEOUT_SEVERITY, store),
        }
    }

    pub fn unique(&self) -> usize {
        self.triage.unique()
    }

    pub fn last_report(&self) -> Option<BugReport> {
        self.triage.last()
    }
}

impl Rule for TimeoutRule {
    fn name(&self) -> &'static str {
        "timeout"
    }

    fn applies(&self, result: &ExecutionResult) -> bool {
        result.status == ExecutionStatus::Timeout
    }

    fn on_apply(&self, result: &ExecutionResult, _context: &RuleContext) -> Result<(), FeedbackError> {
        self.triage.record(result)
    }

    fn on_decline(&self, _result: &ExecutionResult) {}

    fn report(&self) -> Option<String> {
        self.triage.report()
    }
}
