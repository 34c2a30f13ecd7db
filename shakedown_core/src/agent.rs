use crate::coverage::BranchTrace;
use crate::executor::ExecutionStatus;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Magic word at the start of 64-bit `.sancov` files.
const SANCOV_MAGIC_64: u64 = 0xC0BF_FFFF_FFFF_FF64;

/// An `Agent` collects coverage for one server instance around one execution.
///
/// The executor calls `pre_exec` before connecting to the server and
/// `post_exec` after the protocol run and the liveness check. The collected
/// locations are then available through `trace`.
pub trait Agent: Send {
    fn name(&self) -> &'static str;

    /// Prepares collection. Usually calls `reset`.
    fn pre_exec(&mut self) -> Result<(), anyhow::Error>;

    /// Collects what the server reported for the execution that just finished.
    fn post_exec(&mut self, status: &ExecutionStatus) -> Result<(), anyhow::Error>;

    fn reset(&mut self) -> Result<(), anyhow::Error>;

    /// Locations gathered by the last `post_exec`.
    fn trace(&self) -> BranchTrace;
}

/// Which agent the executor attaches to each server instance.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    NoOp,
    #[default]
    TraceFile,
}

impl AgentKind {
    /// Builds an agent for an instance whose coverage goes to `trace_path`.
    /// Instances without a trace file always get a [`NoOpAgent`].
    pub fn build(self, trace_path: Option<&Path>) -> Box<dyn Agent> {
        match (self, trace_path) {
            (AgentKind::TraceFile, Some(path)) => Box::new(TraceFileAgent::new(path.to_path_buf())),
            _ => Box::new(NoOpAgent),
        }
    }
}

/// Collects nothing.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoOpAgent;

impl Agent for NoOpAgent {
    fn name(&self) -> &'static str {
        "NoOpAgent"
    }

    fn pre_exec(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn post_exec(&mut self, _status: &ExecutionStatus) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn reset(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn trace(&self) -> BranchTrace {
        BranchTrace::new()
    }
}

/// Reads the locations an instrumented server dumps into a file.
///
/// The file is truncated before every run. Afterwards it may hold one location
/// per line (decimal or `0x`-prefixed hex) or raw little-endian `u64` words as
/// written by sanitizer coverage, with or without the `.sancov` magic header.
#[derive(Debug)]
pub struct TraceFileAgent {
    path: PathBuf,
    trace: BranchTrace,
}

impl TraceFileAgent {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            trace: BranchTrace::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse_text(text: &str) -> Option<BranchTrace> {
        let mut trace = BranchTrace::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let value = match line.strip_prefix("0x").or_else(|| line.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16).ok()?,
                None => line.parse::<u64>().ok()?,
            };
            trace.insert(value);
        }
        Some(trace)
    }

    fn parse_raw(bytes: &[u8]) -> BranchTrace {
        let mut words = bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .peekable();
        if words.peek() == Some(&SANCOV_MAGIC_64) {
            words.next();
        }
        words.collect()
    }

    pub fn parse(bytes: &[u8]) -> BranchTrace {
        std::str::from_utf8(bytes)
            .ok()
            .and_then(Self::parse_text)
            .unwrap_or_else(|| Self::parse_raw(bytes))
    }
}

impl Agent for TraceFileAgent {
    fn name(&self) -> &'static str {
        "TraceFileAgent"
    }

    fn pre_exec(&mut self) -> Result<(), anyhow::Error> {
        self.reset()?;
        fs::write(&self.path, b"")?;
        Ok(())
    }

    fn post_exec(&mut self, status: &ExecutionStatus) -> Result<(), anyhow::Error> {
        match fs::read(&self.path) {
            Ok(bytes) => self.trace = Self::parse(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No trace file at {:?} after {:?}", self.path, status);
                self.trace = BranchTrace::new();
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<(), anyhow::Error> {
        self.trace = BranchTrace::new();
        Ok(())
    }

    fn trace(&self) -> BranchTrace {
        self.trace.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn text_traces_accept_decimal_and_hex() {
        let trace = TraceFileAgent::parse(b"10\n0x1f\n\n  42  \n");
        assert_eq!(trace.iter().collect::<Vec<_>>(), vec![10, 31, 42]);
    }

    #[test]
    fn raw_traces_skip_sancov_magic() {
        let mut bytes = SANCOV_MAGIC_64.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x4010u64.to_le_bytes());
        bytes.extend_from_slice(&0x4020u64.to_le_bytes());
        bytes.extend_from_slice(&[1, 2, 3]);
        let trace = TraceFileAgent::parse(&bytes);
        assert_eq!(trace.iter().collect::<Vec<_>>(), vec![0x4010, 0x4020]);
    }

    #[test]
    fn trace_file_agent_truncates_then_collects() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace.log");
        fs::write(&path, "1\n2\n").unwrap();

        let mut agent = TraceFileAgent::new(path.clone());
        agent.pre_exec().unwrap();
        assert_eq!(fs::read(&path).unwrap().len(), 0, "pre_exec must truncate");

        fs::write(&path, "5\n0x6\n").unwrap();
        agent.post_exec(&ExecutionStatus::Ok).unwrap();
        assert_eq!(agent.trace().iter().collect::<Vec<_>>(), vec![5, 6]);

        agent.reset().unwrap();
        assert!(agent.trace().is_empty());
    }

    #[test]
    fn missing_trace_file_is_an_empty_trace() {
        let dir = tempdir().unwrap();
        let mut agent = TraceFileAgent::new(dir.path().join("never-written"));
        agent
            .post_exec(&ExecutionStatus::Crash("gone".into()))
            .unwrap();
        assert!(agent.trace().is_empty());
    }

    #[test]
    fn agent_kind_falls_back_to_noop_without_trace_path() {
        assert_eq!(AgentKind::TraceFile.build(None).name(), "NoOpAgent");
        assert_eq!(
            AgentKind::TraceFile.build(Some(Path::new("/tmp/x"))).name(),
            "TraceFileAgent"
        );
        assert_eq!(AgentKind::NoOp.build(Some(Path::new("/tmp/x"))).name(), "NoOpAgent");
    }
}
