use crate::agent::AgentKind;
use crate::coverage::BranchTrace;
use crate::message::Message;
use crate::pool::{FleetLease, PoolError, ServerLease, ServerPool};
use crate::protocol::{Connection, ExecutionContext, ProtocolEngine, ProtocolError, ProtocolOutcome};
use crate::server::ServerProcess;
use crate::vector::TestVector;
use serde::Serialize;
use std::any::Any;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// How one execution ended, ordered by how interesting it is to triage.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", content = "detail", rename_all = "kebab-case")]
pub enum ExecutionStatus {
    Ok,
    /// The server diverged from the planned sequence.
    Rejected(String),
    Timeout,
    /// The server died or stopped answering.
    Crash(String),
    AgentError(String),
    Other(String),
}

impl ExecutionStatus {
    /// Ordering used to pick the aggregate status of a broadcast run.
    fn weight(&self) -> u8 {
        match self {
            ExecutionStatus::Ok => 0,
            ExecutionStatus::Rejected(_) => 1,
            ExecutionStatus::Other(_) => 2,
            ExecutionStatus::AgentError(_) => 3,
            ExecutionStatus::Timeout => 4,
            ExecutionStatus::Crash(_) => 5,
        }
    }

    /// Short stable name used in metadata and reports.
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionStatus::Ok => "ok",
            ExecutionStatus::Rejected(_) => "rejected",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Crash(_) => "crash",
            ExecutionStatus::AgentError(_) => "agent-error",
            ExecutionStatus::Other(_) => "other",
        }
    }

    /// Whether the server died or the agent reported a crash.
    pub fn is_crash(&self) -> bool {
        matches!(self, ExecutionStatus::Crash(_))
    }
}

/// What happened on one server instance.
#[derive(Debug, Clone)]
pub struct InstanceOutcome {
    pub server: usize,
    pub endpoint: SocketAddr,
    pub status: ExecutionStatus,
    pub trace: BranchTrace,
    pub elapsed: Duration,
}

/// Everything a run produced, handed to the rule chain.
///
/// `vector` is the exact submitted vector; `cleaned` is the genericized copy
/// that rules persist.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub id: String,
    pub started: SystemTime,
    pub finished: SystemTime,
    pub outcomes: Vec<InstanceOutcome>,
    pub status: ExecutionStatus,
    /// Union of all instance traces.
    pub trace: BranchTrace,
    /// The exact vector that was submitted.
    pub vector: Arc<TestVector>,
    /// Genericized copy, suitable for persistence and replay.
    pub cleaned: Option<TestVector>,
}

impl ExecutionResult {
    fn assemble(
        vector: &Arc<TestVector>,
        started: SystemTime,
        outcomes: Vec<InstanceOutcome>,
        engine: &dyn ProtocolEngine,
    ) -> Self {
        let mut trace = BranchTrace::new();
        for outcome in &outcomes {
            trace.union_with(&outcome.trace);
        }
        let status = outcomes
            .iter()
            .map(|o| &o.status)
            .max_by_key(|s| s.weight())
            .cloned()
            .unwrap_or_else(|| ExecutionStatus::Other("no instance executed".to_string()));
        let mut cleaned = (**vector).clone();
        cleaned.make_generic(engine);

        let nanos = started
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let id = format!("{:x}", md5::compute(format!("{}-{nanos}", vector.id())));
        Self {
            id,
            started,
            finished: SystemTime::now(),
            outcomes,
            status,
            trace,
            vector: vector.clone(),
            cleaned: Some(cleaned),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.outcomes.len() > 1
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    /// Hard deadline for one execution against one instance.
    pub timeout: Duration,
    pub agent: AgentKind,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            agent: AgentKind::default(),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic type".to_string()
    }
}

/// How playing the sequence went, before liveness is taken into account.
enum Played {
    Outcome(ProtocolOutcome),
    Failed(ProtocolError),
    Unreachable(ProtocolError),
    Panicked(String),
}

/// Plays one vector against one leased instance.
pub struct SingleServerExecutor {
    engine: Arc<dyn ProtocolEngine>,
    config: ExecutorConfig,
}

impl SingleServerExecutor {
    /// Creates an executor that plays vectors with `engine`.
    pub fn new(engine: Arc<dyn ProtocolEngine>, config: ExecutorConfig) -> Self {
        Self { engine, config }
    }

    pub fn engine(&self) -> &Arc<dyn ProtocolEngine> {
        &self.engine
    }

    /// Executes `vector` against the instance behind `lease`.
    ///
    /// # Arguments
    ///
    /// * `vector` - The submitted vector. Only a copy of its live genome is played.
    /// * `lease` - The instance to run on. It stays leased; the caller releases it.
    ///
    /// # Returns
    ///
    /// An `ExecutionResult`. Failures to prepare, connect or play are folded into
    /// its status; this never returns an error.
    pub fn run(&self, vector: &Arc<TestVector>, lease: &ServerLease) -> ExecutionResult {
        let started = SystemTime::now();
        let outcome = lease.with_server(|server| self.run_instance(vector, server));
        let result = ExecutionResult::assemble(vector, started, vec![outcome], self.engine.as_ref());
        tracing::debug!(
            "Vector {} on server {}: {}",
            vector.id(),
            lease.slot(),
            result.status.label()
        );
        result
    }

    fn play(&self, messages: &mut [Message], vector: &TestVector, endpoint: SocketAddr) -> Played {
        let context = ExecutionContext {
            client_credentials: &vector.live().client_credentials,
        };
        let played = catch_unwind(AssertUnwindSafe(|| {
            let mut connection = match Connection::tcp(endpoint, self.config.timeout) {
                Ok(connection) => connection,
                Err(e) => return Played::Unreachable(e),
            };
            match self.engine.execute(messages, &mut connection, &context) {
                Ok(outcome) => Played::Outcome(outcome),
                Err(e) => Played::Failed(e),
            }
        }));
        played.unwrap_or_else(|payload| Played::Panicked(panic_message(payload)))
    }

    pub(crate) fn run_instance(
        &self,
        vector: &TestVector,
        server: &mut dyn ServerProcess,
    ) -> InstanceOutcome {
        let started = Instant::now();
        let endpoint = server.endpoint();
        let mut outcome = InstanceOutcome {
            server: server.id(),
            endpoint,
            status: ExecutionStatus::Ok,
            trace: BranchTrace::new(),
            elapsed: Duration::ZERO,
        };

        if let Err(e) = server.prepare(&vector.live().server_credentials) {
            outcome.status = ExecutionStatus::Other(format!("Preparing server failed: {e}"));
            outcome.elapsed = started.elapsed();
            return outcome;
        }

        let mut agent = self.config.agent.build(server.trace_path());
        if let Err(e) = agent.pre_exec() {
            let error_msg = format!("Agent '{}' pre_exec failed: {}", agent.name(), e);
            tracing::error!("{}", error_msg);
            outcome.status = ExecutionStatus::AgentError(error_msg);
            outcome.elapsed = started.elapsed();
            return outcome;
        }

        let mut messages = vector.live().messages.clone();
        self.engine.reset_trace(&mut messages);
        let played = self.play(&mut messages, vector, endpoint);

        let mut status = if !server.is_alive() {
            ExecutionStatus::Crash(format!("server {} died during execution", server.id()))
        } else {
            match played {
                Played::Outcome(ProtocolOutcome::Completed) => ExecutionStatus::Ok,
                Played::Outcome(ProtocolOutcome::Rejected { at, reason }) => {
                    ExecutionStatus::Rejected(format!("at message {at}: {reason}"))
                }
                Played::Failed(ProtocolError::Timeout) => ExecutionStatus::Timeout,
                Played::Failed(ProtocolError::Closed) => {
                    ExecutionStatus::Rejected("connection closed".to_string())
                }
                Played::Failed(e) => ExecutionStatus::Other(e.to_string()),
                Played::Unreachable(ProtocolError::Timeout) => ExecutionStatus::Timeout,
                Played::Unreachable(e) => {
                    ExecutionStatus::Crash(format!("server {} unresponsive: {e}", server.id()))
                }
                Played::Panicked(msg) => ExecutionStatus::Other(format!("engine panicked: {msg}")),
            }
        };

        if let Err(e) = agent.post_exec(&status) {
            let error_msg = format!("Agent '{}' post_exec failed: {}", agent.name(), e);
            tracing::error!("{}", error_msg);
            if status == ExecutionStatus::Ok {
                status = ExecutionStatus::AgentError(error_msg);
            }
        }
        outcome.trace = agent.trace();
        outcome.status = status;
        outcome.elapsed = started.elapsed();
        outcome
    }
}

/// Plays one vector on every instance of the pool.
pub struct MultiServerExecutor {
    single: Arc<SingleServerExecutor>,
}

impl MultiServerExecutor {
    pub fn new(single: Arc<SingleServerExecutor>) -> Self {
        Self { single }
    }

    /// Runs sequentially on independent copies of the vector. A failing instance
    /// only affects its own outcome.
    pub fn run(&self, vector: &Arc<TestVector>, fleet: &FleetLease) -> ExecutionResult {
        let started = SystemTime::now();
        let mut outcomes = Vec::with_capacity(fleet.len());
        for lease in fleet.leases() {
            let copy = (**vector).clone();
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                lease.with_server(|server| self.single.run_instance(&copy, server))
            }));
            let outcome = outcome.unwrap_or_else(|payload| {
                let msg = panic_message(payload);
                tracing::warn!("Instance {} failed during broadcast: {}", lease.slot(), msg);
                InstanceOutcome {
                    server: lease.slot(),
                    endpoint: lease.endpoint(),
                    status: ExecutionStatus::Other(msg),
                    trace: BranchTrace::new(),
                    elapsed: Duration::ZERO,
                }
            });
            outcomes.push(outcome);
        }
        let result = ExecutionResult::assemble(vector, started, outcomes, self.single.engine().as_ref());
        tracing::debug!(
            "Vector {} broadcast to {} servers: {}",
            vector.id(),
            fleet.len(),
            result.status.label()
        );
        result
    }

    /// Takes the whole fleet, runs, and gives it back on every path.
    pub fn run_exclusive(
        &self,
        vector: &Arc<TestVector>,
        pool: &Arc<ServerPool>,
        timeout: Duration,
    ) -> Result<ExecutionResult, PoolError> {
        let fleet = pool.acquire_all(timeout)?;
        let result = self.run(vector, &fleet);
        if let Err(e) = fleet.release() {
            tracing::error!("Releasing fleet after broadcast: {}", e);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::{CertKeyPair, CertificateRole};
    use crate::message::MessageKind;
    use crate::modification::Genome;
    use crate::template::{KeyExchange, client_message};
    use crate::testing::{ScriptedServer, server_hello_record};
    use crate::vector::ExecutionMode;
    use crate::wire::TlsRecordEngine;
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    fn hello_vector() -> Arc<TestVector> {
        let messages = vec![
            client_message(MessageKind::ClientHello, KeyExchange::Rsa, 0x002f),
            Message::expect(MessageKind::ServerHello),
        ];
        let seed = Genome::new(
            messages,
            CertKeyPair::builtin(CertificateRole::Server),
            CertKeyPair::builtin(CertificateRole::Client),
        );
        Arc::new(TestVector::new(seed, ExecutionMode::Single))
    }

    fn executor(timeout: Duration) -> Arc<SingleServerExecutor> {
        Arc::new(SingleServerExecutor::new(
            Arc::new(TlsRecordEngine::new()),
            ExecutorConfig {
                timeout,
                agent: AgentKind::TraceFile,
            },
        ))
    }

    fn scripted_pool(servers: Vec<ScriptedServer>) -> Arc<ServerPool> {
        let boxed: Vec<Box<dyn ServerProcess>> = servers
            .into_iter()
            .map(|s| Box::new(s) as Box<dyn ServerProcess>)
            .collect();
        ServerPool::new(boxed).unwrap()
    }

    #[test]
    fn completed_run_collects_trace_and_cleaned_copy() {
        let dir = tempdir().unwrap();
        let server = ScriptedServer::new(0, Some(dir.path()));
        *server.script.response.lock().unwrap() = server_hello_record();
        *server.script.locations.lock().unwrap() = vec![11, 12];
        let pool = scripted_pool(vec![server]);

        let vector = hello_vector();
        let lease = pool.acquire(Duration::from_secs(1)).unwrap();
        let result = executor(Duration::from_secs(2)).run(&vector, &lease);
        assert_eq!(result.status, ExecutionStatus::Ok);
        assert_eq!(result.trace.iter().collect::<Vec<_>>(), vec![11, 12]);
        assert!(Arc::ptr_eq(&result.vector, &vector));
        let cleaned = result.cleaned.as_ref().unwrap();
        assert!(cleaned.live().messages.iter().all(|m| m.observed.is_none()));
        assert!(
            vector.live().messages[1].observed.is_none(),
            "the submitted vector must not be touched"
        );
    }

    #[test]
    fn rejection_and_timeout_are_distinct_outcomes() {
        let server = ScriptedServer::new(0, None);
        let script = server.script.clone();
        *script.response.lock().unwrap() = vec![21, 3, 3, 0, 2, 2, 40];
        let pool = scripted_pool(vec![server]);
        let exec = executor(Duration::from_millis(300));

        let lease = pool.acquire(Duration::from_secs(1)).unwrap();
        let rejected = exec.run(&hello_vector(), &lease);
        assert!(
            matches!(rejected.status, ExecutionStatus::Rejected(ref r) if r.contains("message 1")),
            "{:?}",
            rejected.status
        );

        script.hang.store(true, Ordering::SeqCst);
        let timed_out = exec.run(&hello_vector(), &lease);
        assert_eq!(timed_out.status, ExecutionStatus::Timeout);
    }

    #[test]
    fn dead_server_is_a_crash_and_gets_restarted() {
        let server = ScriptedServer::new(0, None);
        let script = server.script.clone();
        let restarts = server.restarts.clone();
        script.crash_next.store(true, Ordering::SeqCst);
        let pool = scripted_pool(vec![server]);

        let lease = pool.acquire(Duration::from_secs(1)).unwrap();
        let result = executor(Duration::from_secs(2)).run(&hello_vector(), &lease);
        assert!(result.status.is_crash(), "{:?}", result.status);
        lease.release().unwrap();
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn broadcast_survives_one_crashing_instance() {
        let dir = tempdir().unwrap();
        let servers: Vec<ScriptedServer> =
            (0..3).map(|i| ScriptedServer::new(i, Some(dir.path()))).collect();
        for (i, server) in servers.iter().enumerate() {
            *server.script.response.lock().unwrap() = server_hello_record();
            *server.script.locations.lock().unwrap() = vec![100 + i as u64];
        }
        servers[1].script.crash_next.store(true, Ordering::SeqCst);
        let restarts = servers[1].restarts.clone();
        let pool = scripted_pool(servers);

        let multi = MultiServerExecutor::new(executor(Duration::from_secs(2)));
        let result = multi
            .run_exclusive(&hello_vector(), &pool, Duration::from_secs(1))
            .unwrap();

        assert_eq!(result.outcomes.len(), 3);
        assert_eq!(result.outcomes[0].status, ExecutionStatus::Ok);
        assert!(result.outcomes[1].status.is_crash());
        assert_eq!(result.outcomes[2].status, ExecutionStatus::Ok);
        assert!(result.status.is_crash(), "crash dominates the aggregate");
        assert!(result.trace.contains(100) && result.trace.contains(102));

        let stats = pool.stats();
        assert_eq!(stats.busy, 0, "all instances must be released");
        assert!(!stats.exclusive);
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn aggregate_status_prefers_the_most_severe() {
        let statuses = [
            ExecutionStatus::Ok,
            ExecutionStatus::Timeout,
            ExecutionStatus::Rejected("x".into()),
        ];
        let worst = statuses.iter().max_by_key(|s| s.weight()).unwrap();
        assert_eq!(worst, &ExecutionStatus::Timeout);
        assert_eq!(ExecutionStatus::Crash("c".into()).label(), "crash");
    }
}
