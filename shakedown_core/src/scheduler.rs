//! Drives the campaign: one dispatch thread mutates and leases, a fixed set of
//! workers executes and feeds the rule chain.

use crate::executor::{MultiServerExecutor, SingleServerExecutor};
use crate::feedback::{RuleChain, RuleContext};
use crate::mutator::{Mutator, MutatorError};
use crate::pool::{FleetLease, PoolError, ServerLease, ServerPool};
use crate::report::{Progress, Report, ReportSources};
use crate::vector::{ExecutionMode, TestVector};
use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors that can occur during scheduler operations.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Server pool failed: {0}")]
    PoolFatal(String),
    #[error("Failed to spawn scheduler thread: {0}")]
    Spawn(String),
}

/// Thread counts, waits and budget of a scheduler.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub workers: usize,
    /// How long one acquire may wait for a free instance.
    pub acquire_timeout: Duration,
    /// Pause after the pool was exhausted.
    pub exhausted_backoff: Duration,
    /// Sleep between checks while stopped.
    pub idle_poll: Duration,
    /// Dispatch ends after this many runs.
    pub max_runs: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            acquire_timeout: Duration::from_secs(1),
            exhausted_backoff: Duration::from_millis(50),
            idle_poll: Duration::from_millis(100),
            max_runs: None,
        }
    }
}

enum Lease {
    Single(ServerLease),
    Fleet(FleetLease),
}

impl Lease {
    fn release(self) -> Result<(), PoolError> {
        match self {
            Lease::Single(lease) => lease.release(),
            Lease::Fleet(fleet) => fleet.release(),
        }
    }
}

struct Job {
    vector: Arc<TestVector>,
    lease: Lease,
    persist: bool,
}

#[derive(Default)]
struct Shared {
    running: AtomicBool,
    shutdown: AtomicBool,
    dispatching: AtomicBool,
    runs: AtomicU64,
    settled: AtomicU64,
    backoffs: AtomicU64,
    replay_pending: AtomicUsize,
    fatal: Mutex<Option<String>>,
}

impl Shared {
    fn record_fatal(&self, reason: String) {
        let mut fatal = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
        if fatal.is_none() {
            tracing::error!("Stopping dispatch: {}", reason);
            *fatal = Some(reason);
        }
        self.running.store(false, Ordering::SeqCst);
    }

    fn fatal(&self) -> Option<String> {
        self.fatal.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Builder for a running campaign. `spawn` turns it into a `SchedulerHandle`.
pub struct ExecutionScheduler {
    config: SchedulerConfig,
    pool: Arc<ServerPool>,
    mutator: Box<dyn Mutator>,
    single: Arc<SingleServerExecutor>,
    multi: Arc<MultiServerExecutor>,
    rules: Arc<RuleChain>,
    sources: Arc<ReportSources>,
    backlog: VecDeque<TestVector>,
}

impl ExecutionScheduler {
    pub fn new(
        config: SchedulerConfig,
        mutator: Box<dyn Mutator>,
        executor: Arc<SingleServerExecutor>,
        sources: ReportSources,
    ) -> Self {
        Self {
            config,
            pool: sources.pool.clone(),
            mutator,
            multi: Arc::new(MultiServerExecutor::new(executor.clone())),
            single: executor,
            rules: sources.rules.clone(),
            sources: Arc::new(sources),
            backlog: VecDeque::new(),
        }
    }

    /// Vectors to execute, without persisting, before mutation starts.
    pub fn with_backlog(mut self, vectors: impl IntoIterator<Item = TestVector>) -> Self {
        self.backlog.extend(vectors);
        self
    }

    /// Starts the dispatch and worker threads in the stopped state.
    pub fn spawn(self) -> Result<SchedulerHandle, SchedulerError> {
        let shared = Arc::new(Shared::default());
        shared
            .replay_pending
            .store(self.backlog.len(), Ordering::SeqCst);
        shared.dispatching.store(true, Ordering::SeqCst);

        let workers = self.config.workers.max(1);
        let (tx, rx) = channel::bounded::<Job>(workers * 5);

        let mut worker_handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let worker = Worker {
                rx: rx.clone(),
                shared: shared.clone(),
                single: self.single.clone(),
                multi: self.multi.clone(),
                rules: self.rules.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("shakedown-worker-{index}"))
                .spawn(move || worker.run())
                .map_err(|e| SchedulerError::Spawn(e.to_string()))?;
            worker_handles.push(handle);
        }
        drop(rx);

        let sources = self.sources.clone();
        let dispatch = Dispatch {
            config: self.config,
            pool: self.pool,
            mutator: self.mutator,
            single: self.single,
            backlog: self.backlog,
            shared: shared.clone(),
            tx,
        };
        let dispatcher = thread::Builder::new()
            .name("shakedown-dispatch".to_string())
            .spawn(move || dispatch.run())
            .map_err(|e| SchedulerError::Spawn(e.to_string()))?;

        Ok(SchedulerHandle {
            shared,
            sources,
            started: Instant::now(),
            dispatcher: Some(dispatcher),
            workers: worker_handles,
        })
    }
}

struct Dispatch {
    config: SchedulerConfig,
    pool: Arc<ServerPool>,
    mutator: Box<dyn Mutator>,
    single: Arc<SingleServerExecutor>,
    backlog: VecDeque<TestVector>,
    shared: Arc<Shared>,
    tx: Sender<Job>,
}

impl Dispatch {
    fn run(mut self) {
        if !self.backlog.is_empty() {
            tracing::info!("Replaying {} backlog vectors", self.backlog.len());
        }
        let mut pending: Option<(Arc<TestVector>, bool)> = None;
        loop {
            if self.shared.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if !self.shared.running.load(Ordering::SeqCst) {
                thread::sleep(self.config.idle_poll);
                continue;
            }
            if let Some(max) = self.config.max_runs {
                if self.shared.runs.load(Ordering::SeqCst) >= max {
                    tracing::info!("Run budget of {} reached", max);
                    self.shared.running.store(false, Ordering::SeqCst);
                    break;
                }
            }

            let (vector, persist) = match pending.take() {
                Some(job) => job,
                None => match self.next_vector() {
                    Ok(job) => job,
                    Err(MutatorError::NoApplicableKind(parent)) => {
                        tracing::warn!("No modification fits parent {}, drawing again", parent);
                        continue;
                    }
                    Err(e) => {
                        self.shared.record_fatal(e.to_string());
                        break;
                    }
                },
            };

            let lease = match vector.mode() {
                ExecutionMode::Single => self
                    .pool
                    .acquire(self.config.acquire_timeout)
                    .map(Lease::Single),
                ExecutionMode::Broadcast => self
                    .pool
                    .acquire_all(self.config.acquire_timeout)
                    .map(Lease::Fleet),
            };
            let lease = match lease {
                Ok(lease) => lease,
                Err(PoolError::Exhausted(waited)) => {
                    tracing::debug!("Pool exhausted after {:?}, backing off", waited);
                    self.shared.backoffs.fetch_add(1, Ordering::SeqCst);
                    pending = Some((vector, persist));
                    thread::sleep(self.config.exhausted_backoff);
                    continue;
                }
                Err(PoolError::Fatal(reason)) => {
                    self.shared
                        .record_fatal(SchedulerError::PoolFatal(reason).to_string());
                    break;
                }
                Err(e) => {
                    self.shared
                        .record_fatal(SchedulerError::PoolFatal(e.to_string()).to_string());
                    break;
                }
            };

            if !self.send(Job {
                vector,
                lease,
                persist,
            }) {
                break;
            }
            self.shared.runs.fetch_add(1, Ordering::SeqCst);
        }
        self.shared.dispatching.store(false, Ordering::SeqCst);
    }

    /// Replay backlog first, then mutation.
    fn next_vector(&mut self) -> Result<(Arc<TestVector>, bool), MutatorError> {
        if let Some(mut vector) = self.backlog.pop_front() {
            vector.reset();
            vector.make_generic(self.single.engine().as_ref());
            let left = self.backlog.len();
            self.shared.replay_pending.store(left, Ordering::SeqCst);
            if left == 0 {
                tracing::info!("Replay finished, switching to mutation");
            }
            return Ok((Arc::new(vector), false));
        }
        Ok((Arc::new(self.mutator.next()?), true))
    }

    /// Blocks on the bounded channel but keeps watching for shutdown.
    fn send(&self, mut job: Job) -> bool {
        loop {
            match self.tx.send_timeout(job, self.config.idle_poll) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => {
                    if self.shared.shutdown.load(Ordering::SeqCst) {
                        return false;
                    }
                    job = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}

struct Worker {
    rx: Receiver<Job>,
    shared: Arc<Shared>,
    single: Arc<SingleServerExecutor>,
    multi: Arc<MultiServerExecutor>,
    rules: Arc<RuleChain>,
}

impl Worker {
    fn run(self) {
        while let Ok(job) = self.rx.recv() {
            if self.shared.shutdown.load(Ordering::SeqCst) {
                // Dropping the job hands its lease back.
                continue;
            }
            let result = match &job.lease {
                Lease::Single(lease) => self.single.run(&job.vector, lease),
                Lease::Fleet(fleet) => self.multi.run(&job.vector, fleet),
            };
            self.rules.apply(
                &result,
                &RuleContext {
                    persist: job.persist,
                },
            );
            if let Err(e) = job.lease.release() {
                tracing::error!("Returning lease after {}: {}", result.id, e);
                if let PoolError::Fatal(reason) = e {
                    self.shared
                        .record_fatal(SchedulerError::PoolFatal(reason).to_string());
                }
            }
            self.shared.settled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Control surface of a spawned scheduler.
pub struct SchedulerHandle {
    shared: Arc<Shared>,
    sources: Arc<ReportSources>,
    started: Instant,
    dispatcher: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Resumes dispatch. Ignored once a fatal error was recorded.
    pub fn start(&self) {
        if self.shared.fatal().is_some() {
            tracing::warn!("Scheduler cannot start after a fatal error");
            return;
        }
        self.shared.running.store(true, Ordering::SeqCst);
    }

    /// Pauses dispatch; jobs already queued still run.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> u64 {
        self.shared.runs.load(Ordering::SeqCst)
    }

    pub fn settled(&self) -> u64 {
        self.shared.settled.load(Ordering::SeqCst)
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.shared.fatal()
    }

    /// Dispatch has ended (run budget, fatal error or shutdown) and every run settled.
    pub fn is_finished(&self) -> bool {
        !self.shared.dispatching.load(Ordering::SeqCst) && self.settled() >= self.runs()
    }

    /// Collects a report from the live counters and sources.
    pub fn report(&self) -> Report {
        self.sources.collect(Progress {
            elapsed: self.started.elapsed(),
            running: self.is_running(),
            runs: self.runs(),
            settled: self.settled(),
            backoffs: self.shared.backoffs.load(Ordering::SeqCst),
            replay_pending: self.shared.replay_pending.load(Ordering::SeqCst),
            fatal: self.fatal_error(),
        })
    }

    fn join(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.join().is_err() {
                tracing::error!("Dispatch thread panicked");
            }
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("Worker thread panicked");
            }
        }
    }

    /// Hard stop: nothing new is dispatched, queued jobs are dropped and all
    /// threads are joined. Returns the final report.
    pub fn shutdown(mut self) -> Report {
        self.join();
        self.report()
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentKind;
    use crate::certificate::{CertKeyPair, CertificateMutator};
    use crate::corpus::{Corpus, InMemoryCorpus};
    use crate::coverage::CoverageMap;
    use crate::executor::{ExecutionResult, ExecutorConfig};
    use crate::feedback::{CoverageRule, FeedbackError, ModificationStats, Rule};
    use crate::mutator::{GeneticMutator, MutatorConfig, template_seeds};
    use crate::oracle::CrashRule;
    use crate::server::{ServerError, ServerProcess};
    use crate::testing::{ScriptedServer, server_hello_record};
    use crate::wire::TlsRecordEngine;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::net::SocketAddr;
    use std::path::Path;
    use tempfile::tempdir;

    /// What one settled run looked like, in settlement order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Settled {
        modifications: usize,
        mode: ExecutionMode,
        instances: usize,
        persist: bool,
    }

    #[derive(Default)]
    struct RunLog {
        runs: Mutex<Vec<Settled>>,
    }

    impl RunLog {
        fn runs(&self) -> Vec<Settled> {
            self.runs.lock().unwrap().clone()
        }
    }

    impl Rule for RunLog {
        fn name(&self) -> &'static str {
            "run-log"
        }

        fn applies(&self, _result: &ExecutionResult) -> bool {
            true
        }

        fn on_apply(
            &self,
            result: &ExecutionResult,
            context: &RuleContext,
        ) -> Result<(), FeedbackError> {
            self.runs.lock().unwrap().push(Settled {
                modifications: result.vector.modifications().len(),
                mode: result.vector.mode(),
                instances: result.outcomes.len(),
                persist: context.persist,
            });
            Ok(())
        }

        fn on_decline(&self, _result: &ExecutionResult) {}

        fn report(&self) -> Option<String> {
            None
        }
    }

    /// Fails the first `failures` draws as if no kind fit the parent.
    struct Unlucky {
        inner: GeneticMutator,
        failures: usize,
    }

    impl Mutator for Unlucky {
        fn next(&mut self) -> Result<TestVector, MutatorError> {
            if self.failures > 0 {
                self.failures -= 1;
                let parent = self.inner.seeds()[0].id().clone();
                return Err(MutatorError::NoApplicableKind(parent));
            }
            self.inner.next()
        }
    }

    struct Campaign {
        archive: Arc<InMemoryCorpus>,
        crashes: Arc<InMemoryCorpus>,
        coverage: Arc<CoverageMap>,
        pool: Arc<ServerPool>,
        log: Arc<RunLog>,
        /// The mutator's unmodified seeds, for use as a baseline backlog.
        seeds: Vec<TestVector>,
        scheduler: ExecutionScheduler,
    }

    fn campaign(servers: Vec<Box<dyn ServerProcess>>, config: SchedulerConfig) -> Campaign {
        campaign_with(servers, config, MutatorConfig::default(), |m| Box::new(m))
    }

    fn campaign_with(
        servers: Vec<Box<dyn ServerProcess>>,
        config: SchedulerConfig,
        mutator_config: MutatorConfig,
        wrap: impl FnOnce(GeneticMutator) -> Box<dyn Mutator>,
    ) -> Campaign {
        let pool = ServerPool::new(servers).unwrap();
        let log = Arc::new(RunLog::default());
        let archive = Arc::new(InMemoryCorpus::new());
        let crashes = Arc::new(InMemoryCorpus::new());
        let coverage = Arc::new(CoverageMap::new());
        let stats = Arc::new(ModificationStats::new());
        let rules = Arc::new(
            RuleChain::new()
                .with_rule(Arc::new(CoverageRule::new(
                    coverage.clone(),
                    stats.clone(),
                    archive.clone(),
                )))
                .with_rule(Arc::new(CrashRule::new(crashes.clone())))
                .with_rule(log.clone()),
        );
        let mutator = GeneticMutator::new(
            archive.clone(),
            Vec::new(),
            stats.clone(),
            CertificateMutator::default(),
            mutator_config,
        );
        let seeds = mutator.seeds().iter().map(|v| (**v).clone()).collect();
        let executor = Arc::new(SingleServerExecutor::new(
            Arc::new(TlsRecordEngine::new()),
            ExecutorConfig {
                timeout: Duration::from_millis(400),
                agent: AgentKind::TraceFile,
            },
        ));
        let sources = ReportSources {
            stats,
            coverage: coverage.clone(),
            corpora: vec![
                ("archive".to_string(), archive.clone() as Arc<dyn Corpus>),
                ("crashes".to_string(), crashes.clone() as Arc<dyn Corpus>),
            ],
            rules,
            pool: pool.clone(),
        };
        Campaign {
            archive,
            crashes,
            coverage,
            pool,
            log,
            seeds,
            scheduler: ExecutionScheduler::new(config, wrap(mutator), executor, sources),
        }
    }

    fn scripted(count: usize, trace_dir: &Path) -> Vec<Box<dyn ServerProcess>> {
        (0..count)
            .map(|i| {
                let server = ScriptedServer::new(i, Some(trace_dir));
                *server.script.response.lock().unwrap() = server_hello_record();
                *server.script.locations.lock().unwrap() = vec![1000 + i as u64, 7];
                Box::new(server) as Box<dyn ServerProcess>
            })
            .collect()
    }

    fn wait_until(what: &str, timeout: Duration, done: impl Fn() -> bool) {
        let deadline = Instant::now() + timeout;
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn campaign_runs_to_budget_and_settles_everything() {
        let dir = tempdir().unwrap();
        let c = campaign(
            scripted(2, dir.path()),
            SchedulerConfig {
                workers: 2,
                max_runs: Some(12),
                ..SchedulerConfig::default()
            },
        );
        let handle = c.scheduler.spawn().unwrap();
        handle.start();
        wait_until("the run budget", Duration::from_secs(30), || handle.is_finished());

        assert_eq!(handle.runs(), 12);
        assert_eq!(handle.settled(), 12);
        assert!(!handle.is_running());
        assert!(handle.fatal_error().is_none());

        let report = handle.shutdown();
        assert_eq!(report.pool.busy, 0, "every lease must be back");
        assert!(report.rules.contains_key("coverage"));
        assert!(!c.coverage.is_empty());
        assert!(!c.archive.is_empty(), "the first novel trace is archived");
        assert!(c.crashes.is_empty());
    }

    #[test]
    fn replay_backlog_runs_first_without_persisting() {
        let dir = tempdir().unwrap();
        let c = campaign(
            scripted(1, dir.path()),
            SchedulerConfig {
                max_runs: Some(3),
                ..SchedulerConfig::default()
            },
        );
        let backlog =
            template_seeds(&mut ChaCha8Rng::seed_from_u64(3), &CertificateMutator::default())
                .into_iter()
                .take(3);
        let handle = c.scheduler.with_backlog(backlog).spawn().unwrap();
        assert_eq!(handle.report().replay_pending, 3);
        handle.start();
        wait_until("the replay", Duration::from_secs(30), || handle.is_finished());

        let report = handle.shutdown();
        assert_eq!(report.replay_pending, 0);
        assert_eq!(report.settled, 3);
        assert!(!c.coverage.is_empty(), "replay still records coverage");
        assert!(c.archive.is_empty(), "replayed vectors are not persisted again");
    }

    #[test]
    fn stopped_scheduler_dispatches_nothing() {
        let dir = tempdir().unwrap();
        let c = campaign(scripted(1, dir.path()), SchedulerConfig::default());
        let handle = c.scheduler.spawn().unwrap();
        thread::sleep(Duration::from_millis(250));
        assert_eq!(handle.runs(), 0);

        handle.start();
        wait_until("first run", Duration::from_secs(10), || handle.settled() > 0);
        handle.stop();
        thread::sleep(Duration::from_millis(1000));
        let runs = handle.runs();
        thread::sleep(Duration::from_millis(300));
        assert_eq!(handle.runs(), runs, "no dispatch after stop");
        handle.shutdown();
    }

    /// Never answers and cannot be brought back once it is down.
    struct BrokenServer {
        started: bool,
    }

    impl ServerProcess for BrokenServer {
        fn id(&self) -> usize {
            0
        }

        fn endpoint(&self) -> SocketAddr {
            "127.0.0.1:1".parse().unwrap()
        }

        fn start(&mut self) -> Result<(), ServerError> {
            if self.started {
                return Err(ServerError::Io("binary vanished".into()));
            }
            self.started = true;
            Ok(())
        }

        fn stop(&mut self) {}

        fn is_alive(&mut self) -> bool {
            false
        }

        fn trace_path(&self) -> Option<&Path> {
            None
        }

        fn prepare(&mut self, _credentials: &CertKeyPair) -> Result<(), ServerError> {
            Ok(())
        }
    }

    #[test]
    fn failed_restart_stops_dispatch_with_a_fatal_error() {
        let c = campaign(
            vec![Box::new(BrokenServer { started: false })],
            SchedulerConfig::default(),
        );
        let handle = c.scheduler.spawn().unwrap();
        handle.start();
        wait_until("the fatal error", Duration::from_secs(10), || {
            handle.fatal_error().is_some() && handle.is_finished()
        });

        let fatal = handle.fatal_error().unwrap();
        assert!(fatal.contains("binary vanished"), "{fatal}");
        assert!(!handle.is_running());
        handle.start();
        assert!(!handle.is_running(), "a fatal scheduler stays stopped");
        assert_eq!(c.crashes.len(), 1, "the dead server is reported as a crash");
        handle.shutdown();
    }

    #[test]
    fn template_seeds_run_unmodified_before_mutation() {
        let dir = tempdir().unwrap();
        let c = campaign(
            scripted(1, dir.path()),
            SchedulerConfig {
                max_runs: Some(20),
                ..SchedulerConfig::default()
            },
        );
        let seeds = c.seeds.clone();
        assert_eq!(seeds.len(), 16);
        let handle = c.scheduler.with_backlog(seeds).spawn().unwrap();
        handle.start();
        wait_until("the baseline and a few children", Duration::from_secs(30), || {
            handle.is_finished()
        });
        handle.shutdown();

        let runs = c.log.runs();
        assert_eq!(runs.len(), 20);
        assert!(
            runs[..16].iter().all(|r| r.modifications == 0 && !r.persist),
            "the baseline must run first, unmodified and unpersisted: {runs:?}"
        );
        assert!(
            runs[16..].iter().all(|r| r.modifications > 0 && r.persist),
            "mutated children follow the baseline: {runs:?}"
        );
        assert!(!c.coverage.is_empty(), "the baseline records coverage");
    }

    #[test]
    fn broadcast_vectors_run_on_the_whole_fleet() {
        let dir = tempdir().unwrap();
        let c = campaign_with(
            scripted(2, dir.path()),
            SchedulerConfig {
                workers: 2,
                max_runs: Some(4),
                ..SchedulerConfig::default()
            },
            MutatorConfig {
                broadcast_probability: 1.0,
                ..MutatorConfig::default()
            },
            |m| Box::new(m),
        );
        let handle = c.scheduler.spawn().unwrap();
        handle.start();
        wait_until("the broadcast runs", Duration::from_secs(30), || handle.is_finished());
        let report = handle.shutdown();

        let runs = c.log.runs();
        assert_eq!(runs.len(), 4);
        for run in &runs {
            assert_eq!(run.mode, ExecutionMode::Broadcast);
            assert_eq!(run.instances, 2, "a broadcast run covers every server");
        }
        assert_eq!(report.pool.busy, 0, "fleet leases must be returned");
        assert!(!report.pool.exclusive);
        assert!(c.coverage.len() >= 3, "traces of both servers are merged");
    }

    #[test]
    fn exhausted_pool_backs_off_and_retries() {
        let dir = tempdir().unwrap();
        let c = campaign(
            scripted(1, dir.path()),
            SchedulerConfig {
                workers: 3,
                max_runs: Some(6),
                acquire_timeout: Duration::from_millis(20),
                exhausted_backoff: Duration::from_millis(10),
                ..SchedulerConfig::default()
            },
        );
        let held = c.pool.acquire(Duration::from_secs(1)).unwrap();
        let handle = c.scheduler.spawn().unwrap();
        handle.start();
        wait_until("a backoff", Duration::from_secs(10), || handle.report().backoffs > 0);
        assert_eq!(handle.runs(), 0, "nothing is dispatched while the only server is held");

        held.release().unwrap();
        wait_until("the run budget", Duration::from_secs(30), || handle.is_finished());
        assert!(handle.fatal_error().is_none());
        let report = handle.shutdown();
        assert_eq!(report.settled, 6);
        assert!(report.backoffs > 0);
        assert_eq!(report.pool.busy, 0);
    }

    #[test]
    fn inapplicable_draws_are_retried_not_fatal() {
        let dir = tempdir().unwrap();
        let c = campaign_with(
            scripted(1, dir.path()),
            SchedulerConfig {
                max_runs: Some(3),
                ..SchedulerConfig::default()
            },
            MutatorConfig::default(),
            |inner| Box::new(Unlucky { inner, failures: 5 }),
        );
        let handle = c.scheduler.spawn().unwrap();
        handle.start();
        wait_until("the run budget", Duration::from_secs(30), || handle.is_finished());
        assert!(handle.fatal_error().is_none(), "{:?}", handle.fatal_error());
        assert_eq!(handle.shutdown().settled, 3);
    }
}
