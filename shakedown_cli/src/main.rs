use shakedown_core::certificate::CertificateMutator;
use shakedown_core::config::ShakedownConfig;
use shakedown_core::corpus::{Corpus, OnDiskCorpus, read_vector_dir};
use shakedown_core::coverage::CoverageMap;
use shakedown_core::executor::SingleServerExecutor;
use shakedown_core::feedback::{CoverageRule, ModificationStats, RuleChain};
use shakedown_core::mutator::GeneticMutator;
use shakedown_core::oracle::{CrashRule, TimeoutRule};
use shakedown_core::pool::ServerPool;
use shakedown_core::report::ReportSources;
use shakedown_core::scheduler::ExecutionScheduler;
use shakedown_core::vector::TestVector;
use shakedown_core::wire::TlsRecordEngine;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "shakedown.toml";
const REPORT_FILE: &str = "report.json";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Server command line, split on whitespace. Overrides `servers.command`.
    #[clap(long)]
    server_command: Option<String>,
    #[clap(long)]
    servers: Option<usize>,
    #[clap(short, long)]
    workers: Option<usize>,
    #[clap(short = 'n', long)]
    max_runs: Option<u64>,
    #[clap(short, long)]
    duration_secs: Option<u64>,
    #[clap(long)]
    seed: Option<u64>,
    #[clap(short, long)]
    output_dir: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG says otherwise.
    #[clap(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(cli: &Cli) -> Result<ShakedownConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(config_path) => {
            tracing::info!("Loading configuration from {:?}", config_path);
            ShakedownConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_config_path.exists() {
                tracing::info!("Loading default configuration {:?}", default_config_path);
                ShakedownConfig::load_from_file(&default_config_path)?
            } else {
                tracing::info!("No config file found, using built-in defaults");
                ShakedownConfig::default()
            }
        }
    };

    if let Some(command) = &cli.server_command {
        config.servers.command = command.split_whitespace().map(str::to_string).collect();
    }
    if let Some(servers) = cli.servers {
        config.servers.count = servers;
    }
    if let Some(workers) = cli.workers {
        config.fuzzer.workers = workers;
    }
    if let Some(max_runs) = cli.max_runs {
        config.fuzzer.max_runs = Some(max_runs);
    }
    if let Some(duration) = cli.duration_secs {
        config.fuzzer.duration_secs = Some(duration);
    }
    if let Some(seed) = cli.seed {
        config.fuzzer.seed = seed;
    }
    if let Some(output_dir) = &cli.output_dir {
        config.fuzzer.output_dir = output_dir.clone();
        config.corpus.archive_dir = output_dir.join("archive");
        config.corpus.crash_dir = output_dir.join("crashes");
        config.corpus.timeout_dir = output_dir.join("timeouts");
    }

    config.validate()?;
    Ok(config)
}

fn load_seeds(config: &ShakedownConfig) -> Result<Vec<TestVector>, anyhow::Error> {
    let mut seeds = Vec::new();
    for dir in &config.corpus.seed_dirs {
        let loaded = read_vector_dir(dir)?;
        tracing::info!("Loaded {} seed vectors from {:?}", loaded.len(), dir);
        seeds.extend(loaded);
    }
    Ok(seeds)
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config(&cli)?;
    tracing::debug!("Effective configuration: {config:#?}");

    let output_dir = config.fuzzer.output_dir.clone();
    std::fs::create_dir_all(&output_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create output directory {:?}: {}", output_dir, e))?;

    let archive = Arc::new(OnDiskCorpus::open(&config.corpus.archive_dir)?);
    let crashes = Arc::new(OnDiskCorpus::open(&config.corpus.crash_dir)?);
    let timeouts = Arc::new(OnDiskCorpus::open(&config.corpus.timeout_dir)?);

    // Replaying the archive rebuilds coverage; without replay the saved artifact is the baseline.
    let coverage = if config.corpus.replay {
        Arc::new(CoverageMap::new())
    } else {
        Arc::new(CoverageMap::load(&output_dir)?)
    };

    let certificates = match &config.mutator.certificate_dir {
        Some(dir) => {
            CertificateMutator::from_dir(dir, config.mutator.malformed_certificate_probability)?
        }
        None => CertificateMutator::default(),
    };

    let pool = ServerPool::new(config.servers.command_servers()?)?;
    tracing::info!("Started {} server instances", pool.capacity());

    let stats = Arc::new(ModificationStats::new());
    let coverage_rule = Arc::new(CoverageRule::new(
        coverage.clone(),
        stats.clone(),
        archive.clone(),
    ));
    let rules = Arc::new(
        RuleChain::new()
            .with_rule(coverage_rule.clone())
            .with_rule(Arc::new(CrashRule::new(crashes.clone())))
            .with_rule(Arc::new(TimeoutRule::new(timeouts.clone()))),
    );

    let executor = Arc::new(SingleServerExecutor::new(
        Arc::new(TlsRecordEngine::new()),
        config.executor.executor_config(),
    ));
    let mutator = GeneticMutator::new(
        archive.clone(),
        load_seeds(&config)?,
        stats.clone(),
        certificates,
        config.mutator.mutator_config(config.fuzzer.seed),
    );

    // An empty archive means no baseline yet: the unmodified seeds run first so
    // mutated children are only credited for coverage beyond them.
    let backlog: Vec<TestVector> = if archive.is_empty() {
        tracing::info!("Archive is empty, running {} seeds as baseline", mutator.seeds().len());
        mutator.seeds().iter().map(|v| (**v).clone()).collect()
    } else if config.corpus.replay {
        archive.snapshot().iter().map(|v| (**v).clone()).collect()
    } else {
        Vec::new()
    };

    let sources = ReportSources {
        stats,
        coverage,
        corpora: vec![
            ("archive".to_string(), archive as Arc<dyn Corpus>),
            ("crashes".to_string(), crashes as Arc<dyn Corpus>),
            ("timeouts".to_string(), timeouts as Arc<dyn Corpus>),
        ],
        rules,
        pool,
    };
    let handle = ExecutionScheduler::new(
        config.fuzzer.scheduler_config(),
        Box::new(mutator),
        executor,
        sources,
    )
    .with_backlog(backlog)
    .spawn()?;

    tracing::info!(
        "Fuzzing with {} workers (max runs: {:?}, duration: {:?}s)",
        config.fuzzer.workers,
        config.fuzzer.max_runs,
        config.fuzzer.duration_secs
    );
    handle.start();

    let started = Instant::now();
    let deadline = config.fuzzer.duration_secs.map(Duration::from_secs);
    let interval = Duration::from_secs(config.fuzzer.report_interval_secs.max(1));
    let mut last_summary = Instant::now();
    while !handle.is_finished() {
        if deadline.is_some_and(|d| started.elapsed() >= d) {
            tracing::info!("Time budget reached");
            break;
        }
        thread::sleep(Duration::from_millis(200));
        if last_summary.elapsed() >= interval {
            tracing::info!("{}", handle.report().summary());
            last_summary = Instant::now();
        }
    }

    let report = handle.shutdown();
    tracing::info!("Finished: {}", report.summary());
    for (rule, summary) in &report.rules {
        tracing::info!("  {}: {}", rule, summary);
    }
    coverage_rule.save_coverage(&output_dir)?;
    report.write_to(&output_dir.join(REPORT_FILE))?;

    if let Some(reason) = report.fatal {
        return Err(anyhow::anyhow!("Fuzzing stopped early: {}", reason));
    }
    Ok(())
}
