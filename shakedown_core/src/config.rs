use crate::agent::AgentKind;
use crate::executor::ExecutorConfig;
use crate::mutator::MutatorConfig;
use crate::scheduler::SchedulerConfig;
use crate::server::{CommandServer, CommandServerConfig, ServerError, ServerProcess};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors found when validating a loaded configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Campaign-wide settings: threads, budgets, seed and output location.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Stop after this many runs. Unlimited when absent.
    #[serde(default)]
    pub max_runs: Option<u64>,
    /// Stop after this much wall-clock time. Unlimited when absent.
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

pub fn default_workers() -> usize {
    1
}
pub fn default_output_dir() -> PathBuf {
    PathBuf::from("./shakedown-out")
}
fn default_report_interval_secs() -> u64 {
    10
}
fn default_acquire_timeout_ms() -> u64 {
    1000
}
fn default_idle_poll_ms() -> u64 {
    100
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_runs: None,
            duration_secs: None,
            seed: 0,
            output_dir: default_output_dir(),
            report_interval_secs: default_report_interval_secs(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

impl FuzzerSettings {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            workers: self.workers,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            idle_poll: Duration::from_millis(self.idle_poll_ms),
            max_runs: self.max_runs,
            ..SchedulerConfig::default()
        }
    }
}

/// How server-under-test instances are launched.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    /// Command line of one server instance; see `CommandServerConfig::command`.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "default_server_count")]
    pub count: usize,
    #[serde(default = "default_host")]
    pub host: IpAddr,
    /// Instance `i` listens on `base-port + i`.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// Parent of the per-instance work directories. Temporary directories when absent.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

fn default_server_count() -> usize {
    1
}
fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}
fn default_base_port() -> u16 {
    4433
}
fn default_startup_timeout_ms() -> u64 {
    5000
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            count: default_server_count(),
            host: default_host(),
            base_port: default_base_port(),
            startup_timeout_ms: default_startup_timeout_ms(),
            work_dir: None,
        }
    }
}

impl ServerSettings {
    pub fn endpoint(&self, index: usize) -> SocketAddr {
        SocketAddr::new(self.host, self.base_port.saturating_add(index as u16))
    }

    /// One `CommandServer` per instance, not yet started.
    pub fn command_servers(&self) -> Result<Vec<Box<dyn ServerProcess>>, ServerError> {
        (0..self.count)
            .map(|i| {
                let config = CommandServerConfig {
                    command: self.command.clone(),
                    endpoint: self.endpoint(i),
                    work_dir: self.work_dir.as_ref().map(|dir| dir.join(format!("server-{i}"))),
                    startup_timeout: Duration::from_millis(self.startup_timeout_ms),
                };
                CommandServer::new(i, config).map(|s| Box::new(s) as Box<dyn ServerProcess>)
            })
            .collect()
    }
}

/// Per-execution settings.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExecutorSettings {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub agent: AgentKind,
}

fn default_timeout_ms() -> u64 {
    2000
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            agent: AgentKind::default(),
        }
    }
}

impl ExecutorSettings {
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            timeout: Duration::from_millis(self.timeout_ms),
            agent: self.agent,
        }
    }
}

/// Where vectors are stored and read from.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusSettings {
    /// Archived vectors; loaded at startup and replayed before mutation.
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,
    #[serde(default = "default_crash_dir")]
    pub crash_dir: PathBuf,
    #[serde(default = "default_timeout_dir")]
    pub timeout_dir: PathBuf,
    /// Directories of vector files used as seeds instead of the templates.
    #[serde(default)]
    pub seed_dirs: Vec<PathBuf>,
    #[serde(default = "default_replay")]
    pub replay: bool,
}

pub fn default_archive_dir() -> PathBuf {
    PathBuf::from("./shakedown-out/archive")
}
fn default_crash_dir() -> PathBuf {
    PathBuf::from("./shakedown-out/crashes")
}
fn default_timeout_dir() -> PathBuf {
    PathBuf::from("./shakedown-out/timeouts")
}
fn default_replay() -> bool {
    true
}

impl Default for CorpusSettings {
    fn default() -> Self {
        Self {
            archive_dir: default_archive_dir(),
            crash_dir: default_crash_dir(),
            timeout_dir: default_timeout_dir(),
            seed_dirs: Vec::new(),
            replay: default_replay(),
        }
    }
}

/// Tuning of the genetic mutator.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MutatorSettings {
    #[serde(default = "default_max_modifications")]
    pub max_modifications: usize,
    #[serde(default = "default_weight_floor")]
    pub weight_floor: f64,
    #[serde(default)]
    pub broadcast_probability: f64,
    /// Holds `server/` and `client/` subdirectories of `<name>.crt` / `<name>.key` pairs.
    #[serde(default)]
    pub certificate_dir: Option<PathBuf>,
    #[serde(default = "default_malformed_certificate_probability")]
    pub malformed_certificate_probability: f64,
}

fn default_max_modifications() -> usize {
    3
}
fn default_weight_floor() -> f64 {
    0.05
}
fn default_malformed_certificate_probability() -> f64 {
    0.2
}

impl Default for MutatorSettings {
    fn default() -> Self {
        Self {
            max_modifications: default_max_modifications(),
            weight_floor: default_weight_floor(),
            broadcast_probability: 0.0,
            certificate_dir: None,
            malformed_certificate_probability: default_malformed_certificate_probability(),
        }
    }
}

impl MutatorSettings {
    pub fn mutator_config(&self, seed: u64) -> MutatorConfig {
        MutatorConfig {
            max_modifications: self.max_modifications,
            weight_floor: self.weight_floor,
            broadcast_probability: self.broadcast_probability,
            rng_seed: seed,
        }
    }
}

/// Root of the TOML configuration file.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ShakedownConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub servers: ServerSettings,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub corpus: CorpusSettings,
    #[serde(default)]
    pub mutator: MutatorSettings,
}

impl ShakedownConfig {
    /// Loads the configuration from a TOML file.
    ///
    /// # Arguments
    ///
    /// * `path` - The TOML file to read.
    ///
    /// # Returns
    ///
    /// The parsed configuration, or an error if the file cannot be read or parsed.
    /// Validation is left to `validate`.
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: ShakedownConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    /// Checks what serde cannot: ranges and cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.command.is_empty() {
            return Err(ConfigError::Invalid(
                "servers.command must name the server-under-test binary".to_string(),
            ));
        }
        if self.servers.count == 0 {
            return Err(ConfigError::Invalid("servers.count must be at least 1".to_string()));
        }
        let last_port = self.servers.base_port as usize + self.servers.count - 1;
        if last_port > u16::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "{} servers starting at port {} exceed the port range",
                self.servers.count, self.servers.base_port
            )));
        }
        if self.fuzzer.workers == 0 {
            return Err(ConfigError::Invalid("fuzzer.workers must be at least 1".to_string()));
        }
        if self.mutator.max_modifications == 0 {
            return Err(ConfigError::Invalid(
                "mutator.max-modifications must be at least 1".to_string(),
            ));
        }
        for (name, p) in [
            ("mutator.broadcast-probability", self.mutator.broadcast_probability),
            (
                "mutator.malformed-certificate-probability",
                self.mutator.malformed_certificate_probability,
            ),
            ("mutator.weight-floor", self.mutator.weight_floor),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(ConfigError::Invalid(format!("{name} must be within [0, 1], got {p}")));
            }
        }
        Ok(())
    }
}
