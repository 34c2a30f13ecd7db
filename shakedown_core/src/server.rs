use crate::certificate::{CertKeyPair, CertificateRole};
use std::fs;
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use thiserror::Error;

const PORT_PLACEHOLDER: &str = "{port}";
const TRACE_PLACEHOLDER: &str = "{trace}";
const CERT_PLACEHOLDER: &str = "{cert}";
const KEY_PLACEHOLDER: &str = "{key}";

const PROBE_TIMEOUT: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Errors raised while starting, preparing or restarting a server process.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to spawn server {id} ({command}): {reason}")]
    Spawn {
        id: usize,
        command: String,
        reason: String,
    },
    #[error("Server {id} exited during startup: {status}")]
    ExitedDuringStartup { id: usize, status: String },
    #[error("Server {id} did not accept connections on {endpoint} within {waited:?}")]
    StartupTimeout {
        id: usize,
        endpoint: SocketAddr,
        waited: Duration,
    },
    #[error("Server I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Io(err.to_string())
    }
}

/// One server-under-test instance owned by the pool.
pub trait ServerProcess: Send {
    fn id(&self) -> usize;

    fn endpoint(&self) -> SocketAddr;

    /// Starts the process and returns once it accepts connections.
    fn start(&mut self) -> Result<(), ServerError>;

    fn stop(&mut self);

    fn is_alive(&mut self) -> bool;

    fn restart(&mut self) -> Result<(), ServerError> {
        self.stop();
        self.start()
    }

    /// Where the instance writes its coverage, if it writes any.
    fn trace_path(&self) -> Option<&Path>;

    /// Makes the instance serve `credentials` for the next execution.
    fn prepare(&mut self, credentials: &CertKeyPair) -> Result<(), ServerError>;
}

/// Command line and limits for a `CommandServer`.
#[derive(Debug, Clone)]
pub struct CommandServerConfig {
    /// Program and arguments, with `{port}`, `{trace}`, `{cert}` and `{key}` substituted per instance.
    pub command: Vec<String>,
    pub endpoint: SocketAddr,
    /// Instance directory for the trace and credential files. A temporary directory when `None`.
    pub work_dir: Option<PathBuf>,
    pub startup_timeout: Duration,
}

/// A server started from a command line.
pub struct CommandServer {
    id: usize,
    config: CommandServerConfig,
    work_dir: PathBuf,
    _temp_dir: Option<TempDir>,
    trace_path: PathBuf,
    cert_path: PathBuf,
    key_path: PathBuf,
    child: Option<Child>,
    /// Digest of the credentials currently on disk.
    installed: Option<[u8; 16]>,
}

impl CommandServer {
    pub fn new(id: usize, config: CommandServerConfig) -> Result<Self, ServerError> {
        if config.command.is_empty() {
            return Err(ServerError::Spawn {
                id,
                command: String::new(),
                reason: "empty command".to_string(),
            });
        }
        let (work_dir, temp_dir) = match &config.work_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                (dir.clone(), None)
            }
            None => {
                let temp = tempfile::Builder::new()
                    .prefix(&format!("shakedown-server-{id}-"))
                    .tempdir()?;
                (temp.path().to_path_buf(), Some(temp))
            }
        };
        Ok(Self {
            id,
            trace_path: work_dir.join("trace.log"),
            cert_path: work_dir.join("server.crt"),
            key_path: work_dir.join("server.key"),
            work_dir,
            _temp_dir: temp_dir,
            config,
            child: None,
            installed: None,
        })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn consumes_credentials(&self) -> bool {
        self.config
            .command
            .iter()
            .any(|arg| arg.contains(CERT_PLACEHOLDER) || arg.contains(KEY_PLACEHOLDER))
    }

    fn consumes_trace(&self) -> bool {
        self.config.command.iter().any(|arg| arg.contains(TRACE_PLACEHOLDER))
    }

    fn render_args(&self) -> Vec<String> {
        let port = self.config.endpoint.port().to_string();
        let trace = self.trace_path.to_string_lossy();
        let cert = self.cert_path.to_string_lossy();
        let key = self.key_path.to_string_lossy();
        self.config
            .command
            .iter()
            .map(|arg| {
                arg.replace(PORT_PLACEHOLDER, &port)
                    .replace(TRACE_PLACEHOLDER, &trace)
                    .replace(CERT_PLACEHOLDER, &cert)
                    .replace(KEY_PLACEHOLDER, &key)
            })
            .collect()
    }

    fn install(&mut self, credentials: &CertKeyPair) -> Result<bool, ServerError> {
        let mut material = credentials.certificate.clone();
        material.extend_from_slice(&credentials.key);
        let digest = md5::compute(&material).0;
        if self.installed == Some(digest) {
            return Ok(false);
        }
        fs::write(&self.cert_path, &credentials.certificate)?;
        fs::write(&self.key_path, &credentials.key)?;
        self.installed = Some(digest);
        Ok(true)
    }

    /// Polls the endpoint with exponential backoff until it accepts or the startup window closes.
    fn wait_until_ready(&mut self) -> Result<(), ServerError> {
        let started = Instant::now();
        let mut backoff = Duration::from_millis(10);
        loop {
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    self.child = None;
                    return Err(ServerError::ExitedDuringStartup {
                        id: self.id,
                        status: status.to_string(),
                    });
                }
            }
            if TcpStream::connect_timeout(&self.config.endpoint, PROBE_TIMEOUT).is_ok() {
                return Ok(());
            }
            if started.elapsed() >= self.config.startup_timeout {
                self.stop();
                return Err(ServerError::StartupTimeout {
                    id: self.id,
                    endpoint: self.config.endpoint,
                    waited: started.elapsed(),
                });
            }
            sleep(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

impl ServerProcess for CommandServer {
    fn id(&self) -> usize {
        self.id
    }

    fn endpoint(&self) -> SocketAddr {
        self.config.endpoint
    }

    fn start(&mut self) -> Result<(), ServerError> {
        if self.consumes_credentials() && self.installed.is_none() {
            self.install(&CertKeyPair::builtin(CertificateRole::Server))?;
        }
        let args = self.render_args();
        let mut cmd = Command::new(&args[0]);
        cmd.args(&args[1..])
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let child = cmd.spawn().map_err(|e| ServerError::Spawn {
            id: self.id,
            command: args.join(" "),
            reason: e.to_string(),
        })?;
        tracing::debug!("Server {} spawned as pid {}", self.id, child.id());
        self.child = Some(child);
        self.wait_until_ready()
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                tracing::debug!("Server {}: kill failed: {}", self.id, e);
            }
            let _ = child.wait();
        }
    }

    fn is_alive(&mut self) -> bool {
        match self.child.as_mut().map(|c| c.try_wait()) {
            // A running process that no longer accepts connections counts as down.
            Some(Ok(None)) => {
                TcpStream::connect_timeout(&self.config.endpoint, PROBE_TIMEOUT).is_ok()
            }
            Some(Ok(Some(status))) => {
                tracing::debug!("Server {} exited: {}", self.id, status);
                false
            }
            Some(Err(e)) => {
                tracing::warn!("Server {}: cannot query process state: {}", self.id, e);
                false
            }
            None => false,
        }
    }

    fn trace_path(&self) -> Option<&Path> {
        self.consumes_trace().then_some(self.trace_path.as_path())
    }

    fn prepare(&mut self, credentials: &CertKeyPair) -> Result<(), ServerError> {
        if !self.consumes_credentials() {
            return Ok(());
        }
        if self.install(credentials)? {
            tracing::debug!(
                "Server {} restarting with credentials '{}'",
                self.id,
                credentials.name
            );
            self.restart()?;
        }
        Ok(())
    }
}

impl Drop for CommandServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(command: &[&str], work_dir: Option<PathBuf>) -> CommandServerConfig {
        CommandServerConfig {
            command: command.iter().map(|s| s.to_string()).collect(),
            endpoint: "127.0.0.1:4433".parse().unwrap(),
            work_dir,
            startup_timeout: Duration::from_millis(300),
        }
    }

    #[test]
    fn placeholders_are_substituted_per_instance() {
        let dir = tempdir().unwrap();
        let server = CommandServer::new(
            2,
            config(
                &["srv", "-p", "{port}", "--cov={trace}", "{cert}", "{key}"],
                Some(dir.path().to_path_buf()),
            ),
        )
        .unwrap();
        let args = server.render_args();
        assert_eq!(args[2], "4433");
        assert!(args[3].starts_with("--cov=") && args[3].ends_with("trace.log"));
        assert!(args[4].ends_with("server.crt"));
        assert!(args[5].ends_with("server.key"));
        assert!(server.consumes_credentials());
        assert_eq!(server.trace_path(), Some(dir.path().join("trace.log").as_path()));
    }

    #[test]
    fn trace_path_is_absent_when_command_does_not_use_it() {
        let server = CommandServer::new(0, config(&["srv"], None)).unwrap();
        assert!(server.trace_path().is_none());
        assert!(server.work_dir().is_dir(), "temporary work dir should exist");
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(matches!(
            CommandServer::new(0, config(&[], None)),
            Err(ServerError::Spawn { .. })
        ));
    }

    #[test]
    fn install_writes_files_only_when_credentials_change() {
        let dir = tempdir().unwrap();
        let mut server = CommandServer::new(
            0,
            config(&["srv", "{cert}"], Some(dir.path().to_path_buf())),
        )
        .unwrap();
        let pair = CertKeyPair::new("a", vec![1, 2], vec![3]);
        assert!(server.install(&pair).unwrap());
        assert!(!server.install(&pair).unwrap());
        assert_eq!(fs::read(dir.path().join("server.crt")).unwrap(), vec![1, 2]);
        assert_eq!(fs::read(dir.path().join("server.key")).unwrap(), vec![3]);
        let other = CertKeyPair::new("b", vec![9], vec![3]);
        assert!(server.install(&other).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn process_that_exits_during_startup_is_reported() {
        let mut cfg = config(&["sh", "-c", "exit 3"], None);
        cfg.endpoint = "127.0.0.1:1".parse().unwrap();
        cfg.startup_timeout = Duration::from_secs(5);
        let mut server = CommandServer::new(0, cfg).unwrap();
        match server.start() {
            Err(ServerError::ExitedDuringStartup { id, status }) => {
                assert_eq!(id, 0);
                assert!(status.contains('3'), "{status}");
            }
            other => panic!("expected an early exit, got {other:?}"),
        }
        assert!(!server.is_alive());
    }

    #[test]
    fn missing_binary_fails_to_spawn() {
        let mut server =
            CommandServer::new(1, config(&["/definitely/not/a/server/binary"], None)).unwrap();
        assert!(matches!(server.start(), Err(ServerError::Spawn { id: 1, .. })));
        assert!(!server.is_alive());
    }
}
