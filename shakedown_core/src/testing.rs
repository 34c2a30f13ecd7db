//! Test doubles shared by the executor and scheduler tests.

use crate::certificate::CertKeyPair;
use crate::server::{ServerError, ServerProcess};
use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Knobs a test flips while the server runs.
#[derive(Default)]
pub(crate) struct Script {
    /// Bytes written back after the first client flight arrives.
    pub response: Mutex<Vec<u8>>,
    /// Locations written to the trace file for every connection.
    pub locations: Mutex<Vec<u64>>,
    /// Die after handling the next connection.
    pub crash_next: AtomicBool,
    /// Never answer; the client runs into its deadline.
    pub hang: AtomicBool,
    pub connections: AtomicUsize,
}

/// A loopback TCP server whose behaviour is driven by a shared [`Script`].
pub(crate) struct ScriptedServer {
    id: usize,
    addr: SocketAddr,
    alive: Arc<AtomicBool>,
    pub restarts: Arc<AtomicUsize>,
    pub script: Arc<Script>,
    trace_path: Option<PathBuf>,
}

impl ScriptedServer {
    pub fn new(id: usize, trace_dir: Option<&Path>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
        let addr = listener.local_addr().expect("listener address");
        let alive = Arc::new(AtomicBool::new(false));
        let script = Arc::new(Script::default());
        let trace_path = trace_dir.map(|dir| dir.join(format!("trace-{id}.log")));

        let (thread_alive, thread_script, thread_trace) =
            (alive.clone(), script.clone(), trace_path.clone());
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                if !thread_alive.load(Ordering::SeqCst) {
                    continue;
                }
                thread_script.connections.fetch_add(1, Ordering::SeqCst);
                let _ = stream.set_read_timeout(Some(Duration::from_millis(500)));
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                if let Some(path) = &thread_trace {
                    let text: String = thread_script
                        .locations
                        .lock()
                        .unwrap()
                        .iter()
                        .map(|l| format!("{l}\n"))
                        .collect();
                    let _ = fs::write(path, text);
                }
                if thread_script.hang.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(800));
                    continue;
                }
                if thread_script.crash_next.swap(false, Ordering::SeqCst) {
                    thread_alive.store(false, Ordering::SeqCst);
                    continue;
                }
                let response = thread_script.response.lock().unwrap().clone();
                let _ = stream.write_all(&response);
            }
        });

        Self {
            id,
            addr,
            alive,
            restarts: Arc::new(AtomicUsize::new(0)),
            script,
            trace_path,
        }
    }
}

impl ServerProcess for ScriptedServer {
    fn id(&self) -> usize {
        self.id
    }

    fn endpoint(&self) -> SocketAddr {
        self.addr
    }

    fn start(&mut self) -> Result<(), ServerError> {
        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn is_alive(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn restart(&mut self) -> Result<(), ServerError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.start()
    }

    fn trace_path(&self) -> Option<&Path> {
        self.trace_path.as_deref()
    }

    fn prepare(&mut self, _credentials: &CertKeyPair) -> Result<(), ServerError> {
        Ok(())
    }
}

/// A handshake record holding a ServerHello with an empty body.
pub(crate) fn server_hello_record() -> Vec<u8> {
    vec![22, 3, 3, 0, 4, 2, 0, 0, 0]
}
