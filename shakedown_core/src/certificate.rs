//! Certificate and key material handed to the server (server pair) or sent by
//! the client (client pair), and the mutator that picks or synthesizes it.
//!
//! Real certificate generation is a crypto concern and lives behind
//! [`CertificateSynthesizer`]. The default synthesizer never builds valid
//! certificates: it derives damaged variants of known pairs, which is what the
//! fuzzer wants to throw at a server anyway.

use rand::Rng;
use rand::seq::IndexedRandom;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading certificate material.
#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("Certificate I/O error: {0}")]
    Io(String),
    #[error("No certificate pairs available for the {0:?} role")]
    NoPairs(CertificateRole),
}

impl From<std::io::Error> for CertificateError {
    fn from(err: std::io::Error) -> Self {
        CertificateError::Io(err.to_string())
    }
}

/// Which side of the handshake a credential is for.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum CertificateRole {
    Server,
    Client,
}

impl CertificateRole {
    fn dir_name(self) -> &'static str {
        match self {
            CertificateRole::Server => "server",
            CertificateRole::Client => "client",
        }
    }
}

/// A certificate together with its private key, both as raw encoded bytes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CertKeyPair {
    pub name: String,
    pub certificate: Vec<u8>,
    pub key: Vec<u8>,
    #[serde(default)]
    pub malformed: bool,
}

impl CertKeyPair {
    pub fn new(name: &str, certificate: Vec<u8>, key: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            certificate,
            key,
            malformed: false,
        }
    }

    /// A DER-shaped placeholder pair used when no certificate directory is configured.
    pub fn builtin(role: CertificateRole) -> Self {
        let tag = match role {
            CertificateRole::Server => 0x53u8,
            CertificateRole::Client => 0x43u8,
        };
        let body: Vec<u8> = (0..96u16).map(|i| (i as u8).wrapping_mul(31) ^ tag).collect();
        let mut certificate = vec![0x30, 0x82, 0x00, body.len() as u8];
        certificate.extend_from_slice(&body);
        let mut key = vec![0x30, 0x81, 48];
        key.extend((0..48u8).map(|i| i ^ tag));
        Self::new(&format!("builtin-{}", role.dir_name()), certificate, key)
    }

    /// Loads every `<name>.crt`/`<name>.pem` + `<name>.key` pair from `dir`.
    pub fn load_dir(dir: &Path) -> Result<Vec<CertKeyPair>, CertificateError> {
        let mut pairs = Vec::new();
        if !dir.is_dir() {
            return Ok(pairs);
        }
        let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.path());
        for entry in entries {
            let path = entry.path();
            let is_cert = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("crt") | Some("pem") | Some("der")
            );
            if !is_cert {
                continue;
            }
            let key_path = path.with_extension("key");
            if !key_path.is_file() {
                tracing::warn!("Certificate {:?} has no matching key file, skipping", path);
                continue;
            }
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("unnamed")
                .to_string();
            pairs.push(CertKeyPair::new(&name, fs::read(&path)?, fs::read(&key_path)?));
        }
        Ok(pairs)
    }
}

/// What the caller wants from a synthesized pair.
#[derive(Debug, Clone, Copy)]
pub struct CertificateConstraints {
    pub role: CertificateRole,
    pub malformed: bool,
    pub max_len: usize,
}

/// Produces certificate/key material on demand.
pub trait CertificateSynthesizer: Send + Sync {
    fn synthesize(
        &self,
        constraints: &CertificateConstraints,
        rng: &mut dyn RngCore,
    ) -> CertKeyPair;
}

/// Derives (mostly broken) pairs from a set of base pairs.
#[derive(Debug, Clone)]
pub struct MalformedCertificateSynthesizer {
    bases: Vec<CertKeyPair>,
}

impl MalformedCertificateSynthesizer {
    pub fn new(bases: Vec<CertKeyPair>) -> Self {
        let bases = if bases.is_empty() {
            vec![
                CertKeyPair::builtin(CertificateRole::Server),
                CertKeyPair::builtin(CertificateRole::Client),
            ]
        } else {
            bases
        };
        Self { bases }
    }
}

impl CertificateSynthesizer for MalformedCertificateSynthesizer {
    fn synthesize(
        &self,
        constraints: &CertificateConstraints,
        rng: &mut dyn RngCore,
    ) -> CertKeyPair {
        let base = &self.bases[rng.random_range(0..self.bases.len())];
        let mut pair = base.clone();
        if !constraints.malformed {
            return pair;
        }

        match rng.random_range(0..5u8) {
            0 => {
                let keep = rng.random_range(0..=pair.certificate.len());
                pair.certificate.truncate(keep);
                pair.name = format!("{}-truncated-{keep}", base.name);
            }
            1 => {
                if !pair.certificate.is_empty() {
                    for _ in 0..rng.random_range(1..=4) {
                        let idx = rng.random_range(0..pair.certificate.len());
                        pair.certificate[idx] ^= 1 << rng.random_range(0..8);
                    }
                }
                pair.name = format!("{}-bitflip", base.name);
            }
            2 => {
                if pair.certificate.len() >= 4 {
                    pair.certificate[2] = 0xff;
                    pair.certificate[3] = 0xff;
                }
                pair.name = format!("{}-bad-length", base.name);
            }
            3 => {
                let other = &self.bases[rng.random_range(0..self.bases.len())];
                pair.key = other.key.iter().rev().copied().collect();
                pair.name = format!("{}-key-mismatch", base.name);
            }
            _ => {
                let len = rng.random_range(0..=constraints.max_len.max(1));
                pair.certificate = (0..len).map(|_| rng.random()).collect();
                pair.name = format!("random-{len}");
            }
        }
        pair.certificate.truncate(constraints.max_len);
        pair.malformed = true;
        pair
    }
}

/// Selects or synthesizes credentials for certificate-changing modifications.
pub struct CertificateMutator {
    server: Vec<CertKeyPair>,
    client: Vec<CertKeyPair>,
    synthesizer: Box<dyn CertificateSynthesizer>,
    malformed_probability: f64,
    max_len: usize,
}

impl CertificateMutator {
    pub fn new(
        server: Vec<CertKeyPair>,
        client: Vec<CertKeyPair>,
        synthesizer: Box<dyn CertificateSynthesizer>,
        malformed_probability: f64,
    ) -> Self {
        let server = if server.is_empty() {
            vec![CertKeyPair::builtin(CertificateRole::Server)]
        } else {
            server
        };
        let client = if client.is_empty() {
            vec![CertKeyPair::builtin(CertificateRole::Client)]
        } else {
            client
        };
        Self {
            server,
            client,
            synthesizer,
            malformed_probability: malformed_probability.clamp(0.0, 1.0),
            max_len: 4096,
        }
    }

    /// Reads `<dir>/server` and `<dir>/client` and wires the default synthesizer.
    pub fn from_dir(dir: &Path, malformed_probability: f64) -> Result<Self, CertificateError> {
        let server = CertKeyPair::load_dir(&dir.join(CertificateRole::Server.dir_name()))?;
        let client = CertKeyPair::load_dir(&dir.join(CertificateRole::Client.dir_name()))?;
        let mut bases = server.clone();
        bases.extend(client.iter().cloned());
        tracing::info!(
            "Loaded {} server and {} client certificate pairs from {:?}",
            server.len(),
            client.len(),
            dir
        );
        Ok(Self::new(
            server,
            client,
            Box::new(MalformedCertificateSynthesizer::new(bases)),
            malformed_probability,
        ))
    }

    pub fn default_server(&self) -> &CertKeyPair {
        &self.server[0]
    }

    pub fn default_client(&self) -> &CertKeyPair {
        &self.client[0]
    }

    /// Picks credentials for `role`.
    ///
    /// # Arguments
    ///
    /// * `role` - Client or server side.
    /// * `rng` - Source of randomness for the choice and for synthesis.
    ///
    /// # Returns
    ///
    /// A loaded pair, or with the configured probability a synthesized malformed one.
    pub fn pick(&self, role: CertificateRole, rng: &mut dyn RngCore) -> CertKeyPair {
        if rng.random_bool(self.malformed_probability) {
            let constraints = CertificateConstraints {
                role,
                malformed: true,
                max_len: self.max_len,
            };
            return self.synthesizer.synthesize(&constraints, rng);
        }
        let pool = match role {
            CertificateRole::Server => &self.server,
            CertificateRole::Client => &self.client,
        };
        // Both pools are non-empty by construction.
        pool.choose(rng)
            .cloned()
            .unwrap_or_else(|| CertKeyPair::builtin(role))
    }
}

impl Default for CertificateMutator {
    fn default() -> Self {
        Self::new(
            Vec::new(),
            Vec::new(),
            Box::new(MalformedCertificateSynthesizer::new(Vec::new())),
            0.5,
        )
    }
}
