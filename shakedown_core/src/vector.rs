//! The unit of work: a seed genome plus the ordered modifications that turn it
//! into the sequence that actually gets played.

use crate::modification::{ApplyOutcome, Genome, Modification, ModificationKind};
use crate::protocol::ProtocolEngine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Content-derived identifier (hex md5 of seed and replay log).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct VectorId(String);

impl VectorId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a vector runs.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Runs on one leased server.
    #[default]
    Single,
    /// Runs on every server of the pool under an exclusive fleet lease.
    Broadcast,
}

/// On-disk form of a vector. The live genome is never stored; it is rebuilt by replay.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct VectorRecord {
    pub id: VectorId,
    #[serde(default)]
    pub parent: Option<VectorId>,
    #[serde(default)]
    pub mode: ExecutionMode,
    pub seed: Genome,
    #[serde(default)]
    pub modifications: Vec<Modification>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// A seed genome, its replay log and the live genome the log produces.
///
/// The id is derived from seed and log, so two vectors with the same content
/// share an id. Serialized through `VectorRecord`; the live genome is rebuilt
/// on load.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(from = "VectorRecord", into = "VectorRecord")]
pub struct TestVector {
    id: VectorId,
    parent: Option<VectorId>,
    mode: ExecutionMode,
    seed: Genome,
    log: Vec<Modification>,
    live: Genome,
    pub metadata: BTreeMap<String, String>,
}

fn replay(seed: &Genome, log: &[Modification]) -> Genome {
    let mut genome = seed.clone();
    for modification in log {
        // Skipped edits stay skipped on replay.
        if let Ok(next) = modification.apply(&genome) {
            genome = next;
        }
    }
    genome
}

fn content_id(seed: &Genome, log: &[Modification]) -> VectorId {
    let encoded = serde_json::to_vec(&(seed, log)).unwrap_or_default();
    VectorId(format!("{:x}", md5::compute(encoded)))
}

impl TestVector {
    /// Creates a vector with an empty replay log.
    ///
    /// # Arguments
    ///
    /// * `seed` - The genome the replay log starts from.
    /// * `mode` - Whether to run on one instance or on the whole pool.
    pub fn new(seed: Genome, mode: ExecutionMode) -> Self {
        let id = content_id(&seed, &[]);
        Self {
            id,
            parent: None,
            mode,
            live: seed.clone(),
            seed,
            log: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &VectorId {
        &self.id
    }

    pub fn parent(&self) -> Option<&VectorId> {
        self.parent.as_ref()
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.mode = mode;
    }

    /// The genome the replay log is applied to.
    pub fn seed(&self) -> &Genome {
        &self.seed
    }

    /// The current genome: seed with every successful modification applied.
    pub fn live(&self) -> &Genome {
        &self.live
    }

    /// The replay log, including modifications that were skipped.
    pub fn modifications(&self) -> &[Modification] {
        &self.log
    }

    pub fn modification_kinds(&self) -> impl Iterator<Item = ModificationKind> + '_ {
        self.log.iter().map(Modification::kind)
    }

    /// Deep copy that records this vector as its parent.
    pub fn derive_child(&self) -> TestVector {
        let mut child = self.clone();
        child.parent = Some(self.id.clone());
        child.metadata.clear();
        child
    }

    /// Appends `modification` to the replay log and applies it to the live genome.
    ///
    /// A modification without a valid target is still logged, as a no-op, so
    /// that statistics see it and replay stays faithful.
    pub fn add_modification(&mut self, modification: Modification) -> ApplyOutcome {
        let outcome = match modification.apply(&self.live) {
            Ok(next) => {
                self.live = next;
                ApplyOutcome::Applied
            }
            Err(e) => {
                tracing::debug!("Vector {}: {}", self.id, e);
                ApplyOutcome::Skipped(e)
            }
        };
        self.log.push(modification);
        self.id = content_id(&self.seed, &self.log);
        outcome
    }

    /// Rebuilds the live genome from seed and log, dropping anything an execution left on it.
    pub fn reset(&mut self) {
        self.live = replay(&self.seed, &self.log);
    }

    /// Strips execution-derived values from the seed and rebuilds the live
    /// genome from it.
    ///
    /// Edited fields lose their dynamic flag on the live genome, so the live
    /// sequence is replayed rather than genericized in place. `reset()` and a
    /// reload from disk then produce the sequence that is played.
    pub fn make_generic(&mut self, engine: &dyn ProtocolEngine) {
        engine.genericize(&mut self.seed.messages);
        self.live = replay(&self.seed, &self.log);
        self.id = content_id(&self.seed, &self.log);
    }

    /// The on-disk form of this vector.
    pub fn to_record(&self) -> VectorRecord {
        self.clone().into()
    }
}

impl From<VectorRecord> for TestVector {
    fn from(record: VectorRecord) -> Self {
        let live = replay(&record.seed, &record.modifications);
        let id = content_id(&record.seed, &record.modifications);
        if id != record.id {
            tracing::warn!("Vector record {} replays to content id {}", record.id, id);
        }
        Self {
            id,
            parent: record.parent,
            mode: record.mode,
            seed: record.seed,
            log: record.modifications,
            live,
            metadata: record.metadata,
        }
    }
}

impl From<TestVector> for VectorRecord {
    fn from(vector: TestVector) -> Self {
        Self {
            id: vector.id,
            parent: vector.parent,
            mode: vector.mode,
            seed: vector.seed,
            modifications: vector.log,
            metadata: vector.metadata,
        }
    }
}
