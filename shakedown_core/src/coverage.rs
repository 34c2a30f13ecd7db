use bincode::config::{Configuration, Fixint, LittleEndian, NoLimit};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

pub const COVERAGE_ARTIFACT: &str = "coverage.bin";
pub const COVERAGE_SUMMARY: &str = "coverage.txt";
const ARTIFACT_VERSION: u32 = 1;

/// Errors raised while saving or loading the coverage artifact.
#[derive(Error, Debug)]
pub enum CoverageError {
    #[error("Coverage I/O error: {0}")]
    Io(String),
    #[error("Coverage artifact could not be encoded: {0}")]
    Encode(String),
    #[error("Coverage artifact is corrupt: {0}")]
    Decode(String),
}

impl From<std::io::Error> for CoverageError {
    fn from(err: std::io::Error) -> Self {
        CoverageError::Io(err.to_string())
    }
}

fn bincode_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// The set of code locations one execution reached.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchTrace {
    locations: BTreeSet<u64>,
}

impl BranchTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `location`; returns whether it was new.
    pub fn insert(&mut self, location: u64) -> bool {
        self.locations.insert(location)
    }

    pub fn contains(&self, location: u64) -> bool {
        self.locations.contains(&location)
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.locations.iter().copied()
    }

    pub fn union_with(&mut self, other: &BranchTrace) {
        self.locations.extend(other.locations.iter().copied());
    }

    /// Locations in `self` that are not in `other`.
    pub fn difference(&self, other: &BranchTrace) -> BranchTrace {
        BranchTrace {
            locations: self.locations.difference(&other.locations).copied().collect(),
        }
    }
}

impl FromIterator<u64> for BranchTrace {
    fn from_iter<T: IntoIterator<Item = u64>>(iter: T) -> Self {
        Self {
            locations: iter.into_iter().collect(),
        }
    }
}

#[derive(Encode, Decode)]
struct CoverageArtifact {
    version: u32,
    locations: Vec<u64>,
}

/// Every location observed so far across all executions.
#[derive(Debug, Default)]
pub struct CoverageMap {
    seen: Mutex<HashSet<u64>>,
}

impl CoverageMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn seen(&self) -> std::sync::MutexGuard<'_, HashSet<u64>> {
        // A poisoned set is still a valid set.
        self.seen.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// How many locations of `trace` have not been seen yet.
    pub fn novel_count(&self, trace: &BranchTrace) -> usize {
        let seen = self.seen();
        trace.iter().filter(|loc| !seen.contains(loc)).count()
    }

    /// Whether `trace` has a location not yet in the map.
    pub fn has_novel(&self, trace: &BranchTrace) -> bool {
        let seen = self.seen();
        trace.iter().any(|loc| !seen.contains(&loc))
    }

    /// Adds `trace` and returns how many locations were new, under a single lock.
    pub fn merge(&self, trace: &BranchTrace) -> usize {
        let mut seen = self.seen();
        trace.iter().filter(|loc| seen.insert(*loc)).count()
    }

    pub fn len(&self) -> usize {
        self.seen().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen().is_empty()
    }

    /// Writes `coverage.bin` and a human-readable `coverage.txt` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<(), CoverageError> {
        fs::create_dir_all(dir)?;
        let mut locations: Vec<u64> = self.seen().iter().copied().collect();
        locations.sort_unstable();

        let artifact = CoverageArtifact {
            version: ARTIFACT_VERSION,
            locations,
        };
        let bytes = bincode::encode_to_vec(&artifact, bincode_config())
            .map_err(|e| CoverageError::Encode(e.to_string()))?;
        fs::write(dir.join(COVERAGE_ARTIFACT), bytes)?;

        let mut summary = fs::File::create(dir.join(COVERAGE_SUMMARY))?;
        writeln!(summary, "locations: {}", artifact.locations.len())?;
        for location in &artifact.locations {
            writeln!(summary, "{location:#x}")?;
        }
        Ok(())
    }

    /// Loads a map saved by [`CoverageMap::save`]; a missing artifact yields an empty map.
    pub fn load(dir: &Path) -> Result<Self, CoverageError> {
        let path = dir.join(COVERAGE_ARTIFACT);
        if !path.is_file() {
            return Ok(Self::new());
        }
        let bytes = fs::read(&path)?;
        let (artifact, _): (CoverageArtifact, usize) =
            bincode::decode_from_slice(&bytes, bincode_config())
                .map_err(|e| CoverageError::Decode(e.to_string()))?;
        if artifact.version != ARTIFACT_VERSION {
            return Err(CoverageError::Decode(format!(
                "unsupported artifact version {}",
                artifact.version
            )));
        }
        Ok(Self {
            seen: Mutex::new(artifact.locations.into_iter().collect()),
        })
    }
}
