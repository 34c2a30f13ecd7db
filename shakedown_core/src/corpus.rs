use crate::vector::{TestVector, VectorId};
use rand_core::RngCore;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Suffix of every persisted vector file.
pub const VECTOR_FILE_SUFFIX: &str = ".vector.json";

/// Defines errors that can arise during corpus operations.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// An I/O error occurred while reading or writing the corpus directory.
    #[error("Corpus I/O error: {0}")]
    Io(String),

    #[error("Corpus serialization error: {0}")]
    Serialization(String),

    /// A vector file exists but could not be parsed.
    #[error("Corpus deserialization error: {0}")]
    Deserialization(String),
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}

/// A shared, append-only collection of test vectors.
///
/// Implementations use interior mutability: the feedback rules add from many
/// worker threads while the mutator reads parents from the dispatch thread.
pub trait Corpus: Send + Sync {
    /// Adds `vector` unless a vector with the same id is already present.
    /// Returns whether it was added.
    fn add(&self, vector: TestVector) -> Result<bool, CorpusError>;

    fn get(&self, index: usize) -> Option<Arc<TestVector>>;

    /// Picks an entry uniformly at random.
    fn random_select(&self, rng: &mut dyn RngCore) -> Option<(usize, Arc<TestVector>)>;

    fn contains(&self, id: &VectorId) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries in insertion order.
    fn snapshot(&self) -> Vec<Arc<TestVector>>;
}

#[derive(Debug, Default)]
struct Entries {
    vectors: Vec<Arc<TestVector>>,
    ids: HashSet<VectorId>,
}

/// A corpus kept entirely in memory. Used for tests and transient stores.
#[derive(Debug, Default)]
pub struct InMemoryCorpus {
    entries: RwLock<Entries>,
}

impl InMemoryCorpus {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Corpus for InMemoryCorpus {
    fn add(&self, vector: TestVector) -> Result<bool, CorpusError> {
        let mut entries = self.write();
        if !entries.ids.insert(vector.id().clone()) {
            return Ok(false);
        }
        entries.vectors.push(Arc::new(vector));
        Ok(true)
    }

    fn get(&self, index: usize) -> Option<Arc<TestVector>> {
        self.read().vectors.get(index).cloned()
    }

    fn random_select(&self, rng: &mut dyn RngCore) -> Option<(usize, Arc<TestVector>)> {
        let entries = self.read();
        if entries.vectors.is_empty() {
            return None;
        }
        let index = rng.next_u64() as usize % entries.vectors.len();
        entries.vectors.get(index).map(|v| (index, v.clone()))
    }

    fn contains(&self, id: &VectorId) -> bool {
        self.read().ids.contains(id)
    }

    fn len(&self) -> usize {
        self.read().vectors.len()
    }

    fn snapshot(&self) -> Vec<Arc<TestVector>> {
        self.read().vectors.clone()
    }
}

/// A corpus mirrored to a directory, one pretty-printed JSON file per vector.
///
/// Files are written before the entry becomes visible in memory and no lock is
/// held while writing.
#[derive(Debug)]
pub struct OnDiskCorpus {
    dir: PathBuf,
    memory: InMemoryCorpus,
}

impl OnDiskCorpus {
    /// Opens `dir`, creating it if needed, and loads every vector file already in it.
    pub fn open(dir: &Path) -> Result<Self, CorpusError> {
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(|e| {
                CorpusError::Io(format!("Failed to create corpus directory at {:?}: {}", dir, e))
            })?;
        } else if !dir.is_dir() {
            return Err(CorpusError::Io(format!(
                "Corpus path {:?} exists but is not a directory",
                dir
            )));
        }

        let memory = InMemoryCorpus::new();
        for vector in read_vector_dir(dir)? {
            memory.add(vector)?;
        }
        if !memory.is_empty() {
            tracing::info!("Loaded {} vectors from {:?}", memory.len(), dir);
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            memory,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the vector with `id` is stored.
    pub fn file_path(&self, id: &VectorId) -> PathBuf {
        self.dir.join(format!("{id}{VECTOR_FILE_SUFFIX}"))
    }

    fn write_file(&self, vector: &TestVector) -> Result<(), CorpusError> {
        let path = self.file_path(vector.id());
        let file = File::create(&path)
            .map_err(|e| CorpusError::Io(format!("Failed to create {:?}: {}", path, e)))?;
        serde_json::to_writer_pretty(BufWriter::new(file), vector).map_err(|e| {
            CorpusError::Serialization(format!("Failed to write vector to {:?}: {}", path, e))
        })
    }
}

impl Corpus for OnDiskCorpus {
    fn add(&self, vector: TestVector) -> Result<bool, CorpusError> {
        if self.memory.contains(vector.id()) {
            return Ok(false);
        }
        self.write_file(&vector)?;
        self.memory.add(vector)
    }

    fn get(&self, index: usize) -> Option<Arc<TestVector>> {
        self.memory.get(index)
    }

    fn random_select(&self, rng: &mut dyn RngCore) -> Option<(usize, Arc<TestVector>)> {
        self.memory.random_select(rng)
    }

    fn contains(&self, id: &VectorId) -> bool {
        self.memory.contains(id)
    }

    fn len(&self) -> usize {
        self.memory.len()
    }

    fn snapshot(&self) -> Vec<Arc<TestVector>> {
        self.memory.snapshot()
    }
}

/// Reads every `*.vector.json` file in `dir`, in file name order.
pub fn read_vector_dir(dir: &Path) -> Result<Vec<TestVector>, CorpusError> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| CorpusError::Io(format!("Failed to read corpus directory {:?}: {}", dir, e)))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(VECTOR_FILE_SUFFIX))
        })
        .collect();
    paths.sort();

    let mut vectors = Vec::with_capacity(paths.len());
    for path in paths {
        let file = File::open(&path)
            .map_err(|e| CorpusError::Io(format!("Failed to open {:?}: {}", path, e)))?;
        let vector: TestVector = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            CorpusError::Deserialization(format!(
                "Failed to parse {:?}: {}. The file might be corrupted.",
                path, e
            ))
        })?;
        vectors.push(vector);
    }
    Ok(vectors)
}
