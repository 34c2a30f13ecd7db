pub mod agent;
pub mod certificate;
pub mod config;
pub mod corpus;
pub mod coverage;
pub mod executor;
pub mod feedback;
pub mod message;
pub mod modification;
pub mod mutator;
pub mod oracle;
pub mod pool;
pub mod protocol;
pub mod report;
pub mod scheduler;
pub mod server;
pub mod template;
pub mod vector;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ShakedownConfig;
pub use corpus::{Corpus, CorpusError, InMemoryCorpus, OnDiskCorpus};
pub use coverage::{BranchTrace, CoverageMap};
pub use executor::{ExecutionResult, ExecutionStatus, MultiServerExecutor, SingleServerExecutor};
pub use feedback::{CoverageRule, FeedbackError, ModificationStats, Rule, RuleChain, RuleContext};
pub use modification::{Modification, ModificationKind};
pub use mutator::{GeneticMutator, Mutator, MutatorError};
pub use oracle::{BugReport, CrashRule, TimeoutRule};
pub use pool::{PoolError, ServerPool};
pub use protocol::ProtocolEngine;
pub use report::Report;
pub use scheduler::{ExecutionScheduler, SchedulerError, SchedulerHandle};
pub use vector::{TestVector, VectorId};
pub use wire::TlsRecordEngine;
