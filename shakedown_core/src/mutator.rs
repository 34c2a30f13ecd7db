use crate::certificate::{CertificateMutator, CertificateRole};
use crate::corpus::Corpus;
use crate::feedback::ModificationStats;
use crate::message::{Message, MessageKind};
use crate::modification::{FieldEdit, Genome, Modification, ModificationKind};
use crate::template::{KeyExchange, all_seed_sequences, client_message};
use crate::vector::{ExecutionMode, TestVector, VectorId};
use rand::Rng;
use rand::seq::IndexedRandom;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::sync::Arc;
use thiserror::Error;

static DANGEROUS_U8: &[u8] = &[u8::MIN, u8::MAX, i8::MAX as u8, (i8::MAX as u8) + 1];

static DANGEROUS_U16: &[u16] = &[
    u16::MIN,
    u16::MAX,
    i16::MAX as u16,
    (i16::MAX as u16) + 1,
    0xff7f,
    0x0080,
    // Largest record payload and one past it.
    0x4000,
    0x4001,
];

static DANGEROUS_U32: &[u32] = &[
    u32::MIN,
    u32::MAX,
    i32::MAX as u32,
    (i32::MAX as u32) + 1,
    0xffff_ff7f,
    0x0000_0080,
];

static DANGEROUS_U64: &[u64] = &[
    u64::MIN,
    u64::MAX,
    i64::MAX as u64,
    (i64::MAX as u64) + 1,
    0xffff_ffff_ffff_ff7f,
    0x0000_0000_0000_0080,
];

/// A boundary value as big-endian bytes, sized like the field it replaces when possible.
fn dangerous_bytes<R: Rng + ?Sized>(width: usize, rng: &mut R) -> Vec<u8> {
    let width = match width {
        1 | 2 | 4 | 8 => width,
        _ => [1usize, 2, 4, 8][rng.random_range(0..4)],
    };
    match width {
        1 => vec![DANGEROUS_U8[rng.random_range(0..DANGEROUS_U8.len())]],
        2 => DANGEROUS_U16[rng.random_range(0..DANGEROUS_U16.len())]
            .to_be_bytes()
            .to_vec(),
        4 => DANGEROUS_U32[rng.random_range(0..DANGEROUS_U32.len())]
            .to_be_bytes()
            .to_vec(),
        _ => DANGEROUS_U64[rng.random_range(0..DANGEROUS_U64.len())]
            .to_be_bytes()
            .to_vec(),
    }
}

fn random_bytes<R: Rng + ?Sized>(max_len: usize, rng: &mut R) -> Vec<u8> {
    let len = rng.random_range(1..=max_len.max(1));
    (0..len).map(|_| rng.random()).collect()
}

/// Errors raised while producing the next vector.
#[derive(Error, Debug)]
pub enum MutatorError {
    #[error("No parent available: the corpus and the seed set are both empty")]
    NoParent,
    #[error("No modification kind can be instantiated on vector {0}")]
    NoApplicableKind(VectorId),
}

/// Produces the next vector to execute.
pub trait Mutator: Send {
    fn next(&mut self) -> Result<TestVector, MutatorError>;
}

/// Tuning of `GeneticMutator`.
#[derive(Debug, Clone, Copy)]
pub struct MutatorConfig {
    /// Upper bound of modifications added to one child; at least one is always added.
    pub max_modifications: usize,
    /// Lowest selection weight any modification kind can fall to.
    pub weight_floor: f64,
    pub broadcast_probability: f64,
    pub rng_seed: u64,
}

impl Default for MutatorConfig {
    fn default() -> Self {
        Self {
            max_modifications: 3,
            weight_floor: 0.05,
            broadcast_probability: 0.0,
            rng_seed: 0,
        }
    }
}

/// Evolves archived vectors with modifications weighted by how often each kind
/// led to new coverage.
pub struct GeneticMutator {
    rng: ChaCha8Rng,
    archive: Arc<dyn Corpus>,
    seeds: Vec<Arc<TestVector>>,
    stats: Arc<ModificationStats>,
    certificates: CertificateMutator,
    config: MutatorConfig,
}

impl GeneticMutator {
    /// Falls back to template seeds when `seeds` is empty.
    pub fn new(
        archive: Arc<dyn Corpus>,
        seeds: Vec<TestVector>,
        stats: Arc<ModificationStats>,
        certificates: CertificateMutator,
        config: MutatorConfig,
    ) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(config.rng_seed);
        let seeds = if seeds.is_empty() {
            let generated = template_seeds(&mut rng, &certificates);
            tracing::info!("Generated {} template seeds", generated.len());
            generated
        } else {
            seeds
        };
        Self {
            rng,
            archive,
            seeds: seeds.into_iter().map(Arc::new).collect(),
            stats,
            certificates,
            config,
        }
    }

    /// The seed set parents are drawn from while the archive is empty.
    pub fn seeds(&self) -> &[Arc<TestVector>] {
        &self.seeds
    }

    fn select_parent(&mut self) -> Result<Arc<TestVector>, MutatorError> {
        if let Some((_, parent)) = self.archive.random_select(&mut self.rng) {
            return Ok(parent);
        }
        self.seeds
            .choose(&mut self.rng)
            .cloned()
            .ok_or(MutatorError::NoParent)
    }

    /// Draws kinds by weight until one fits `genome`.
    fn next_modification(&mut self, genome: &Genome) -> Option<Modification> {
        let mut candidates = self.stats.weights(self.config.weight_floor);
        while !candidates.is_empty() {
            let kind = match candidates.choose_weighted(&mut self.rng, |(_, w)| *w) {
                Ok((kind, _)) => *kind,
                Err(e) => {
                    tracing::warn!("Modification weights unusable ({}), picking uniformly", e);
                    candidates.choose(&mut self.rng)?.0
                }
            };
            if let Some(modification) = self.instantiate(kind, genome) {
                return Some(modification);
            }
            candidates.retain(|(k, _)| *k != kind);
        }
        None
    }

    /// Concrete parameters for `kind` on `genome`, or `None` when it has no target there.
    fn instantiate(&mut self, kind: ModificationKind, genome: &Genome) -> Option<Modification> {
        let rng = &mut self.rng;
        let messages = &genome.messages;
        let len = messages.len();
        match kind {
            ModificationKind::AddMessage => {
                let message_kind = *MessageKind::ALL.choose(rng)?;
                let message = if rng.random_bool(0.75) {
                    let family = *KeyExchange::ALL.choose(rng)?;
                    let suite = *family.cipher_suites().choose(rng)?;
                    client_message(message_kind, family, suite)
                } else {
                    Message::expect(message_kind)
                };
                let position = rng.random_bool(0.5).then(|| rng.random_range(0..=len));
                Some(Modification::AddMessage { position, message })
            }
            ModificationKind::AddRecord => {
                let sent: Vec<usize> = (0..len).filter(|&i| messages[i].is_client()).collect();
                let index = *sent.choose(rng)?;
                // Header plus body of a handshake message.
                let payload = messages[index].body().len() + 4;
                let fragment = rng.random_range(0..=payload);
                Some(Modification::AddRecord { index, fragment })
            }
            ModificationKind::DuplicateMessage if len > 0 => Some(Modification::DuplicateMessage {
                index: rng.random_range(0..len),
            }),
            ModificationKind::ModifyField => {
                let targets: Vec<(usize, usize)> = messages
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| m.is_client())
                    .flat_map(|(i, m)| (0..m.fields.len()).map(move |f| (i, f)))
                    .collect();
                let (index, field_index) = *targets.choose(rng)?;
                let field = &messages[index].fields[field_index];
                let value_len = field.value.len();
                let edit = match rng.random_range(0..4u8) {
                    0 if value_len > 0 => FieldEdit::FlipBits {
                        offset: rng.random_range(0..value_len),
                        mask: 1 << rng.random_range(0..8),
                    },
                    1 if value_len > 0 => FieldEdit::Truncate {
                        len: rng.random_range(0..value_len),
                    },
                    2 => FieldEdit::Extend {
                        bytes: random_bytes(16, rng),
                    },
                    _ if rng.random_bool(0.5) => FieldEdit::Replace {
                        bytes: dangerous_bytes(value_len, rng),
                    },
                    _ => FieldEdit::Replace {
                        bytes: random_bytes(value_len * 2 + 1, rng),
                    },
                };
                Some(Modification::ModifyField {
                    index,
                    field: field.name.clone(),
                    edit,
                })
            }
            ModificationKind::RemoveMessage if len > 0 => Some(Modification::RemoveMessage {
                index: rng.random_range(0..len),
            }),
            ModificationKind::Reorder if len > 1 => {
                let from = rng.random_range(0..len);
                let mut to = rng.random_range(0..len - 1);
                if to >= from {
                    to += 1;
                }
                Some(Modification::Reorder { from, to })
            }
            ModificationKind::ChangeClientCertificate => {
                Some(Modification::ChangeClientCertificate {
                    pair: self.certificates.pick(CertificateRole::Client, rng),
                })
            }
            ModificationKind::ChangeServerCertificate => {
                Some(Modification::ChangeServerCertificate {
                    pair: self.certificates.pick(CertificateRole::Server, rng),
                })
            }
            ModificationKind::DuplicateMessage
            | ModificationKind::RemoveMessage
            | ModificationKind::Reorder => None,
        }
    }
}

impl Mutator for GeneticMutator {
    fn next(&mut self) -> Result<TestVector, MutatorError> {
        let parent = self.select_parent()?;
        let mut child = parent.derive_child();
        let count = self.rng.random_range(1..=self.config.max_modifications.max(1));
        for _ in 0..count {
            let Some(modification) = self.next_modification(child.live()) else {
                return Err(MutatorError::NoApplicableKind(parent.id().clone()));
            };
            child.add_modification(modification);
        }
        let mode = if self.rng.random_bool(self.config.broadcast_probability.clamp(0.0, 1.0)) {
            ExecutionMode::Broadcast
        } else {
            ExecutionMode::Single
        };
        child.set_mode(mode);
        Ok(child)
    }
}

/// One vector per handshake shape and key-exchange family, using the default credentials.
pub fn template_seeds<R: Rng + ?Sized>(
    rng: &mut R,
    certificates: &CertificateMutator,
) -> Vec<TestVector> {
    all_seed_sequences(rng)
        .into_iter()
        .map(|messages| {
            TestVector::new(
                Genome::new(
                    messages,
                    certificates.default_server().clone(),
                    certificates.default_client().clone(),
                ),
                ExecutionMode::Single,
            )
        })
        .collect()
}
