//! Structural edits to a planned message sequence.
//!
//! Every [`Modification`] is a value: it carries everything needed to apply it
//! again, so the replay log of a test vector plus its seed rebuilds the exact
//! same genome. Applying never touches the input genome; it returns a new one.

use crate::certificate::CertKeyPair;
use crate::message::Message;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while applying a modification to a genome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModificationError {
    /// The target index or field does not exist in the sequence the edit was applied to.
    #[error("{kind} has no valid target: {detail}")]
    MalformedTarget {
        kind: ModificationKind,
        detail: String,
    },
}

/// Everything a modification may change: the messages and the credentials.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Genome {
    pub messages: Vec<Message>,
    pub server_credentials: CertKeyPair,
    pub client_credentials: CertKeyPair,
}

impl Genome {
    pub fn new(
        messages: Vec<Message>,
        server_credentials: CertKeyPair,
        client_credentials: CertKeyPair,
    ) -> Self {
        Self {
            messages,
            server_credentials,
            client_credentials,
        }
    }
}

/// An edit to the bytes of a single field.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum FieldEdit {
    Replace { bytes: Vec<u8> },
    FlipBits { offset: usize, mask: u8 },
    Truncate { len: usize },
    Extend { bytes: Vec<u8> },
}

impl FieldEdit {
    fn apply(&self, value: &mut Vec<u8>) -> Result<(), String> {
        match self {
            FieldEdit::Replace { bytes } => *value = bytes.clone(),
            FieldEdit::FlipBits { offset, mask } => match value.get_mut(*offset) {
                Some(byte) => *byte ^= mask,
                None => return Err(format!("offset {offset} beyond field of {}", value.len())),
            },
            FieldEdit::Truncate { len } => {
                if *len > value.len() {
                    return Err(format!("truncate to {len} beyond field of {}", value.len()));
                }
                value.truncate(*len);
            }
            FieldEdit::Extend { bytes } => value.extend_from_slice(bytes),
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Modification {
    /// Inserts `message` at `position`, or appends it when `position` is `None`.
    AddMessage {
        position: Option<usize>,
        message: Message,
    },
    /// Splits the message at `index` over one more record of `fragment` bytes.
    AddRecord { index: usize, fragment: usize },
    /// Inserts a copy of the message at `index` right after it.
    DuplicateMessage { index: usize },
    ModifyField {
        index: usize,
        field: String,
        edit: FieldEdit,
    },
    RemoveMessage { index: usize },
    /// Moves the message at `from` so that it ends up at `to`.
    Reorder { from: usize, to: usize },
    ChangeClientCertificate { pair: CertKeyPair },
    ChangeServerCertificate { pair: CertKeyPair },
}

/// The field-less discriminant of `Modification`, used for statistics.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum ModificationKind {
    AddMessage,
    AddRecord,
    DuplicateMessage,
    ModifyField,
    RemoveMessage,
    Reorder,
    ChangeClientCertificate,
    ChangeServerCertificate,
}

impl ModificationKind {
    pub const ALL: [ModificationKind; 8] = [
        ModificationKind::AddMessage,
        ModificationKind::AddRecord,
        ModificationKind::DuplicateMessage,
        ModificationKind::ModifyField,
        ModificationKind::RemoveMessage,
        ModificationKind::Reorder,
        ModificationKind::ChangeClientCertificate,
        ModificationKind::ChangeServerCertificate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ModificationKind::AddMessage => "add-message",
            ModificationKind::AddRecord => "add-record",
            ModificationKind::DuplicateMessage => "duplicate-message",
            ModificationKind::ModifyField => "modify-field",
            ModificationKind::RemoveMessage => "remove-message",
            ModificationKind::Reorder => "reorder",
            ModificationKind::ChangeClientCertificate => "change-client-certificate",
            ModificationKind::ChangeServerCertificate => "change-server-certificate",
        }
    }
}

impl fmt::Display for ModificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened when a modification was added to a vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The edit had no valid target and was recorded as a no-op.
    Skipped(ModificationError),
}

impl Modification {
    /// The discriminant of this modification.
    pub fn kind(&self) -> ModificationKind {
        match self {
            Modification::AddMessage { .. } => ModificationKind::AddMessage,
            Modification::AddRecord { .. } => ModificationKind::AddRecord,
            Modification::DuplicateMessage { .. } => ModificationKind::DuplicateMessage,
            Modification::ModifyField { .. } => ModificationKind::ModifyField,
            Modification::RemoveMessage { .. } => ModificationKind::RemoveMessage,
            Modification::Reorder { .. } => ModificationKind::Reorder,
            Modification::ChangeClientCertificate { .. } => {
                ModificationKind::ChangeClientCertificate
            }
            Modification::ChangeServerCertificate { .. } => {
                ModificationKind::ChangeServerCertificate
            }
        }
    }

    fn malformed(&self, detail: String) -> ModificationError {
        ModificationError::MalformedTarget {
            kind: self.kind(),
            detail,
        }
    }

    fn check_index(&self, index: usize, len: usize) -> Result<(), ModificationError> {
        if index >= len {
            return Err(self.malformed(format!("index {index} in sequence of {len}")));
        }
        Ok(())
    }

    /// Returns the genome with this modification applied; `genome` is left untouched.
    pub fn apply(&self, genome: &Genome) -> Result<Genome, ModificationError> {
        let mut next = genome.clone();
        let len = next.messages.len();
        match self {
            Modification::AddMessage { position, message } => match position {
                None => next.messages.push(message.clone()),
                Some(pos) if *pos <= len => next.messages.insert(*pos, message.clone()),
                Some(pos) => {
                    return Err(self.malformed(format!("position {pos} in sequence of {len}")));
                }
            },
            Modification::AddRecord { index, fragment } => {
                self.check_index(*index, len)?;
                next.messages[*index].records.push(*fragment);
            }
            Modification::DuplicateMessage { index } => {
                self.check_index(*index, len)?;
                let copy = next.messages[*index].clone();
                next.messages.insert(index + 1, copy);
            }
            Modification::ModifyField { index, field, edit } => {
                self.check_index(*index, len)?;
                let target = next.messages[*index]
                    .field_mut(field)
                    .ok_or_else(|| self.malformed(format!("no field '{field}' at {index}")))?;
                edit.apply(&mut target.value)
                    .map_err(|detail| self.malformed(detail))?;
                // The fuzzer chose this value; it no longer depends on a prior run.
                target.dynamic = false;
            }
            Modification::RemoveMessage { index } => {
                self.check_index(*index, len)?;
                next.messages.remove(*index);
            }
            Modification::Reorder { from, to } => {
                self.check_index(*from, len)?;
                self.check_index(*to, len)?;
                let moved = next.messages.remove(*from);
                next.messages.insert(*to, moved);
            }
            Modification::ChangeClientCertificate { pair } => {
                next.client_credentials = pair.clone();
            }
            Modification::ChangeServerCertificate { pair } => {
                next.server_credentials = pair.clone();
            }
        }
        Ok(next)
    }
}
