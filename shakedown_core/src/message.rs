use serde::{Deserialize, Serialize};

/// Record content types as they appear on the wire.
pub const CONTENT_CHANGE_CIPHER_SPEC: u8 = 20;
pub const CONTENT_ALERT: u8 = 21;
pub const CONTENT_HANDSHAKE: u8 = 22;
pub const CONTENT_APPLICATION_DATA: u8 = 23;

/// The kind of a protocol message inside a planned execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    HelloRequest,
    ClientHello,
    ServerHello,
    Certificate,
    ServerKeyExchange,
    CertificateRequest,
    ServerHelloDone,
    CertificateVerify,
    ClientKeyExchange,
    Finished,
    ChangeCipherSpec,
    Alert,
    ApplicationData,
}

impl MessageKind {
    pub const ALL: [MessageKind; 13] = [
        MessageKind::HelloRequest,
        MessageKind::ClientHello,
        MessageKind::ServerHello,
        MessageKind::Certificate,
        MessageKind::ServerKeyExchange,
        MessageKind::CertificateRequest,
        MessageKind::ServerHelloDone,
        MessageKind::CertificateVerify,
        MessageKind::ClientKeyExchange,
        MessageKind::Finished,
        MessageKind::ChangeCipherSpec,
        MessageKind::Alert,
        MessageKind::ApplicationData,
    ];

    pub fn content_type(self) -> u8 {
        match self {
            MessageKind::ChangeCipherSpec => CONTENT_CHANGE_CIPHER_SPEC,
            MessageKind::Alert => CONTENT_ALERT,
            MessageKind::ApplicationData => CONTENT_APPLICATION_DATA,
            _ => CONTENT_HANDSHAKE,
        }
    }

    pub fn handshake_type(self) -> Option<u8> {
        match self {
            MessageKind::HelloRequest => Some(0),
            MessageKind::ClientHello => Some(1),
            MessageKind::ServerHello => Some(2),
            MessageKind::Certificate => Some(11),
            MessageKind::ServerKeyExchange => Some(12),
            MessageKind::CertificateRequest => Some(13),
            MessageKind::ServerHelloDone => Some(14),
            MessageKind::CertificateVerify => Some(15),
            MessageKind::ClientKeyExchange => Some(16),
            MessageKind::Finished => Some(20),
            MessageKind::ChangeCipherSpec | MessageKind::Alert | MessageKind::ApplicationData => {
                None
            }
        }
    }

    /// Maps a received record back to a message kind.
    pub fn from_wire(content_type: u8, handshake_type: Option<u8>) -> Option<Self> {
        match content_type {
            CONTENT_CHANGE_CIPHER_SPEC => Some(MessageKind::ChangeCipherSpec),
            CONTENT_ALERT => Some(MessageKind::Alert),
            CONTENT_APPLICATION_DATA => Some(MessageKind::ApplicationData),
            CONTENT_HANDSHAKE => {
                let wanted = handshake_type?;
                MessageKind::ALL
                    .iter()
                    .copied()
                    .find(|kind| kind.handshake_type() == Some(wanted))
            }
            _ => None,
        }
    }
}

/// Which peer sends a message.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Sender {
    Client,
    Server,
}

/// A named, already-encoded piece of a message body.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub value: Vec<u8>,
    /// Set for values that depend on a specific prior execution (echoed session
    /// ids, verify data) and must be dropped before replaying elsewhere.
    #[serde(default)]
    pub dynamic: bool,
}

impl Field {
    pub fn new(name: &str, value: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            value,
            dynamic: false,
        }
    }

    pub fn dynamic(name: &str, value: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            value,
            dynamic: true,
        }
    }
}

/// One planned protocol message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub sender: Sender,
    #[serde(default)]
    pub fields: Vec<Field>,
    /// Record fragment sizes. Empty means the message travels in one record;
    /// the bytes left over after the listed fragments form a final record.
    #[serde(default)]
    pub records: Vec<usize>,
    /// Bytes received for this message during the last execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<Vec<u8>>,
}

impl Message {
    pub fn new(kind: MessageKind, sender: Sender, fields: Vec<Field>) -> Self {
        Self {
            kind,
            sender,
            fields,
            records: Vec::new(),
            observed: None,
        }
    }

    /// A message the server is expected to send. Its body is whatever arrives.
    pub fn expect(kind: MessageKind) -> Self {
        Self::new(kind, Sender::Server, Vec::new())
    }

    pub fn is_client(&self) -> bool {
        self.sender == Sender::Client
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut Field> {
        self.fields.iter_mut().find(|f| f.name == name)
    }

    /// Replaces the value of `name`, appending the field when it does not exist yet.
    pub fn set_field(&mut self, name: &str, value: Vec<u8>) {
        match self.field_mut(name) {
            Some(field) => field.value = value,
            None => self.fields.push(Field::new(name, value)),
        }
    }

    /// The concatenated field values.
    pub fn body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.fields.iter().map(|f| f.value.len()).sum());
        for field in &self.fields {
            body.extend_from_slice(&field.value);
        }
        body
    }

    /// Clears everything a previous execution left behind on this message.
    pub fn clear_observed(&mut self) {
        self.observed = None;
    }
}

pub fn u16_prefixed(bytes: &[u8]) -> Vec<u8> {
    let len = bytes.len().min(u16::MAX as usize) as u16;
    let mut out = len.to_be_bytes().to_vec();
    out.extend_from_slice(&bytes[..len as usize]);
    out
}

pub fn u24_prefixed(bytes: &[u8]) -> Vec<u8> {
    let len = bytes.len().min(0x00ff_ffff);
    let mut out = u24(len).to_vec();
    out.extend_from_slice(&bytes[..len]);
    out
}

pub fn u24(len: usize) -> [u8; 3] {
    let len = len.min(0x00ff_ffff) as u32;
    let be = len.to_be_bytes();
    [be[1], be[2], be[3]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_mapping_round_trips_every_handshake_kind() {
        for kind in MessageKind::ALL {
            let mapped = MessageKind::from_wire(kind.content_type(), kind.handshake_type());
            assert_eq!(mapped, Some(kind), "kind {kind:?} should map back from the wire");
        }
        assert_eq!(MessageKind::from_wire(99, None), None);
        assert_eq!(MessageKind::from_wire(CONTENT_HANDSHAKE, Some(200)), None);
    }

    #[test]
    fn set_field_replaces_or_appends() {
        let mut msg = Message::new(
            MessageKind::ClientHello,
            Sender::Client,
            vec![Field::new("version", vec![3, 3])],
        );
        msg.set_field("version", vec![3, 1]);
        msg.set_field("random", vec![0xAA; 4]);
        assert_eq!(msg.field("version").unwrap().value, vec![3, 1]);
        assert_eq!(msg.body(), vec![3, 1, 0xAA, 0xAA, 0xAA, 0xAA]);
    }

    #[test]
    fn length_prefix_helpers_encode_big_endian() {
        assert_eq!(u16_prefixed(&[1, 2]), vec![0, 2, 1, 2]);
        assert_eq!(u24_prefixed(&[9]), vec![0, 0, 1, 9]);
        assert_eq!(u24(0x010203), [1, 2, 3]);
    }
}
