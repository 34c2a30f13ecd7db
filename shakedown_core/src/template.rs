//! Baseline handshake templates used to seed the fuzzer when no corpus exists.

use crate::message::{Field, Message, MessageKind, Sender, u16_prefixed};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Key exchange family a seed sequence is built for.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum KeyExchange {
    Rsa,
    Dhe,
    Ecdhe,
    /// Suites the templates know no key exchange for; no ClientKeyExchange is planned.
    Unsupported,
}

impl KeyExchange {
    pub const ALL: [KeyExchange; 4] = [
        KeyExchange::Rsa,
        KeyExchange::Dhe,
        KeyExchange::Ecdhe,
        KeyExchange::Unsupported,
    ];

    pub fn is_ephemeral(self) -> bool {
        matches!(self, KeyExchange::Dhe | KeyExchange::Ecdhe)
    }

    pub fn cipher_suites(self) -> &'static [u16] {
        match self {
            KeyExchange::Rsa => &[0x002f, 0x0035, 0x003c, 0x009c, 0x009d],
            KeyExchange::Dhe => &[0x0033, 0x0039, 0x0067, 0x009e, 0x009f],
            KeyExchange::Ecdhe => &[0xc009, 0xc013, 0xc014, 0xc02b, 0xc02f, 0xcca8],
            KeyExchange::Unsupported => &[0x0000, 0x00ff, 0x5600],
        }
    }
}

/// How far into the connection a seed sequence goes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum HandshakeShape {
    /// Only the ClientHello.
    Hello,
    /// ClientHello and the complete first server flight.
    ServerResponse,
    /// A complete handshake including both Finished messages.
    Handshake,
    /// A handshake followed by one application data exchange.
    Full,
}

impl HandshakeShape {
    pub const ALL: [HandshakeShape; 4] = [
        HandshakeShape::Hello,
        HandshakeShape::ServerResponse,
        HandshakeShape::Handshake,
        HandshakeShape::Full,
    ];
}

/// Builds a client-sent message of `kind` with plausible default field values.
pub fn client_message(kind: MessageKind, family: KeyExchange, suite: u16) -> Message {
    let fields = match kind {
        MessageKind::ClientHello => {
            let random: Vec<u8> = (0..32u8).map(|i| i.wrapping_mul(7).wrapping_add(1)).collect();
            vec![
                Field::new("version", vec![3, 3]),
                Field::new("random", random),
                Field::dynamic("session_id", vec![0]),
                Field::new("cipher_suites", u16_prefixed(&suite.to_be_bytes())),
                Field::new("compression", vec![1, 0]),
                Field::new(
                    "extensions",
                    u16_prefixed(&[0x00, 0x0b, 0x00, 0x02, 0x01, 0x00]),
                ),
            ]
        }
        MessageKind::ClientKeyExchange => match family {
            KeyExchange::Rsa => {
                let mut premaster = vec![3, 3];
                premaster.extend((0..46u8).map(|i| i ^ 0x5a));
                vec![Field::new("encrypted_premaster", u16_prefixed(&premaster))]
            }
            KeyExchange::Dhe => {
                let public: Vec<u8> = (0..128u8).map(|i| i.wrapping_add(0x11)).collect();
                vec![Field::new("public_key", u16_prefixed(&public))]
            }
            KeyExchange::Ecdhe | KeyExchange::Unsupported => {
                let mut point = vec![65, 0x04];
                point.extend((0..64u8).map(|i| i.wrapping_mul(3)));
                vec![Field::new("public_point", point)]
            }
        },
        // Filled from the vector's client credentials at execution time when empty.
        MessageKind::Certificate => vec![Field::dynamic("certificates", Vec::new())],
        MessageKind::CertificateVerify => vec![
            Field::new("algorithm", vec![4, 1]),
            Field::dynamic("signature", u16_prefixed(&[0u8; 64])),
        ],
        MessageKind::ChangeCipherSpec => vec![Field::new("payload", vec![1])],
        MessageKind::Finished => vec![Field::dynamic("verify_data", vec![0; 12])],
        MessageKind::ApplicationData => {
            vec![Field::new("data", b"GET / HTTP/1.0\r\n\r\n".to_vec())]
        }
        MessageKind::Alert => vec![Field::new("level", vec![1]), Field::new("description", vec![0])],
        MessageKind::ServerHello => vec![
            Field::new("version", vec![3, 3]),
            Field::new("random", vec![0; 32]),
            Field::new("session_id", vec![0]),
            Field::new("cipher_suite", suite.to_be_bytes().to_vec()),
            Field::new("compression", vec![0]),
        ],
        MessageKind::HelloRequest
        | MessageKind::ServerKeyExchange
        | MessageKind::CertificateRequest
        | MessageKind::ServerHelloDone => Vec::new(),
    };
    Message::new(kind, Sender::Client, fields)
}

/// The message sequence for one (shape, family) combination.
pub fn seed_sequence(shape: HandshakeShape, family: KeyExchange, suite: u16) -> Vec<Message> {
    let mut messages = vec![client_message(MessageKind::ClientHello, family, suite)];
    if shape == HandshakeShape::Hello {
        return messages;
    }

    messages.push(Message::expect(MessageKind::ServerHello));
    messages.push(Message::expect(MessageKind::Certificate));
    if family.is_ephemeral() {
        messages.push(Message::expect(MessageKind::ServerKeyExchange));
    }
    messages.push(Message::expect(MessageKind::ServerHelloDone));
    if shape == HandshakeShape::ServerResponse {
        return messages;
    }

    if family != KeyExchange::Unsupported {
        messages.push(client_message(MessageKind::ClientKeyExchange, family, suite));
    }
    messages.push(client_message(MessageKind::ChangeCipherSpec, family, suite));
    messages.push(client_message(MessageKind::Finished, family, suite));
    messages.push(Message::expect(MessageKind::ChangeCipherSpec));
    messages.push(Message::expect(MessageKind::Finished));
    if shape == HandshakeShape::Handshake {
        return messages;
    }

    messages.push(client_message(MessageKind::ApplicationData, family, suite));
    messages.push(Message::expect(MessageKind::ApplicationData));
    messages
}

/// One sequence per shape and family, each offering a random suite of that family.
pub fn all_seed_sequences<R: Rng + ?Sized>(rng: &mut R) -> Vec<Vec<Message>> {
    let mut sequences = Vec::new();
    for family in KeyExchange::ALL {
        for shape in HandshakeShape::ALL {
            let suites = family.cipher_suites();
            let suite = suites[rng.random_range(0..suites.len())];
            sequences.push(seed_sequence(shape, family, suite));
        }
    }
    sequences
}
