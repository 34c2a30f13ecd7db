//! Default protocol engine: plain TLS 1.2 record framing with no cryptography.
//!
//! Client messages are framed exactly as planned, split over as many records
//! as their `records` list asks for. Server records are read back and matched
//! against the planned server messages in order. Anything received after the
//! server switched ciphers cannot be decoded here; it is kept as observed bytes
//! and accepted as whatever message was expected.

use crate::message::{
    CONTENT_ALERT, CONTENT_CHANGE_CIPHER_SPEC, CONTENT_HANDSHAKE, Message, MessageKind, u24,
    u24_prefixed,
};
use crate::protocol::{
    Connection, ExecutionContext, ProtocolEngine, ProtocolError, ProtocolOutcome,
};
use std::collections::VecDeque;

const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_HEADER_LEN: usize = 4;
const MAX_RECORD_LEN: usize = (1 << 14) + 2048;
/// Longest fragment the 16-bit record length can describe.
const MAX_FRAGMENT_LEN: usize = u16::MAX as usize;
const PROTOCOL_VERSION: [u8; 2] = [3, 3];

/// Plays sequences as plain TLS 1.2 records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsRecordEngine;

impl TlsRecordEngine {
    pub fn new() -> Self {
        TlsRecordEngine
    }

    fn payload(message: &Message) -> Vec<u8> {
        let body = message.body();
        match message.kind.handshake_type() {
            Some(hs_type) => {
                let mut out = Vec::with_capacity(HANDSHAKE_HEADER_LEN + body.len());
                out.push(hs_type);
                out.extend_from_slice(&u24(body.len()));
                out.extend_from_slice(&body);
                out
            }
            None => body,
        }
    }

    /// Frames one message into one or more records.
    fn records(message: &Message) -> Vec<u8> {
        let payload = Self::payload(message);
        let content_type = message.kind.content_type();
        let mut chunks: Vec<&[u8]> = Vec::new();
        let mut rest = payload.as_slice();
        for &fragment in &message.records {
            if rest.is_empty() {
                break;
            }
            let (head, tail) = rest.split_at(fragment.min(rest.len()).min(MAX_FRAGMENT_LEN));
            chunks.push(head);
            rest = tail;
        }
        // Whatever the requested fragments left over goes out in records of the
        // largest length the header can carry.
        while rest.len() > MAX_FRAGMENT_LEN {
            let (head, tail) = rest.split_at(MAX_FRAGMENT_LEN);
            chunks.push(head);
            rest = tail;
        }
        if !rest.is_empty() || chunks.is_empty() {
            chunks.push(rest);
        }

        let mut out = Vec::with_capacity(payload.len() + chunks.len() * RECORD_HEADER_LEN);
        for chunk in chunks {
            out.push(content_type);
            out.extend_from_slice(&PROTOCOL_VERSION);
            out.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Fills an empty client Certificate message with the vector's client credentials.
    fn bind_credentials(message: &mut Message, context: &ExecutionContext<'_>) {
        if message.kind != MessageKind::Certificate {
            return;
        }
        let empty = message
            .field("certificates")
            .is_none_or(|field| field.value.is_empty());
        if empty {
            let list = u24_prefixed(&u24_prefixed(&context.client_credentials.certificate));
            message.set_field("certificates", list);
        }
    }
}

/// One message as received, before it is matched against the plan.
#[derive(Debug)]
struct Received {
    content_type: u8,
    /// `None` when the bytes could not be decoded.
    kind: Option<MessageKind>,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct RecordReader {
    handshake: Vec<u8>,
    queue: VecDeque<Received>,
    encrypted: bool,
}

impl RecordReader {
    fn next(&mut self, connection: &mut Connection) -> Result<Received, ProtocolError> {
        loop {
            if let Some(received) = self.queue.pop_front() {
                return Ok(received);
            }
            self.read_record(connection)?;
        }
    }

    fn read_record(&mut self, connection: &mut Connection) -> Result<(), ProtocolError> {
        let header = connection.recv_exact(RECORD_HEADER_LEN)?;
        let content_type = header[0];
        let len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if len > MAX_RECORD_LEN {
            return Err(ProtocolError::Io(format!("record of {len} bytes exceeds limit")));
        }
        let payload = connection.recv_exact(len)?;

        if self.encrypted && content_type != CONTENT_ALERT {
            self.queue.push_back(Received {
                content_type,
                kind: None,
                bytes: payload,
            });
            return Ok(());
        }

        if content_type != CONTENT_HANDSHAKE {
            if content_type == CONTENT_CHANGE_CIPHER_SPEC {
                self.encrypted = true;
            }
            self.queue.push_back(Received {
                content_type,
                kind: MessageKind::from_wire(content_type, None),
                bytes: payload,
            });
            return Ok(());
        }

        self.handshake.extend_from_slice(&payload);
        while self.handshake.len() >= HANDSHAKE_HEADER_LEN {
            let body_len = u32::from_be_bytes([
                0,
                self.handshake[1],
                self.handshake[2],
                self.handshake[3],
            ]) as usize;
            let total = HANDSHAKE_HEADER_LEN + body_len;
            if self.handshake.len() < total {
                break;
            }
            let bytes: Vec<u8> = self.handshake.drain(..total).collect();
            self.queue.push_back(Received {
                content_type,
                kind: MessageKind::from_wire(content_type, Some(bytes[0])),
                bytes,
            });
        }
        Ok(())
    }
}

fn closed(at: usize) -> ProtocolOutcome {
    ProtocolOutcome::Rejected {
        at,
        reason: "connection closed by server".to_string(),
    }
}

impl ProtocolEngine for TlsRecordEngine {
    fn name(&self) -> &'static str {
        "tls-record"
    }

    fn serialize(&self, messages: &[Message]) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::new();
        for message in messages.iter().filter(|m| m.is_client()) {
            out.extend_from_slice(&Self::records(message));
        }
        Ok(out)
    }

    fn execute(
        &self,
        messages: &mut [Message],
        connection: &mut Connection,
        context: &ExecutionContext<'_>,
    ) -> Result<ProtocolOutcome, ProtocolError> {
        let mut reader = RecordReader::default();

        for (at, message) in messages.iter_mut().enumerate() {
            if message.is_client() {
                Self::bind_credentials(message, context);
                match connection.send(&Self::records(message)) {
                    Ok(()) => continue,
                    Err(ProtocolError::Closed) => return Ok(closed(at)),
                    Err(e) => return Err(e),
                }
            }

            let received = match reader.next(connection) {
                Ok(received) => received,
                Err(ProtocolError::Closed) => return Ok(closed(at)),
                Err(e) => return Err(e),
            };

            if received.content_type == CONTENT_ALERT && message.kind != MessageKind::Alert {
                let reason = match received.bytes.as_slice() {
                    [level, description, ..] => {
                        format!("alert level {level} description {description}")
                    }
                    _ => "truncated alert".to_string(),
                };
                message.observed = Some(received.bytes);
                return Ok(ProtocolOutcome::Rejected { at, reason });
            }

            match received.kind {
                Some(kind) if kind != message.kind => {
                    return Ok(ProtocolOutcome::Rejected {
                        at,
                        reason: format!("expected {:?}, received {:?}", message.kind, kind),
                    });
                }
                // Undecodable bytes are accepted as the expected message.
                _ => message.observed = Some(received.bytes),
            }
        }

        connection.shutdown();
        Ok(ProtocolOutcome::Completed)
    }

    fn genericize(&self, messages: &mut [Message]) {
        self.reset_trace(messages);
        for message in messages {
            for field in message.fields.iter_mut().filter(|f| f.dynamic) {
                match field.name.as_str() {
                    "session_id" => field.value = vec![0],
                    "certificates" => field.value.clear(),
                    _ => field.value.iter_mut().for_each(|b| *b = 0),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::{CertKeyPair, CertificateRole};
    use crate::message::{CONTENT_APPLICATION_DATA, Field, Sender};
    use crate::template::{KeyExchange, client_message};
    use std::io::{self, Cursor, Read, Write};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct ScriptedPeer {
        incoming: Cursor<Vec<u8>>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl Read for ScriptedPeer {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.incoming.read(buf)
        }
    }

    impl Write for ScriptedPeer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn connection(server_bytes: Vec<u8>) -> (Connection, Arc<Mutex<Vec<u8>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let peer = ScriptedPeer {
            incoming: Cursor::new(server_bytes),
            written: written.clone(),
        };
        (
            Connection::from_transport(Box::new(peer), Duration::from_secs(5)),
            written,
        )
    }

    fn record(content_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![content_type, 3, 3];
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn handshake(hs_type: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![hs_type];
        out.extend_from_slice(&u24(body.len()));
        out.extend_from_slice(body);
        out
    }

    fn hello() -> Message {
        client_message(MessageKind::ClientHello, KeyExchange::Rsa, 0x002f)
    }

    #[test]
    fn serialize_splits_messages_over_requested_records() {
        let mut msg = Message::new(
            MessageKind::ApplicationData,
            Sender::Client,
            vec![Field::new("data", vec![1, 2, 3, 4, 5])],
        );
        msg.records = vec![2, 2];
        let bytes = TlsRecordEngine.serialize(&[msg, Message::expect(MessageKind::Alert)]).unwrap();
        let expected = [
            record(CONTENT_APPLICATION_DATA, &[1, 2]),
            record(CONTENT_APPLICATION_DATA, &[3, 4]),
            record(CONTENT_APPLICATION_DATA, &[5]),
        ]
        .concat();
        assert_eq!(bytes, expected, "server messages must not be serialized");
    }

    #[test]
    fn oversized_payload_is_split_instead_of_truncated() {
        let data: Vec<u8> = (0..70_000u32).map(|i| i as u8).collect();
        let mut msg = Message::new(
            MessageKind::ApplicationData,
            Sender::Client,
            vec![Field::new("data", data.clone())],
        );
        msg.records = vec![100_000];
        let bytes = TlsRecordEngine.serialize(&[msg]).unwrap();
        let expected = [
            record(CONTENT_APPLICATION_DATA, &data[..65_535]),
            record(CONTENT_APPLICATION_DATA, &data[65_535..]),
        ]
        .concat();
        assert_eq!(bytes.len(), data.len() + 2 * RECORD_HEADER_LEN);
        assert_eq!(bytes, expected, "every payload byte must be carried");
    }

    #[test]
    fn empty_message_still_produces_one_record() {
        let msg = Message::new(MessageKind::ApplicationData, Sender::Client, Vec::new());
        let bytes = TlsRecordEngine.serialize(&[msg]).unwrap();
        assert_eq!(bytes, record(CONTENT_APPLICATION_DATA, &[]));
    }

    #[test]
    fn completes_when_server_flight_matches_plan() {
        let flight = [
            handshake(2, &[3, 3, 0xaa]),
            handshake(11, &[0, 0, 0]),
            handshake(14, &[]),
        ]
        .concat();
        let (mut conn, written) = connection(record(CONTENT_HANDSHAKE, &flight));
        let mut seq = vec![
            hello(),
            Message::expect(MessageKind::ServerHello),
            Message::expect(MessageKind::Certificate),
            Message::expect(MessageKind::ServerHelloDone),
        ];
        let creds = CertKeyPair::builtin(CertificateRole::Client);
        let ctx = ExecutionContext {
            client_credentials: &creds,
        };
        let outcome = TlsRecordEngine.execute(&mut seq, &mut conn, &ctx).unwrap();
        assert_eq!(outcome, ProtocolOutcome::Completed);
        assert_eq!(seq[1].observed, Some(handshake(2, &[3, 3, 0xaa])));
        assert_eq!(seq[3].observed, Some(handshake(14, &[])));
        assert_eq!(written.lock().unwrap()[0], CONTENT_HANDSHAKE);
    }

    #[test]
    fn alert_rejects_at_the_expected_message() {
        let (mut conn, _) = connection(record(CONTENT_ALERT, &[2, 40]));
        let mut seq = vec![hello(), Message::expect(MessageKind::ServerHello)];
        let creds = CertKeyPair::builtin(CertificateRole::Client);
        let ctx = ExecutionContext {
            client_credentials: &creds,
        };
        match TlsRecordEngine.execute(&mut seq, &mut conn, &ctx).unwrap() {
            ProtocolOutcome::Rejected { at, reason } => {
                assert_eq!(at, 1);
                assert!(reason.contains("description 40"), "{reason}");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn eof_and_wrong_message_are_rejections() {
        let creds = CertKeyPair::builtin(CertificateRole::Client);
        let ctx = ExecutionContext {
            client_credentials: &creds,
        };

        let (mut conn, _) = connection(Vec::new());
        let mut seq = vec![hello(), Message::expect(MessageKind::ServerHello)];
        assert!(matches!(
            TlsRecordEngine.execute(&mut seq, &mut conn, &ctx).unwrap(),
            ProtocolOutcome::Rejected { at: 1, .. }
        ));

        let (mut conn, _) = connection(record(CONTENT_HANDSHAKE, &handshake(14, &[])));
        let mut seq = vec![hello(), Message::expect(MessageKind::ServerHello)];
        assert!(matches!(
            TlsRecordEngine.execute(&mut seq, &mut conn, &ctx).unwrap(),
            ProtocolOutcome::Rejected { at: 1, .. }
        ));
    }

    #[test]
    fn records_after_change_cipher_spec_are_accepted_undecoded() {
        let server = [
            record(CONTENT_CHANGE_CIPHER_SPEC, &[1]),
            record(CONTENT_HANDSHAKE, &[0x17, 0x99, 0x01, 0x02]),
        ]
        .concat();
        let (mut conn, _) = connection(server);
        let mut seq = vec![
            Message::expect(MessageKind::ChangeCipherSpec),
            Message::expect(MessageKind::Finished),
        ];
        let creds = CertKeyPair::builtin(CertificateRole::Client);
        let ctx = ExecutionContext {
            client_credentials: &creds,
        };
        let outcome = TlsRecordEngine.execute(&mut seq, &mut conn, &ctx).unwrap();
        assert_eq!(outcome, ProtocolOutcome::Completed);
        assert_eq!(seq[1].observed, Some(vec![0x17, 0x99, 0x01, 0x02]));
    }

    #[test]
    fn empty_client_certificate_is_filled_from_credentials() {
        let (mut conn, written) = connection(Vec::new());
        let mut seq = vec![client_message(
            MessageKind::Certificate,
            KeyExchange::Rsa,
            0x002f,
        )];
        let creds = CertKeyPair::new("c", vec![0xde, 0xad], vec![]);
        let ctx = ExecutionContext {
            client_credentials: &creds,
        };
        TlsRecordEngine.execute(&mut seq, &mut conn, &ctx).unwrap();
        let field = seq[0].field("certificates").unwrap();
        assert_eq!(field.value, vec![0, 0, 5, 0, 0, 2, 0xde, 0xad]);
        assert!(written.lock().unwrap().ends_with(&[0xde, 0xad]));
    }

    #[test]
    fn genericize_resets_known_dynamic_fields() {
        let mut msg = hello();
        msg.set_field("session_id", vec![32; 33]);
        msg.observed = Some(vec![1]);
        let mut cert = client_message(MessageKind::Certificate, KeyExchange::Rsa, 0x002f);
        cert.set_field("certificates", vec![0, 0, 1, 9]);
        let mut seq = vec![msg, cert];
        TlsRecordEngine.genericize(&mut seq);
        assert_eq!(seq[0].field("session_id").unwrap().value, vec![0]);
        assert!(seq[0].observed.is_none());
        assert!(seq[1].field("certificates").unwrap().value.is_empty());
    }
}
