//! The narrow interface to the protocol library: serialize a planned sequence,
//! play it against a live connection, and clean execution state off it.

use crate::certificate::CertKeyPair;
use crate::message::Message;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The local sequence cannot be played at all (e.g. it cannot be serialized).
    #[error("Malformed local state: {0}")]
    MalformedState(String),
    #[error("Execution deadline exceeded")]
    Timeout,
    #[error("Peer closed the connection")]
    Closed,
    #[error("Transport error: {0}")]
    Io(String),
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ProtocolError::Timeout,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ProtocolError::Closed,
            _ => ProtocolError::Io(err.to_string()),
        }
    }
}

/// How a played sequence ended at the protocol level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolOutcome {
    Completed,
    /// The server diverged from the plan at message `at` (alert, wrong message, close).
    Rejected { at: usize, reason: String },
}

/// Per-run inputs the engine needs besides the messages.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext<'a> {
    pub client_credentials: &'a CertKeyPair,
}

pub trait Transport: Read + Write + Send {}
impl<T: Read + Write + Send> Transport for T {}

/// A byte stream bounded by a hard deadline for the whole execution.
pub struct Connection {
    stream: Box<dyn Transport>,
    tcp: Option<TcpStream>,
    deadline: Instant,
}

impl Connection {
    pub fn tcp(addr: SocketAddr, timeout: Duration) -> Result<Self, ProtocolError> {
        let deadline = Instant::now() + timeout;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        let control = stream.try_clone()?;
        Ok(Self {
            stream: Box::new(stream),
            tcp: Some(control),
            deadline,
        })
    }

    /// Wraps any in-memory or custom transport. The deadline is checked between operations only.
    pub fn from_transport(stream: Box<dyn Transport>, timeout: Duration) -> Self {
        Self {
            stream,
            tcp: None,
            deadline: Instant::now() + timeout,
        }
    }

    fn arm(&mut self) -> Result<(), ProtocolError> {
        let remaining = self
            .deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
            .ok_or(ProtocolError::Timeout)?;
        if let Some(tcp) = &self.tcp {
            tcp.set_read_timeout(Some(remaining))?;
            tcp.set_write_timeout(Some(remaining))?;
        }
        Ok(())
    }

    /// Writes all of `bytes` before the deadline.
    pub fn send(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.arm()?;
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Reads exactly `len` bytes before the deadline.
    pub fn recv_exact(&mut self, len: usize) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            self.arm()?;
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => return Err(ProtocolError::Closed),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(buf)
    }

    pub fn shutdown(&mut self) {
        if let Some(tcp) = &self.tcp {
            let _ = tcp.shutdown(std::net::Shutdown::Both);
        }
    }
}

/// The protocol capability consumed by the executor and the test vectors.
pub trait ProtocolEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn serialize(&self, messages: &[Message]) -> Result<Vec<u8>, ProtocolError>;

    /// Plays `messages` against `connection`, recording received bytes on the
    /// server-sent messages. Returns `Err` only for local failures and
    /// transport-level timeouts; protocol divergence is an `Ok` outcome.
    fn execute(
        &self,
        messages: &mut [Message],
        connection: &mut Connection,
        context: &ExecutionContext<'_>,
    ) -> Result<ProtocolOutcome, ProtocolError>;

    /// Drops everything a previous execution recorded on the sequence.
    fn reset_trace(&self, messages: &mut [Message]) {
        for message in messages {
            message.clear_observed();
        }
    }

    /// Strips values tied to one specific execution so the sequence replays on any server.
    fn genericize(&self, messages: &mut [Message]) {
        self.reset_trace(messages);
        for message in messages {
            for field in message.fields.iter_mut().filter(|f| f.dynamic) {
                field.value.iter_mut().for_each(|b| *b = 0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Field, MessageKind, Sender};
    use std::io::Cursor;

    struct NullEngine;

    impl ProtocolEngine for NullEngine {
        fn name(&self) -> &'static str {
            "null"
        }
        fn serialize(&self, _messages: &[Message]) -> Result<Vec<u8>, ProtocolError> {
            Ok(Vec::new())
        }
        fn execute(
            &self,
            _messages: &mut [Message],
            _connection: &mut Connection,
            _context: &ExecutionContext<'_>,
        ) -> Result<ProtocolOutcome, ProtocolError> {
            Ok(ProtocolOutcome::Completed)
        }
    }

    #[test]
    fn default_genericize_zeroes_dynamic_fields_and_observed_bytes() {
        let mut msg = Message::new(
            MessageKind::Finished,
            Sender::Client,
            vec![
                Field::dynamic("verify_data", vec![7; 12]),
                Field::new("static", vec![1]),
            ],
        );
        msg.observed = Some(vec![1, 2, 3]);
        let mut seq = vec![msg];
        NullEngine.genericize(&mut seq);
        assert!(seq[0].observed.is_none());
        assert_eq!(seq[0].field("verify_data").unwrap().value, vec![0; 12]);
        assert_eq!(seq[0].field("static").unwrap().value, vec![1]);
    }

    #[test]
    fn in_memory_connection_reads_exact_and_reports_close() {
        let mut conn =
            Connection::from_transport(Box::new(Cursor::new(vec![1, 2, 3])), Duration::from_secs(5));
        assert_eq!(conn.recv_exact(2).unwrap(), vec![1, 2]);
        assert!(matches!(conn.recv_exact(2), Err(ProtocolError::Closed)));
    }

    #[test]
    fn expired_deadline_is_a_timeout() {
        let mut conn = Connection::from_transport(Box::new(Cursor::new(vec![0u8; 4])), Duration::ZERO);
        assert!(matches!(conn.send(&[1]), Err(ProtocolError::Timeout)));
        assert!(matches!(conn.recv_exact(1), Err(ProtocolError::Timeout)));
    }

    #[test]
    fn io_error_kinds_map_to_protocol_errors() {
        let timeout: ProtocolError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert!(matches!(timeout, ProtocolError::Timeout));
        let closed: ProtocolError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(matches!(closed, ProtocolError::Closed));
        let other: ProtocolError = io::Error::other("boom").into();
        assert!(matches!(other, ProtocolError::Io(_)));
    }
}
