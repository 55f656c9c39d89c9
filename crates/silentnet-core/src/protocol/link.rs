//! The message-level seam between sessions and the transport.
//!
//! Sessions never touch sockets directly.  They talk to a [`MessageLink`],
//! which is implemented by the plain [`Framer`] (employee connections), by the
//! encrypted [`SecureChannel`](crate::protocol::secure::SecureChannel) (manager
//! connections), and by [`ScriptedLink`](crate::protocol::mock::ScriptedLink)
//! in tests.

use std::io::{Read, Write};

use tracing::warn;

use crate::protocol::framing::{Frame, Framer, FramingError};
use crate::protocol::messages::{Reply, Request};

/// Outcome of one receive attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvOutcome<T> {
    /// A complete message.
    Data(T),
    /// The peer disconnected; the session must end.
    Closed,
    /// Nothing arrived before the read timeout; poll again.
    TimedOut,
    /// Bytes arrived but could not be understood.  Counts as a protocol
    /// violation.
    Malformed(String),
}

impl<T> RecvOutcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> RecvOutcome<U> {
        match self {
            RecvOutcome::Data(value) => RecvOutcome::Data(f(value)),
            RecvOutcome::Closed => RecvOutcome::Closed,
            RecvOutcome::TimedOut => RecvOutcome::TimedOut,
            RecvOutcome::Malformed(reason) => RecvOutcome::Malformed(reason),
        }
    }
}

/// A bidirectional, message-oriented connection.
pub trait MessageLink {
    /// Receives one raw payload.
    fn recv_payload(&mut self) -> RecvOutcome<Vec<u8>>;

    /// Sends one raw payload.
    fn send_payload(&mut self, payload: &[u8]) -> Result<(), FramingError>;

    /// Receives and decodes one [`Request`].
    fn recv_request(&mut self) -> RecvOutcome<Request> {
        match self.recv_payload() {
            RecvOutcome::Data(payload) => match Request::decode(&payload) {
                Ok(request) => RecvOutcome::Data(request),
                Err(e) => RecvOutcome::Malformed(e.to_string()),
            },
            RecvOutcome::Closed => RecvOutcome::Closed,
            RecvOutcome::TimedOut => RecvOutcome::TimedOut,
            RecvOutcome::Malformed(reason) => RecvOutcome::Malformed(reason),
        }
    }

    /// Encodes and sends one [`Reply`].
    fn send_reply(&mut self, reply: &Reply) -> Result<(), FramingError> {
        self.send_payload(&reply.encode())
    }

    /// Encodes and sends one [`Request`] (manager side).
    fn send_request(&mut self, request: &Request) -> Result<(), FramingError> {
        self.send_payload(&request.encode())
    }

    /// Receives and decodes one [`Reply`] (manager side).
    fn recv_reply(&mut self) -> RecvOutcome<Reply> {
        match self.recv_payload() {
            RecvOutcome::Data(payload) => match Reply::decode(&payload) {
                Ok(reply) => RecvOutcome::Data(reply),
                Err(e) => RecvOutcome::Malformed(e.to_string()),
            },
            RecvOutcome::Closed => RecvOutcome::Closed,
            RecvOutcome::TimedOut => RecvOutcome::TimedOut,
            RecvOutcome::Malformed(reason) => RecvOutcome::Malformed(reason),
        }
    }
}

impl<S: Read + Write> MessageLink for Framer<S> {
    fn recv_payload(&mut self) -> RecvOutcome<Vec<u8>> {
        match self.recv() {
            Ok(Frame::Data(payload)) => RecvOutcome::Data(payload),
            Ok(Frame::Closed) => RecvOutcome::Closed,
            Ok(Frame::TimedOut) => RecvOutcome::TimedOut,
            Err(FramingError::Io(e)) => {
                warn!(error = %e, "frame read failed; treating connection as closed");
                RecvOutcome::Closed
            }
            Err(e) => RecvOutcome::Malformed(e.to_string()),
        }
    }

    fn send_payload(&mut self, payload: &[u8]) -> Result<(), FramingError> {
        self.send(payload)
    }
}
