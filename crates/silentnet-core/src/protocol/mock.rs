//! In-memory [`MessageLink`] for driving sessions in tests.

use std::collections::VecDeque;

use crate::protocol::framing::FramingError;
use crate::protocol::link::{MessageLink, RecvOutcome};
use crate::protocol::messages::{Reply, Request};

/// A link that replays a fixed script of incoming outcomes and records every
/// payload sent through it.
///
/// Once the script is exhausted every receive reports
/// [`RecvOutcome::Closed`], so a session under test always terminates.
#[derive(Debug, Default)]
pub struct ScriptedLink {
    incoming: VecDeque<RecvOutcome<Vec<u8>>>,
    pub sent: Vec<Vec<u8>>,
}

impl ScriptedLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_request(mut self, request: Request) -> Self {
        self.incoming.push_back(RecvOutcome::Data(request.encode()));
        self
    }

    pub fn push_raw(mut self, payload: &[u8]) -> Self {
        self.incoming.push_back(RecvOutcome::Data(payload.to_vec()));
        self
    }

    pub fn push_outcome(mut self, outcome: RecvOutcome<Vec<u8>>) -> Self {
        self.incoming.push_back(outcome);
        self
    }

    /// Number of scripted outcomes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.incoming.len()
    }

    /// Every sent payload decoded as a [`Reply`]; undecodable payloads are
    /// skipped.
    pub fn replies(&self) -> Vec<Reply> {
        self.sent
            .iter()
            .filter_map(|payload| Reply::decode(payload).ok())
            .collect()
    }
}

impl MessageLink for ScriptedLink {
    fn recv_payload(&mut self) -> RecvOutcome<Vec<u8>> {
        self.incoming.pop_front().unwrap_or(RecvOutcome::Closed)
    }

    fn send_payload(&mut self, payload: &[u8]) -> Result<(), FramingError> {
        self.sent.push(payload.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_link_replays_then_closes() {
        let mut link = ScriptedLink::new()
            .push_request(Request::ListClients)
            .push_outcome(RecvOutcome::TimedOut);

        assert_eq!(link.recv_request(), RecvOutcome::Data(Request::ListClients));
        assert_eq!(link.recv_request(), RecvOutcome::TimedOut);
        assert_eq!(link.recv_request(), RecvOutcome::Closed);
        assert_eq!(link.remaining(), 0);
    }

    #[test]
    fn test_scripted_link_records_replies() {
        let mut link = ScriptedLink::new();
        link.send_reply(&Reply::PasswordValid).unwrap();
        link.send_payload(b"garbage").unwrap();

        assert_eq!(link.sent.len(), 2);
        assert_eq!(link.replies(), vec![Reply::PasswordValid]);
    }
}
