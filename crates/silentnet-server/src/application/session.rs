//! What every session needs from the server, and the receive loop both
//! session kinds share.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDateTime;
use silentnet_core::protocol::{MessageLink, RecvOutcome, Request};
use uuid::Uuid;

use super::admission::{AdmissionControl, SessionNo};
use super::online::OnlineRegistry;
use super::safety::SafetyCounter;
use crate::infrastructure::storage::Storage;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer closed the socket (or the socket failed).
    PeerClosed,
    /// The server is shutting down.
    Shutdown,
    /// Too many unsafe messages.
    SafetyExceeded,
    /// The manager sent `MME`.
    Exited,
    /// Wrong manager password, or an unexpected first message.
    AuthFailed,
    /// Another manager was authorized first.
    ManagerAlreadyConnected,
    /// Identity could not be resolved or stored.
    Rejected,
}

/// Borrowed server state handed to one session thread.
#[derive(Clone, Copy)]
pub struct SessionContext<'a> {
    pub session: SessionNo,
    pub session_id: Uuid,
    pub storage: &'a Storage,
    pub admission: &'a dyn AdmissionControl,
    pub online: &'a OnlineRegistry,
    pub running: &'a AtomicBool,
}

impl<'a> SessionContext<'a> {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn safety_threshold(&self) -> u8 {
        self.admission.settings().safety_threshold
    }
}

impl std::fmt::Debug for SessionContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("session", &self.session)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Local wall-clock time, the timebase of every stored timestamp.
pub fn local_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// Blocks until the next well-formed request.
///
/// Timeouts are polled through (checking the running flag); malformed
/// payloads are struck against `safety` and skipped.  Returns the reason the
/// session must end instead when it must.
pub fn next_request<L: MessageLink>(
    ctx: &SessionContext<'_>,
    link: &mut L,
    safety: &mut SafetyCounter,
) -> Result<Request, SessionEnd> {
    loop {
        match link.recv_request() {
            RecvOutcome::Data(request) => return Ok(request),
            RecvOutcome::TimedOut => {
                if !ctx.is_running() {
                    return Err(SessionEnd::Shutdown);
                }
            }
            RecvOutcome::Closed => return Err(SessionEnd::PeerClosed),
            RecvOutcome::Malformed(reason) => {
                if safety.strike(ctx.safety_threshold(), &reason) {
                    return Err(SessionEnd::SafetyExceeded);
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::Harness;
    use super::*;
    use crate::application::admission::AdmissionSettings;
    use silentnet_core::protocol::mock::ScriptedLink;

    #[test]
    fn test_next_request_skips_timeouts_while_running() {
        let harness = Harness::new(AdmissionSettings::default());
        let ctx = harness.ctx(1);
        let mut link = ScriptedLink::new()
            .push_outcome(RecvOutcome::TimedOut)
            .push_request(Request::ListClients);

        let request = next_request(&ctx, &mut link, &mut SafetyCounter::new());

        assert_eq!(request, Ok(Request::ListClients));
    }

    #[test]
    fn test_next_request_ends_on_timeout_after_shutdown() {
        let harness = Harness::new(AdmissionSettings::default());
        harness.running.store(false, Ordering::Relaxed);
        let ctx = harness.ctx(1);
        let mut link = ScriptedLink::new().push_outcome(RecvOutcome::TimedOut);

        let request = next_request(&ctx, &mut link, &mut SafetyCounter::new());

        assert_eq!(request, Err(SessionEnd::Shutdown));
    }

    #[test]
    fn test_next_request_strikes_malformed_payloads() {
        // Arrange
        let harness = Harness::new(AdmissionSettings::default());
        let ctx = harness.ctx(1);
        let mut link = ScriptedLink::new()
            .push_raw(b"???")
            .push_raw(b"MGC\x1fextra")
            .push_request(Request::ManagerExit);
        let mut safety = SafetyCounter::new();

        // Act
        let request = next_request(&ctx, &mut link, &mut safety);

        // Assert
        assert_eq!(request, Ok(Request::ManagerExit));
        assert_eq!(safety.strikes(), 2);
    }
}
