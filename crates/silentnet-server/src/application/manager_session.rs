//! ManagerSession: the privileged console connection.
//!
//! ```text
//! Handshake ──► Authenticating ──MVC──► Authorized ──MME / close──► Closed
//!                      │
//!                      └──MIC / MAC──► Closed
//! ```
//!
//! The key exchange runs in the network layer before this type is built, so
//! the link handed to [`ManagerSession::run`] is already encrypted.  Only one
//! manager can be authorized at a time; whoever leaves the role restores the
//! default admission settings.

use std::time::Duration;

use rand::Rng;
use silentnet_core::protocol::secure::constant_time_eq;
use silentnet_core::protocol::{ClientSummary, MessageLink, Reply, Request};
use tracing::{debug, info, warn};

use super::safety::SafetyCounter;
use super::session::{local_now, next_request, SessionContext, SessionEnd};
use crate::infrastructure::storage::DeleteOutcome;

/// Upper bound of the random pause before a password verdict.
const AUTH_JITTER_MS: u64 = 50;

enum Flow {
    Continue,
    Exit,
}

pub struct ManagerSession<'a> {
    ctx: SessionContext<'a>,
    password: &'a str,
    safety: SafetyCounter,
}

impl<'a> ManagerSession<'a> {
    pub fn new(ctx: SessionContext<'a>, password: &'a str) -> Self {
        Self {
            ctx,
            password,
            safety: SafetyCounter::new(),
        }
    }

    /// Authenticates, then serves requests until the manager exits or the
    /// connection ends.
    pub fn run<L: MessageLink>(mut self, link: &mut L) -> SessionEnd {
        let end = match self.authenticate(link) {
            Ok(()) => self.serve(link),
            Err(end) => end,
        };
        self.ctx.admission.release_manager(self.ctx.session);
        info!(
            session = %self.ctx.session_id,
            ?end,
            strikes = self.safety.strikes(),
            "manager session closed"
        );
        end
    }

    fn authenticate<L: MessageLink>(&mut self, link: &mut L) -> Result<(), SessionEnd> {
        let attempt = match next_request(&self.ctx, link, &mut self.safety)? {
            Request::ManagerPassword(password) => password,
            other => {
                warn!(
                    session = %self.ctx.session_id,
                    message = %other.message_type(),
                    "expected manager password"
                );
                return Err(SessionEnd::AuthFailed);
            }
        };

        let valid = constant_time_eq(attempt.as_bytes(), self.password.as_bytes());
        let jitter = rand::thread_rng().gen_range(0..=AUTH_JITTER_MS);
        std::thread::sleep(Duration::from_millis(jitter));

        if !valid {
            warn!(session = %self.ctx.session_id, "manager password rejected");
            let _ = link.send_reply(&Reply::PasswordInvalid);
            return Err(SessionEnd::AuthFailed);
        }
        if !self.ctx.admission.try_claim_manager(self.ctx.session) {
            info!(session = %self.ctx.session_id, "manager role already taken");
            let _ = link.send_reply(&Reply::ManagerAlreadyConnected);
            return Err(SessionEnd::ManagerAlreadyConnected);
        }
        if let Err(e) = link.send_reply(&Reply::PasswordValid) {
            warn!(session = %self.ctx.session_id, error = %e, "failed to confirm login");
            return Err(SessionEnd::PeerClosed);
        }
        info!(session = %self.ctx.session_id, "manager authorized");
        Ok(())
    }

    fn serve<L: MessageLink>(&mut self, link: &mut L) -> SessionEnd {
        loop {
            let request = match next_request(&self.ctx, link, &mut self.safety) {
                Ok(request) => request,
                Err(end) => return end,
            };
            match self.handle(request, link) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => return SessionEnd::Exited,
                Err(reason) => {
                    if self.safety.strike(self.ctx.safety_threshold(), &reason) {
                        return SessionEnd::SafetyExceeded;
                    }
                }
            }
        }
    }

    fn handle<L: MessageLink>(&mut self, request: Request, link: &mut L) -> Result<Flow, String> {
        debug!(session = %self.ctx.session_id, message = %request.message_type(), "manager request");
        let storage = self.ctx.storage;
        match request {
            Request::UpdateSettings {
                max_clients,
                safety_threshold,
            } => {
                self.ctx
                    .admission
                    .update_settings(max_clients, safety_threshold)
                    .map_err(|e| e.to_string())?;
            }
            Request::ListClients => {
                let now = local_now();
                let events = storage.events();
                let rows = storage
                    .identities()
                    .list()
                    .into_iter()
                    .map(|client| ClientSummary {
                        active_percentage: events.active_percentage(client.id, now),
                        online: self.ctx.online.is_online(client.id),
                        hostname: client.hostname,
                    })
                    .collect();
                send(link, &Reply::ClientList(rows))?;
            }
            Request::ClientStats { hostname } => {
                let reply = match storage.identities().id_by_hostname(&hostname) {
                    Some(id) => {
                        let stats = storage.events().client_stats(id, local_now());
                        Reply::ClientStats(stats.to_json().map_err(|e| e.to_string())?)
                    }
                    None => Reply::ClientNotFound,
                };
                send(link, &reply)?;
            }
            Request::RenameClient { from, to } => {
                let reply = if storage.identities().rename(&from, &to) {
                    info!(from = %from, to = %to, "client renamed");
                    Reply::RenameAccepted
                } else {
                    Reply::RenameRejected
                };
                send(link, &reply)?;
            }
            Request::DeleteClient { hostname } => {
                let online = self.ctx.online;
                let outcome = storage.delete_client(&hostname, |id| online.is_online(id));
                if outcome == DeleteOutcome::NotFound {
                    warn!(hostname = %hostname, "delete requested for unknown client");
                }
            }
            Request::ManagerExit => return Ok(Flow::Exit),
            other => {
                return Err(format!("{} is not a manager request", other.message_type()));
            }
        }
        Ok(Flow::Continue)
    }
}

fn send<L: MessageLink>(link: &mut L, reply: &Reply) -> Result<(), String> {
    link.send_reply(reply).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::admission::{AdmissionControl, AdmissionSettings};
    use crate::application::session::fixtures::Harness;
    use crate::infrastructure::storage::event_log::LogKind;
    use silentnet_core::protocol::mock::ScriptedLink;

    const PASSWORD: &str = "itzik";

    fn harness() -> Harness {
        Harness::new(AdmissionSettings::default())
    }

    fn login() -> ScriptedLink {
        ScriptedLink::new().push_request(Request::ManagerPassword(PASSWORD.into()))
    }

    #[test]
    fn test_wrong_password_replies_invalid_and_ends() {
        // Arrange
        let harness = harness();
        let mut link = ScriptedLink::new()
            .push_request(Request::ManagerPassword("nope".into()))
            .push_request(Request::ListClients);

        // Act
        let end = ManagerSession::new(harness.ctx(1), PASSWORD).run(&mut link);

        // Assert
        assert_eq!(end, SessionEnd::AuthFailed);
        assert_eq!(link.replies(), vec![Reply::PasswordInvalid]);
        assert!(!harness.gate.manager_active());
    }

    #[test]
    fn test_second_manager_gets_already_connected() {
        let harness = harness();
        harness.ctx(1);
        assert!(harness.gate.try_claim_manager(1));
        let mut link = login();

        let end = ManagerSession::new(harness.ctx(2), PASSWORD).run(&mut link);

        assert_eq!(end, SessionEnd::ManagerAlreadyConnected);
        assert_eq!(link.replies(), vec![Reply::ManagerAlreadyConnected]);
        assert!(harness.gate.manager_active());
    }

    #[test]
    fn test_list_clients_reports_online_flag_and_percentage() {
        // Arrange
        let harness = harness();
        let alice = harness.storage.register_client("m1", "alice", |_| {}).unwrap().id;
        harness.storage.register_client("m2", "bob", |_| {}).unwrap();
        harness.online.add(alice);
        let mut link = login()
            .push_request(Request::ListClients)
            .push_request(Request::ManagerExit);

        // Act
        let end = ManagerSession::new(harness.ctx(1), PASSWORD).run(&mut link);

        // Assert
        assert_eq!(end, SessionEnd::Exited);
        let expected = vec![
            ClientSummary {
                hostname: "alice".into(),
                active_percentage: 100,
                online: true,
            },
            ClientSummary {
                hostname: "bob".into(),
                active_percentage: 100,
                online: false,
            },
        ];
        assert_eq!(
            link.replies(),
            vec![Reply::PasswordValid, Reply::ClientList(expected)]
        );
    }

    #[test]
    fn test_client_stats_for_unknown_host_is_not_found() {
        let harness = harness();
        let mut link = login().push_request(Request::ClientStats {
            hostname: "ghost".into(),
        });

        ManagerSession::new(harness.ctx(1), PASSWORD).run(&mut link);

        assert_eq!(link.replies()[1], Reply::ClientNotFound);
    }

    #[test]
    fn test_client_stats_returns_json_document() {
        let harness = harness();
        let id = harness.storage.register_client("m1", "alice", |_| {}).unwrap().id;
        harness
            .storage
            .events()
            .record(id, LogKind::ProcessOpen, b"firefox");
        let mut link = login().push_request(Request::ClientStats {
            hostname: "alice".into(),
        });

        ManagerSession::new(harness.ctx(1), PASSWORD).run(&mut link);

        let Reply::ClientStats(json) = &link.replies()[1] else {
            panic!("expected stats reply, got {:?}", link.replies());
        };
        let doc: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(doc["processes"]["labels"][0], "firefox");
        assert_eq!(doc["processes"]["data"][0], 1);
        assert_eq!(doc["wpm"], 0);
    }

    #[test]
    fn test_rename_collision_then_free_name() {
        // Arrange
        let harness = harness();
        harness.storage.register_client("m1", "alice", |_| {}).unwrap();
        harness.storage.register_client("m2", "bob", |_| {}).unwrap();
        let mut link = login()
            .push_request(Request::RenameClient {
                from: "alice".into(),
                to: "bob".into(),
            })
            .push_request(Request::RenameClient {
                from: "alice".into(),
                to: "carol".into(),
            })
            .push_request(Request::ListClients);

        // Act
        ManagerSession::new(harness.ctx(1), PASSWORD).run(&mut link);

        // Assert
        let replies = link.replies();
        assert_eq!(replies[1], Reply::RenameRejected);
        assert_eq!(replies[2], Reply::RenameAccepted);
        let Reply::ClientList(rows) = &replies[3] else {
            panic!("expected client list");
        };
        let names: Vec<&str> = rows.iter().map(|r| r.hostname.as_str()).collect();
        assert_eq!(names, vec!["carol", "bob"]);
    }

    #[test]
    fn test_update_settings_applies_while_authorized() {
        // Arrange
        let harness = harness();
        let mut link = login().push_request(Request::UpdateSettings {
            max_clients: 12,
            safety_threshold: 2,
        });
        let mut session = ManagerSession::new(harness.ctx(1), PASSWORD);
        session.authenticate(&mut link).unwrap();

        // Act: serve without the release that `run` performs on return.
        let end = session.serve(&mut link);

        // Assert
        assert_eq!(end, SessionEnd::PeerClosed);
        assert_eq!(
            harness.gate.settings(),
            AdmissionSettings {
                max_clients: 12,
                safety_threshold: 2
            }
        );
    }

    #[test]
    fn test_session_end_resets_settings_and_manager_flag() {
        let harness = harness();
        let mut link = login()
            .push_request(Request::UpdateSettings {
                max_clients: 12,
                safety_threshold: 2,
            })
            .push_request(Request::ManagerExit);

        let end = ManagerSession::new(harness.ctx(1), PASSWORD).run(&mut link);

        assert_eq!(end, SessionEnd::Exited);
        assert_eq!(harness.gate.settings(), AdmissionSettings::default());
        assert!(!harness.gate.manager_active());
    }

    #[test]
    fn test_out_of_range_settings_are_struck_and_ignored() {
        let harness = harness();
        let mut link = login().push_request(Request::UpdateSettings {
            max_clients: 99,
            safety_threshold: 3,
        });
        let mut session = ManagerSession::new(harness.ctx(1), PASSWORD);
        session.authenticate(&mut link).unwrap();

        assert_eq!(session.serve(&mut link), SessionEnd::PeerClosed);

        assert_eq!(session.safety.strikes(), 1);
        assert_eq!(harness.gate.settings().max_clients, 5);
    }

    #[test]
    fn test_delete_offline_client_removes_it() {
        let harness = harness();
        harness.storage.register_client("m1", "alice", |_| {}).unwrap();
        let mut link = login()
            .push_request(Request::DeleteClient {
                hostname: "alice".into(),
            })
            .push_request(Request::ListClients);

        ManagerSession::new(harness.ctx(1), PASSWORD).run(&mut link);

        assert_eq!(link.replies()[1], Reply::ClientList(vec![]));
    }

    #[test]
    fn test_employee_event_on_manager_session_is_struck() {
        let harness = harness();
        let mut link = login()
            .push_request(Request::ProcessOpen("vim".into()))
            .push_request(Request::ManagerExit);
        let mut session = ManagerSession::new(harness.ctx(1), PASSWORD);
        session.authenticate(&mut link).unwrap();

        assert_eq!(session.serve(&mut link), SessionEnd::Exited);
        assert_eq!(session.safety.strikes(), 1);
    }
}
