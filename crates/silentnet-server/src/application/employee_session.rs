//! EmployeeSession: ingests the event stream of one monitored machine.
//!
//! ```text
//! Authenticating ──CAU──► Streaming ──close / shutdown / safety──► Closed
//! ```
//!
//! The `CAU` message itself is consumed by the connection server during
//! classification; [`EmployeeSession::start`] receives its two fields.

use silentnet_core::protocol::{MessageLink, Request};
use tracing::{debug, info, trace, warn};

use super::process_filter::{ProcessDebouncer, ProcessFilter};
use super::safety::SafetyCounter;
use super::session::{local_now, next_request, SessionContext, SessionEnd};
use crate::infrastructure::storage::event_log::LogKind;

pub struct EmployeeSession<'a> {
    ctx: SessionContext<'a>,
    client_id: i64,
    hostname: String,
    filter: &'a ProcessFilter,
    debouncer: ProcessDebouncer,
    safety: SafetyCounter,
}

impl<'a> EmployeeSession<'a> {
    /// Resolves (or creates) the identity for `mac` and marks it online.
    ///
    /// Returns `None` when either field is empty or storage fails; the
    /// connection should then be dropped.
    pub fn start(
        ctx: SessionContext<'a>,
        filter: &'a ProcessFilter,
        debouncer: ProcessDebouncer,
        mac: &str,
        hostname: &str,
    ) -> Option<Self> {
        if mac.trim().is_empty() || hostname.trim().is_empty() {
            warn!(session = %ctx.session_id, "employee authentication with empty field");
            return None;
        }
        let registration = ctx
            .storage
            .register_client(mac, hostname, |id| ctx.online.add(id))?;
        info!(
            session = %ctx.session_id,
            client_id = registration.id,
            mac,
            hostname,
            new = registration.created,
            "employee connected"
        );
        Some(Self {
            ctx,
            client_id: registration.id,
            hostname: hostname.to_string(),
            filter,
            debouncer,
            safety: SafetyCounter::new(),
        })
    }

    pub fn client_id(&self) -> i64 {
        self.client_id
    }

    /// Streams events until the connection ends.  The client goes offline on
    /// return; its stored rows are kept.
    pub fn run<L: MessageLink>(mut self, link: &mut L) -> SessionEnd {
        let end = loop {
            let request = match next_request(&self.ctx, link, &mut self.safety) {
                Ok(request) => request,
                Err(end) => break end,
            };
            if let Err(reason) = self.handle(request) {
                if self.safety.strike(self.ctx.safety_threshold(), &reason) {
                    break SessionEnd::SafetyExceeded;
                }
            }
        };

        self.ctx.online.remove(self.client_id);
        info!(
            session = %self.ctx.session_id,
            client_id = self.client_id,
            hostname = %self.hostname,
            ?end,
            strikes = self.safety.strikes(),
            "employee disconnected"
        );
        end
    }

    /// Applies one event.  `Err` carries the reason it counts as unsafe.
    fn handle(&mut self, request: Request) -> Result<(), String> {
        let id = self.client_id;
        let events = self.ctx.storage.events();
        match request {
            Request::ProcessOpen(name) => {
                let name = non_empty(name)?;
                if self.filter.is_ignored(&name) {
                    trace!(client_id = id, process = %name, "ignored system process");
                } else if !self.debouncer.should_log(&name) {
                    trace!(client_id = id, process = %name, "debounced process");
                } else {
                    events.record(id, LogKind::ProcessOpen, name.as_bytes());
                }
            }
            Request::ProcessClose(name) => {
                debug!(client_id = id, process = %non_empty(name)?, "process closed");
            }
            Request::InputEvent(payload) => {
                events.record_input(id, non_empty(payload)?.as_bytes(), local_now());
            }
            Request::CpuUsage(batch) => {
                events.append_cpu_usage(id, &non_empty(batch)?);
            }
            Request::IpContact(address) => {
                events.record(id, LogKind::IpContact, non_empty(address)?.as_bytes());
            }
            other => {
                return Err(format!(
                    "{} is not an employee event",
                    other.message_type()
                ));
            }
        }
        Ok(())
    }
}

fn non_empty(field: String) -> Result<String, String> {
    if field.trim().is_empty() {
        Err("empty event payload".to_string())
    } else {
        Ok(field)
    }
}
