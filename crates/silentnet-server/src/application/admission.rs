//! Admission control: the live-session registry and the settings a manager
//! may change, guarded by one mutex and one condition variable.
//!
//! # Rules
//!
//! - The accept loop may take a new socket whenever fewer than
//!   `max_clients` non-manager sessions are live, or when no manager is
//!   connected.  Otherwise it waits on the condition variable.
//! - An employee is admitted only while fewer than `max_clients` employees
//!   are live.
//! - At most one manager is authorized at a time.  When it leaves the
//!   settings fall back to their defaults.
//!
//! Every change that can open a slot (a session leaving, a manager leaving,
//! a settings update) calls `notify_all`.
//!
//! The registry is generic over a per-session handle `H` so the network
//! layer can keep whatever it needs to interrupt a session on shutdown
//! without this module knowing about sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, info};

use crate::infrastructure::storage::config::{
    DEFAULT_MAX_CLIENTS, DEFAULT_SAFETY_THRESHOLD, MAX_CLIENTS_RANGE, SAFETY_THRESHOLD_RANGE,
};

/// Sequential number the server assigns to each accepted connection.
pub type SessionNo = u64;

/// What a connection turned out to be after classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unclassified,
    Employee,
    Manager,
}

/// The two knobs a manager can turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionSettings {
    pub max_clients: u32,
    pub safety_threshold: u8,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            max_clients: DEFAULT_MAX_CLIENTS,
            safety_threshold: DEFAULT_SAFETY_THRESHOLD,
        }
    }
}

/// A settings update outside the accepted ranges.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("max clients {0} outside 1..=40")]
    MaxClients(u32),
    #[error("safety threshold {0} outside 1..=5")]
    SafetyThreshold(u8),
}

/// The operations sessions need from admission control.
pub trait AdmissionControl: Send + Sync {
    fn settings(&self) -> AdmissionSettings;

    /// Validates and applies new settings, waking the accept loop.
    fn update_settings(&self, max_clients: u32, safety_threshold: u8) -> Result<(), SettingsError>;

    /// Marks `session` as the authorized manager.  Returns `false` if another
    /// manager already holds the role.
    fn try_claim_manager(&self, session: SessionNo) -> bool;

    /// Gives up the manager role held by `session` and resets the settings.
    fn release_manager(&self, session: SessionNo);
}

struct SessionEntry<H> {
    role: Role,
    handle: H,
}

struct AdmissionState<H> {
    settings: AdmissionSettings,
    sessions: HashMap<SessionNo, SessionEntry<H>>,
    active_manager: Option<SessionNo>,
}

impl<H> AdmissionState<H> {
    fn count(&self, pred: impl Fn(Role) -> bool) -> usize {
        self.sessions.values().filter(|entry| pred(entry.role)).count()
    }

    fn has_slot(&self) -> bool {
        let non_manager = self.count(|role| role != Role::Manager);
        self.active_manager.is_none() || non_manager < self.settings.max_clients as usize
    }

    fn release(&mut self, session: SessionNo) -> bool {
        if self.active_manager != Some(session) {
            return false;
        }
        self.active_manager = None;
        self.settings = AdmissionSettings::default();
        if let Some(entry) = self.sessions.get_mut(&session) {
            entry.role = Role::Unclassified;
        }
        true
    }
}

/// Process-wide admission state shared by the accept loop and every
/// session thread.
pub struct AdmissionGate<H> {
    state: Mutex<AdmissionState<H>>,
    changed: Condvar,
}

impl<H> AdmissionGate<H> {
    pub fn new(settings: AdmissionSettings) -> Self {
        Self {
            state: Mutex::new(AdmissionState {
                settings,
                sessions: HashMap::new(),
                active_manager: None,
            }),
            changed: Condvar::new(),
        }
    }

    /// Blocks until a new connection may be accepted.  Re-checks `running`
    /// every `poll`; returns `false` once it is cleared.
    pub fn wait_for_slot(&self, running: &AtomicBool, poll: Duration) -> bool {
        let mut state = self.state.lock();
        loop {
            if !running.load(Ordering::Relaxed) {
                return false;
            }
            if state.has_slot() {
                return true;
            }
            self.changed.wait_for(&mut state, poll);
        }
    }

    /// Adds a freshly accepted, not yet classified connection.
    pub fn register(&self, session: SessionNo, handle: H) {
        self.state.lock().sessions.insert(
            session,
            SessionEntry {
                role: Role::Unclassified,
                handle,
            },
        );
    }

    /// Removes a finished connection.  A manager that did not release its
    /// role is released here.
    pub fn unregister(&self, session: SessionNo) -> Option<H> {
        let entry = {
            let mut state = self.state.lock();
            if state.release(session) {
                info!(session, "manager role released on disconnect");
            }
            state.sessions.remove(&session)
        };
        self.changed.notify_all();
        entry.map(|entry| entry.handle)
    }

    /// Marks `session` as an employee if the quota allows it.
    pub fn try_admit_employee(&self, session: SessionNo) -> bool {
        let mut state = self.state.lock();
        let employees = state.count(|role| role == Role::Employee);
        if employees >= state.settings.max_clients as usize {
            debug!(session, employees, "employee quota reached");
            return false;
        }
        match state.sessions.get_mut(&session) {
            Some(entry) => {
                entry.role = Role::Employee;
                true
            }
            None => false,
        }
    }

    pub fn manager_active(&self) -> bool {
        self.state.lock().active_manager.is_some()
    }

    pub fn live_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn employee_count(&self) -> usize {
        self.state.lock().count(|role| role == Role::Employee)
    }

    /// Calls `f` on every live session's handle while holding the lock.
    pub fn for_each_handle(&self, mut f: impl FnMut(SessionNo, &H)) {
        let state = self.state.lock();
        for (session, entry) in &state.sessions {
            f(*session, &entry.handle);
        }
    }

    /// Wakes every waiter without changing anything; used on shutdown.
    pub fn wake_all(&self) {
        self.changed.notify_all();
    }
}

impl<H: Send> AdmissionControl for AdmissionGate<H> {
    fn settings(&self) -> AdmissionSettings {
        self.state.lock().settings
    }

    fn update_settings(&self, max_clients: u32, safety_threshold: u8) -> Result<(), SettingsError> {
        if !MAX_CLIENTS_RANGE.contains(&max_clients) {
            return Err(SettingsError::MaxClients(max_clients));
        }
        if !SAFETY_THRESHOLD_RANGE.contains(&safety_threshold) {
            return Err(SettingsError::SafetyThreshold(safety_threshold));
        }
        self.state.lock().settings = AdmissionSettings {
            max_clients,
            safety_threshold,
        };
        info!(max_clients, safety_threshold, "admission settings updated");
        self.changed.notify_all();
        Ok(())
    }

    fn try_claim_manager(&self, session: SessionNo) -> bool {
        let mut state = self.state.lock();
        if state.active_manager.is_some() {
            return false;
        }
        state.active_manager = Some(session);
        if let Some(entry) = state.sessions.get_mut(&session) {
            entry.role = Role::Manager;
        }
        drop(state);
        self.changed.notify_all();
        true
    }

    fn release_manager(&self, session: SessionNo) {
        let released = self.state.lock().release(session);
        if released {
            info!(session, "manager left; admission settings reset");
            self.changed.notify_all();
        }
    }
}

impl<H> std::fmt::Debug for AdmissionGate<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AdmissionGate")
            .field("settings", &state.settings)
            .field("sessions", &state.sessions.len())
            .field("active_manager", &state.active_manager)
            .finish()
    }
}
