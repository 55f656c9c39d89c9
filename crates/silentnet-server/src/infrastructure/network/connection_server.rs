//! The TCP front door: accept loop, classification and session threads.
//!
//! # Threads
//!
//! ```text
//! silentnet-accept ──accept──► silentnet-session-1  (employee)
//!                  ├─────────► silentnet-session-2  (manager)
//!                  └─────────► …
//! ```
//!
//! The listener is non-blocking and polled every 100 ms so the accept thread
//! observes shutdown promptly.  Before each accept it waits on the admission
//! gate, which blocks while a manager is connected and the non-manager
//! sessions already fill `max_clients`.
//!
//! # Classification
//!
//! The first framed, unencrypted message decides what a connection is:
//!
//! | first message | result |
//! |---|---|
//! | `MCC` (liveness probe), empty, unknown | dropped |
//! | `MMP` while a manager is authorized | `MAC` sent, dropped |
//! | `MMP` otherwise | key exchange, then [`ManagerSession`] |
//! | `CAU` over the employee quota | dropped |
//! | `CAU` otherwise | [`EmployeeSession`] |
//!
//! # Shutdown
//!
//! [`ServerHandle::quit`] clears the running flag, joins the accept thread,
//! shuts down every registered socket and joins every session thread.  The
//! storage handle outlives all of them.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use silentnet_core::protocol::framing::is_timeout;
use silentnet_core::protocol::{
    Framer, MessageLink, RecvOutcome, Reply, Request, SecureChannel,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::admission::{AdmissionControl, AdmissionGate, AdmissionSettings, SessionNo};
use crate::application::employee_session::EmployeeSession;
use crate::application::manager_session::ManagerSession;
use crate::application::online::OnlineRegistry;
use crate::application::process_filter::{ProcessDebouncer, ProcessFilter};
use crate::application::session::{SessionContext, SessionEnd};
use crate::infrastructure::storage::config::ServerConfig;
use crate::infrastructure::storage::Storage;

/// How often blocked loops re-check the running flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Error type for starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The bound socket could not be configured.
    #[error("failed to configure listener: {0}")]
    Listener(#[source] io::Error),

    /// The accept thread could not be spawned.
    #[error("failed to spawn accept thread: {0}")]
    Spawn(#[source] io::Error),
}

/// State shared by the accept thread and every session thread.
struct Shared {
    storage: Arc<Storage>,
    gate: AdmissionGate<TcpStream>,
    online: OnlineRegistry,
    running: AtomicBool,
    filter: ProcessFilter,
    password: String,
    recv_timeout: Duration,
    debounce_window: Duration,
    debounce_capacity: usize,
    next_session: AtomicU64,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn context(&self, session: SessionNo, session_id: Uuid) -> SessionContext<'_> {
        SessionContext {
            session,
            session_id,
            storage: &self.storage,
            admission: &self.gate,
            online: &self.online,
            running: &self.running,
        }
    }
}

/// A bound but not yet running server.
pub struct ConnectionServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
}

impl ConnectionServer {
    /// Binds the listening socket described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address is unavailable.
    pub fn bind(config: &ServerConfig, storage: Arc<Storage>) -> Result<Self, ServerError> {
        let addr = config.listen_address();
        let listener =
            TcpListener::bind(&addr).map_err(|source| ServerError::Bind { addr, source })?;
        listener
            .set_nonblocking(true)
            .map_err(ServerError::Listener)?;
        let local_addr = listener.local_addr().map_err(ServerError::Listener)?;

        let monitoring = &config.monitoring;
        let shared = Arc::new(Shared {
            storage,
            gate: AdmissionGate::new(AdmissionSettings {
                max_clients: config.admission.max_clients,
                safety_threshold: config.admission.safety_threshold,
            }),
            online: OnlineRegistry::new(),
            running: AtomicBool::new(true),
            filter: ProcessFilter::new(&monitoring.extra_ignored_processes),
            password: config.admission.password.clone(),
            recv_timeout: Duration::from_millis(config.network.recv_timeout_ms.max(1)),
            debounce_window: Duration::from_secs(monitoring.debounce_window_secs),
            debounce_capacity: monitoring.debounce_capacity,
            next_session: AtomicU64::new(0),
            threads: Mutex::new(Vec::new()),
        });

        Ok(Self {
            listener,
            local_addr,
            shared,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawns the accept thread and returns the control handle.
    pub fn start(self) -> Result<ServerHandle, ServerError> {
        let shared = Arc::clone(&self.shared);
        let listener = self.listener;
        let accept = thread::Builder::new()
            .name("silentnet-accept".to_string())
            .spawn(move || accept_loop(listener, shared))
            .map_err(ServerError::Spawn)?;

        info!(addr = %self.local_addr, "server listening");
        Ok(ServerHandle {
            shared: self.shared,
            accept: Some(accept),
            local_addr: self.local_addr,
        })
    }
}

/// Control surface of a running server: the operator's quit and erase-logs
/// commands, plus a few read-only views.
pub struct ServerHandle {
    shared: Arc<Shared>,
    accept: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    pub fn settings(&self) -> AdmissionSettings {
        self.shared.gate.settings()
    }

    pub fn manager_active(&self) -> bool {
        self.shared.gate.manager_active()
    }

    pub fn live_sessions(&self) -> usize {
        self.shared.gate.live_sessions()
    }

    pub fn employee_count(&self) -> usize {
        self.shared.gate.employee_count()
    }

    pub fn online_clients(&self) -> usize {
        self.shared.online.len()
    }

    pub fn storage(&self) -> &Storage {
        &self.shared.storage
    }

    /// Wipes every event row and re-creates the scalar rows of every known
    /// client.  Safe while sessions are running.
    pub fn erase_all_logs(&self) -> bool {
        let erased = self.shared.storage.events().erase_all();
        if erased {
            info!("all logs erased");
        }
        erased
    }

    /// Stops accepting, disconnects every session and waits for all threads.
    pub fn quit(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(accept) = self.accept.take() else {
            return;
        };
        info!("server shutting down");
        self.shared.running.store(false, Ordering::Relaxed);
        self.shared.gate.wake_all();
        if accept.join().is_err() {
            error!("accept thread panicked");
        }

        self.shared.gate.for_each_handle(|session, stream| {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!(session, error = %e, "socket already closed");
            }
        });
        let threads: Vec<_> = self.shared.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                error!("session thread panicked");
            }
        }
        info!("server stopped");
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Accept loop ──────────────────────────────────────────────────────────────

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    while shared.running.load(Ordering::Relaxed) {
        if !shared.gate.wait_for_slot(&shared.running, POLL_INTERVAL) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => spawn_session(&shared, stream, peer),
            Err(e) if is_timeout(&e) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                error!(error = %e, "accept failed");
                thread::sleep(POLL_INTERVAL);
            }
        }
        shared.threads.lock().retain(|handle| !handle.is_finished());
    }
    debug!("accept loop stopped");
}

fn spawn_session(shared: &Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = prepare_stream(&stream, shared.recv_timeout) {
        warn!(%peer, error = %e, "failed to configure accepted socket");
        return;
    }
    let registered = match stream.try_clone() {
        Ok(clone) => clone,
        Err(e) => {
            warn!(%peer, error = %e, "failed to clone accepted socket");
            return;
        }
    };

    let session = shared.next_session.fetch_add(1, Ordering::Relaxed) + 1;
    shared.gate.register(session, registered);

    let worker = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name(format!("silentnet-session-{session}"))
        .spawn(move || {
            run_connection(&worker, session, stream, peer);
            worker.gate.unregister(session);
        });
    match spawned {
        Ok(handle) => shared.threads.lock().push(handle),
        Err(e) => {
            error!(session, error = %e, "failed to spawn session thread");
            shared.gate.unregister(session);
        }
    }
}

fn prepare_stream(stream: &TcpStream, recv_timeout: Duration) -> io::Result<()> {
    // Accepted sockets may inherit the listener's non-blocking mode.
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(recv_timeout))?;
    stream.set_nodelay(true)
}

// ── Classification ───────────────────────────────────────────────────────────

fn run_connection(shared: &Shared, session: SessionNo, stream: TcpStream, peer: SocketAddr) {
    let session_id = Uuid::new_v4();
    debug!(session, %session_id, %peer, "connection accepted");
    let mut framer = Framer::new(stream);

    let Some(first) = first_payload(shared, &mut framer) else {
        debug!(%session_id, "connection closed before classification");
        return;
    };

    let ctx = shared.context(session, session_id);
    let end = match Request::decode(&first) {
        Ok(Request::LivenessProbe) => {
            debug!(%session_id, "liveness probe");
            return;
        }
        Ok(Request::ManagerPassword(_)) => {
            if shared.gate.manager_active() {
                info!(%session_id, %peer, "manager refused: another manager is connected");
                refuse_second_manager(&mut framer, session_id);
                return;
            }
            match SecureChannel::accept(framer) {
                Ok(mut channel) => ManagerSession::new(ctx, &shared.password).run(&mut channel),
                Err(e) => {
                    warn!(%session_id, %peer, error = %e, "manager key exchange failed");
                    return;
                }
            }
        }
        Ok(Request::EmployeeAuth { mac, hostname }) => {
            if !shared.gate.try_admit_employee(session) {
                info!(%session_id, %peer, mac = %mac, "employee refused: quota reached");
                return;
            }
            let debouncer = ProcessDebouncer::new(shared.debounce_window, shared.debounce_capacity);
            match EmployeeSession::start(ctx, &shared.filter, debouncer, &mac, &hostname) {
                Some(employee) => employee.run(&mut framer),
                None => SessionEnd::Rejected,
            }
        }
        Ok(other) => {
            debug!(%session_id, message = %other.message_type(), "unexpected first message");
            return;
        }
        Err(e) => {
            debug!(%session_id, error = %e, "unclassifiable first message");
            return;
        }
    };
    debug!(session, %session_id, ?end, "connection finished");
}

/// Tells a late manager that the role is taken.  Returns `false` when the
/// refusal could not be delivered.
fn refuse_second_manager<L: MessageLink>(link: &mut L, session_id: Uuid) -> bool {
    match link.send_reply(&Reply::ManagerAlreadyConnected) {
        Ok(()) => true,
        Err(e) => {
            debug!(%session_id, error = %e, "could not deliver manager refusal");
            false
        }
    }
}

/// Waits for the first payload, polling the running flag on timeouts.
fn first_payload(shared: &Shared, framer: &mut Framer<TcpStream>) -> Option<Vec<u8>> {
    loop {
        match framer.recv_payload() {
            RecvOutcome::Data(payload) => return Some(payload),
            RecvOutcome::TimedOut if shared.running.load(Ordering::Relaxed) => continue,
            RecvOutcome::TimedOut | RecvOutcome::Closed => return None,
            RecvOutcome::Malformed(reason) => {
                debug!(reason, "malformed first frame");
                return None;
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
