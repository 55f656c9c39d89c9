//! Storage infrastructure: configuration file and the SQLite event store.
//!
//! - **`config`** – TOML configuration with serde defaults.
//! - **`database`** – the one shared SQLite connection and its transaction
//!   helpers.
//! - **`identity_store`** – MAC → id + hostname registry (`uid` table).
//! - **`event_log`** – per-client event rows and statistics queries (`logs`
//!   table).
//!
//! [`Storage`] ties the last three together.  It is constructed once at
//! start-up and shared between session threads through an `Arc`.

pub mod config;
pub mod database;
pub mod event_log;
pub mod identity_store;

use std::path::Path;

use chrono::Duration;
use tracing::info;

use self::database::{Database, StorageError};
use self::event_log::EventLog;
use self::identity_store::{IdentityStore, Registration};

/// What [`Storage::delete_client`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    NotFound,
    /// Identity and every event row removed.
    Deleted,
    /// The client is online: its rows were cleared and the identity was
    /// re-created with the same id and fresh scalar rows.
    Regenerated,
}

#[derive(Debug)]
pub struct Storage {
    db: Database,
    idle_threshold: Duration,
}

impl Storage {
    pub fn open(path: &Path, idle_threshold_minutes: i64) -> Result<Self, StorageError> {
        let db = Database::open(path)?;
        info!(path = %path.display(), "event store opened");
        Ok(Self {
            db,
            idle_threshold: Duration::minutes(idle_threshold_minutes),
        })
    }

    pub fn in_memory(idle_threshold_minutes: i64) -> Result<Self, StorageError> {
        Self::open(Path::new(":memory:"), idle_threshold_minutes)
    }

    pub fn identities(&self) -> IdentityStore<'_> {
        IdentityStore::new(&self.db)
    }

    pub fn events(&self) -> EventLog<'_> {
        EventLog::new(&self.db, self.idle_threshold)
    }

    /// Resolves `mac` to an identity, creating it on first contact, and makes
    /// sure its scalar rows exist before anything is logged against it.
    ///
    /// `on_registered` runs before the storage lock is released, so a
    /// concurrent [`delete_client`](Self::delete_client) already sees the
    /// client as online.
    pub fn register_client(
        &self,
        mac: &str,
        hostname: &str,
        on_registered: impl FnOnce(i64),
    ) -> Option<Registration> {
        let _hold = self.db.hold();
        let registration = self.identities().register(mac, hostname)?;
        if !self.events().client_setup(registration.id) {
            return None;
        }
        on_registered(registration.id);
        Some(registration)
    }

    /// Deletes the client called `hostname`.
    ///
    /// `is_online` is consulted while the storage lock is held, so a client
    /// cannot be registered or removed halfway through.
    pub fn delete_client(&self, hostname: &str, is_online: impl FnOnce(i64) -> bool) -> DeleteOutcome {
        let outcome = {
            let _hold = self.db.hold();
            let identities = self.identities();
            let Some(identity) = identities
                .id_by_hostname(hostname)
                .and_then(|id| identities.get(id))
            else {
                return DeleteOutcome::NotFound;
            };

            let events = self.events();
            events.clear_client(identity.id);
            identities.delete(identity.id);
            if is_online(identity.id) {
                identities.restore(&identity);
                events.client_setup(identity.id);
                DeleteOutcome::Regenerated
            } else {
                DeleteOutcome::Deleted
            }
        };
        self.db.vacuum();
        info!(hostname, ?outcome, "client deleted");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::event_log::LogKind;
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::thread;
    use std::time::Duration as StdDuration;

    #[test]
    fn test_delete_offline_client_removes_identity() {
        // Arrange
        let storage = Storage::in_memory(5).unwrap();
        let id = storage.identities().register("m1", "alice").unwrap().id;
        storage.events().client_setup(id);
        storage.events().record(id, LogKind::ProcessOpen, b"vim");

        // Act
        let outcome = storage.delete_client("alice", |_| false);

        // Assert
        assert_eq!(outcome, DeleteOutcome::Deleted);
        assert_eq!(storage.identities().get(id), None);
        assert!(storage.events().histogram(id, LogKind::ProcessOpen).labels.is_empty());
    }

    #[test]
    fn test_delete_online_client_regenerates_same_identity() {
        // Arrange
        let storage = Storage::in_memory(5).unwrap();
        let id = storage.identities().register("m1", "alice").unwrap().id;
        storage.events().client_setup(id);
        storage.events().record(id, LogKind::IpContact, b"8.8.8.8");
        let before = storage.identities().get(id).unwrap();

        // Act
        let outcome = storage.delete_client("alice", |candidate| candidate == id);

        // Assert
        assert_eq!(outcome, DeleteOutcome::Regenerated);
        assert_eq!(storage.identities().get(id), Some(before));
        assert!(storage.events().histogram(id, LogKind::IpContact).labels.is_empty());
        // Scalar rows are back, so input can be recorded immediately.
        assert!(storage.events().record_input(
            id,
            b"kbd\x1f57",
            chrono::Local::now().naive_local()
        ));
    }

    #[test]
    fn test_register_client_creates_scalar_rows_once() {
        // Arrange
        let storage = Storage::in_memory(5).unwrap();

        // Act
        let first = storage.register_client("m1", "alice", |_| {}).unwrap();
        let again = storage.register_client("m1", "alice", |_| {}).unwrap();

        // Assert
        assert!(first.created);
        assert!(!again.created);
        assert_eq!(first.id, again.id);
        assert!(storage.events().append_cpu_usage(first.id, "0,12.5"));
        assert_eq!(storage.events().cpu_usage(first.id).data.cores, vec![0]);
    }

    #[test]
    fn test_delete_racing_registration_regenerates_identity() {
        // Arrange
        let storage = Storage::in_memory(5).unwrap();
        let online = AtomicI64::new(-1);
        let is_online = |id: i64| online.load(Ordering::SeqCst) == id;
        let (storage, is_online) = (&storage, &is_online);

        // Act: the delete is issued from inside the registration window.
        let (registration, outcome) = thread::scope(|s| {
            let mut deleter = None;
            let registration = storage
                .register_client("m1", "alice", |id| {
                    online.store(id, Ordering::SeqCst);
                    deleter = Some(s.spawn(move || storage.delete_client("alice", is_online)));
                    thread::sleep(StdDuration::from_millis(50));
                })
                .unwrap();
            (registration, deleter.unwrap().join().unwrap())
        });

        // Assert
        assert_eq!(outcome, DeleteOutcome::Regenerated);
        assert!(storage.identities().get(registration.id).is_some());
        assert!(storage.events().record(registration.id, LogKind::ProcessOpen, b"vim"));
    }

    #[test]
    fn test_delete_unknown_client_is_not_found() {
        let storage = Storage::in_memory(5).unwrap();
        assert_eq!(storage.delete_client("ghost", |_| true), DeleteOutcome::NotFound);
    }
}
