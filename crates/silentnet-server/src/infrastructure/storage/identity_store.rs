//! Durable identities of employee machines.
//!
//! A machine is identified by its MAC address and gets an immutable integer
//! id on first contact.  The hostname it reports becomes its display name,
//! de-duplicated at creation time (`name`, `name1`, `name2`, …) and later
//! editable by a manager.

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use super::database::Database;

/// One registered machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub id: i64,
    pub mac: String,
    pub hostname: String,
    pub original_hostname: String,
}

impl ClientIdentity {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            mac: row.get(1)?,
            hostname: row.get(2)?,
            original_hostname: row.get(3)?,
        })
    }
}

/// Result of [`IdentityStore::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub id: i64,
    /// `true` if this call created the identity.
    pub created: bool,
}

const SELECT_COLUMNS: &str = "SELECT id, mac, hostname, original_hostname FROM uid";

/// Borrowing view over the `uid` table.
#[derive(Debug, Clone, Copy)]
pub struct IdentityStore<'a> {
    db: &'a Database,
}

impl<'a> IdentityStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Resolves `mac` to its id, creating the identity on first sight.
    ///
    /// A new identity takes `hostname` if it is free, otherwise the first
    /// free `hostname1`, `hostname2`, ….  Returns `None` only on a storage
    /// failure.
    pub fn register(&self, mac: &str, hostname: &str) -> Option<Registration> {
        self.db
            .transaction("register identity", |conn| {
                if let Some(id) = id_by_mac(conn, mac)? {
                    return Ok(Registration { id, created: false });
                }

                let display_name = free_hostname(conn, hostname)?;
                conn.execute(
                    "INSERT INTO uid (mac, hostname, original_hostname) VALUES (?1, ?2, ?3)",
                    params![mac, display_name, hostname],
                )?;
                let id = conn.last_insert_rowid();
                info!(id, mac, hostname = %display_name, "registered new client");
                Ok(Registration { id, created: true })
            })
            .ok()
    }

    /// Renames `from` to `to`.  Returns `false` (and changes nothing) if `to`
    /// is already taken or `from` does not exist.
    pub fn rename(&self, from: &str, to: &str) -> bool {
        self.db.run("rename client", |conn| {
            if to.is_empty() || hostname_taken(conn, to)? {
                return Ok(false);
            }
            let changed = conn.execute(
                "UPDATE uid SET hostname = ?2 WHERE hostname = ?1",
                params![from, to],
            )?;
            if changed == 1 {
                debug!(from, to, "client renamed");
            }
            Ok(changed == 1)
        })
    }

    pub fn id_by_hostname(&self, hostname: &str) -> Option<i64> {
        self.db.run("id lookup", |conn| {
            conn.query_row(
                "SELECT id FROM uid WHERE hostname = ?1",
                params![hostname],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn get(&self, id: i64) -> Option<ClientIdentity> {
        self.db.run("identity lookup", |conn| {
            conn.query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id],
                ClientIdentity::from_row,
            )
            .optional()
        })
    }

    /// Every identity ordered by id.
    pub fn list(&self) -> Vec<ClientIdentity> {
        self.db.run("list identities", |conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY id"))?;
            let rows = stmt.query_map([], ClientIdentity::from_row)?;
            rows.collect()
        })
    }

    /// Removes the identity row.  Event rows must already be gone.
    pub fn delete(&self, id: i64) -> bool {
        self.db.run("delete identity", |conn| {
            Ok(conn.execute("DELETE FROM uid WHERE id = ?1", params![id])? == 1)
        })
    }

    /// Re-inserts a previously deleted identity with the same id, MAC and
    /// hostname.
    pub fn restore(&self, identity: &ClientIdentity) -> bool {
        self.db.run("restore identity", |conn| {
            conn.execute(
                "INSERT INTO uid (id, mac, hostname, original_hostname) VALUES (?1, ?2, ?3, ?4)",
                params![
                    identity.id,
                    identity.mac,
                    identity.hostname,
                    identity.original_hostname
                ],
            )?;
            Ok(true)
        })
    }
}

fn id_by_mac(conn: &Connection, mac: &str) -> rusqlite::Result<Option<i64>> {
    conn.query_row("SELECT id FROM uid WHERE mac = ?1", params![mac], |row| {
        row.get(0)
    })
    .optional()
}

fn hostname_taken(conn: &Connection, hostname: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM uid WHERE hostname = ?1)",
        params![hostname],
        |row| row.get(0),
    )
}

fn free_hostname(conn: &Connection, hostname: &str) -> rusqlite::Result<String> {
    if !hostname_taken(conn, hostname)? {
        return Ok(hostname.to_string());
    }
    let mut suffix = 1u64;
    loop {
        let candidate = format!("{hostname}{suffix}");
        if !hostname_taken(conn, &candidate)? {
            return Ok(candidate);
        }
        suffix += 1;
    }
}
