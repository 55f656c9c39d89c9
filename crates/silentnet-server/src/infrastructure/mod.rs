//! Infrastructure layer for the server.
//!
//! Contains the OS-facing adapters: the TCP listener and its threads, the
//! SQLite event store and the TOML configuration file.
//!
//! - **`network`** – accept loop, classification, shutdown.
//! - **`storage`** – configuration, identities, event rows, statistics
//!   queries.

pub mod network;
pub mod storage;
