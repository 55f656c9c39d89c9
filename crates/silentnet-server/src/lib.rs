//! silentnet-server library entry point.
//!
//! The binary in `main.rs` and the integration tests in `tests/` share this
//! module tree:
//!
//! - **`application`** – employee and manager sessions, admission control,
//!   process filtering and the statistics arithmetic.
//! - **`infrastructure`** – the TCP server, the SQLite event store and the
//!   TOML configuration.

pub mod application;
pub mod infrastructure;

pub use infrastructure::network::{ConnectionServer, ServerError, ServerHandle};
pub use infrastructure::storage::config::{load_config, ConfigOverrides, ServerConfig};
pub use infrastructure::storage::Storage;
