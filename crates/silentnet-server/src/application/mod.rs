//! Application layer: per-connection protocol state machines and the
//! in-memory state they share.
//!
//! Nothing in here opens a socket.  Sessions are written against the
//! [`MessageLink`](silentnet_core::protocol::MessageLink) trait, so the same
//! code runs over a plain framer, an encrypted channel, or a scripted link
//! in tests.
//!
//! # Sub-modules
//!
//! - **`admission`** – live-session registry, employee quota, manager role
//!   and the settings a manager can change.
//! - **`online`** – which client ids currently have a live connection.
//! - **`safety`** – the per-session strike counter.
//! - **`session`** – the context handed to a session thread and the shared
//!   receive loop.
//! - **`employee_session`** / **`manager_session`** – the two roles.
//! - **`process_filter`** – ignore list and debounce for process events.
//! - **`statistics`** – timestamp, idle, WPM and CPU arithmetic behind the
//!   stats document.

pub mod admission;
pub mod employee_session;
pub mod manager_session;
pub mod online;
pub mod process_filter;
pub mod safety;
pub mod session;
pub mod statistics;
