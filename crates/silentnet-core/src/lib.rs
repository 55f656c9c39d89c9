//! # silentnet-core
//!
//! Shared protocol library for Silent Net, a workplace activity monitor in
//! which employee agents stream events to a central server and a manager
//! console queries the aggregated statistics.
//!
//! This crate contains everything both ends of a connection must agree on.
//! It opens no sockets itself: every type wraps a caller-supplied
//! `Read + Write` stream.
//!
//! - **`protocol::framing`** – 4-digit ASCII length prefix + payload.
//! - **`protocol::codec`** – `type␟field␟field…` field splitting.
//! - **`protocol::messages`** – the closed [`Request`] / [`Reply`] vocabulary.
//! - **`protocol::secure`** – Diffie–Hellman + AES-256-CBC for manager links.
//! - **`protocol::link`** – the [`MessageLink`] seam sessions are written
//!   against, with an in-memory implementation in `protocol::mock`.

pub mod protocol;

pub use protocol::framing::{Frame, Framer, FramingError};
pub use protocol::link::{MessageLink, RecvOutcome};
pub use protocol::messages::{ClientSummary, MessageType, ProtocolError, Reply, Request};
pub use protocol::secure::{DhParams, HandshakeError, SecureChannel};
