//! Network infrastructure: the TCP listener and the per-connection threads.
//!
//! - **`connection_server`** – binds the listening socket, runs the accept
//!   loop behind the admission gate, classifies each connection from its
//!   first message and hands it to the matching session.  [`ServerHandle`]
//!   is the operator's control surface.

pub mod connection_server;

pub use connection_server::{ConnectionServer, ServerError, ServerHandle};
