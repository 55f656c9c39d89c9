//! Wire protocol: framing, field codec, message vocabulary and the encrypted
//! manager channel.

pub mod codec;
pub mod framing;
pub mod link;
pub mod messages;
pub mod mock;
pub mod secure;

pub use framing::{Frame, Framer, FramingError};
pub use link::{MessageLink, RecvOutcome};
pub use messages::{ClientSummary, MessageType, ProtocolError, Reply, Request};
pub use secure::{DhParams, HandshakeError, SecureChannel};
