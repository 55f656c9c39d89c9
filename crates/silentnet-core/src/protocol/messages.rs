//! The Silent Net message vocabulary.
//!
//! Every payload starts with a short ASCII token.  The first letter tells who
//! sends it: `C…` employee agents, `M…` managers (requests *and* server status
//! replies to managers), `EXH` the key exchange.
//!
//! Tokens are decoded exactly once at the protocol boundary into one of two
//! closed enums:
//!
//! - [`Request`]: everything a peer may send to the server.
//! - [`Reply`]: everything the server sends back.
//!
//! Sessions then `match` on these enums; an unexpected variant is a
//! protocol violation counted against the sender, never a panic.

use thiserror::Error;

use crate::protocol::codec::{self, MessageBuilder, SEPARATOR};

// ── Message type tokens ──────────────────────────────────────────────────────

/// Every token defined by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    // Employee agent → server
    EmployeeAuth,
    ProcessOpen,
    ProcessClose,
    InputEvent,
    CpuUsage,
    IpContact,
    // Manager → server
    ManagerPassword,
    UpdateSettings,
    ListClients,
    ClientStats,
    RenameClient,
    DeleteClient,
    ManagerExit,
    LivenessProbe,
    // Both directions, handshake only
    KeyExchange,
    // Server → manager
    PasswordValid,
    PasswordInvalid,
    RenameAccepted,
    RenameRejected,
    ManagerAlreadyConnected,
    ClientNotFound,
}

impl MessageType {
    pub const ALL: [MessageType; 21] = [
        MessageType::EmployeeAuth,
        MessageType::ProcessOpen,
        MessageType::ProcessClose,
        MessageType::InputEvent,
        MessageType::CpuUsage,
        MessageType::IpContact,
        MessageType::ManagerPassword,
        MessageType::UpdateSettings,
        MessageType::ListClients,
        MessageType::ClientStats,
        MessageType::RenameClient,
        MessageType::DeleteClient,
        MessageType::ManagerExit,
        MessageType::LivenessProbe,
        MessageType::KeyExchange,
        MessageType::PasswordValid,
        MessageType::PasswordInvalid,
        MessageType::RenameAccepted,
        MessageType::RenameRejected,
        MessageType::ManagerAlreadyConnected,
        MessageType::ClientNotFound,
    ];

    /// The ASCII token written on the wire.
    pub const fn token(self) -> &'static str {
        match self {
            MessageType::EmployeeAuth => "CAU",
            MessageType::ProcessOpen => "CPO",
            MessageType::ProcessClose => "CPC",
            MessageType::InputEvent => "CIE",
            MessageType::CpuUsage => "CCU",
            MessageType::IpContact => "COT",
            MessageType::ManagerPassword => "MMP",
            MessageType::UpdateSettings => "MST",
            MessageType::ListClients => "MGC",
            MessageType::ClientStats => "MGD",
            MessageType::RenameClient => "MCN",
            MessageType::DeleteClient => "MDC",
            MessageType::ManagerExit => "MME",
            MessageType::LivenessProbe => "MCC",
            MessageType::KeyExchange => "EXH",
            MessageType::PasswordValid => "MVC",
            MessageType::PasswordInvalid => "MIC",
            MessageType::RenameAccepted => "MCH",
            MessageType::RenameRejected => "MIH",
            MessageType::ManagerAlreadyConnected => "MAC",
            MessageType::ClientNotFound => "MNF",
        }
    }

    pub fn from_token(token: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.token().as_bytes() == token)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors raised while turning a payload into a typed message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty payload")]
    Empty,

    #[error("unknown message type: {0:?}")]
    UnknownMessageType(String),

    /// A known token that is not valid in this direction (e.g. a reply token
    /// sent to the server).
    #[error("unexpected message type: {0}")]
    UnexpectedMessage(MessageType),

    #[error("{message_type}: expected {expected} field(s), got {actual}")]
    FieldCount {
        message_type: MessageType,
        expected: usize,
        actual: usize,
    },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

// ── Requests (peer → server) ─────────────────────────────────────────────────

/// A message received by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// First message of an employee connection.
    EmployeeAuth { mac: String, hostname: String },
    /// A process started on the employee machine (payload: process name).
    ProcessOpen(String),
    /// A process exited on the employee machine.
    ProcessClose(String),
    /// A keyboard input event (payload: `device␟keycode`).
    InputEvent(String),
    /// A batch of `core,usage[,timestamp]` samples separated by `;`.
    CpuUsage(String),
    /// An outbound IP address the machine contacted.
    IpContact(String),
    /// Manager login.  Unencrypted during classification (password empty),
    /// encrypted with the password after the key exchange.
    ManagerPassword(String),
    UpdateSettings { max_clients: u32, safety_threshold: u8 },
    ListClients,
    ClientStats { hostname: String },
    RenameClient { from: String, to: String },
    DeleteClient { hostname: String },
    ManagerExit,
    /// Unauthenticated "is the server up" probe.
    LivenessProbe,
}

impl Request {
    pub fn message_type(&self) -> MessageType {
        match self {
            Request::EmployeeAuth { .. } => MessageType::EmployeeAuth,
            Request::ProcessOpen(_) => MessageType::ProcessOpen,
            Request::ProcessClose(_) => MessageType::ProcessClose,
            Request::InputEvent(_) => MessageType::InputEvent,
            Request::CpuUsage(_) => MessageType::CpuUsage,
            Request::IpContact(_) => MessageType::IpContact,
            Request::ManagerPassword(_) => MessageType::ManagerPassword,
            Request::UpdateSettings { .. } => MessageType::UpdateSettings,
            Request::ListClients => MessageType::ListClients,
            Request::ClientStats { .. } => MessageType::ClientStats,
            Request::RenameClient { .. } => MessageType::RenameClient,
            Request::DeleteClient { .. } => MessageType::DeleteClient,
            Request::ManagerExit => MessageType::ManagerExit,
            Request::LivenessProbe => MessageType::LivenessProbe,
        }
    }

    /// Encodes the request into a payload ready for framing.
    pub fn encode(&self) -> Vec<u8> {
        let builder = MessageBuilder::new(self.message_type().token());
        let builder = match self {
            Request::EmployeeAuth { mac, hostname } => builder.field(mac).field(hostname),
            Request::ProcessOpen(v)
            | Request::ProcessClose(v)
            | Request::InputEvent(v)
            | Request::CpuUsage(v)
            | Request::IpContact(v) => builder.field(v),
            Request::ManagerPassword(password) if password.is_empty() => builder,
            Request::ManagerPassword(password) => builder.field(password),
            Request::UpdateSettings {
                max_clients,
                safety_threshold,
            } => builder.field(*max_clients).field(*safety_threshold),
            Request::ClientStats { hostname } | Request::DeleteClient { hostname } => {
                builder.field(hostname)
            }
            Request::RenameClient { from, to } => builder.field(from).field(to),
            Request::ListClients | Request::ManagerExit | Request::LivenessProbe => builder,
        };
        builder.finish()
    }

    /// Decodes a payload received by the server.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] for empty payloads, unknown or misdirected
    /// tokens, wrong field counts and unparsable field values.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use silentnet_core::protocol::messages::Request;
    ///
    /// let request = Request::decode(b"CIE\x1fkeyboard\x1f57").unwrap();
    /// assert_eq!(request, Request::InputEvent("keyboard\x1f57".to_string()));
    /// ```
    pub fn decode(payload: &[u8]) -> Result<Request, ProtocolError> {
        let message_type = peek_type(payload)?;
        match message_type {
            MessageType::EmployeeAuth => {
                let [mac, hostname] = exact_fields::<2>(payload, message_type, None)?;
                Ok(Request::EmployeeAuth {
                    mac: text(mac)?,
                    hostname: text(hostname)?,
                })
            }
            MessageType::ProcessOpen
            | MessageType::ProcessClose
            | MessageType::InputEvent
            | MessageType::CpuUsage
            | MessageType::IpContact => {
                let [body] = exact_fields::<1>(payload, message_type, Some(1))?;
                let body = text(body)?;
                Ok(match message_type {
                    MessageType::ProcessOpen => Request::ProcessOpen(body),
                    MessageType::ProcessClose => Request::ProcessClose(body),
                    MessageType::InputEvent => Request::InputEvent(body),
                    MessageType::CpuUsage => Request::CpuUsage(body),
                    _ => Request::IpContact(body),
                })
            }
            MessageType::ManagerPassword => {
                let fields = codec::decode(payload, Some(1)).unwrap_or_default();
                let password = match fields.get(1) {
                    Some(field) => text(field)?,
                    None => String::new(),
                };
                Ok(Request::ManagerPassword(password))
            }
            MessageType::UpdateSettings => {
                let [max_clients, safety] = exact_fields::<2>(payload, message_type, None)?;
                Ok(Request::UpdateSettings {
                    max_clients: number(max_clients)?,
                    safety_threshold: number(safety)?,
                })
            }
            MessageType::ListClients => {
                exact_fields::<0>(payload, message_type, None)?;
                Ok(Request::ListClients)
            }
            MessageType::ClientStats => {
                let [hostname] = exact_fields::<1>(payload, message_type, Some(1))?;
                Ok(Request::ClientStats {
                    hostname: text(hostname)?,
                })
            }
            MessageType::RenameClient => {
                let [from, to] = exact_fields::<2>(payload, message_type, None)?;
                Ok(Request::RenameClient {
                    from: text(from)?,
                    to: text(to)?,
                })
            }
            MessageType::DeleteClient => {
                let [hostname] = exact_fields::<1>(payload, message_type, Some(1))?;
                Ok(Request::DeleteClient {
                    hostname: text(hostname)?,
                })
            }
            MessageType::ManagerExit => {
                exact_fields::<0>(payload, message_type, None)?;
                Ok(Request::ManagerExit)
            }
            MessageType::LivenessProbe => Ok(Request::LivenessProbe),
            other => Err(ProtocolError::UnexpectedMessage(other)),
        }
    }
}

// ── Replies (server → manager) ───────────────────────────────────────────────

/// One row of the `list-clients` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSummary {
    pub hostname: String,
    /// Share of observed time the client was active, 0..=100.
    pub active_percentage: u32,
    pub online: bool,
}

impl ClientSummary {
    /// Encodes the row as `hostname,percentage,0|1`.
    pub fn to_field(&self) -> String {
        format!(
            "{},{},{}",
            self.hostname,
            self.active_percentage,
            u8::from(self.online)
        )
    }

    /// Parses a row produced by [`to_field`](Self::to_field).
    ///
    /// The hostname may itself contain commas; only the last two are
    /// structural.
    pub fn parse(field: &str) -> Result<Self, ProtocolError> {
        let mut parts = field.rsplitn(3, ',');
        let (online, pct, hostname) = match (parts.next(), parts.next(), parts.next()) {
            (Some(online), Some(pct), Some(hostname)) => (online, pct, hostname),
            _ => {
                return Err(ProtocolError::MalformedPayload(format!(
                    "client row {field:?} needs 3 comma-separated values"
                )))
            }
        };
        let online = match online {
            "1" => true,
            "0" => false,
            other => {
                return Err(ProtocolError::MalformedPayload(format!(
                    "online flag must be 0 or 1, got {other:?}"
                )))
            }
        };
        Ok(ClientSummary {
            hostname: hostname.to_string(),
            active_percentage: pct.parse().map_err(|_| {
                ProtocolError::MalformedPayload(format!("invalid percentage {pct:?}"))
            })?,
            online,
        })
    }
}

/// A message sent by the server to a manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    PasswordValid,
    PasswordInvalid,
    ClientList(Vec<ClientSummary>),
    /// JSON statistics document for one client.
    ClientStats(String),
    ClientNotFound,
    RenameAccepted,
    RenameRejected,
    ManagerAlreadyConnected,
}

impl Reply {
    pub fn message_type(&self) -> MessageType {
        match self {
            Reply::PasswordValid => MessageType::PasswordValid,
            Reply::PasswordInvalid => MessageType::PasswordInvalid,
            Reply::ClientList(_) => MessageType::ListClients,
            Reply::ClientStats(_) => MessageType::ClientStats,
            Reply::ClientNotFound => MessageType::ClientNotFound,
            Reply::RenameAccepted => MessageType::RenameAccepted,
            Reply::RenameRejected => MessageType::RenameRejected,
            Reply::ManagerAlreadyConnected => MessageType::ManagerAlreadyConnected,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let builder = MessageBuilder::new(self.message_type().token());
        let builder = match self {
            Reply::ClientList(rows) => builder.fields(rows.iter().map(ClientSummary::to_field)),
            Reply::ClientStats(json) => builder.field(json),
            _ => builder,
        };
        builder.finish()
    }

    /// Decodes a payload received by a manager.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] for unknown tokens, request tokens, or
    /// malformed client rows.
    pub fn decode(payload: &[u8]) -> Result<Reply, ProtocolError> {
        let message_type = peek_type(payload)?;
        match message_type {
            MessageType::PasswordValid => Ok(Reply::PasswordValid),
            MessageType::PasswordInvalid => Ok(Reply::PasswordInvalid),
            MessageType::ListClients => {
                let fields = codec::decode(payload, None).unwrap_or_default();
                let rows = fields
                    .iter()
                    .skip(1)
                    .map(|f| text(f).and_then(|row| ClientSummary::parse(&row)))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Reply::ClientList(rows))
            }
            MessageType::ClientStats => {
                let [json] = exact_fields::<1>(payload, message_type, Some(1))?;
                Ok(Reply::ClientStats(text(json)?))
            }
            MessageType::ClientNotFound => Ok(Reply::ClientNotFound),
            MessageType::RenameAccepted => Ok(Reply::RenameAccepted),
            MessageType::RenameRejected => Ok(Reply::RenameRejected),
            MessageType::ManagerAlreadyConnected => Ok(Reply::ManagerAlreadyConnected),
            other => Err(ProtocolError::UnexpectedMessage(other)),
        }
    }
}

// ── Decode helpers ───────────────────────────────────────────────────────────

fn peek_type(payload: &[u8]) -> Result<MessageType, ProtocolError> {
    if payload.is_empty() {
        return Err(ProtocolError::Empty);
    }
    let end = payload
        .iter()
        .position(|b| *b == SEPARATOR)
        .unwrap_or(payload.len());
    let token = &payload[..end];
    MessageType::from_token(token)
        .ok_or_else(|| ProtocolError::UnknownMessageType(String::from_utf8_lossy(token).into_owned()))
}

/// Splits `payload` and returns exactly `N` fields after the token.
fn exact_fields<const N: usize>(
    payload: &[u8],
    message_type: MessageType,
    max_splits: Option<usize>,
) -> Result<[&[u8]; N], ProtocolError> {
    let fields = codec::decode(payload, max_splits).unwrap_or_default();
    let actual = fields.len().saturating_sub(1);
    if actual != N {
        return Err(ProtocolError::FieldCount {
            message_type,
            expected: N,
            actual,
        });
    }
    let mut out: [&[u8]; N] = [&[]; N];
    out.copy_from_slice(&fields[1..]);
    Ok(out)
}

fn text(field: &[u8]) -> Result<String, ProtocolError> {
    String::from_utf8(field.to_vec())
        .map_err(|_| ProtocolError::MalformedPayload("field is not valid UTF-8".to_string()))
}

fn number<T: std::str::FromStr>(field: &[u8]) -> Result<T, ProtocolError> {
    let raw = text(field)?;
    raw.trim()
        .parse()
        .map_err(|_| ProtocolError::MalformedPayload(format!("expected a number, got {raw:?}")))
}

// ── Tests ────────────────────────────────────────────────────────────────────
