//! Field codec: `type (SEP field)*` with a single reserved separator byte.
//!
//! ```text
//! CAU␟aa:bb:cc:dd:ee:ff␟alice-laptop
//!    ^ 0x1F (ASCII unit separator)
//! ```
//!
//! Fields are raw bytes.  Strings and integers are converted to bytes by the
//! [`MessageBuilder`]; the typed vocabulary in
//! [`messages`](crate::protocol::messages) turns them back into Rust values.
//!
//! # Split limits
//!
//! [`decode`] accepts an optional cap on the number of splits.  With
//! `Some(1)` only the first separator is honoured, so the trailing field keeps
//! any separators it contains.  Employee events use this to carry sub-messages
//! (for example an input event's `device␟keycode`) through untouched.

/// The reserved field separator (ASCII unit separator).
pub const SEPARATOR: u8 = 0x1F;

/// Conversion of a value into one wire field.
pub trait IntoField {
    fn into_field(self) -> Vec<u8>;
}

impl IntoField for &str {
    fn into_field(self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl IntoField for String {
    fn into_field(self) -> Vec<u8> {
        self.into_bytes()
    }
}

impl IntoField for &String {
    fn into_field(self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl IntoField for &[u8] {
    fn into_field(self) -> Vec<u8> {
        self.to_vec()
    }
}

impl IntoField for Vec<u8> {
    fn into_field(self) -> Vec<u8> {
        self
    }
}

macro_rules! impl_into_field_for_display {
    ($($ty:ty),*) => {
        $(
            impl IntoField for $ty {
                fn into_field(self) -> Vec<u8> {
                    self.to_string().into_bytes()
                }
            }
        )*
    };
}

impl_into_field_for_display!(u8, u16, u32, u64, usize, i32, i64);

/// Builds an encoded message one field at a time.
///
/// # Examples
///
/// ```rust
/// use silentnet_core::protocol::codec::MessageBuilder;
///
/// let bytes = MessageBuilder::new("MST").field(10u32).field(3u8).finish();
/// assert_eq!(bytes, b"MST\x1f10\x1f3");
/// ```
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    pub fn new(token: &str) -> Self {
        Self {
            buf: token.as_bytes().to_vec(),
        }
    }

    /// Appends one field preceded by the separator.
    pub fn field(mut self, value: impl IntoField) -> Self {
        self.buf.push(SEPARATOR);
        self.buf.extend_from_slice(&value.into_field());
        self
    }

    /// Appends every item of `values` as its own field.
    pub fn fields<I>(self, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: IntoField,
    {
        values.into_iter().fold(self, |builder, value| builder.field(value))
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Encodes `token` followed by `fields`.
pub fn encode<F: AsRef<[u8]>>(token: &str, fields: &[F]) -> Vec<u8> {
    let extra: usize = fields.iter().map(|f| f.as_ref().len() + 1).sum();
    let mut buf = Vec::with_capacity(token.len() + extra);
    buf.extend_from_slice(token.as_bytes());
    for field in fields {
        buf.push(SEPARATOR);
        buf.extend_from_slice(field.as_ref());
    }
    buf
}

/// Splits `bytes` on [`SEPARATOR`].
///
/// `max_splits` caps the number of splits performed (`None` splits
/// everywhere).  Returns `None` for empty input: an empty payload is the
/// disconnect sentinel, not a message with zero fields.
pub fn decode(bytes: &[u8], max_splits: Option<usize>) -> Option<Vec<&[u8]>> {
    if bytes.is_empty() {
        return None;
    }
    let fields = match max_splits {
        Some(limit) => bytes.splitn(limit + 1, |b| *b == SEPARATOR).collect(),
        None => bytes.split(|b| *b == SEPARATOR).collect(),
    };
    Some(fields)
}

// ── Tests ────────────────────────────────────────────────────────────────────
