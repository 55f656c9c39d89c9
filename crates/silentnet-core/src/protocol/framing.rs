//! Length-prefixed framing for the Silent Net TCP channel.
//!
//! Wire format:
//! ```text
//! [length:4 ASCII digits, zero padded][payload:length bytes]
//! ```
//!
//! A frame never carries an empty payload: a length of `0000` (or the peer
//! closing the socket) means "disconnect".  This is why [`Framer::send`]
//! silently ignores empty payloads instead of framing them.
//!
//! # Timeouts (for beginners)
//!
//! Session sockets are configured with a read timeout so that a thread blocked
//! in `recv` wakes up periodically and can notice that the server is shutting
//! down.  A timeout that fires *before* a frame starts is reported as
//! [`Frame::TimedOut`]: nothing was lost and the caller simply calls `recv`
//! again.  A timeout in the *middle* of a frame is retried a bounded number of
//! times, because giving up there would desynchronise the stream.

use std::io::{self, Read, Write};

use thiserror::Error;

/// Number of ASCII digits in the length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest payload a 4-digit decimal prefix can describe.
pub const MAX_PAYLOAD_LEN: usize = 9999;

/// Consecutive read timeouts tolerated once a frame has started.
const MAX_STALLED_READS: u32 = 30;

/// Errors produced while reading or writing frames.
#[derive(Debug, Error)]
pub enum FramingError {
    /// The 4-byte prefix was not a decimal number.
    #[error("invalid length prefix: {0:?}")]
    InvalidLength(String),

    /// The payload cannot be described by a 4-digit prefix.
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_LEN}-byte frame limit")]
    PayloadTooLarge(usize),

    /// The underlying stream failed.
    #[error("frame I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result of a single [`Framer::recv`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete, non-empty payload.
    Data(Vec<u8>),
    /// The peer closed the connection (or sent a zero-length frame).
    Closed,
    /// No frame started before the socket read timeout expired.
    TimedOut,
}

enum Fill {
    Complete,
    Closed,
    TimedOut,
}

/// Reads and writes length-prefixed frames on any `Read + Write` stream.
///
/// A `Framer` keeps no buffer between calls: each `recv` reads exactly the
/// prefix and then exactly the declared payload.
#[derive(Debug)]
pub struct Framer<S> {
    stream: S,
}

impl<S: Read + Write> Framer<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Writes `payload` preceded by its zero-padded length.
    ///
    /// Empty payloads are a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::PayloadTooLarge`] for payloads longer than
    /// [`MAX_PAYLOAD_LEN`], or [`FramingError::Io`] if the write fails.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::io::Cursor;
    /// use silentnet_core::protocol::framing::Framer;
    ///
    /// let mut framer = Framer::new(Cursor::new(Vec::new()));
    /// framer.send(b"CAU").unwrap();
    /// assert_eq!(framer.get_ref().get_ref().as_slice(), b"0003CAU");
    /// ```
    pub fn send(&mut self, payload: &[u8]) -> Result<(), FramingError> {
        if payload.is_empty() {
            return Ok(());
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FramingError::PayloadTooLarge(payload.len()));
        }

        let mut buf = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
        buf.extend_from_slice(format!("{:0width$}", payload.len(), width = LENGTH_PREFIX_LEN).as_bytes());
        buf.extend_from_slice(payload);

        self.stream.write_all(&buf)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Reads the next frame.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::InvalidLength`] for a garbled prefix and
    /// [`FramingError::Io`] for stream failures other than an orderly close or
    /// a connection reset (both reported as [`Frame::Closed`]).
    pub fn recv(&mut self) -> Result<Frame, FramingError> {
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        match self.fill(&mut prefix, true)? {
            Fill::Complete => {}
            Fill::Closed => return Ok(Frame::Closed),
            Fill::TimedOut => return Ok(Frame::TimedOut),
        }

        let len = parse_length(&prefix)?;
        if len == 0 {
            return Ok(Frame::Closed);
        }

        let mut payload = vec![0u8; len];
        match self.fill(&mut payload, false)? {
            Fill::Complete => Ok(Frame::Data(payload)),
            Fill::Closed => Ok(Frame::Closed),
            // `fill` only reports TimedOut when idle timeouts are allowed.
            Fill::TimedOut => Err(FramingError::Io(io::ErrorKind::TimedOut.into())),
        }
    }

    fn fill(&mut self, buf: &mut [u8], idle_timeout_allowed: bool) -> Result<Fill, FramingError> {
        let mut filled = 0;
        let mut stalls = 0;

        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => return Ok(Fill::Closed),
                Ok(n) => {
                    filled += n;
                    stalls = 0;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(&e) => {
                    if filled == 0 && idle_timeout_allowed {
                        return Ok(Fill::TimedOut);
                    }
                    stalls += 1;
                    if stalls >= MAX_STALLED_READS {
                        return Err(FramingError::Io(e));
                    }
                }
                Err(e) if is_disconnect(&e) => return Ok(Fill::Closed),
                Err(e) => return Err(FramingError::Io(e)),
            }
        }
        Ok(Fill::Complete)
    }
}

/// Returns `true` for the error kinds a socket read timeout produces.
///
/// Unix reports `WouldBlock`, Windows reports `TimedOut`.
pub fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
    )
}

fn parse_length(prefix: &[u8]) -> Result<usize, FramingError> {
    let invalid = || FramingError::InvalidLength(String::from_utf8_lossy(prefix).into_owned());
    if !prefix.iter().all(u8::is_ascii_digit) {
        return Err(invalid());
    }
    std::str::from_utf8(prefix)
        .map_err(|_| invalid())?
        .parse::<usize>()
        .map_err(|_| invalid())
}

// ── Tests ────────────────────────────────────────────────────────────────────
