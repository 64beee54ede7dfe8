//! Pre-auth wire framing.
//!
//! A client's first bytes are a credential payload: a single JSON object
//! delivered as ASCII. The framer only finds the frame boundary — it never
//! parses JSON. A frame is complete when, after stripping trailing ASCII
//! whitespace, the final byte is `}`. Everything up to that point is handed
//! to the credential validator as one buffer.
//!
//! The supervisor answers the frame with exactly one status byte
//! ([`AUTH_FAILED`], [`AUTH_SUCCESS_NEW`] or [`AUTH_SUCCESS_RECONNECT`]);
//! all bytes after that byte are opaque and relayed verbatim.

/// A username + password with some fluff should always fit in 500 bytes.
pub const AUTH_MAXLEN: usize = 500;

/// Slightly bigger than the cap so an overrun is detected rather than
/// silently truncated.
const AUTHBUF_SIZE: usize = AUTH_MAXLEN + 12;

/// Credentials rejected; the socket is closed after this byte drains.
pub const AUTH_FAILED: u8 = 0;
/// Credentials accepted, a fresh game process was spawned.
pub const AUTH_SUCCESS_NEW: u8 = 1;
/// Credentials accepted, the connection was spliced onto a running game.
pub const AUTH_SUCCESS_RECONNECT: u8 = 2;

/// Result of feeding bytes to an [`AuthFramer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// The frame boundary has not been seen yet.
    NeedMore,
    /// A complete credential frame is buffered; call [`AuthFramer::frame`].
    Ready,
    /// The client sent more than [`AUTH_MAXLEN`] bytes without completing a
    /// frame. The validator must never see this buffer.
    Overflow,
    /// The peer closed the socket before completing a frame.
    PeerGone,
}

/// Accumulates pre-auth bytes until a complete credential frame is seen.
///
/// One framer lives per pending connection and is dropped once the
/// connection is authenticated or destroyed.
pub struct AuthFramer {
    buf: Vec<u8>,
}

impl AuthFramer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(AUTHBUF_SIZE),
        }
    }

    /// Append `data` (one socket read) and classify the buffer state.
    ///
    /// An empty `data` is a zero-length read, i.e. the peer hung up.
    /// The overrun check runs before the boundary scan: a client that
    /// needs the full 500 bytes is treated as an overrun, never as a
    /// valid frame.
    pub fn feed(&mut self, data: &[u8]) -> FrameStatus {
        if data.is_empty() {
            return FrameStatus::PeerGone;
        }

        self.buf.extend_from_slice(data);

        if self.buf.len() >= AUTH_MAXLEN {
            return FrameStatus::Overflow;
        }

        // A JSON object always ends with '}'.
        match self.buf.trim_ascii_end().last() {
            Some(b'}') => FrameStatus::Ready,
            _ => FrameStatus::NeedMore,
        }
    }

    /// The buffered credential frame, trailing whitespace stripped.
    pub fn frame(&self) -> &[u8] {
        self.buf.trim_ascii_end()
    }
}

impl Default for AuthFramer {
    fn default() -> Self {
        Self::new()
    }
}
