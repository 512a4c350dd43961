//! Close frame payload handling (RFC 6455 Section 7).
//!
//! A close frame carries an optional payload:
//!
//! - empty: no status code, no reason
//! - 2 bytes: big-endian status code
//! - 2+ bytes: status code followed by UTF-8 reason text
//!
//! A 1-byte payload is malformed. The close handshake itself (who closed,
//! whether the echo went out) is tracked by the session; this module only
//! parses and encodes the payload.

use crate::frame::FrameError;
use bytes::Bytes;

/// Well-known close status codes (RFC 6455 Section 7.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    /// 1000: normal closure.
    Normal = 1000,
    /// 1001: endpoint going away.
    GoingAway = 1001,
    /// 1002: protocol error.
    ProtocolError = 1002,
    /// 1003: unsupported data type.
    Unsupported = 1003,
    /// 1007: payload inconsistent with message type (e.g. bad UTF-8).
    InvalidPayload = 1007,
    /// 1008: policy violation.
    PolicyViolation = 1008,
    /// 1009: message too big.
    MessageTooBig = 1009,
    /// 1010: client required an extension the server did not negotiate.
    MandatoryExtension = 1010,
    /// 1011: server encountered an unexpected condition.
    InternalError = 1011,
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code as Self
    }
}

impl CloseCode {
    /// Check whether a raw code value may appear on the wire.
    ///
    /// Valid ranges per RFC 6455 Section 7.4 and the IANA close code
    /// registry:
    /// - 1000-1003, 1007-1014: standard and registered codes (1012-1014
    ///   are Service Restart, Try Again Later, and Bad Gateway)
    /// - 3000-3999: registered (IANA)
    /// - 4000-4999: private use
    ///
    /// 1004-1006 and 1015 are reserved for local signalling and must not be
    /// sent or accepted in a close frame payload.
    #[must_use]
    pub const fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

/// Parsed close frame payload.
///
/// The code is kept as the raw `u16` so registered and private-use codes
/// (3000-4999) survive a parse/encode round trip exactly.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseReason {
    /// Close status code, if the payload carried one.
    pub code: Option<u16>,
    /// Close reason text, if the payload carried one.
    pub text: Option<String>,
}

impl CloseReason {
    /// Create a close reason with a code and optional text.
    #[must_use]
    pub fn new(code: u16, text: Option<&str>) -> Self {
        Self {
            code: Some(code),
            text: text.map(String::from),
        }
    }

    /// Create an empty close reason (no code or text).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a close reason for normal closure.
    #[must_use]
    pub fn normal() -> Self {
        Self::new(CloseCode::Normal.into(), None)
    }

    /// Parse a close frame payload.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidClosePayload`] if the payload is exactly
    /// 1 byte, the status code is outside the wire-valid ranges, or the
    /// reason text is not valid UTF-8.
    pub fn parse(payload: &[u8]) -> Result<Self, FrameError> {
        match payload.len() {
            0 => Ok(Self::empty()),
            1 => Err(FrameError::InvalidClosePayload),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                if !CloseCode::is_valid_code(code) {
                    return Err(FrameError::InvalidClosePayload);
                }

                let text = if payload.len() > 2 {
                    let text = std::str::from_utf8(&payload[2..])
                        .map_err(|_| FrameError::InvalidClosePayload)?;
                    Some(text.to_string())
                } else {
                    None
                };

                Ok(Self {
                    code: Some(code),
                    text,
                })
            }
        }
    }

    /// Encode this close reason into a close frame payload.
    ///
    /// Text without a code cannot be represented on the wire and is dropped.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        match (self.code, &self.text) {
            (None, _) => Bytes::new(),
            (Some(code), None) => Bytes::copy_from_slice(&code.to_be_bytes()),
            (Some(code), Some(text)) => {
                let mut buf = Vec::with_capacity(2 + text.len());
                buf.extend_from_slice(&code.to_be_bytes());
                buf.extend_from_slice(text.as_bytes());
                Bytes::from(buf)
            }
        }
    }

    /// Check if this represents a normal closure.
    #[must_use]
    pub fn is_normal(&self) -> bool {
        self.code == Some(CloseCode::Normal.into())
    }
}
