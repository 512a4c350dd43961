//! Engine error taxonomy.
//!
//! Every fault surfaces synchronously from the call that detected it as an
//! [`EngineError`] carrying a closed [`ErrorKind`], the session phase at
//! detection time, and a human-readable message. Wire-level causes
//! ([`FrameError`]) and negotiation causes
//! ([`HandshakeError`](crate::handshake::HandshakeError)) fold into the
//! same taxonomy so callers match on one enum.

use crate::frame::FrameError;
use crate::handshake::HandshakeError;
use crate::session::Phase;
use thiserror::Error;

/// Classification of engine failures. Closed enumeration; no catch-all
/// variant beyond [`GenericFailure`](Self::GenericFailure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The call is not valid in the current phase or queue state
    /// (completing a stale context, posting a second receive, draining an
    /// open session).
    InvalidOperation,
    /// The peer violated protocol sequencing (continuation without a
    /// started message, new data frame mid-message, wrong mask state,
    /// fragmented control frame).
    InvalidProtocolOperation,
    /// The peer sent malformed wire data (reserved bits, unknown opcode,
    /// invalid UTF-8, invalid close payload).
    InvalidProtocolFormat,
    /// A length exceeded a configured or representable bound.
    NumericOverflow,
    /// An unclassified failure (e.g. the transport stalled past the
    /// configured limit).
    GenericFailure,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InvalidOperation => "invalid operation",
            Self::InvalidProtocolOperation => "invalid protocol operation",
            Self::InvalidProtocolFormat => "invalid protocol format",
            Self::NumericOverflow => "numeric overflow",
            Self::GenericFailure => "generic failure",
        };
        f.write_str(name)
    }
}

/// An engine failure: what went wrong, and where the session stood.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message} (phase: {phase})")]
pub struct EngineError {
    /// Failure classification.
    pub kind: ErrorKind,
    /// Session phase when the failure was detected.
    pub phase: Phase,
    /// Human-readable detail.
    pub message: String,
}

impl EngineError {
    /// Create an error with an arbitrary kind.
    pub fn new(kind: ErrorKind, phase: Phase, message: impl Into<String>) -> Self {
        Self {
            kind,
            phase,
            message: message.into(),
        }
    }

    /// Shorthand for [`ErrorKind::InvalidOperation`].
    pub fn invalid_operation(phase: Phase, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidOperation, phase, message)
    }

    /// Classify and wrap a frame codec failure.
    #[must_use]
    pub fn from_frame(err: &FrameError, phase: Phase) -> Self {
        let kind = match err {
            FrameError::InvalidOpcode(_)
            | FrameError::ReservedBits
            | FrameError::InvalidUtf8
            | FrameError::InvalidClosePayload
            | FrameError::ControlFrameTooLarge(_) => ErrorKind::InvalidProtocolFormat,
            FrameError::ProtocolViolation(_)
            | FrameError::FragmentedControlFrame
            | FrameError::UnmaskedFrame
            | FrameError::MaskedFrame => ErrorKind::InvalidProtocolOperation,
            FrameError::PayloadTooLarge { .. } | FrameError::LengthOverflow => {
                ErrorKind::NumericOverflow
            }
        };
        Self::new(kind, phase, err.to_string())
    }

    /// Wrap a handshake failure; negotiation faults are always format
    /// errors detected while connecting.
    #[must_use]
    pub fn from_handshake(err: &HandshakeError) -> Self {
        Self::new(
            ErrorKind::InvalidProtocolFormat,
            Phase::Connecting,
            err.to_string(),
        )
    }

    /// True for [`ErrorKind::InvalidOperation`].
    #[must_use]
    pub const fn is_invalid_operation(&self) -> bool {
        matches!(self.kind, ErrorKind::InvalidOperation)
    }

    /// True for either protocol-violation kind.
    #[must_use]
    pub const fn is_protocol_error(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::InvalidProtocolOperation | ErrorKind::InvalidProtocolFormat
        )
    }

    /// True for [`ErrorKind::NumericOverflow`].
    #[must_use]
    pub const fn is_overflow(&self) -> bool {
        matches!(self.kind, ErrorKind::NumericOverflow)
    }
}

impl From<HandshakeError> for EngineError {
    fn from(err: HandshakeError) -> Self {
        Self::from_handshake(&err)
    }
}
