//! WebSocket frame codec according to RFC 6455.
//!
//! Implements the WebSocket wire format for framing messages:
//! - Frame header encoding/decoding with 7/16/64-bit payload lengths
//! - Masking (client-to-server) and unmasking
//! - Control frame validation
//!
//! # Frame Format (RFC 6455 Section 5.2)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```
//!
//! The codec is a pure byte transformer: `decode` consumes wire bytes from a
//! caller-fed buffer and `encode` appends wire bytes to a caller-owned buffer.
//! It never touches a socket.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// WebSocket frame opcode (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Continuation frame (fragmented message).
    Continuation = 0x0,
    /// Text data frame.
    Text = 0x1,
    /// Binary data frame.
    Binary = 0x2,
    // 0x3-0x7 reserved for non-control frames
    /// Connection close control frame.
    Close = 0x8,
    /// Ping control frame.
    Ping = 0x9,
    /// Pong control frame.
    Pong = 0xA,
    // 0xB-0xF reserved for control frames
}

impl Opcode {
    /// Returns true if this is a control frame (Close, Ping, Pong).
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Returns true if this is a data frame (Continuation, Text, Binary).
    #[must_use]
    pub const fn is_data(self) -> bool {
        matches!(self, Self::Continuation | Self::Text | Self::Binary)
    }

    /// Try to parse an opcode from a byte value.
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(FrameError::InvalidOpcode(value)),
        }
    }
}

/// Role in the WebSocket connection (affects masking requirements).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client role: masks frames sent to the server.
    Client,
    /// Server role: never masks outgoing frames.
    Server,
}

impl Role {
    /// Returns the opposite role (the peer's role).
    #[must_use]
    pub const fn peer(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

/// WebSocket frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Final fragment flag (FIN bit).
    pub fin: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Whether the frame arrived masked (receive side only).
    pub masked: bool,
    /// Payload data, already unmasked on decode.
    pub payload: Bytes,
}

impl Frame {
    /// Create a final frame with the given opcode and payload.
    #[must_use]
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            masked: false,
            payload: payload.into(),
        }
    }

    /// Create a text frame.
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Text, payload)
    }

    /// Create a binary frame.
    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Binary, payload)
    }

    /// Create a ping frame with optional payload.
    #[must_use]
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    /// Create a pong frame with optional payload.
    #[must_use]
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// Create a close frame from an encoded close payload.
    #[must_use]
    pub fn close(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Close, payload)
    }

    /// Clear the FIN bit, marking this frame as a non-final fragment.
    #[must_use]
    pub fn fragment(mut self) -> Self {
        self.fin = false;
        self
    }
}

/// Frame codec errors.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Invalid or reserved opcode value.
    #[error("invalid opcode: 0x{0:X}")]
    InvalidOpcode(u8),
    /// Reserved header bits set without a negotiated extension.
    #[error("reserved bits set without extension")]
    ReservedBits,
    /// Sequencing violation (fragmentation or masking misuse).
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    /// Declared payload length exceeds the configured buffer size.
    #[error("payload of {size} bytes exceeds limit of {max}")]
    PayloadTooLarge {
        /// Declared payload size in bytes.
        size: u64,
        /// Configured maximum in bytes.
        max: usize,
    },
    /// 64-bit payload length with the high bit set (RFC 6455 Section 5.2).
    #[error("64-bit payload length has high bit set")]
    LengthOverflow,
    /// Control frame payload exceeds 125 bytes.
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlFrameTooLarge(usize),
    /// Control frame with FIN clear.
    #[error("control frame cannot be fragmented")]
    FragmentedControlFrame,
    /// Frame arrived unmasked where masking is required.
    #[error("client frame must be masked")]
    UnmaskedFrame,
    /// Frame arrived masked where masking is forbidden.
    #[error("server frame must not be masked")]
    MaskedFrame,
    /// Invalid UTF-8 in a text payload.
    #[error("invalid UTF-8 in text payload")]
    InvalidUtf8,
    /// Invalid close frame payload (bad length, code, or reason text).
    #[error("invalid close frame payload")]
    InvalidClosePayload,
}

/// Partially decoded frame header, carried between decode states.
#[derive(Debug, Clone, Copy)]
struct PendingHeader {
    fin: bool,
    opcode: Opcode,
    masked: bool,
}

/// Decode state machine for the frame codec.
#[derive(Debug)]
enum DecodeState {
    /// Waiting for the first 2 header bytes.
    Header,
    /// Reading a 2- or 8-byte extended payload length.
    ExtendedLength {
        header: PendingHeader,
        bytes_needed: usize,
    },
    /// Reading the 4-byte mask key.
    MaskKey {
        header: PendingHeader,
        payload_len: usize,
    },
    /// Reading payload data.
    Payload {
        header: PendingHeader,
        mask_key: Option<[u8; 4]>,
        payload_len: usize,
    },
}

/// Streaming WebSocket frame codec.
///
/// One codec instance per direction: the send queue encodes with it, the
/// receive queue decodes with it. The mask policy follows the session role
/// unless masking was disabled in the session configuration (test/loopback
/// use only).
#[derive(Debug)]
pub struct FrameCodec {
    /// Local role; the decode side expects frames from the peer role.
    role: Role,
    /// Whether client-originated frames carry a mask.
    masking: bool,
    /// Maximum accepted payload size for a single frame.
    max_payload_size: usize,
    /// Current decode state.
    state: DecodeState,
}

impl FrameCodec {
    /// Creates a codec for the given role and payload limit.
    #[must_use]
    pub fn new(role: Role, max_payload_size: usize) -> Self {
        Self {
            role,
            masking: true,
            max_payload_size,
            state: DecodeState::Header,
        }
    }

    /// Disable masking of client frames (test/loopback use only).
    #[must_use]
    pub fn masking(mut self, enabled: bool) -> Self {
        self.masking = enabled;
        self
    }

    /// Decode the next frame from `src`, consuming exactly the bytes used.
    ///
    /// Returns `Ok(None)` when more wire bytes are needed. Decode state is
    /// preserved across calls, so partial headers and payloads may be fed in
    /// arbitrary chunks.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] on any wire-format or masking violation.
    /// All decode errors are fatal: the stream cannot be resynchronized.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        loop {
            match &self.state {
                DecodeState::Header => {
                    if src.len() < 2 {
                        return Ok(None);
                    }

                    let first = src[0];
                    let second = src[1];

                    let fin = (first & 0x80) != 0;
                    if first & 0x70 != 0 {
                        return Err(FrameError::ReservedBits);
                    }
                    let opcode = Opcode::from_u8(first & 0x0F)?;
                    let masked = (second & 0x80) != 0;
                    let len7 = second & 0x7F;

                    self.check_mask_policy(masked)?;

                    if opcode.is_control() {
                        if !fin {
                            return Err(FrameError::FragmentedControlFrame);
                        }
                        if len7 > 125 {
                            return Err(FrameError::ControlFrameTooLarge(len7 as usize));
                        }
                    }

                    let _ = src.split_to(2);
                    let header = PendingHeader {
                        fin,
                        opcode,
                        masked,
                    };

                    match len7 {
                        0..=125 => {
                            self.advance_to_body(header, u64::from(len7))?;
                        }
                        126 => {
                            self.state = DecodeState::ExtendedLength {
                                header,
                                bytes_needed: 2,
                            };
                        }
                        _ => {
                            self.state = DecodeState::ExtendedLength {
                                header,
                                bytes_needed: 8,
                            };
                        }
                    }
                }

                DecodeState::ExtendedLength {
                    header,
                    bytes_needed,
                } => {
                    if src.len() < *bytes_needed {
                        return Ok(None);
                    }
                    let header = *header;

                    let payload_len = if *bytes_needed == 2 {
                        let raw = src.split_to(2);
                        u64::from(u16::from_be_bytes([raw[0], raw[1]]))
                    } else {
                        let raw = src.split_to(8);
                        let len = u64::from_be_bytes([
                            raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
                        ]);
                        if len & (1 << 63) != 0 {
                            return Err(FrameError::LengthOverflow);
                        }
                        len
                    };

                    self.advance_to_body(header, payload_len)?;
                }

                DecodeState::MaskKey {
                    header,
                    payload_len,
                } => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let header = *header;
                    let payload_len = *payload_len;

                    let raw = src.split_to(4);
                    let mut mask_key = [0u8; 4];
                    mask_key.copy_from_slice(&raw);

                    self.state = DecodeState::Payload {
                        header,
                        mask_key: Some(mask_key),
                        payload_len,
                    };
                }

                DecodeState::Payload {
                    header,
                    mask_key,
                    payload_len,
                } => {
                    if src.len() < *payload_len {
                        return Ok(None);
                    }

                    let mut payload = src.split_to(*payload_len);
                    if let Some(key) = mask_key {
                        apply_mask(&mut payload, *key);
                    }

                    let frame = Frame {
                        fin: header.fin,
                        opcode: header.opcode,
                        masked: mask_key.is_some(),
                        payload: payload.freeze(),
                    };

                    self.state = DecodeState::Header;
                    return Ok(Some(frame));
                }
            }
        }
    }

    /// Encode a frame, appending its wire bytes to `dst`.
    ///
    /// Client-role codecs mask the payload with a fresh random key unless
    /// masking was disabled.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] for control frames that are fragmented or
    /// oversized.
    pub fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let payload_len = frame.payload.len();

        if frame.opcode.is_control() {
            if !frame.fin {
                return Err(FrameError::FragmentedControlFrame);
            }
            if payload_len > 125 {
                return Err(FrameError::ControlFrameTooLarge(payload_len));
            }
        }

        let should_mask = self.role == Role::Client && self.masking;

        let mut first = frame.opcode as u8;
        if frame.fin {
            first |= 0x80;
        }
        let mask_bit = if should_mask { 0x80 } else { 0 };

        let extended_len = if payload_len > 65535 {
            8
        } else if payload_len > 125 {
            2
        } else {
            0
        };
        let mask_len = if should_mask { 4 } else { 0 };
        dst.reserve(2 + extended_len + mask_len + payload_len);

        dst.put_u8(first);
        if payload_len <= 125 {
            dst.put_u8(mask_bit | payload_len as u8);
        } else if payload_len <= 65535 {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(payload_len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(payload_len as u64);
        }

        if should_mask {
            let mask_key = generate_mask_key();
            dst.put_slice(&mask_key);

            let start = dst.len();
            dst.put_slice(&frame.payload);
            apply_mask(&mut dst[start..], mask_key);
        } else {
            dst.put_slice(&frame.payload);
        }

        Ok(())
    }

    /// Reject frames whose mask bit contradicts the peer's role.
    fn check_mask_policy(&self, masked: bool) -> Result<(), FrameError> {
        match self.role {
            // Frames arriving at a server come from a client and must be
            // masked, unless masking was disabled for loopback testing.
            Role::Server if !masked && self.masking => Err(FrameError::UnmaskedFrame),
            // Frames arriving at a client come from a server and must never
            // be masked.
            Role::Client if masked => Err(FrameError::MaskedFrame),
            _ => Ok(()),
        }
    }

    /// Validate the declared length and move to the mask-key or payload state.
    fn advance_to_body(&mut self, header: PendingHeader, len: u64) -> Result<(), FrameError> {
        if len > self.max_payload_size as u64 {
            self.state = DecodeState::Header;
            return Err(FrameError::PayloadTooLarge {
                size: len,
                max: self.max_payload_size,
            });
        }
        let payload_len = len as usize;

        self.state = if header.masked {
            DecodeState::MaskKey {
                header,
                payload_len,
            }
        } else {
            DecodeState::Payload {
                header,
                mask_key: None,
                payload_len,
            }
        };
        Ok(())
    }
}

/// Apply XOR masking to payload data.
///
/// Masking and unmasking are the same operation; the mask is applied in
/// place, cycling the 4-byte key per byte index modulo 4.
pub fn apply_mask(payload: &mut [u8], mask_key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

/// Generate a mask key for client-to-server frames.
///
/// RFC 6455 Section 5.3 requires masking keys to come from a strong entropy
/// source to prevent cache-poisoning attacks against intermediaries.
fn generate_mask_key() -> [u8; 4] {
    let mut key = [0u8; 4];
    getrandom::fill(&mut key).expect("OS RNG unavailable");
    key
}
