//! Incremental UTF-8 validation for fragmented text messages.
//!
//! Text message payloads may be split across frames at arbitrary byte
//! offsets, including mid-codepoint. The validator keeps the trailing bytes
//! of an incomplete sequence between chunks and distinguishes "incomplete at
//! the end of this chunk" (fine, wait for more) from "invalid sequence"
//! (fatal).

use crate::frame::FrameError;

/// Maximum bytes a single UTF-8 sequence can span.
const MAX_SEQUENCE_LEN: usize = 4;

/// Streaming UTF-8 validator.
///
/// Feed payload chunks with [`push`](Self::push); call
/// [`finish`](Self::finish) at message end (the final fragment) to reject a
/// message that stops mid-codepoint.
#[derive(Debug, Default)]
pub struct Utf8Validator {
    /// Trailing bytes of an incomplete sequence from the previous chunk.
    pending: Vec<u8>,
}

impl Utf8Validator {
    /// Create a validator with no carried-over state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the next chunk of a text message.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidUtf8`] if the chunk contains a byte
    /// sequence that cannot start or continue a valid codepoint. An
    /// incomplete trailing sequence is not an error; its bytes are carried
    /// into the next call.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), FrameError> {
        if self.pending.is_empty() {
            self.check(chunk.to_vec())
        } else {
            let mut buf = std::mem::take(&mut self.pending);
            buf.extend_from_slice(chunk);
            self.check(buf)
        }
    }

    /// Finish the message.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidUtf8`] if the message ended in the
    /// middle of a multi-byte sequence.
    pub fn finish(&mut self) -> Result<(), FrameError> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            self.pending.clear();
            Err(FrameError::InvalidUtf8)
        }
    }

    /// Discard any carried-over state, readying the validator for a new
    /// message.
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    fn check(&mut self, buf: Vec<u8>) -> Result<(), FrameError> {
        match std::str::from_utf8(&buf) {
            Ok(_) => Ok(()),
            Err(err) => {
                // error_len() is Some for an invalid sequence and None for a
                // sequence cut short by the end of input.
                if err.error_len().is_some() {
                    return Err(FrameError::InvalidUtf8);
                }
                let tail = &buf[err.valid_up_to()..];
                if tail.len() >= MAX_SEQUENCE_LEN {
                    return Err(FrameError::InvalidUtf8);
                }
                self.pending = tail.to_vec();
                Ok(())
            }
        }
    }
}
