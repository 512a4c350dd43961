//! WebSocket opening handshake (RFC 6455 Section 4).
//!
//! The handshake upgrades an HTTP/1.1 connection to the WebSocket protocol.
//! This module works purely on header sets: the caller owns the HTTP
//! request/response machinery and the transport, and hands header name/value
//! pairs in and out. The key exchange:
//!
//! 1. Client sends a random 16-byte key, base64-encoded, in
//!    `Sec-WebSocket-Key`
//! 2. Server concatenates the key with a magic GUID, hashes with SHA-1, and
//!    returns the base64 digest in `Sec-WebSocket-Accept`
//! 3. Client verifies the accept value byte-for-byte
//!
//! Subprotocols are carried opaquely: requested names go out in
//! `Sec-WebSocket-Protocol` and the server's selection is surfaced without
//! interpretation.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Magic GUID from RFC 6455 Section 1.3, appended to the client key before
/// hashing.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this engine speaks.
pub const SUPPORTED_VERSION: &str = "13";

/// An HTTP header as a name/value pair.
///
/// Names are matched case-insensitively on receipt and emitted in the exact
/// case given here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHeader {
    /// Header name.
    pub name: String,
    /// Header value.
    pub value: String,
}

impl HttpHeader {
    /// Create a header from any string-like pair.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Handshake negotiation errors.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// A required header is absent.
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),
    /// A required header is present but carries the wrong value.
    #[error("invalid value for header: {0}")]
    InvalidHeader(&'static str),
    /// `Sec-WebSocket-Key` does not decode to 16 bytes.
    #[error("invalid Sec-WebSocket-Key")]
    InvalidKey,
    /// The peer asked for a protocol version other than 13.
    #[error("unsupported WebSocket version: {0}")]
    UnsupportedVersion(String),
    /// `Sec-WebSocket-Accept` does not match the expected digest.
    #[error("accept key mismatch: expected {expected}, got {actual}")]
    AcceptMismatch {
        /// The digest computed from the key we sent.
        expected: String,
        /// The value the server returned.
        actual: String,
    },
}

/// Look up a header value by case-insensitive name.
fn find_header<'a>(headers: &'a [HttpHeader], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// Check whether a comma-separated header value contains the given token,
/// case-insensitively. `Connection: keep-alive, Upgrade` must match
/// "upgrade".
fn header_has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// Compute the `Sec-WebSocket-Accept` value for a client key.
///
/// `base64(SHA1(key + GUID))` per RFC 6455 Section 4.2.2.
#[must_use]
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Generate a random client key (16 random bytes, base64-encoded).
#[must_use]
pub fn generate_client_key() -> String {
    let mut nonce = [0u8; 16];
    getrandom::fill(&mut nonce).expect("OS RNG unavailable");
    BASE64.encode(nonce)
}

/// Client side of the opening handshake.
///
/// Holds the generated key between the begin and end steps so the accept
/// value can be verified.
#[derive(Debug)]
pub struct ClientHandshake {
    key: String,
    protocols: Vec<String>,
}

impl ClientHandshake {
    /// Create a client negotiator with a fresh random key.
    #[must_use]
    pub fn new() -> Self {
        Self {
            key: generate_client_key(),
            protocols: Vec::new(),
        }
    }

    /// Request one or more subprotocols, in preference order.
    #[must_use]
    pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// The key this negotiator sends (test hook).
    #[cfg(test)]
    pub(crate) fn with_key(mut self, key: &str) -> Self {
        self.key = key.to_string();
        self
    }

    /// Produce the upgrade request headers.
    ///
    /// The caller's base headers (Host, cookies, and so on) come first,
    /// followed by the upgrade fields. The caller is responsible for the
    /// request line.
    #[must_use]
    pub fn begin(&self, base_headers: &[HttpHeader]) -> Vec<HttpHeader> {
        let mut headers = Vec::with_capacity(base_headers.len() + 5);
        headers.extend_from_slice(base_headers);
        headers.push(HttpHeader::new("Upgrade", "websocket"));
        headers.push(HttpHeader::new("Connection", "Upgrade"));
        headers.push(HttpHeader::new("Sec-WebSocket-Key", self.key.clone()));
        headers.push(HttpHeader::new(
            "Sec-WebSocket-Version",
            SUPPORTED_VERSION,
        ));
        if !self.protocols.is_empty() {
            headers.push(HttpHeader::new(
                "Sec-WebSocket-Protocol",
                self.protocols.join(", "),
            ));
        }
        headers
    }

    /// Validate the server's 101 response headers.
    ///
    /// Returns the subprotocol the server selected, if any.
    ///
    /// # Errors
    ///
    /// Returns a [`HandshakeError`] if the Upgrade/Connection fields are
    /// missing or wrong, or the accept key does not match.
    pub fn end(&self, response_headers: &[HttpHeader]) -> Result<Option<String>, HandshakeError> {
        let upgrade = find_header(response_headers, "Upgrade")
            .ok_or(HandshakeError::MissingHeader("Upgrade"))?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(HandshakeError::InvalidHeader("Upgrade"));
        }

        let connection = find_header(response_headers, "Connection")
            .ok_or(HandshakeError::MissingHeader("Connection"))?;
        if !header_has_token(connection, "upgrade") {
            return Err(HandshakeError::InvalidHeader("Connection"));
        }

        let actual = find_header(response_headers, "Sec-WebSocket-Accept")
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Accept"))?;
        let expected = compute_accept_key(&self.key);
        if actual != expected {
            return Err(HandshakeError::AcceptMismatch {
                expected,
                actual: actual.to_string(),
            });
        }

        Ok(find_header(response_headers, "Sec-WebSocket-Protocol").map(String::from))
    }
}

impl Default for ClientHandshake {
    fn default() -> Self {
        Self::new()
    }
}

/// Server side of the opening handshake.
#[derive(Debug, Default)]
pub struct ServerHandshake;

impl ServerHandshake {
    /// Validate an upgrade request and produce the 101 response headers.
    ///
    /// `selected_protocol`, if given, is echoed in `Sec-WebSocket-Protocol`;
    /// the engine does not check it against the client's request list. The
    /// caller is responsible for the status line
    /// (`HTTP/1.1 101 Switching Protocols`).
    ///
    /// # Errors
    ///
    /// Returns a [`HandshakeError`] if the request is not a well-formed
    /// version-13 upgrade.
    pub fn begin(
        request_headers: &[HttpHeader],
        selected_protocol: Option<&str>,
    ) -> Result<Vec<HttpHeader>, HandshakeError> {
        let upgrade = find_header(request_headers, "Upgrade")
            .ok_or(HandshakeError::MissingHeader("Upgrade"))?;
        if !header_has_token(upgrade, "websocket") {
            return Err(HandshakeError::InvalidHeader("Upgrade"));
        }

        let connection = find_header(request_headers, "Connection")
            .ok_or(HandshakeError::MissingHeader("Connection"))?;
        if !header_has_token(connection, "upgrade") {
            return Err(HandshakeError::InvalidHeader("Connection"));
        }

        let version = find_header(request_headers, "Sec-WebSocket-Version")
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Version"))?;
        if version.trim() != SUPPORTED_VERSION {
            return Err(HandshakeError::UnsupportedVersion(version.to_string()));
        }

        let key = find_header(request_headers, "Sec-WebSocket-Key")
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;
        let decoded = BASE64
            .decode(key.trim())
            .map_err(|_| HandshakeError::InvalidKey)?;
        if decoded.len() != 16 {
            return Err(HandshakeError::InvalidKey);
        }

        let mut headers = vec![
            HttpHeader::new("Upgrade", "websocket"),
            HttpHeader::new("Connection", "Upgrade"),
            HttpHeader::new("Sec-WebSocket-Accept", compute_accept_key(key.trim())),
        ];
        if let Some(protocol) = selected_protocol {
            headers.push(HttpHeader::new("Sec-WebSocket-Protocol", protocol));
        }
        Ok(headers)
    }
}
