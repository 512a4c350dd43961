//! Session lifecycle: role, phase machine, configuration, and the opening
//! handshake driver.
//!
//! A [`Session`] is constructed in the Connecting phase, driven through the
//! opening handshake, and then [`split`](Session::split) into the send and
//! receive queue halves plus an [`AbortHandle`]. The phase machine:
//!
//! ```text
//! Connecting ──> Open ──> Draining ──> Closed
//!      │           │          │
//!      └───────────┴──────────┴──────> Aborted
//! ```
//!
//! Phases only move forward. The phase lives in an atomic so `abort` never
//! blocks and never takes the control lock; everything else the two queue
//! halves share sits behind a `parking_lot` mutex.

use crate::close::CloseReason;
use crate::error::EngineError;
use crate::frame::Role;
use crate::handshake::{ClientHandshake, HttpHeader, ServerHandshake};
use crate::queue::{ReceiveQueue, SendQueue};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tracing::debug;

/// Session lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Phase {
    /// Opening handshake not yet complete.
    Connecting = 0,
    /// Data may flow in both directions.
    Open = 1,
    /// A close frame was observed (either direction); pending work flushes,
    /// no new application sends.
    Draining = 2,
    /// Both queues went idle after Draining; the close handshake finished.
    Closed = 3,
    /// Hard abort; reachable from any phase.
    Aborted = 4,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Draining,
            3 => Self::Closed,
            _ => Self::Aborted,
        }
    }

    /// True once the session can never carry data again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Aborted)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Draining => "draining",
            Self::Closed => "closed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// The keep-alive interval the engine advertises when none is configured.
#[must_use]
pub const fn default_keep_alive_interval() -> Duration {
    Duration::from_secs(30)
}

/// Session configuration.
///
/// Builder-style; all knobs have working defaults.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum bytes accepted per application send submit, and the upper
    /// bound for outbound frame payloads.
    pub send_buffer_size: usize,
    /// Size of the staging buffer lent to the caller for reads, and the
    /// maximum declared length accepted for an incoming frame.
    pub receive_buffer_size: usize,
    /// Whether client-originated frames carry a mask. Disabling is for
    /// tests and loopback transports only.
    pub masking: bool,
    /// Whether inbound text payloads are validated as UTF-8.
    pub utf8_verification: bool,
    /// Advisory keep-alive interval; the engine never schedules timers,
    /// the caller uses this to time unsolicited pongs. `None` disables.
    pub keep_alive_interval: Option<Duration>,
    /// Whether an incoming Ping auto-queues a Pong on the send side.
    pub auto_pong: bool,
    /// Maximum consecutive zero-byte completions of a single I/O action
    /// before the engine gives up. `None` tolerates stalls forever.
    pub stall_limit: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: 16 * 1024,
            receive_buffer_size: 16 * 1024,
            masking: true,
            utf8_verification: true,
            keep_alive_interval: Some(default_keep_alive_interval()),
            auto_pong: true,
            stall_limit: None,
        }
    }
}

impl SessionConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum application send size.
    #[must_use]
    pub const fn send_buffer_size(mut self, bytes: usize) -> Self {
        self.send_buffer_size = bytes;
        self
    }

    /// Set the receive staging buffer size and inbound frame limit.
    #[must_use]
    pub const fn receive_buffer_size(mut self, bytes: usize) -> Self {
        self.receive_buffer_size = bytes;
        self
    }

    /// Disable masking (test/loopback use only).
    #[must_use]
    pub const fn disable_masking(mut self) -> Self {
        self.masking = false;
        self
    }

    /// Disable inbound UTF-8 verification.
    #[must_use]
    pub const fn disable_utf8_verification(mut self) -> Self {
        self.utf8_verification = false;
        self
    }

    /// Set or disable the advisory keep-alive interval.
    #[must_use]
    pub const fn keep_alive_interval(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Enable or disable automatic Pong replies to incoming Pings.
    #[must_use]
    pub const fn auto_pong(mut self, enabled: bool) -> Self {
        self.auto_pong = enabled;
        self
    }

    /// Bound consecutive zero-byte completions of one action.
    #[must_use]
    pub const fn stall_limit(mut self, limit: Option<u32>) -> Self {
        self.stall_limit = limit;
        self
    }
}

/// State the two queue halves coordinate through, behind the control lock.
#[derive(Debug, Default)]
pub(crate) struct ControlState {
    /// Pong payloads queued by the receive side for the send side to flush.
    pub(crate) pending_pongs: VecDeque<Bytes>,
    /// Close echo scheduled by the receive side, if we had not closed yet.
    pub(crate) close_echo: Option<CloseReason>,
    /// A close frame of ours was submitted or scheduled.
    pub(crate) close_sent: bool,
    /// The peer's close frame arrived.
    pub(crate) close_received: bool,
    /// Application pings awaiting a pong, for solicited/unsolicited
    /// classification.
    pub(crate) pings_in_flight: u32,
    /// The send queue reported NoAction while Draining.
    pub(crate) send_idle: bool,
    /// The receive queue reported NoAction while Draining.
    pub(crate) recv_idle: bool,
}

/// State shared by the session, both queue halves, and abort handles.
#[derive(Debug)]
pub(crate) struct Shared {
    phase: AtomicU8,
    pub(crate) role: Role,
    pub(crate) config: SessionConfig,
    pub(crate) ctrl: Mutex<ControlState>,
}

impl Shared {
    fn new(role: Role, config: SessionConfig) -> Self {
        Self {
            phase: AtomicU8::new(Phase::Connecting as u8),
            role,
            config,
            ctrl: Mutex::new(ControlState::default()),
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Advance the phase, forward only. Returns the phase after the call.
    pub(crate) fn advance_phase(&self, to: Phase) -> Phase {
        let mut current = self.phase.load(Ordering::Acquire);
        loop {
            if current >= to as u8 {
                return Phase::from_u8(current);
            }
            match self.phase.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(from = %Phase::from_u8(current), to = %to, "phase transition");
                    return to;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Record that a queue went idle while Draining; once both have, the
    /// close handshake is complete.
    pub(crate) fn note_idle(&self, send_side: bool) {
        if self.phase() != Phase::Draining {
            return;
        }
        let both = {
            let mut ctrl = self.ctrl.lock();
            if send_side {
                ctrl.send_idle = true;
            } else {
                ctrl.recv_idle = true;
            }
            ctrl.send_idle && ctrl.recv_idle
        };
        if both {
            self.advance_phase(Phase::Closed);
        }
    }
}

/// Cloneable handle that hard-aborts the session from any thread.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    shared: Arc<Shared>,
}

impl AbortHandle {
    /// Jump the session to the Aborted phase.
    ///
    /// Non-blocking and idempotent. After this, `get_action` on either
    /// queue reports NoAction promptly; the caller then drains both
    /// queues.
    pub fn abort(&self) {
        self.shared.advance_phase(Phase::Aborted);
    }

    /// Current session phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.shared.phase()
    }
}

/// A WebSocket protocol session.
///
/// Performs no I/O. Drive the opening handshake with the begin/end calls,
/// then [`split`](Session::split) into queue halves and pull actions.
#[derive(Debug)]
pub struct Session {
    shared: Arc<Shared>,
    client_handshake: Option<ClientHandshake>,
    protocols: Vec<String>,
    negotiated_protocol: Option<String>,
    /// Server handshake validated, response headers handed out, awaiting
    /// the caller's confirmation that the response was sent.
    server_response_ready: bool,
}

impl Session {
    /// Create a client-role session.
    #[must_use]
    pub fn client(config: SessionConfig) -> Self {
        Self::new(Role::Client, config)
    }

    /// Create a server-role session.
    #[must_use]
    pub fn server(config: SessionConfig) -> Self {
        Self::new(Role::Server, config)
    }

    fn new(role: Role, config: SessionConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(role, config)),
            client_handshake: None,
            protocols: Vec::new(),
            negotiated_protocol: None,
            server_response_ready: false,
        }
    }

    /// Request subprotocols, in preference order (client role).
    #[must_use]
    pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Session role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.shared.phase()
    }

    /// Session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// The subprotocol the handshake settled on, if any.
    #[must_use]
    pub fn protocol(&self) -> Option<&str> {
        self.negotiated_protocol.as_deref()
    }

    /// Produce the client upgrade request headers.
    ///
    /// `base_headers` (Host and friends) are passed through ahead of the
    /// upgrade fields.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if this is not a connecting client session or the
    /// handshake was already begun.
    pub fn begin_client_handshake(
        &mut self,
        base_headers: &[HttpHeader],
    ) -> Result<Vec<HttpHeader>, EngineError> {
        self.require_connecting(Role::Client)?;
        if self.client_handshake.is_some() {
            return Err(EngineError::invalid_operation(
                self.phase(),
                "client handshake already begun",
            ));
        }
        let negotiator = ClientHandshake::new().with_protocols(self.protocols.clone());
        let headers = negotiator.begin(base_headers);
        self.client_handshake = Some(negotiator);
        Ok(headers)
    }

    /// Validate the server's 101 response headers; opens the session.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` without a matching begin call;
    /// `InvalidProtocolFormat` if the response fails validation. A failed
    /// handshake never opens the session.
    pub fn end_client_handshake(
        &mut self,
        response_headers: &[HttpHeader],
    ) -> Result<(), EngineError> {
        self.require_connecting(Role::Client)?;
        let negotiator = self.client_handshake.as_ref().ok_or_else(|| {
            EngineError::invalid_operation(self.phase(), "client handshake not begun")
        })?;
        self.negotiated_protocol = negotiator.end(response_headers)?;
        self.shared.advance_phase(Phase::Open);
        debug!(role = ?self.shared.role, protocol = ?self.negotiated_protocol, "handshake complete");
        Ok(())
    }

    /// Validate a client upgrade request and produce the 101 response
    /// headers.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if this is not a connecting server session;
    /// `InvalidProtocolFormat` if the request is not a well-formed
    /// version-13 upgrade.
    pub fn begin_server_handshake(
        &mut self,
        request_headers: &[HttpHeader],
        selected_protocol: Option<&str>,
    ) -> Result<Vec<HttpHeader>, EngineError> {
        self.require_connecting(Role::Server)?;
        let headers = ServerHandshake::begin(request_headers, selected_protocol)?;
        self.negotiated_protocol = selected_protocol.map(String::from);
        self.server_response_ready = true;
        Ok(headers)
    }

    /// Confirm the 101 response went out; opens the session.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` without a successful begin call.
    pub fn end_server_handshake(&mut self) -> Result<(), EngineError> {
        self.require_connecting(Role::Server)?;
        if !self.server_response_ready {
            return Err(EngineError::invalid_operation(
                self.phase(),
                "server handshake not begun",
            ));
        }
        self.shared.advance_phase(Phase::Open);
        debug!(role = ?self.shared.role, protocol = ?self.negotiated_protocol, "handshake complete");
        Ok(())
    }

    /// Split an open session into its queue halves and an abort handle.
    ///
    /// The two halves may be driven from different threads; each pulls
    /// actions independently and they coordinate through shared state.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` unless the session is Open.
    pub fn split(self) -> Result<(SendQueue, ReceiveQueue, AbortHandle), EngineError> {
        let phase = self.phase();
        if phase != Phase::Open {
            return Err(EngineError::invalid_operation(
                phase,
                "split requires an open session",
            ));
        }
        let abort = AbortHandle {
            shared: Arc::clone(&self.shared),
        };
        let send = SendQueue::new(Arc::clone(&self.shared));
        let receive = ReceiveQueue::new(self.shared);
        Ok((send, receive, abort))
    }

    fn require_connecting(&self, role: Role) -> Result<(), EngineError> {
        let phase = self.phase();
        if phase != Phase::Connecting {
            return Err(EngineError::invalid_operation(
                phase,
                "handshake calls require a connecting session",
            ));
        }
        if self.shared.role != role {
            return Err(EngineError::invalid_operation(
                phase,
                "handshake call does not match session role",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::compute_accept_key;

    fn open_client() -> Session {
        let mut session = Session::client(SessionConfig::default());
        let request = session.begin_client_handshake(&[]).unwrap();
        let key = request
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("Sec-WebSocket-Key"))
            .unwrap()
            .value
            .clone();
        let response = vec![
            HttpHeader::new("Upgrade", "websocket"),
            HttpHeader::new("Connection", "Upgrade"),
            HttpHeader::new("Sec-WebSocket-Accept", compute_accept_key(&key)),
        ];
        session.end_client_handshake(&response).unwrap();
        session
    }

    #[test]
    fn phase_ordering_is_forward_only() {
        let shared = Shared::new(Role::Client, SessionConfig::default());
        assert_eq!(shared.phase(), Phase::Connecting);
        shared.advance_phase(Phase::Open);
        assert_eq!(shared.phase(), Phase::Open);
        // Regression attempt is a no-op.
        shared.advance_phase(Phase::Connecting);
        assert_eq!(shared.phase(), Phase::Open);
        shared.advance_phase(Phase::Aborted);
        assert_eq!(shared.phase(), Phase::Aborted);
        shared.advance_phase(Phase::Closed);
        assert_eq!(shared.phase(), Phase::Aborted);
    }

    #[test]
    fn only_closed_and_aborted_are_terminal() {
        for phase in [Phase::Connecting, Phase::Open, Phase::Draining] {
            assert!(!phase.is_terminal(), "{phase} can still carry data");
        }
        assert!(Phase::Closed.is_terminal());
        assert!(Phase::Aborted.is_terminal());
    }

    #[test]
    fn client_handshake_opens_session() {
        let session = open_client();
        assert_eq!(session.phase(), Phase::Open);
        assert_eq!(session.protocol(), None);
    }

    #[test]
    fn failed_end_leaves_session_connecting() {
        let mut session = Session::client(SessionConfig::default());
        session.begin_client_handshake(&[]).unwrap();
        let bad = vec![
            HttpHeader::new("Upgrade", "websocket"),
            HttpHeader::new("Connection", "Upgrade"),
            HttpHeader::new("Sec-WebSocket-Accept", "d3Jvbmcga2V5IGVudGlyZWx5"),
        ];
        assert!(session.end_client_handshake(&bad).is_err());
        assert_eq!(session.phase(), Phase::Connecting);
    }

    #[test]
    fn end_without_begin_rejected() {
        let mut session = Session::client(SessionConfig::default());
        let err = session.end_client_handshake(&[]).unwrap_err();
        assert!(err.is_invalid_operation());

        let mut session = Session::server(SessionConfig::default());
        let err = session.end_server_handshake().unwrap_err();
        assert!(err.is_invalid_operation());
    }

    #[test]
    fn handshake_role_mismatch_rejected() {
        let mut session = Session::server(SessionConfig::default());
        let err = session.begin_client_handshake(&[]).unwrap_err();
        assert!(err.is_invalid_operation());
    }

    #[test]
    fn server_handshake_opens_session() {
        let mut session = Session::server(SessionConfig::default());
        let request = vec![
            HttpHeader::new("Host", "example.com"),
            HttpHeader::new("Upgrade", "websocket"),
            HttpHeader::new("Connection", "Upgrade"),
            HttpHeader::new("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
            HttpHeader::new("Sec-WebSocket-Version", "13"),
        ];
        let response = session
            .begin_server_handshake(&request, Some("chat"))
            .unwrap();
        assert!(response
            .iter()
            .any(|h| h.name.eq_ignore_ascii_case("Sec-WebSocket-Accept")));
        assert_eq!(session.phase(), Phase::Connecting);

        session.end_server_handshake().unwrap();
        assert_eq!(session.phase(), Phase::Open);
        assert_eq!(session.protocol(), Some("chat"));
    }

    #[test]
    fn split_requires_open() {
        let session = Session::client(SessionConfig::default());
        let err = session.split().unwrap_err();
        assert!(err.is_invalid_operation());
    }

    #[test]
    fn split_yields_working_abort_handle() {
        let session = open_client();
        let (_send, _receive, abort) = session.split().unwrap();
        assert_eq!(abort.phase(), Phase::Open);
        abort.abort();
        assert_eq!(abort.phase(), Phase::Aborted);
        // Idempotent.
        abort.abort();
        assert_eq!(abort.phase(), Phase::Aborted);
    }

    #[test]
    fn config_builder_round_trip() {
        let config = SessionConfig::new()
            .send_buffer_size(1024)
            .receive_buffer_size(2048)
            .disable_masking()
            .disable_utf8_verification()
            .keep_alive_interval(None)
            .auto_pong(false)
            .stall_limit(Some(8));

        assert_eq!(config.send_buffer_size, 1024);
        assert_eq!(config.receive_buffer_size, 2048);
        assert!(!config.masking);
        assert!(!config.utf8_verification);
        assert_eq!(config.keep_alive_interval, None);
        assert!(!config.auto_pong);
        assert_eq!(config.stall_limit, Some(8));
    }

    #[test]
    fn default_keep_alive_is_thirty_seconds() {
        assert_eq!(default_keep_alive_interval(), Duration::from_secs(30));
        assert_eq!(
            SessionConfig::default().keep_alive_interval,
            Some(Duration::from_secs(30))
        );
    }
}
