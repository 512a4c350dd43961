//! Pull-based action queues: the engine's entire I/O surface.
//!
//! The engine never touches a socket. Instead, each half of a split session
//! exposes a queue the caller polls:
//!
//! - [`SendQueue::get_action`] yields `SendToNetwork` (wire bytes to write)
//!   and `IndicateSendComplete` (a submit fully flushed)
//! - [`ReceiveQueue::get_action`] yields `ReceiveFromNetwork` (a writable
//!   slot to fill from the transport) and `IndicateReceiveComplete` (a
//!   decoded frame payload)
//!
//! Every action carries an [`ActionContext`] token. The token is not
//! clonable and is consumed by [`complete_action`](SendQueue::complete_action),
//! so each action completes exactly once; completing with a stale token is
//! an `InvalidOperation`. At most one action is in flight per queue:
//! calling `get_action` again before completing is also `InvalidOperation`.
//!
//! Completing an I/O action with zero bytes means the transport made no
//! progress; the identical action is re-offered on the next poll. After an
//! abort, both queues report `NoAction` promptly and [`drain`](SendQueue::drain)
//! releases whatever was pending.

use crate::close::{CloseCode, CloseReason};
use crate::error::{EngineError, ErrorKind};
use crate::frame::{Frame, FrameCodec, FrameError, Opcode};
use crate::session::{Phase, Shared};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

/// What the caller must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Nothing to do right now.
    NoAction,
    /// Write the action's payload bytes to the transport.
    SendToNetwork,
    /// An application submit has fully flushed.
    IndicateSendComplete,
    /// Fill the queue's slot from the transport.
    ReceiveFromNetwork,
    /// A decoded frame payload is ready.
    IndicateReceiveComplete,
}

/// What kind of data an action refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferType {
    /// No payload semantics (I/O actions).
    None,
    /// Final frame of a text message.
    Utf8Message,
    /// Non-final fragment of a text message.
    Utf8Fragment,
    /// Final frame of a binary message.
    BinaryMessage,
    /// Non-final fragment of a binary message.
    BinaryFragment,
    /// Close frame.
    Close,
    /// Ping, or a pong answering one of our pings.
    PingPong,
    /// A pong with no outstanding ping (keep-alive).
    UnsolicitedPong,
}

/// Which queue a context belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Send,
    Receive,
}

/// Opaque completion token for one action.
///
/// Deliberately neither `Clone` nor `Copy`: completing an action consumes
/// the token, so double completion is a move error at compile time.
#[derive(Debug)]
pub struct ActionContext {
    side: Side,
    seq: u64,
}

/// One polled action.
#[derive(Debug)]
pub struct ActionRequest {
    /// What to do.
    pub kind: ActionKind,
    /// What the payload is.
    pub buffer_type: BufferType,
    /// Wire bytes for `SendToNetwork`; decoded payload for
    /// `IndicateReceiveComplete`; empty otherwise.
    pub payload: Bytes,
    /// Parsed close payload, set on `Close` notifications.
    pub close_reason: Option<CloseReason>,
    /// Completion token; absent for `NoAction`.
    pub context: Option<ActionContext>,
}

impl ActionRequest {
    fn no_action() -> Self {
        Self {
            kind: ActionKind::NoAction,
            buffer_type: BufferType::None,
            payload: Bytes::new(),
            close_reason: None,
            context: None,
        }
    }
}

/// What the outstanding context was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Issued {
    Wire,
    Notify,
}

/// An encoded application submit waiting its turn on the wire.
#[derive(Debug)]
struct PendingSend {
    wire: Bytes,
    buffer_type: BufferType,
    /// Completion notification owed to the application, if any.
    notify: Option<BufferType>,
}

/// The submit currently going out, possibly across several partial writes.
#[derive(Debug)]
struct CurrentSend {
    wire: Bytes,
    offset: usize,
    buffer_type: BufferType,
    notify: Option<BufferType>,
    zero_count: u32,
}

/// Send half of a split session.
///
/// Application submits are encoded immediately and flushed in order; the
/// engine's own frames (auto-pongs) jump the queue, and a close frame (ours
/// or the echo of the peer's) always goes out last.
#[derive(Debug)]
pub struct SendQueue {
    shared: Arc<Shared>,
    codec: FrameCodec,
    pending: VecDeque<PendingSend>,
    current: Option<CurrentSend>,
    /// Completion notification ready for delivery.
    notify: Option<BufferType>,
    in_flight: Option<(u64, Issued)>,
    next_seq: u64,
    /// Opcode of the outbound fragmented message in progress.
    frag_opcode: Option<Opcode>,
}

impl SendQueue {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let codec = FrameCodec::new(shared.role, shared.config.send_buffer_size)
            .masking(shared.config.masking);
        Self {
            shared,
            codec,
            pending: VecDeque::new(),
            current: None,
            notify: None,
            in_flight: None,
            next_seq: 0,
            frag_opcode: None,
        }
    }

    /// Current session phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.shared.phase()
    }

    /// Submit a complete text message, or the final fragment of a
    /// fragmented text message.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` unless the session is Open; `NumericOverflow`
    /// (non-fatal) if the payload exceeds the send buffer size;
    /// `InvalidProtocolOperation` if a binary message is mid-fragmentation.
    pub fn send_text(&mut self, text: &str) -> Result<(), EngineError> {
        self.submit_data(Opcode::Text, Bytes::copy_from_slice(text.as_bytes()), true)
    }

    /// Submit a non-final text fragment.
    ///
    /// # Errors
    ///
    /// As [`send_text`](Self::send_text).
    pub fn send_text_fragment(&mut self, text: &str) -> Result<(), EngineError> {
        self.submit_data(Opcode::Text, Bytes::copy_from_slice(text.as_bytes()), false)
    }

    /// Submit a complete binary message, or the final fragment of a
    /// fragmented binary message.
    ///
    /// # Errors
    ///
    /// As [`send_text`](Self::send_text).
    pub fn send_binary(&mut self, payload: impl Into<Bytes>) -> Result<(), EngineError> {
        self.submit_data(Opcode::Binary, payload.into(), true)
    }

    /// Submit a non-final binary fragment.
    ///
    /// # Errors
    ///
    /// As [`send_text`](Self::send_text).
    pub fn send_binary_fragment(&mut self, payload: impl Into<Bytes>) -> Result<(), EngineError> {
        self.submit_data(Opcode::Binary, payload.into(), false)
    }

    /// Submit a Ping. The eventual matching Pong is classified `PingPong`.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` unless Open; `InvalidProtocolFormat` if the
    /// payload exceeds 125 bytes.
    pub fn send_ping(&mut self, payload: impl Into<Bytes>) -> Result<(), EngineError> {
        self.require_open()?;
        self.push_frame(Frame::ping(payload.into()), BufferType::PingPong, true)?;
        self.shared.ctrl.lock().pings_in_flight += 1;
        Ok(())
    }

    /// Submit a Pong in reply to a received Ping.
    ///
    /// Only needed when `auto_pong` is disabled.
    ///
    /// # Errors
    ///
    /// As [`send_ping`](Self::send_ping).
    pub fn send_pong(&mut self, payload: impl Into<Bytes>) -> Result<(), EngineError> {
        self.require_open()?;
        self.push_frame(Frame::pong(payload.into()), BufferType::PingPong, true)
    }

    /// Submit a Pong with no preceding Ping (keep-alive heartbeat).
    ///
    /// # Errors
    ///
    /// As [`send_ping`](Self::send_ping).
    pub fn send_unsolicited_pong(&mut self, payload: impl Into<Bytes>) -> Result<(), EngineError> {
        self.require_open()?;
        self.push_frame(Frame::pong(payload.into()), BufferType::UnsolicitedPong, true)
    }

    /// Submit a Close frame and move the session to Draining.
    ///
    /// Earlier submits still flush; the close frame goes out after them.
    /// When the peer closed first, this call serves as the echo if the
    /// engine has not already scheduled one.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if a close was already sent, the code is not
    /// sendable on the wire, or the session is past Draining.
    pub fn send_close(
        &mut self,
        code: Option<u16>,
        reason: Option<&str>,
    ) -> Result<(), EngineError> {
        let phase = self.shared.phase();
        if !matches!(phase, Phase::Open | Phase::Draining) {
            return Err(EngineError::invalid_operation(
                phase,
                "session is not open for a close submit",
            ));
        }
        if let Some(code) = code {
            if !CloseCode::is_valid_code(code) {
                return Err(EngineError::invalid_operation(
                    phase,
                    format!("close code {code} is not sendable"),
                ));
            }
        }

        {
            let mut ctrl = self.shared.ctrl.lock();
            if ctrl.close_sent {
                return Err(EngineError::invalid_operation(
                    phase,
                    "close already sent",
                ));
            }
            ctrl.close_sent = true;
            // Our close supersedes any echo the receive side scheduled.
            ctrl.close_echo = None;
        }

        let payload = CloseReason {
            code,
            text: reason.map(String::from),
        }
        .encode();
        self.push_frame(Frame::close(payload), BufferType::Close, true)?;
        self.shared.advance_phase(Phase::Draining);
        Ok(())
    }

    /// Pull the next action.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if an action is already outstanding on this
    /// queue.
    pub fn get_action(&mut self) -> Result<ActionRequest, EngineError> {
        let phase = self.shared.phase();
        if phase == Phase::Aborted {
            return Ok(ActionRequest::no_action());
        }
        if self.in_flight.is_some() {
            return Err(EngineError::invalid_operation(
                phase,
                "an action is already outstanding on the send queue",
            ));
        }

        if let Some(buffer_type) = self.notify {
            let context = self.issue(Issued::Notify);
            trace!(?buffer_type, "send complete ready");
            return Ok(ActionRequest {
                kind: ActionKind::IndicateSendComplete,
                buffer_type,
                payload: Bytes::new(),
                close_reason: None,
                context: Some(context),
            });
        }

        if self.current.is_none() {
            self.stage_next(phase)?;
        }

        if let Some(current) = &self.current {
            let payload = current.wire.slice(current.offset..);
            let buffer_type = current.buffer_type;
            let context = self.issue(Issued::Wire);
            trace!(len = payload.len(), ?buffer_type, "send to network");
            return Ok(ActionRequest {
                kind: ActionKind::SendToNetwork,
                buffer_type,
                payload,
                close_reason: None,
                context: Some(context),
            });
        }

        self.shared.note_idle(true);
        Ok(ActionRequest::no_action())
    }

    /// Complete the outstanding action.
    ///
    /// `bytes_transferred` is the number of wire bytes written for
    /// `SendToNetwork` and ignored for notifications. Zero bytes re-offers
    /// the same action.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` for a stale or mismatched context;
    /// `GenericFailure` once zero-byte completions exceed the configured
    /// stall limit.
    pub fn complete_action(
        &mut self,
        context: ActionContext,
        bytes_transferred: usize,
    ) -> Result<(), EngineError> {
        let phase = self.shared.phase();
        let issued = self.match_context(&context, phase)?;
        self.in_flight = None;

        match issued {
            Issued::Notify => {
                self.notify = None;
                Ok(())
            }
            Issued::Wire => {
                if phase == Phase::Aborted {
                    // Drain discards the rest.
                    return Ok(());
                }
                let Some(mut current) = self.current.take() else {
                    return Err(EngineError::invalid_operation(
                        phase,
                        "no send in progress for this context",
                    ));
                };

                if bytes_transferred == 0 {
                    current.zero_count += 1;
                    let stalled = self
                        .shared
                        .config
                        .stall_limit
                        .is_some_and(|limit| current.zero_count > limit);
                    self.current = Some(current);
                    if stalled {
                        return Err(EngineError::new(
                            ErrorKind::GenericFailure,
                            phase,
                            "transport made no progress past the stall limit",
                        ));
                    }
                    return Ok(());
                }

                let remaining = current.wire.len() - current.offset;
                if bytes_transferred > remaining {
                    self.current = Some(current);
                    return Err(EngineError::invalid_operation(
                        phase,
                        "completed more bytes than were offered",
                    ));
                }

                current.zero_count = 0;
                current.offset += bytes_transferred;
                if current.offset == current.wire.len() {
                    self.notify = current.notify;
                } else {
                    self.current = Some(current);
                }
                Ok(())
            }
        }
    }

    /// Release everything still queued. Mandatory before dropping the
    /// queue once the session left the Open phase.
    ///
    /// Returns the number of discarded items; a second drain returns 0.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` while the session is still Connecting or Open.
    pub fn drain(&mut self) -> Result<usize, EngineError> {
        let phase = self.shared.phase();
        if matches!(phase, Phase::Connecting | Phase::Open) {
            return Err(EngineError::invalid_operation(
                phase,
                "drain requires a draining, closed, or aborted session",
            ));
        }

        self.in_flight = None;
        let mut released = 0;
        if self.notify.take().is_some() {
            released += 1;
        }
        if self.current.take().is_some() {
            released += 1;
        }
        released += self.pending.len();
        self.pending.clear();
        {
            let mut ctrl = self.shared.ctrl.lock();
            released += ctrl.pending_pongs.len();
            ctrl.pending_pongs.clear();
            if ctrl.close_echo.take().is_some() {
                released += 1;
            }
        }
        self.shared.note_idle(true);
        trace!(released, "send queue drained");
        Ok(released)
    }

    fn submit_data(
        &mut self,
        opcode: Opcode,
        payload: Bytes,
        fin: bool,
    ) -> Result<(), EngineError> {
        let phase = self.require_open()?;
        if payload.len() > self.shared.config.send_buffer_size {
            return Err(EngineError::new(
                ErrorKind::NumericOverflow,
                phase,
                format!(
                    "submit of {} bytes exceeds send buffer of {}",
                    payload.len(),
                    self.shared.config.send_buffer_size
                ),
            ));
        }

        let (wire_opcode, buffer_type) = match self.frag_opcode {
            Some(started) => {
                if started != opcode {
                    return Err(EngineError::new(
                        ErrorKind::InvalidProtocolOperation,
                        phase,
                        "submit type does not match the fragmented message in progress",
                    ));
                }
                (Opcode::Continuation, fragment_buffer_type(opcode, fin))
            }
            None => (opcode, fragment_buffer_type(opcode, fin)),
        };

        let mut frame = Frame::new(wire_opcode, payload);
        if !fin {
            frame = frame.fragment();
        }
        self.push_frame(frame, buffer_type, true)?;

        self.frag_opcode = if fin { None } else { Some(opcode) };
        Ok(())
    }

    /// Encode a frame and append it to the application queue.
    fn push_frame(
        &mut self,
        frame: Frame,
        buffer_type: BufferType,
        notify: bool,
    ) -> Result<(), EngineError> {
        let mut wire = BytesMut::new();
        self.codec
            .encode(&frame, &mut wire)
            .map_err(|e| EngineError::from_frame(&e, self.shared.phase()))?;
        self.pending.push_back(PendingSend {
            wire: wire.freeze(),
            buffer_type,
            notify: notify.then_some(buffer_type),
        });
        Ok(())
    }

    /// Promote the next frame to the wire: engine pongs first, then
    /// application submits, then the close echo once nothing else remains.
    fn stage_next(&mut self, phase: Phase) -> Result<(), EngineError> {
        let engine_frame = {
            let mut ctrl = self.shared.ctrl.lock();
            if let Some(payload) = ctrl.pending_pongs.pop_front() {
                Some((Frame::pong(payload), BufferType::PingPong))
            } else if self.pending.is_empty() {
                ctrl.close_echo.take().map(|echo| {
                    ctrl.close_sent = true;
                    (Frame::close(echo.encode()), BufferType::Close)
                })
            } else {
                None
            }
        };

        if let Some((frame, buffer_type)) = engine_frame {
            let mut wire = BytesMut::new();
            self.codec
                .encode(&frame, &mut wire)
                .map_err(|e| EngineError::from_frame(&e, phase))?;
            self.current = Some(CurrentSend {
                wire: wire.freeze(),
                offset: 0,
                buffer_type,
                notify: None,
                zero_count: 0,
            });
            return Ok(());
        }

        if let Some(pending) = self.pending.pop_front() {
            self.current = Some(CurrentSend {
                wire: pending.wire,
                offset: 0,
                buffer_type: pending.buffer_type,
                notify: pending.notify,
                zero_count: 0,
            });
        }
        Ok(())
    }

    fn require_open(&self) -> Result<Phase, EngineError> {
        let phase = self.shared.phase();
        if phase == Phase::Open {
            Ok(phase)
        } else {
            Err(EngineError::invalid_operation(
                phase,
                "session is not open for sends",
            ))
        }
    }

    fn issue(&mut self, issued: Issued) -> ActionContext {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight = Some((seq, issued));
        ActionContext {
            side: Side::Send,
            seq,
        }
    }

    fn match_context(
        &self,
        context: &ActionContext,
        phase: Phase,
    ) -> Result<Issued, EngineError> {
        match self.in_flight {
            Some((seq, issued)) if context.side == Side::Send && context.seq == seq => Ok(issued),
            _ => Err(EngineError::invalid_operation(
                phase,
                "context does not match the outstanding send action",
            )),
        }
    }
}

fn fragment_buffer_type(opcode: Opcode, fin: bool) -> BufferType {
    match (opcode, fin) {
        (Opcode::Text, true) => BufferType::Utf8Message,
        (Opcode::Text, false) => BufferType::Utf8Fragment,
        (_, true) => BufferType::BinaryMessage,
        (_, false) => BufferType::BinaryFragment,
    }
}

/// A decoded frame waiting for the application to collect it.
#[derive(Debug)]
struct Notification {
    buffer_type: BufferType,
    payload: Bytes,
    close_reason: Option<CloseReason>,
}

/// Receive half of a split session.
///
/// The caller posts a receive request, pulls `ReceiveFromNetwork` actions,
/// fills the lent slot from the transport, and collects decoded frames as
/// `IndicateReceiveComplete` notifications. One request is outstanding at a
/// time and yields exactly one notification.
#[derive(Debug)]
pub struct ReceiveQueue {
    shared: Arc<Shared>,
    codec: FrameCodec,
    /// Undecoded wire bytes carried between completions.
    staging: BytesMut,
    /// Storage lent to the caller during `ReceiveFromNetwork`.
    slot: Vec<u8>,
    request_posted: bool,
    notifications: VecDeque<Notification>,
    in_flight: Option<(u64, Issued)>,
    next_seq: u64,
    /// Opcode of the inbound fragmented message in progress.
    frag_opcode: Option<Opcode>,
    utf8: crate::utf8::Utf8Validator,
    zero_count: u32,
    /// Set after a fatal protocol violation; only abort/drain recover.
    poisoned: bool,
}

impl ReceiveQueue {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let codec = FrameCodec::new(shared.role, shared.config.receive_buffer_size)
            .masking(shared.config.masking);
        let slot = vec![0u8; shared.config.receive_buffer_size];
        Self {
            shared,
            codec,
            staging: BytesMut::new(),
            slot,
            request_posted: false,
            notifications: VecDeque::new(),
            in_flight: None,
            next_seq: 0,
            frag_opcode: None,
            utf8: crate::utf8::Utf8Validator::new(),
            zero_count: 0,
            poisoned: false,
        }
    }

    /// Current session phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.shared.phase()
    }

    /// Post a receive request. Each request yields exactly one
    /// `IndicateReceiveComplete`.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if a request is already posted, the queue is
    /// poisoned, or the session left the Open/Draining phases.
    pub fn receive(&mut self) -> Result<(), EngineError> {
        let phase = self.shared.phase();
        if self.poisoned {
            return Err(EngineError::invalid_operation(
                phase,
                "receive queue is poisoned by a protocol violation",
            ));
        }
        if !matches!(phase, Phase::Open | Phase::Draining) {
            return Err(EngineError::invalid_operation(
                phase,
                "session is not open for receives",
            ));
        }
        if self.request_posted {
            return Err(EngineError::invalid_operation(
                phase,
                "a receive is already posted",
            ));
        }
        self.request_posted = true;
        Ok(())
    }

    /// Pull the next action.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if an action is already outstanding or the queue
    /// is poisoned.
    pub fn get_action(&mut self) -> Result<ActionRequest, EngineError> {
        let phase = self.shared.phase();
        if phase == Phase::Aborted {
            return Ok(ActionRequest::no_action());
        }
        if self.poisoned {
            return Err(EngineError::invalid_operation(
                phase,
                "receive queue is poisoned by a protocol violation",
            ));
        }
        if self.in_flight.is_some() {
            return Err(EngineError::invalid_operation(
                phase,
                "an action is already outstanding on the receive queue",
            ));
        }

        if self.request_posted {
            if let Some(front) = self.notifications.front() {
                let buffer_type = front.buffer_type;
                let payload = front.payload.clone();
                let close_reason = front.close_reason.clone();
                let context = self.issue(Issued::Notify);
                trace!(?buffer_type, len = payload.len(), "receive complete ready");
                return Ok(ActionRequest {
                    kind: ActionKind::IndicateReceiveComplete,
                    buffer_type,
                    payload,
                    close_reason,
                    context: Some(context),
                });
            }

            let close_received = self.shared.ctrl.lock().close_received;
            if !close_received {
                let context = self.issue(Issued::Wire);
                trace!(slot = self.slot.len(), "receive from network");
                return Ok(ActionRequest {
                    kind: ActionKind::ReceiveFromNetwork,
                    buffer_type: BufferType::None,
                    payload: Bytes::new(),
                    close_reason: None,
                    context: Some(context),
                });
            }
        }

        if self.notifications.is_empty() {
            self.shared.note_idle(false);
        }
        Ok(ActionRequest::no_action())
    }

    /// Borrow the writable slot for the outstanding `ReceiveFromNetwork`
    /// action. Fill it from the transport, then complete with the byte
    /// count.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if the context does not match an outstanding
    /// receive-from-network action.
    pub fn transfer_slot(&mut self, context: &ActionContext) -> Result<&mut [u8], EngineError> {
        match self.in_flight {
            Some((seq, Issued::Wire)) if context.side == Side::Receive && context.seq == seq => {
                Ok(&mut self.slot[..])
            }
            _ => Err(EngineError::invalid_operation(
                self.shared.phase(),
                "context does not match an outstanding receive action",
            )),
        }
    }

    /// Complete the outstanding action.
    ///
    /// For `ReceiveFromNetwork`, `bytes_transferred` is how much of the
    /// slot the transport filled; the bytes run through the frame decoder
    /// immediately and any decoded frames queue as notifications. Zero
    /// bytes re-offers the same action. For notifications the count is
    /// ignored and the posted request is consumed.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` for stale contexts or counts larger than the
    /// slot; any protocol violation in the decoded bytes surfaces here and
    /// poisons the queue; `GenericFailure` past the stall limit.
    pub fn complete_action(
        &mut self,
        context: ActionContext,
        bytes_transferred: usize,
    ) -> Result<(), EngineError> {
        let phase = self.shared.phase();
        let issued = match self.in_flight {
            Some((seq, issued))
                if context.side == Side::Receive && context.seq == seq =>
            {
                issued
            }
            _ => {
                return Err(EngineError::invalid_operation(
                    phase,
                    "context does not match the outstanding receive action",
                ))
            }
        };
        self.in_flight = None;

        match issued {
            Issued::Notify => {
                if let Some(done) = self.notifications.pop_front() {
                    trace!(buffer_type = ?done.buffer_type, "notification collected");
                }
                self.request_posted = false;
                Ok(())
            }
            Issued::Wire => {
                if phase == Phase::Aborted {
                    return Ok(());
                }
                if bytes_transferred > self.slot.len() {
                    return Err(EngineError::invalid_operation(
                        phase,
                        "completed more bytes than the slot holds",
                    ));
                }
                if bytes_transferred == 0 {
                    self.zero_count += 1;
                    if self
                        .shared
                        .config
                        .stall_limit
                        .is_some_and(|limit| self.zero_count > limit)
                    {
                        return Err(EngineError::new(
                            ErrorKind::GenericFailure,
                            phase,
                            "transport made no progress past the stall limit",
                        ));
                    }
                    return Ok(());
                }
                self.zero_count = 0;
                self.staging.extend_from_slice(&self.slot[..bytes_transferred]);
                self.decode_staged(phase)
            }
        }
    }

    /// Release everything still queued. Mandatory before dropping the
    /// queue once the session left the Open phase.
    ///
    /// Returns the number of discarded items; a second drain returns 0.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` while the session is still Connecting or Open.
    pub fn drain(&mut self) -> Result<usize, EngineError> {
        let phase = self.shared.phase();
        if matches!(phase, Phase::Connecting | Phase::Open) {
            return Err(EngineError::invalid_operation(
                phase,
                "drain requires a draining, closed, or aborted session",
            ));
        }

        let mut released = 0;
        if self.in_flight.take().is_some() {
            released += 1;
        }
        released += self.notifications.len();
        self.notifications.clear();
        if self.request_posted {
            self.request_posted = false;
            released += 1;
        }
        self.staging.clear();
        self.poisoned = false;
        self.shared.note_idle(false);
        trace!(released, "receive queue drained");
        Ok(released)
    }

    fn decode_staged(&mut self, phase: Phase) -> Result<(), EngineError> {
        loop {
            match self.codec.decode(&mut self.staging) {
                Ok(Some(frame)) => {
                    if let Err(err) = self.process_frame(frame) {
                        self.poisoned = true;
                        return Err(EngineError::from_frame(&err, phase));
                    }
                }
                Ok(None) => return Ok(()),
                Err(err) => {
                    self.poisoned = true;
                    return Err(EngineError::from_frame(&err, phase));
                }
            }
        }
    }

    fn process_frame(&mut self, frame: Frame) -> Result<(), FrameError> {
        trace!(opcode = ?frame.opcode, fin = frame.fin, len = frame.payload.len(), "frame decoded");
        match frame.opcode {
            Opcode::Ping => {
                {
                    let mut ctrl = self.shared.ctrl.lock();
                    if self.shared.config.auto_pong && !ctrl.close_sent {
                        ctrl.pending_pongs.push_back(frame.payload.clone());
                    }
                }
                self.notifications.push_back(Notification {
                    buffer_type: BufferType::PingPong,
                    payload: frame.payload,
                    close_reason: None,
                });
                Ok(())
            }
            Opcode::Pong => {
                let solicited = {
                    let mut ctrl = self.shared.ctrl.lock();
                    if ctrl.pings_in_flight > 0 {
                        ctrl.pings_in_flight -= 1;
                        true
                    } else {
                        false
                    }
                };
                self.notifications.push_back(Notification {
                    buffer_type: if solicited {
                        BufferType::PingPong
                    } else {
                        BufferType::UnsolicitedPong
                    },
                    payload: frame.payload,
                    close_reason: None,
                });
                Ok(())
            }
            Opcode::Close => {
                let reason = CloseReason::parse(&frame.payload)?;
                {
                    let mut ctrl = self.shared.ctrl.lock();
                    ctrl.close_received = true;
                    if !ctrl.close_sent && ctrl.close_echo.is_none() {
                        // Echo the peer's code without the reason text.
                        ctrl.close_echo = Some(CloseReason {
                            code: reason.code,
                            text: None,
                        });
                    }
                }
                self.shared.advance_phase(Phase::Draining);
                self.notifications.push_back(Notification {
                    buffer_type: BufferType::Close,
                    payload: frame.payload,
                    close_reason: Some(reason),
                });
                Ok(())
            }
            Opcode::Text | Opcode::Binary | Opcode::Continuation => self.process_data(frame),
        }
    }

    fn process_data(&mut self, frame: Frame) -> Result<(), FrameError> {
        let message_opcode = match (frame.opcode, self.frag_opcode) {
            (Opcode::Continuation, Some(started)) => started,
            (Opcode::Continuation, None) => {
                return Err(FrameError::ProtocolViolation(
                    "continuation without a started message",
                ));
            }
            (opcode, None) => opcode,
            (_, Some(_)) => {
                return Err(FrameError::ProtocolViolation(
                    "new data frame while a message is in progress",
                ));
            }
        };

        if message_opcode == Opcode::Text && self.shared.config.utf8_verification {
            self.utf8.push(&frame.payload)?;
            if frame.fin {
                self.utf8.finish()?;
            }
        }

        self.frag_opcode = if frame.fin {
            None
        } else {
            Some(message_opcode)
        };

        self.notifications.push_back(Notification {
            buffer_type: fragment_buffer_type(message_opcode, frame.fin),
            payload: frame.payload,
            close_reason: None,
        });
        Ok(())
    }

    fn issue(&mut self, issued: Issued) -> ActionContext {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight = Some((seq, issued));
        ActionContext {
            side: Side::Receive,
            seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Role;
    use crate::handshake::{HttpHeader, compute_accept_key};
    use crate::session::{Session, SessionConfig};

    fn open_session(role: Role, config: SessionConfig) -> Session {
        match role {
            Role::Client => {
                let mut session = Session::client(config);
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
            Role::Server => {
                let mut session = Session::server(config);
                let request = vec![
                    HttpHeader::new("Host", "example.com"),
                    HttpHeader::new("Upgrade", "websocket"),
                    HttpHeader::new("Connection", "Upgrade"),
                    HttpHeader::new("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
                    HttpHeader::new("Sec-WebSocket-Version", "13"),
                ];
                session.begin_server_handshake(&request, None).unwrap();
                session.end_server_handshake().unwrap();
                session
            }
        }
    }

    fn split_client(config: SessionConfig) -> (SendQueue, ReceiveQueue, crate::session::AbortHandle) {
        open_session(Role::Client, config).split().unwrap()
    }

    /// Encode a frame the way the client's peer (a server) would.
    fn peer_bytes(frame: &Frame) -> Vec<u8> {
        let mut codec = FrameCodec::new(Role::Server, usize::MAX);
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        buf.to_vec()
    }

    /// Post a receive (if needed), pull the I/O action, fill the slot with
    /// `bytes`, and complete.
    fn feed(rq: &mut ReceiveQueue, bytes: &[u8]) -> Result<(), EngineError> {
        if !rq.request_posted {
            rq.receive()?;
        }
        let action = rq.get_action()?;
        assert_eq!(action.kind, ActionKind::ReceiveFromNetwork);
        let context = action.context.unwrap();
        let slot = rq.transfer_slot(&context)?;
        slot[..bytes.len()].copy_from_slice(bytes);
        rq.complete_action(context, bytes.len())
    }

    /// Pull the pending notification, asserting its buffer type.
    fn collect(rq: &mut ReceiveQueue, expected: BufferType) -> ActionRequest {
        let action = rq.get_action().unwrap();
        assert_eq!(action.kind, ActionKind::IndicateReceiveComplete);
        assert_eq!(action.buffer_type, expected);
        let payload = action.payload.clone();
        let close_reason = action.close_reason.clone();
        let context = action.context.unwrap();
        rq.complete_action(context, 0).unwrap();
        ActionRequest {
            kind: ActionKind::IndicateReceiveComplete,
            buffer_type: expected,
            payload,
            close_reason,
            context: None,
        }
    }

    /// Flush one submit: SendToNetwork fully completed, then the
    /// notification. Returns the wire bytes.
    fn flush_one(sq: &mut SendQueue, expected: BufferType) -> Vec<u8> {
        let action = sq.get_action().unwrap();
        assert_eq!(action.kind, ActionKind::SendToNetwork);
        assert_eq!(action.buffer_type, expected);
        let wire = action.payload.to_vec();
        sq.complete_action(action.context.unwrap(), wire.len()).unwrap();

        let notify = sq.get_action().unwrap();
        assert_eq!(notify.kind, ActionKind::IndicateSendComplete);
        assert_eq!(notify.buffer_type, expected);
        sq.complete_action(notify.context.unwrap(), 0).unwrap();
        wire
    }

    #[test]
    fn send_text_yields_wire_then_completion() {
        let (mut sq, _rq, _abort) = split_client(SessionConfig::default());
        sq.send_text("hello").unwrap();

        let wire = flush_one(&mut sq, BufferType::Utf8Message);
        // FIN + text opcode, masked.
        assert_eq!(wire[0], 0x81);
        assert_eq!(wire[1] & 0x80, 0x80);

        let idle = sq.get_action().unwrap();
        assert_eq!(idle.kind, ActionKind::NoAction);
        assert!(idle.context.is_none());
    }

    #[test]
    fn partial_writes_resume_where_they_left_off() {
        let (mut sq, _rq, _abort) = split_client(SessionConfig::default());
        sq.send_binary(vec![7u8; 100]).unwrap();

        let action = sq.get_action().unwrap();
        let total = action.payload.len();
        sq.complete_action(action.context.unwrap(), 10).unwrap();

        let action = sq.get_action().unwrap();
        assert_eq!(action.kind, ActionKind::SendToNetwork);
        assert_eq!(action.payload.len(), total - 10);
        sq.complete_action(action.context.unwrap(), total - 10).unwrap();

        let notify = sq.get_action().unwrap();
        assert_eq!(notify.kind, ActionKind::IndicateSendComplete);
        assert_eq!(notify.buffer_type, BufferType::BinaryMessage);
    }

    #[test]
    fn get_action_with_outstanding_context_rejected() {
        let (mut sq, _rq, _abort) = split_client(SessionConfig::default());
        sq.send_text("x").unwrap();
        let action = sq.get_action().unwrap();
        assert_eq!(action.kind, ActionKind::SendToNetwork);

        let err = sq.get_action().unwrap_err();
        assert!(err.is_invalid_operation());

        // Completing clears the way.
        let context = action.context.unwrap();
        sq.complete_action(context, action.payload.len()).unwrap();
        assert!(sq.get_action().is_ok());
    }

    #[test]
    fn cross_queue_context_rejected() {
        let (mut sq, mut rq, _abort) = split_client(SessionConfig::default());
        sq.send_text("x").unwrap();
        let action = sq.get_action().unwrap();
        let send_context = action.context.unwrap();

        rq.receive().unwrap();
        let recv_action = rq.get_action().unwrap();
        let recv_context = recv_action.context.unwrap();

        // Send token into the receive queue and vice versa.
        assert!(rq.complete_action(send_context, 0).unwrap_err().is_invalid_operation());
        assert!(sq.complete_action(recv_context, 0).unwrap_err().is_invalid_operation());
    }

    #[test]
    fn zero_byte_completion_reoffers_same_action() {
        let (mut sq, _rq, _abort) = split_client(SessionConfig::default());
        sq.send_text("retry me").unwrap();

        let action = sq.get_action().unwrap();
        let first_payload = action.payload.clone();
        sq.complete_action(action.context.unwrap(), 0).unwrap();

        let again = sq.get_action().unwrap();
        assert_eq!(again.kind, ActionKind::SendToNetwork);
        assert_eq!(again.payload, first_payload);
    }

    #[test]
    fn stall_limit_trips_generic_failure() {
        let config = SessionConfig::default().stall_limit(Some(2));
        let (mut sq, _rq, _abort) = split_client(config);
        sq.send_text("stuck").unwrap();

        for _ in 0..2 {
            let action = sq.get_action().unwrap();
            sq.complete_action(action.context.unwrap(), 0).unwrap();
        }
        let action = sq.get_action().unwrap();
        let err = sq.complete_action(action.context.unwrap(), 0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::GenericFailure);
    }

    #[test]
    fn oversized_submit_is_nonfatal_overflow() {
        let config = SessionConfig::default().send_buffer_size(8);
        let (mut sq, _rq, _abort) = split_client(config);

        let err = sq.send_binary(vec![0u8; 9]).unwrap_err();
        assert!(err.is_overflow());

        // The queue still works.
        sq.send_binary(vec![0u8; 8]).unwrap();
        flush_one(&mut sq, BufferType::BinaryMessage);
    }

    #[test]
    fn outbound_fragmentation_uses_continuation_opcodes() {
        let (mut sq, _rq, _abort) = split_client(SessionConfig::default());
        sq.send_text_fragment("one").unwrap();
        sq.send_text_fragment("two").unwrap();
        sq.send_text("three").unwrap();

        let first = flush_one(&mut sq, BufferType::Utf8Fragment);
        let second = flush_one(&mut sq, BufferType::Utf8Fragment);
        let last = flush_one(&mut sq, BufferType::Utf8Message);

        assert_eq!(first[0], 0x01); // text, FIN clear
        assert_eq!(second[0], 0x00); // continuation, FIN clear
        assert_eq!(last[0], 0x80); // continuation, FIN set
    }

    #[test]
    fn mismatched_fragment_type_rejected() {
        let (mut sq, _rq, _abort) = split_client(SessionConfig::default());
        sq.send_text_fragment("start").unwrap();
        let err = sq.send_binary(vec![1, 2, 3]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidProtocolOperation);
    }

    #[test]
    fn receive_text_message_notification() {
        let (_sq, mut rq, _abort) = split_client(SessionConfig::default());
        feed(&mut rq, &peer_bytes(&Frame::text("from server"))).unwrap();

        let done = collect(&mut rq, BufferType::Utf8Message);
        assert_eq!(done.payload.as_ref(), b"from server");

        // Request consumed; queue idle until the next post.
        assert_eq!(rq.get_action().unwrap().kind, ActionKind::NoAction);
    }

    #[test]
    fn double_receive_post_rejected() {
        let (_sq, mut rq, _abort) = split_client(SessionConfig::default());
        rq.receive().unwrap();
        let err = rq.receive().unwrap_err();
        assert!(err.is_invalid_operation());
    }

    #[test]
    fn wire_bytes_split_across_completions() {
        let (_sq, mut rq, _abort) = split_client(SessionConfig::default());
        let wire = peer_bytes(&Frame::text("split feed"));
        let (head, tail) = wire.split_at(3);

        feed(&mut rq, head).unwrap();
        // Not a full frame yet: the read is re-offered.
        let action = rq.get_action().unwrap();
        assert_eq!(action.kind, ActionKind::ReceiveFromNetwork);
        let context = action.context.unwrap();
        let slot = rq.transfer_slot(&context).unwrap();
        slot[..tail.len()].copy_from_slice(tail);
        rq.complete_action(context, tail.len()).unwrap();

        let done = collect(&mut rq, BufferType::Utf8Message);
        assert_eq!(done.payload.as_ref(), b"split feed");
    }

    #[test]
    fn inbound_fragments_classified_per_frame() {
        let (_sq, mut rq, _abort) = split_client(SessionConfig::default());
        feed(&mut rq, &peer_bytes(&Frame::text("he").fragment())).unwrap();
        let done = collect(&mut rq, BufferType::Utf8Fragment);
        assert_eq!(done.payload.as_ref(), b"he");

        feed(
            &mut rq,
            &peer_bytes(&Frame::new(Opcode::Continuation, "llo")),
        )
        .unwrap();
        let done = collect(&mut rq, BufferType::Utf8Message);
        assert_eq!(done.payload.as_ref(), b"llo");
    }

    #[test]
    fn continuation_without_start_poisons_queue() {
        let (_sq, mut rq, _abort) = split_client(SessionConfig::default());
        let err = feed(&mut rq, &peer_bytes(&Frame::new(Opcode::Continuation, "x")))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidProtocolOperation);

        // Poisoned until drained.
        assert!(rq.get_action().unwrap_err().is_invalid_operation());
        assert!(rq.receive().unwrap_err().is_invalid_operation());
    }

    #[test]
    fn invalid_utf8_mid_message_is_format_error() {
        let (_sq, mut rq, _abort) = split_client(SessionConfig::default());
        let err = feed(&mut rq, &peer_bytes(&Frame::text(&b"ok\xFF"[..]))).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidProtocolFormat);
    }

    #[test]
    fn utf8_split_at_fragment_boundary_accepted() {
        let (_sq, mut rq, _abort) = split_client(SessionConfig::default());
        // U+00E9 split across two fragments.
        feed(&mut rq, &peer_bytes(&Frame::text(&b"h\xC3"[..]).fragment())).unwrap();
        collect(&mut rq, BufferType::Utf8Fragment);
        feed(
            &mut rq,
            &peer_bytes(&Frame::new(Opcode::Continuation, &b"\xA9"[..])),
        )
        .unwrap();
        collect(&mut rq, BufferType::Utf8Message);
    }

    #[test]
    fn utf8_verification_can_be_disabled() {
        let config = SessionConfig::default().disable_utf8_verification();
        let (_sq, mut rq, _abort) = split_client(config);
        feed(&mut rq, &peer_bytes(&Frame::text(&b"raw\xFF"[..]))).unwrap();
        let done = collect(&mut rq, BufferType::Utf8Message);
        assert_eq!(done.payload.as_ref(), b"raw\xFF");
    }

    #[test]
    fn ping_auto_queues_pong_ahead_of_app_data() {
        let (mut sq, mut rq, _abort) = split_client(SessionConfig::default());
        sq.send_text("app data").unwrap();
        feed(&mut rq, &peer_bytes(&Frame::ping("tick"))).unwrap();

        let done = collect(&mut rq, BufferType::PingPong);
        assert_eq!(done.payload.as_ref(), b"tick");

        // The pong goes out before the application text.
        let action = sq.get_action().unwrap();
        assert_eq!(action.kind, ActionKind::SendToNetwork);
        assert_eq!(action.buffer_type, BufferType::PingPong);
        let wire = action.payload.to_vec();
        assert_eq!(wire[0], 0x8A); // FIN + pong

        // Payload echoes the ping, visible after unmasking.
        let mut decoder = FrameCodec::new(Role::Server, usize::MAX);
        let mut buf = BytesMut::from(&wire[..]);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"tick");

        sq.complete_action(action.context.unwrap(), wire.len()).unwrap();
        // Engine frame: no send-complete notification, straight to app data.
        let action = sq.get_action().unwrap();
        assert_eq!(action.buffer_type, BufferType::Utf8Message);
    }

    #[test]
    fn auto_pong_disabled_leaves_send_queue_alone() {
        let config = SessionConfig::default().auto_pong(false);
        let (mut sq, mut rq, _abort) = split_client(config);
        feed(&mut rq, &peer_bytes(&Frame::ping("tick"))).unwrap();
        collect(&mut rq, BufferType::PingPong);

        assert_eq!(sq.get_action().unwrap().kind, ActionKind::NoAction);
    }

    #[test]
    fn pong_classification_depends_on_outstanding_ping() {
        let (mut sq, mut rq, _abort) = split_client(SessionConfig::default());

        // No ping outstanding: unsolicited.
        feed(&mut rq, &peer_bytes(&Frame::pong("beat"))).unwrap();
        collect(&mut rq, BufferType::UnsolicitedPong);

        // With a ping in flight: solicited.
        sq.send_ping("tock").unwrap();
        flush_one(&mut sq, BufferType::PingPong);
        feed(&mut rq, &peer_bytes(&Frame::pong("tock"))).unwrap();
        collect(&mut rq, BufferType::PingPong);
    }

    #[test]
    fn peer_close_drains_and_echoes_exactly_once() {
        let (mut sq, mut rq, _abort) = split_client(SessionConfig::default());
        let close_payload = CloseReason::new(1000, Some("done")).encode();
        feed(&mut rq, &peer_bytes(&Frame::close(close_payload))).unwrap();

        let done = collect(&mut rq, BufferType::Close);
        let reason = done.close_reason.unwrap();
        assert_eq!(reason.code, Some(1000));
        assert_eq!(reason.text.as_deref(), Some("done"));
        assert_eq!(rq.phase(), Phase::Draining);

        // Exactly one echo, then idle.
        let action = sq.get_action().unwrap();
        assert_eq!(action.buffer_type, BufferType::Close);
        let len = action.payload.len();
        sq.complete_action(action.context.unwrap(), len).unwrap();
        assert_eq!(sq.get_action().unwrap().kind, ActionKind::NoAction);

        // Both queues idle after Draining: the session is Closed.
        assert_eq!(rq.get_action().unwrap().kind, ActionKind::NoAction);
        assert_eq!(sq.phase(), Phase::Closed);
    }

    #[test]
    fn peer_close_with_gateway_code_is_not_a_violation() {
        // A restarting gateway closes with 1012; the session must drain
        // normally instead of treating the code as malformed.
        let (mut sq, mut rq, _abort) = split_client(SessionConfig::default());
        feed(&mut rq, &peer_bytes(&Frame::close(CloseReason::new(1012, None).encode()))).unwrap();

        let done = collect(&mut rq, BufferType::Close);
        assert_eq!(done.close_reason.unwrap().code, Some(1012));
        assert_eq!(rq.phase(), Phase::Draining);

        // The echo carries the peer's code back.
        let action = sq.get_action().unwrap();
        assert_eq!(action.buffer_type, BufferType::Close);
        let mut decoder = FrameCodec::new(Role::Server, usize::MAX);
        let mut buf = BytesMut::from(action.payload.as_ref());
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        let echoed = CloseReason::parse(&frame.payload).unwrap();
        assert_eq!(echoed.code, Some(1012));
    }

    #[test]
    fn app_close_suppresses_echo_and_blocks_later_submits() {
        let (mut sq, mut rq, _abort) = split_client(SessionConfig::default());
        sq.send_text("last words").unwrap();
        sq.send_close(Some(1001), Some("bye")).unwrap();
        assert_eq!(sq.phase(), Phase::Draining);

        // No submits after close.
        assert!(sq.send_text("too late").unwrap_err().is_invalid_operation());
        assert!(sq.send_close(Some(1000), None).unwrap_err().is_invalid_operation());

        // Earlier data still flushes, then the close.
        flush_one(&mut sq, BufferType::Utf8Message);
        flush_one(&mut sq, BufferType::Close);

        // Peer's close now arrives; no second close goes out.
        feed(&mut rq, &peer_bytes(&Frame::close(CloseReason::normal().encode()))).unwrap();
        collect(&mut rq, BufferType::Close);
        assert_eq!(sq.get_action().unwrap().kind, ActionKind::NoAction);
    }

    #[test]
    fn invalid_close_code_rejected_at_submit() {
        let (mut sq, _rq, _abort) = split_client(SessionConfig::default());
        let err = sq.send_close(Some(1005), None).unwrap_err();
        assert!(err.is_invalid_operation());
        // Still open; a valid close goes through.
        sq.send_close(Some(1000), None).unwrap();
    }

    #[test]
    fn oversized_inbound_frame_is_fatal_overflow() {
        let config = SessionConfig::default().receive_buffer_size(64);
        let (_sq, mut rq, _abort) = split_client(config);
        // Declared length 200 exceeds the 64-byte receive buffer; header
        // alone is enough to trip it.
        let mut header = vec![0x82u8, 126];
        header.extend_from_slice(&200u16.to_be_bytes());
        let err = feed(&mut rq, &header).unwrap_err();
        assert!(err.is_overflow());
        assert!(rq.get_action().unwrap_err().is_invalid_operation());
    }

    #[test]
    fn abort_quiesces_both_queues() {
        let (mut sq, mut rq, abort) = split_client(SessionConfig::default());
        sq.send_text("never sent").unwrap();
        rq.receive().unwrap();

        abort.abort();
        assert_eq!(sq.get_action().unwrap().kind, ActionKind::NoAction);
        assert_eq!(rq.get_action().unwrap().kind, ActionKind::NoAction);
    }

    #[test]
    fn abort_with_action_in_flight_still_quiesces() {
        let (mut sq, _rq, abort) = split_client(SessionConfig::default());
        sq.send_text("mid flight").unwrap();
        let action = sq.get_action().unwrap();
        let context = action.context.unwrap();

        abort.abort();
        // NoAction even with the context outstanding.
        assert_eq!(sq.get_action().unwrap().kind, ActionKind::NoAction);
        // The stale completion is accepted and discarded.
        sq.complete_action(context, 0).unwrap();
        assert_eq!(sq.drain().unwrap(), 1);
    }

    #[test]
    fn drain_is_bounded_and_idempotent() {
        let (mut sq, mut rq, abort) = split_client(SessionConfig::default());
        sq.send_text("one").unwrap();
        sq.send_text("two").unwrap();
        rq.receive().unwrap();

        abort.abort();
        assert_eq!(sq.drain().unwrap(), 2);
        assert_eq!(sq.drain().unwrap(), 0);
        assert_eq!(rq.drain().unwrap(), 1);
        assert_eq!(rq.drain().unwrap(), 0);
    }

    #[test]
    fn drain_while_open_rejected() {
        let (mut sq, mut rq, _abort) = split_client(SessionConfig::default());
        assert!(sq.drain().unwrap_err().is_invalid_operation());
        assert!(rq.drain().unwrap_err().is_invalid_operation());
    }

    #[test]
    fn drain_recovers_poisoned_receive_queue() {
        let (_sq, mut rq, abort) = split_client(SessionConfig::default());
        feed(&mut rq, &peer_bytes(&Frame::new(Opcode::Continuation, "x")))
            .unwrap_err();

        abort.abort();
        rq.drain().unwrap();
        assert_eq!(rq.get_action().unwrap().kind, ActionKind::NoAction);
    }

    #[test]
    fn server_role_sends_unmasked() {
        let session = open_session(Role::Server, SessionConfig::default());
        let (mut sq, _rq, _abort) = session.split().unwrap();
        sq.send_text("from server").unwrap();
        let wire = flush_one(&mut sq, BufferType::Utf8Message);
        assert_eq!(wire[1] & 0x80, 0);
    }
}
