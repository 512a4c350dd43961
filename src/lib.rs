//! ws-engine: sans-io WebSocket protocol engine.
//!
//! # Overview
//!
//! A transport-agnostic implementation of RFC 6455: the opening handshake,
//! the frame codec (fragmentation, masking, control frames), and the session
//! lifecycle. The engine performs no I/O and schedules no timers. It is a
//! pure state transformer: the caller owns the sockets and pulls *actions*
//! from two queues that say what to do next — write these wire bytes, fill
//! this buffer from the transport, or take delivery of a decoded frame.
//!
//! # Lifecycle
//!
//! 1. Build a [`Session`] for the [`Client`](Role::Client) or
//!    [`Server`](Role::Server) role with a [`SessionConfig`]
//! 2. Drive the opening handshake over header sets
//!    ([`begin_client_handshake`](Session::begin_client_handshake) /
//!    [`begin_server_handshake`](Session::begin_server_handshake) and the
//!    matching end calls)
//! 3. [`split`](Session::split) the open session into a [`SendQueue`], a
//!    [`ReceiveQueue`], and an [`AbortHandle`]
//! 4. Poll each queue with `get_action`, perform the I/O it asks for, and
//!    report back with `complete_action`
//! 5. On close or abort, `drain` both queues before dropping them
//!
//! # Module Structure
//!
//! - [`frame`]: RFC 6455 frame codec (opcodes, masking, streaming decode)
//! - [`close`]: close frame payload parsing and status code ranges
//! - [`handshake`]: opening handshake over HTTP header sets
//! - [`utf8`]: incremental UTF-8 validation across fragment boundaries
//! - [`session`]: role, phase machine, configuration, split
//! - [`queue`]: the pull-based send/receive action queues
//! - [`error`]: the engine error taxonomy

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod close;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod queue;
pub mod session;
pub mod utf8;

pub use close::{CloseCode, CloseReason};
pub use error::{EngineError, ErrorKind};
pub use frame::{Frame, FrameCodec, FrameError, Opcode, Role};
pub use handshake::{
    ClientHandshake, HandshakeError, HttpHeader, ServerHandshake, SUPPORTED_VERSION,
    compute_accept_key,
};
pub use queue::{
    ActionContext, ActionKind, ActionRequest, BufferType, ReceiveQueue, SendQueue,
};
pub use session::{
    AbortHandle, Phase, Session, SessionConfig, default_keep_alive_interval,
};
