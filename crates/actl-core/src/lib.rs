//! Core protocol types and codec for the agent-ctl control channel.
//!
//! This crate defines the wire format shared by senders and the receiver:
//! the socket envelope, the `control.*` message family, the envelope codec
//! with structural validation, and a synchronous sender-side client with
//! idempotent retry.

pub mod client;
pub mod codec;
pub mod control;
pub mod home;
pub mod limits;
pub mod logging;

pub use codec::{InboundRequest, ValidationError, ValidationLimits};
pub use control::{
    CONTROL_SCHEMA_VERSION, ContentRef, ControlAck, ControlEnvelope, ControlMessage,
    InterruptRequest, PROTOCOL_VERSION, ResultCode, StdinRequest,
};
