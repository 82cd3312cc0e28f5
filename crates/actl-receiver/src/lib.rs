//! Control-channel receiver for agent-ctl.
//!
//! Accepts stdin-injection and interrupt requests for live agent sessions
//! over a Unix domain socket, answers every request with exactly one ack,
//! and guarantees at-most-once side effects per `request_id` within the
//! dedup TTL. See [`dispatch::ControlReceiver`] for the pipeline.

pub mod adapter;
pub mod audit;
pub mod authz;
pub mod config;
pub mod content_ref;
pub mod dedup;
pub mod dispatch;
pub mod liveness;
pub mod queue;
pub mod socket;
pub mod testkit;

pub use config::ReceiverConfig;
pub use dispatch::ControlReceiver;
