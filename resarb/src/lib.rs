//! # resarb
//!
//! Resource arbitration protocol engine: applications negotiate access to
//! exclusive or shareable device resources (audio/video paths, vibration,
//! LEDs, backlight, physical buttons) against a central resource manager.
//!
//! The crate is the transport-agnostic protocol core:
//! - a tagged wire [`Message`] model with per-role validity tables,
//! - the [`ResourceSet`] lifecycle (CREATED → CONNECTED → KILLED),
//! - a role-aware [`Connection`] engine correlating asynchronous requests
//!   with replies over a peer-presence-tracked channel,
//! - two transport adapters: a message-bus adapter consuming an external
//!   [`BusLink`] capability, and an in-process loopback adapter,
//! - a client-side [`ResourceContext`] sequencer that keeps at most one
//!   protocol request in flight per resource set, replayed in submission
//!   order.
//!
//! Everything runs on one thread; callbacks never run reentrantly and no
//! call blocks.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Client request sequencer and application-facing handles.
pub mod client;
/// Environment-driven configuration.
pub mod config;
/// Connection engine.
pub mod connection;
/// Error types.
pub mod error;
/// Protocol message model.
pub mod message;
/// Resource set lifecycle.
pub mod set;
/// Deferred-callback scheduling.
pub mod timer;
/// Transport adapters.
pub mod transport;
/// Resource and mode bitmasks.
pub mod types;

pub use client::{AdviceCallback, ErrorCallback, GrantCallback, ResourceContext, ResourceSetHandle};
pub use config::{debug_enabled, BusKind};
pub use connection::{Connection, MessageHandler, StatusCallback};
pub use error::{ProtoError, WireError};
pub use message::{
    AudioStream, MatchMethod, Message, MessageKind, Notify, Possess, Record, Status,
    StreamProperty, VideoStream,
};
pub use set::{ResourceSet, SetState};
pub use timer::{ManualScheduler, Scheduler, SharedScheduler, TimerHandle, TokioScheduler};
pub use transport::{BusCall, BusLink, LoopbackHub, MethodHandler, OwnerNotify, ReplyNotify, ReplyToken};
pub use types::{errcode, res_str, ModeFlags, ResourceFlags, Role, RsetFlags};
