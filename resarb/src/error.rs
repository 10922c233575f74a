//! Error types for the protocol engine.
//!
//! Only local failures are Rust errors. Remote errors and reply timeouts
//! travel the normal reply path as Status messages with a non-zero error
//! code; peer loss is delivered as a synthetic Unregister.

use crate::message::MessageKind;
use crate::types::Role;

/// Failures while decoding a wire message.
///
/// A message that fails to decode is dropped without a reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// The buffer ended before a mandatory field.
    #[error("truncated message: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required to finish the current field.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// The kind tag does not name any known message kind.
    #[error("unknown message kind tag: {tag}")]
    UnknownKind {
        /// The offending tag value.
        tag: i32,
    },

    /// A string field was not valid UTF-8.
    #[error("invalid utf-8 in field '{field}'")]
    InvalidString {
        /// Name of the offending field.
        field: &'static str,
    },

    /// Trailing bytes after a complete message.
    #[error("excess data: {excess} bytes after message end")]
    ExcessData {
        /// Number of unconsumed bytes.
        excess: usize,
    },
}

/// Failures of engine operations that surface synchronously.
///
/// When one of these is returned no Status will follow; the caller must not
/// wait for a reply.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// The operation requires a CONNECTED resource set.
    #[error("resource set {id} is not connected")]
    NotConnected {
        /// Id of the resource set.
        id: u32,
    },

    /// The message kind is not acceptable on this code path.
    #[error("message kind {kind:?} not valid here")]
    InvalidKind {
        /// The rejected kind.
        kind: MessageKind,
    },

    /// The message kind is not in the validity table for this role.
    #[error("message kind {kind:?} not valid for role {role:?}")]
    InvalidForRole {
        /// The rejected kind.
        kind: MessageKind,
        /// Role of the connection.
        role: Role,
    },

    /// A resource bitmask quadruple violates the subset invariants.
    #[error("malformed resource masks on set {id}")]
    InvalidMasks {
        /// Id of the resource set.
        id: u32,
    },

    /// The transport could not move the message.
    #[error("transport send failed: {message}")]
    SendFailed {
        /// Transport-specific detail.
        message: String,
    },

    /// No peer connection is registered for the destination.
    #[error("no peer available for '{peer}'")]
    NoPeer {
        /// Destination name.
        peer: String,
    },

    /// The connection was already torn down.
    #[error("connection is killed")]
    ConnectionKilled,

    /// Transport initialization failed (name request, object registration,
    /// duplicate in-process endpoint, ...).
    #[error("transport setup failed: {message}")]
    SetupFailed {
        /// Transport-specific detail.
        message: String,
    },
}
