//! Transport adapters.
//!
//! A transport moves a [`Message`](crate::message::Message) between a client
//! and the manager and detects peer loss. Two adapters exist: the bus
//! adapter, which marshals onto an external message bus through the
//! [`BusLink`](bus::BusLink) capability, and the loopback adapter for the
//! case where manager and clients share an address space.

use crate::connection::{Connection, StatusCallback};
use crate::error::ProtoError;
use crate::message::Message;
use crate::set::ResourceSet;

pub mod bus;
pub mod loopback;

pub use bus::{BusCall, BusLink, MethodHandler, OwnerNotify, ReplyNotify};
pub use loopback::LoopbackHub;

/// Where a reply to a received request must be sent.
///
/// Handed to message handlers alongside the message; the manager passes it
/// back through [`Connection::reply`]. [`ReplyToken::None`] marks
/// fire-and-forget deliveries for which replying is a successful no-op.
#[derive(Debug, Clone)]
pub enum ReplyToken {
    /// No reply channel; the sender is not waiting.
    None,
    /// Reply as a bus method return to the given call serial.
    Bus {
        /// Serial of the method call being answered.
        serial: u32,
    },
    /// Reply through the loopback hub.
    Loopback {
        /// Synthetic serial of the pending reply on the requester side.
        serial: u32,
        /// In-process name of the requester.
        peer: String,
    },
}

impl ReplyToken {
    /// Whether the sender is waiting for a reply.
    pub fn expects_reply(&self) -> bool {
        !matches!(self, ReplyToken::None)
    }
}

/// Common adapter contract implemented by both transports.
pub(crate) trait Transport {
    /// Wire the adapter to its connection: claim names, register dispatch
    /// entry points, start the presence watch.
    fn attach(&self, conn: &Connection) -> Result<(), ProtoError>;

    /// Find or create the resource set a client Register will travel on.
    /// Client role only; `None` on precondition failure.
    fn connect(&self, conn: &Connection, msg: &Message) -> Option<ResourceSet>;

    /// Move a message towards the peer, opening a pending reply when one is
    /// needed. An `Err` means the send could not be attempted; no Status
    /// will follow.
    fn send(
        &self,
        conn: &Connection,
        rset: &ResourceSet,
        msg: Message,
        callback: Option<StatusCallback>,
    ) -> Result<(), ProtoError>;

    /// Tear down a resource set locally. Idempotent.
    fn disconn(&self, conn: &Connection, rset: &ResourceSet);

    /// Send a Status answer for a previously received request.
    fn reply(
        &self,
        conn: &Connection,
        rset: &ResourceSet,
        status: Message,
        token: &ReplyToken,
    ) -> Result<(), ProtoError>;
}
