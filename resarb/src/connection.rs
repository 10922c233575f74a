//! Connection engine.
//!
//! A [`Connection`] is a role-aware endpoint owning one transport adapter,
//! the list of resource sets bound to it, the pending-reply table and the
//! per-kind dispatch handlers. All state lives behind `Rc`/`RefCell`; every
//! mutation happens from a message arrival, a timer or a public API call on
//! one thread, so no locking is involved.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::ProtoError;
use crate::message::{Message, MessageKind, Possess, Status};
use crate::set::{ResourceSet, SetState};
use crate::timer::{Scheduler as _, SharedScheduler, TimerHandle};
use crate::transport::bus::BusLink;
use crate::transport::loopback::LoopbackHub;
use crate::transport::{ReplyToken, Transport};
use crate::types::{errcode, Role};

/// Completion callback for a request that expects a Status reply.
pub type StatusCallback = Box<dyn FnOnce(&ResourceSet, &Status)>;

/// Handler invoked for a received message kind.
pub type MessageHandler = Rc<dyn Fn(&Message, &ResourceSet, ReplyToken)>;

/// A request waiting for its Status.
///
/// Holds one clone of the resource set handle; dropping the entry releases
/// that reference.
pub(crate) struct PendingReply {
    pub serial: u32,
    pub kind: MessageKind,
    pub reqno: u32,
    pub rset: ResourceSet,
    pub callback: Option<StatusCallback>,
    pub timer: Option<(SharedScheduler, TimerHandle)>,
}

struct ConnState {
    rsets: Vec<ResourceSet>,
    replies: Vec<PendingReply>,
    handlers: HashMap<MessageKind, MessageHandler>,
    manager_up: Option<Rc<dyn Fn(&Connection)>>,
    killed: bool,
}

pub(crate) struct ConnectionCore {
    id: u32,
    role: Role,
    transport: Box<dyn Transport>,
    state: RefCell<ConnState>,
}

static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

/// Shared handle to a protocol connection.
#[derive(Clone)]
pub struct Connection {
    core: Rc<ConnectionCore>,
}

impl Connection {
    fn with_transport(role: Role, transport: Box<dyn Transport>) -> Result<Self, ProtoError> {
        let conn = Self {
            core: Rc::new(ConnectionCore {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                role,
                transport,
                state: RefCell::new(ConnState {
                    rsets: Vec::new(),
                    replies: Vec::new(),
                    handlers: HashMap::new(),
                    manager_up: None,
                    killed: false,
                }),
            }),
        };
        conn.core.transport.attach(&conn)?;
        tracing::debug!(id = conn.core.id, role = ?role, "connection initialized");
        Ok(conn)
    }

    /// Create a manager connection on the message bus. Claims the well-known
    /// manager name and registers the manager object path.
    pub fn bus_manager(bus: Rc<dyn BusLink>) -> Result<Self, ProtoError> {
        Self::with_transport(
            Role::Manager,
            Box::new(crate::transport::bus::BusTransport::new(bus, Role::Manager)),
        )
    }

    /// Create a client connection on the message bus. Starts the presence
    /// watch on the manager's well-known name.
    pub fn bus_client(bus: Rc<dyn BusLink>) -> Result<Self, ProtoError> {
        Self::with_transport(
            Role::Client,
            Box::new(crate::transport::bus::BusTransport::new(bus, Role::Client)),
        )
    }

    /// Create the designated in-process manager connection on `hub`.
    /// Fails if the hub already has a live manager.
    pub fn loopback_manager(hub: &LoopbackHub) -> Result<Self, ProtoError> {
        Self::with_transport(
            Role::Manager,
            Box::new(crate::transport::loopback::LoopbackTransport::manager(hub)),
        )
    }

    /// Create an in-process client connection self-named `name` on `hub`.
    /// Fails if the name is already taken by a live connection.
    pub fn loopback_client(hub: &LoopbackHub, name: &str) -> Result<Self, ProtoError> {
        Self::with_transport(
            Role::Client,
            Box::new(crate::transport::loopback::LoopbackTransport::client(
                hub, name,
            )),
        )
    }

    pub(crate) fn from_core(core: Rc<ConnectionCore>) -> Self {
        Self { core }
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnectionCore> {
        Rc::downgrade(&self.core)
    }

    /// Role of this connection.
    pub fn role(&self) -> Role {
        self.core.role
    }

    /// Whether the connection was shut down.
    pub fn is_killed(&self) -> bool {
        self.core.state.borrow().killed
    }

    /// Mark the connection as killed. Subsequent connects and sends are
    /// rejected with [`ProtoError::ConnectionKilled`].
    pub fn shutdown(&self) {
        self.core.state.borrow_mut().killed = true;
        tracing::debug!(id = self.core.id, "connection killed");
    }

    /// Register the handler for a received message kind.
    ///
    /// The kind is validated against the role's validity table here, once;
    /// dispatch trusts the table.
    pub fn set_handler(
        &self,
        kind: MessageKind,
        handler: impl Fn(&Message, &ResourceSet, ReplyToken) + 'static,
    ) -> Result<(), ProtoError> {
        if !kind.is_valid_for(self.core.role) {
            return Err(ProtoError::InvalidForRole {
                kind,
                role: self.core.role,
            });
        }
        self.core
            .state
            .borrow_mut()
            .handlers
            .insert(kind, Rc::new(handler));
        Ok(())
    }

    /// Register the callback invoked when the manager (re)appears on the
    /// link. Client side only; a manager connection never fires it.
    pub fn set_manager_up(&self, callback: impl Fn(&Connection) + 'static) {
        self.core.state.borrow_mut().manager_up = Some(Rc::new(callback));
    }

    /// Open a resource set towards the manager with a Register message.
    ///
    /// Client role only, on a non-killed connection, and the message must be
    /// a Register with well-formed masks. Returns the (found or created) set,
    /// or `None` when a precondition fails. The Register's Status lands in
    /// `callback`.
    pub fn connect(&self, msg: Message, callback: StatusCallback) -> Option<ResourceSet> {
        if self.is_killed() || self.core.role != Role::Client {
            tracing::warn!(id = self.core.id, "connect rejected: wrong role or killed");
            return None;
        }
        let record = match &msg {
            Message::Register(record) => record,
            _ => {
                tracing::warn!(kind = %msg.kind(), "connect rejected: not a register");
                return None;
            }
        };
        if !record.rset.is_well_formed() {
            tracing::warn!(set = record.id, "connect rejected: malformed masks");
            return None;
        }

        let rset = self.core.transport.connect(self, &msg)?;
        if let Err(error) = self.core.transport.send(self, &rset, msg, Some(callback)) {
            // The set stays in the list as CREATED; a later connect with the
            // same id finds and reuses it.
            tracing::warn!(set = rset.id(), %error, "register send failed");
            return None;
        }
        Some(rset)
    }

    /// Close a resource set with an Unregister message.
    ///
    /// Valid only while the set is CONNECTED. On transport-level send success
    /// the local teardown runs immediately; the set is resurrected only if
    /// the Unregister reply carries an error.
    pub fn disconnect(
        &self,
        rset: &ResourceSet,
        mut msg: Message,
        callback: StatusCallback,
    ) -> Result<(), ProtoError> {
        if rset.state() != SetState::Connected {
            return Err(ProtoError::NotConnected { id: rset.id() });
        }
        if msg.kind() != MessageKind::Unregister {
            return Err(ProtoError::InvalidKind { kind: msg.kind() });
        }
        msg.set_id(rset.id());

        self.core
            .transport
            .send(self, rset, msg, Some(callback))?;
        self.core.transport.disconn(self, rset);
        Ok(())
    }

    /// Send a request on a CONNECTED resource set.
    ///
    /// Register and Unregister must go through [`Connection::connect`] and
    /// [`Connection::disconnect`]. The set's id is stamped onto the message.
    /// An Update applies its quadruple to the set optimistically, before the
    /// ack arrives, so later diffs compare against current intent.
    pub fn send(
        &self,
        rset: &ResourceSet,
        mut msg: Message,
        callback: Option<StatusCallback>,
    ) -> Result<(), ProtoError> {
        if self.is_killed() {
            return Err(ProtoError::ConnectionKilled);
        }
        if rset.state() != SetState::Connected {
            return Err(ProtoError::NotConnected { id: rset.id() });
        }
        let kind = msg.kind();
        if matches!(kind, MessageKind::Register | MessageKind::Unregister) {
            return Err(ProtoError::InvalidKind { kind });
        }
        msg.set_id(rset.id());

        let update_flags = match &msg {
            Message::Update(record) => {
                if !record.rset.is_well_formed() {
                    return Err(ProtoError::InvalidMasks { id: rset.id() });
                }
                Some(record.rset)
            }
            _ => None,
        };

        self.core.transport.send(self, rset, msg, callback)?;

        if let Some(flags) = update_flags {
            rset.update_flags(flags);
        }
        Ok(())
    }

    /// Tear a resource set down locally without any wire traffic.
    ///
    /// The manager side of an acknowledged Unregister, and the general
    /// "explicit destroy" path. Idempotent.
    pub fn destroy_set(&self, rset: &ResourceSet) {
        self.core.transport.disconn(self, rset);
    }

    /// Answer a received request. Manager side of the reply path.
    ///
    /// When `token` is [`ReplyToken::None`] the sender is not waiting and
    /// this is a successful no-op.
    pub fn reply(
        &self,
        rset: &ResourceSet,
        original: &Message,
        token: ReplyToken,
        errcod: i32,
        errmsg: &str,
    ) -> Result<(), ProtoError> {
        if !token.expects_reply() {
            return Ok(());
        }
        let status = Message::Status(Status {
            id: rset.id(),
            reqno: original.reqno(),
            errcod,
            errmsg: errmsg.to_string(),
        });
        self.core.transport.reply(self, rset, status, &token)
    }

    // ---- set bookkeeping -------------------------------------------------

    pub(crate) fn find_set(&self, peer: &str, id: u32) -> Option<ResourceSet> {
        self.core
            .state
            .borrow()
            .rsets
            .iter()
            .find(|rset| rset.matches(peer, id))
            .cloned()
    }

    pub(crate) fn insert_set(&self, rset: ResourceSet) {
        self.core.state.borrow_mut().rsets.push(rset);
    }

    pub(crate) fn remove_set(&self, rset: &ResourceSet) {
        self.core
            .state
            .borrow_mut()
            .rsets
            .retain(|other| !other.same_set(rset));
    }

    fn connected_sets_of_peer(&self, peer: &str) -> Vec<ResourceSet> {
        self.core
            .state
            .borrow()
            .rsets
            .iter()
            .filter(|rset| rset.peer() == peer && rset.state() == SetState::Connected)
            .cloned()
            .collect()
    }

    // ---- pending replies -------------------------------------------------

    pub(crate) fn open_reply(
        &self,
        serial: u32,
        kind: MessageKind,
        reqno: u32,
        rset: ResourceSet,
        callback: Option<StatusCallback>,
        timer: Option<(SharedScheduler, TimerHandle)>,
    ) {
        tracing::debug!(serial, kind = %kind, reqno, set = rset.id(), "pending reply opened");
        self.core.state.borrow_mut().replies.push(PendingReply {
            serial,
            kind,
            reqno,
            rset,
            callback,
            timer,
        });
    }

    fn take_reply(&self, serial: u32) -> Option<PendingReply> {
        let mut state = self.core.state.borrow_mut();
        let index = state.replies.iter().position(|r| r.serial == serial)?;
        Some(state.replies.remove(index))
    }

    /// Resolve the pending reply with `serial`, run the client-role state
    /// transitions and deliver the Status to the completion callback.
    ///
    /// A serial with no pending entry is stale (peer loss already resolved
    /// it) and is ignored.
    pub(crate) fn complete_reply(&self, serial: u32, status: Status) {
        let Some(reply) = self.take_reply(serial) else {
            tracing::debug!(serial, "stale reply ignored");
            return;
        };
        self.finish_reply(reply, status);
    }

    fn finish_reply(&self, mut reply: PendingReply, status: Status) {
        if let Some((scheduler, handle)) = reply.timer.take() {
            scheduler.cancel(handle);
        }

        tracing::debug!(
            serial = reply.serial,
            kind = %reply.kind,
            errcod = status.errcod,
            "reply completed"
        );

        if self.core.role == Role::Client {
            match reply.kind {
                MessageKind::Register => {
                    if status.errcod == errcode::NONE {
                        reply.rset.set_state(SetState::Connected);
                    } else {
                        // Registration refused: the set dies before it ever
                        // carried traffic.
                        self.core.transport.disconn(self, &reply.rset);
                    }
                }
                MessageKind::Unregister => {
                    if status.errcod != errcode::NONE {
                        // Unregister was speculative; roll the set back and
                        // restore the list reference dropped at teardown.
                        reply.rset.set_state(SetState::Connected);
                        self.insert_set(reply.rset.clone());
                    }
                }
                _ => {}
            }
        }

        if let Some(callback) = reply.callback.take() {
            callback(&reply.rset, &status);
        }
        // Dropping `reply` releases the pending reference on the set.
    }

    // ---- dispatch and link state ----------------------------------------

    /// Hand a received message to the registered handler for its kind.
    pub(crate) fn dispatch(&self, msg: &Message, rset: &ResourceSet, token: ReplyToken) {
        let handler = self.core.state.borrow().handlers.get(&msg.kind()).cloned();
        match handler {
            Some(handler) => handler(msg, rset, token),
            None => {
                tracing::debug!(kind = %msg.kind(), "no handler, message dropped");
            }
        }
    }

    /// The peer named `peer` vanished.
    ///
    /// Every in-flight pending reply towards it fails with a synthesized
    /// peer-error Status, then every CONNECTED set bound to it receives a
    /// synthetic Unregister through the normal handler before local
    /// teardown. One code path covers graceful unregister and peer crash.
    pub(crate) fn link_down(&self, peer: &str) {
        tracing::debug!(id = self.core.id, peer, "link down");

        let failed: Vec<PendingReply> = {
            let mut state = self.core.state.borrow_mut();
            let mut kept = Vec::new();
            let mut lost = Vec::new();
            for reply in state.replies.drain(..) {
                if reply.rset.peer() == peer {
                    lost.push(reply);
                } else {
                    kept.push(reply);
                }
            }
            state.replies = kept;
            lost
        };
        for reply in failed {
            let status = Status {
                id: reply.rset.id(),
                reqno: reply.reqno,
                errcod: errcode::PEER_ERROR,
                errmsg: "peer disconnected".to_string(),
            };
            self.finish_reply(reply, status);
        }

        for rset in self.connected_sets_of_peer(peer) {
            let msg = Message::Unregister(Possess {
                id: rset.id(),
                reqno: 0,
            });
            self.dispatch(&msg, &rset, ReplyToken::None);
            self.core.transport.disconn(self, &rset);
        }
    }

    /// The manager (re)appeared on the link.
    pub(crate) fn link_up(&self) {
        tracing::debug!(id = self.core.id, "link up");
        let callback = self.core.state.borrow().manager_up.clone();
        if let Some(callback) = callback {
            callback(self);
        }
    }

}
