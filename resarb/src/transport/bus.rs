//! Message-bus transport adapter.
//!
//! The engine does not speak the bus itself; it consumes a [`BusLink`]
//! capability providing method calls, replies, object dispatch and
//! name-ownership watches. The adapter maps the protocol onto that
//! capability: the manager claims the well-known name and a fixed object
//! path, each client resource set becomes an object under a per-set path,
//! and the method member is the lowercase kind name.
//!
//! Peer presence is inferred from the bus's standard ownership-change
//! broadcast: a client watches the manager's name, the manager watches each
//! registered client's identity.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::connection::{Connection, ConnectionCore, StatusCallback};
use crate::error::ProtoError;
use crate::message::{Message, MessageKind, Status};
use crate::set::{ResourceSet, SetState};
use crate::transport::{ReplyToken, Transport};
use crate::types::{errcode, Role};

/// Well-known bus name of the resource manager.
pub const MANAGER_NAME: &str = "org.maemo.resource.manager";

/// Object path of the manager.
pub const MANAGER_PATH: &str = "/org/maemo/resource/manager";

/// Interface of methods addressed to the manager.
pub const MANAGER_INTERFACE: &str = "org.maemo.resource.manager";

/// Interface of methods addressed to a client.
pub const CLIENT_INTERFACE: &str = "org.maemo.resource.client";

/// Object path of the client-side object for resource set `id`.
pub fn client_path(id: u32) -> String {
    format!("/org/maemo/resource/client{id}")
}

/// Bound timeout for reply-needing method calls.
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// A method call moving over the bus.
#[derive(Debug, Clone)]
pub struct BusCall {
    /// Bus name of the receiver.
    pub destination: String,
    /// Object path addressed.
    pub path: String,
    /// Interface of the member.
    pub interface: String,
    /// Method member name.
    pub member: String,
    /// Unique bus name of the sender.
    pub sender: String,
    /// Call serial. Assigned by the link on send; populated on delivery.
    pub serial: u32,
    /// Encoded [`Message`].
    pub body: Vec<u8>,
}

/// Dispatch entry point for method calls arriving at a registered object.
pub type MethodHandler = Rc<dyn Fn(BusCall)>;

/// Completion of a reply-needing call: the raw reply body, or the bus error
/// name when the call failed or timed out at the bus level.
pub type ReplyNotify = Box<dyn FnOnce(Result<Vec<u8>, String>)>;

/// Ownership-change notification: (name, old owner, new owner). An empty
/// owner string means "no owner".
pub type OwnerNotify = Rc<dyn Fn(&str, &str, &str)>;

/// The send/receive/watch-presence capability the adapter runs on.
///
/// Implementations must deliver method calls, reply notifications and
/// ownership changes from their event loop, never from inside
/// [`BusLink::send`] or [`BusLink::call_with_reply`]; the engine relies on
/// handlers not running reentrantly.
pub trait BusLink {
    /// Unique bus name of this connection.
    fn unique_name(&self) -> String;

    /// Claim a well-known name. True on primary ownership.
    fn request_name(&self, name: &str) -> bool;

    /// Register an object path and its method dispatch.
    fn register_object(&self, path: &str, handler: MethodHandler) -> bool;

    /// Remove a registered object path.
    fn unregister_object(&self, path: &str);

    /// Fire-and-forget method call.
    fn send(&self, call: BusCall) -> bool;

    /// Method call with a pending reply. Returns the assigned serial, or
    /// `None` when the call could not be sent. `notify` fires exactly once:
    /// with the reply body, or with the bus error name after `timeout`.
    fn call_with_reply(
        &self,
        call: BusCall,
        timeout: Duration,
        notify: ReplyNotify,
    ) -> Option<u32>;

    /// Send a method-return for the call with the given serial.
    fn send_reply(&self, serial: u32, body: Vec<u8>) -> bool;

    /// Start or stop watching ownership of `name`. `notify` is required when
    /// starting a watch.
    fn watch_owner(&self, name: &str, watch: bool, notify: Option<OwnerNotify>) -> bool;
}

pub(crate) struct BusTransport {
    bus: Rc<dyn BusLink>,
    role: Role,
    /// Client identities the manager currently watches.
    watched: Rc<RefCell<HashSet<String>>>,
}

impl BusTransport {
    pub(crate) fn new(bus: Rc<dyn BusLink>, role: Role) -> Self {
        Self {
            bus,
            role,
            watched: Rc::new(RefCell::new(HashSet::new())),
        }
    }
}

/// Decode and sanity-check an incoming call; None drops it silently
/// (malformed messages get no reply).
fn parse_call(call: &BusCall, interface: &str) -> Option<Message> {
    let msg = match Message::decode(&call.body) {
        Ok(msg) => msg,
        Err(error) => {
            tracing::warn!(member = %call.member, %error, "malformed bus message dropped");
            return None;
        }
    };
    let method = msg.kind().method()?;
    if call.interface != interface || call.member != method {
        tracing::warn!(
            member = %call.member,
            expected = method,
            "mismatched bus method dropped"
        );
        return None;
    }
    Some(msg)
}

fn manager_owner_notify(
    weak: Weak<ConnectionCore>,
    bus: Rc<dyn BusLink>,
    watched: Rc<RefCell<HashSet<String>>>,
) -> OwnerNotify {
    Rc::new(move |name: &str, old: &str, new: &str| {
        if old.is_empty() || !new.is_empty() {
            return;
        }
        // client is gone
        if let Some(core) = weak.upgrade() {
            Connection::from_core(core).link_down(name);
        }
        bus.watch_owner(name, false, None);
        watched.borrow_mut().remove(name);
    })
}

fn manager_method_handler(
    weak: Weak<ConnectionCore>,
    bus: Rc<dyn BusLink>,
    watched: Rc<RefCell<HashSet<String>>>,
) -> MethodHandler {
    Rc::new(move |call: BusCall| {
        let Some(msg) = parse_call(&call, MANAGER_INTERFACE) else {
            return;
        };
        let Some(core) = weak.upgrade() else {
            return;
        };
        let conn = Connection::from_core(core);
        let kind = msg.kind();
        let token = ReplyToken::Bus {
            serial: call.serial,
        };

        if let Some(rset) = conn.find_set(&call.sender, msg.id()) {
            if kind == MessageKind::Register {
                tracing::debug!(sender = %call.sender, id = msg.id(), "duplicate register dropped");
                return;
            }
            conn.dispatch(&msg, &rset, token);
            return;
        }

        // First-register-wins: any well-formed first Register creates the
        // set; authorization is the policy layer's concern.
        let Message::Register(record) = &msg else {
            tracing::debug!(
                sender = %call.sender,
                id = msg.id(),
                kind = %kind,
                "message for unknown set dropped"
            );
            return;
        };
        if !record.rset.is_well_formed() {
            tracing::warn!(sender = %call.sender, id = record.id, "malformed registration dropped");
            return;
        }

        let rset = ResourceSet::new(
            &call.sender,
            record.id,
            SetState::Connected,
            &record.class,
            record.mode,
            record.rset,
        );
        conn.insert_set(rset.clone());

        if watched.borrow_mut().insert(call.sender.clone()) {
            let notify = manager_owner_notify(weak.clone(), bus.clone(), watched.clone());
            bus.watch_owner(&call.sender, true, Some(notify));
        }

        conn.dispatch(&msg, &rset, token);
    })
}

fn client_method_handler(weak: Weak<ConnectionCore>) -> MethodHandler {
    Rc::new(move |call: BusCall| {
        let Some(msg) = parse_call(&call, CLIENT_INTERFACE) else {
            return;
        };
        let Some(core) = weak.upgrade() else {
            return;
        };
        let conn = Connection::from_core(core);
        match conn.find_set(MANAGER_NAME, msg.id()) {
            Some(rset) => conn.dispatch(
                &msg,
                &rset,
                ReplyToken::Bus {
                    serial: call.serial,
                },
            ),
            None => {
                tracing::debug!(id = msg.id(), "message for unknown set dropped");
            }
        }
    })
}

/// Turn a bus-level reply into the Status delivered to the pending reply.
///
/// Anything that is not a Status matching the set and request number
/// degrades to a synthesized peer error.
fn handle_reply(
    weak: Weak<ConnectionCore>,
    rset: ResourceSet,
    reqno: u32,
    serial: u32,
    result: Result<Vec<u8>, String>,
) {
    let Some(core) = weak.upgrade() else {
        return;
    };
    let conn = Connection::from_core(core);

    let status = match result {
        Err(error_name) => {
            let errcod = if error_name.ends_with("NoReply") {
                errcode::TIMEOUT
            } else {
                errcode::PEER_ERROR
            };
            let errmsg = error_name
                .strip_prefix("org.freedesktop.")
                .unwrap_or(&error_name)
                .to_string();
            Status {
                id: rset.id(),
                reqno,
                errcod,
                errmsg,
            }
        }
        Ok(body) => match Message::decode(&body) {
            Ok(Message::Status(status)) if status.id == rset.id() && status.reqno == reqno => {
                status
            }
            other => {
                tracing::warn!(serial, ?other, "mismatched reply degraded to peer error");
                Status {
                    id: rset.id(),
                    reqno,
                    errcod: errcode::PEER_ERROR,
                    errmsg: "<peer error>".to_string(),
                }
            }
        },
    };

    conn.complete_reply(serial, status);
}

impl Transport for BusTransport {
    fn attach(&self, conn: &Connection) -> Result<(), ProtoError> {
        match self.role {
            Role::Manager => {
                if !self.bus.request_name(MANAGER_NAME) {
                    return Err(ProtoError::SetupFailed {
                        message: format!("could not own {MANAGER_NAME}"),
                    });
                }
                let handler = manager_method_handler(
                    conn.downgrade(),
                    self.bus.clone(),
                    self.watched.clone(),
                );
                if !self.bus.register_object(MANAGER_PATH, handler) {
                    return Err(ProtoError::SetupFailed {
                        message: format!("could not register {MANAGER_PATH}"),
                    });
                }
            }
            Role::Client => {
                let weak = conn.downgrade();
                let notify: OwnerNotify = Rc::new(move |name: &str, old: &str, new: &str| {
                    if name != MANAGER_NAME {
                        return;
                    }
                    let Some(core) = weak.upgrade() else {
                        return;
                    };
                    let conn = Connection::from_core(core);
                    if !new.is_empty() {
                        conn.link_up();
                    } else if !old.is_empty() {
                        conn.link_down(MANAGER_NAME);
                    }
                });
                if !self.bus.watch_owner(MANAGER_NAME, true, Some(notify)) {
                    return Err(ProtoError::SetupFailed {
                        message: format!("could not watch {MANAGER_NAME}"),
                    });
                }
            }
        }
        Ok(())
    }

    fn connect(&self, conn: &Connection, msg: &Message) -> Option<ResourceSet> {
        let Message::Register(record) = msg else {
            return None;
        };
        if let Some(existing) = conn.find_set(MANAGER_NAME, record.id) {
            return Some(existing);
        }
        if !self
            .bus
            .register_object(&client_path(record.id), client_method_handler(conn.downgrade()))
        {
            tracing::warn!(id = record.id, "client object registration failed");
            return None;
        }
        let rset = ResourceSet::new(
            MANAGER_NAME,
            record.id,
            SetState::Created,
            &record.class,
            record.mode,
            record.rset,
        );
        conn.insert_set(rset.clone());
        Some(rset)
    }

    fn send(
        &self,
        conn: &Connection,
        rset: &ResourceSet,
        msg: Message,
        callback: Option<StatusCallback>,
    ) -> Result<(), ProtoError> {
        let kind = msg.kind();
        let Some(member) = kind.method() else {
            return Err(ProtoError::InvalidKind { kind });
        };

        let (destination, path, interface) = match self.role {
            Role::Manager => (rset.peer(), client_path(rset.id()), CLIENT_INTERFACE),
            Role::Client => (
                MANAGER_NAME.to_string(),
                MANAGER_PATH.to_string(),
                MANAGER_INTERFACE,
            ),
        };

        // A client always waits for Register/Unregister; anything else waits
        // exactly when the caller asked for a completion.
        let need_reply = match self.role {
            Role::Client => {
                matches!(kind, MessageKind::Register | MessageKind::Unregister)
                    || callback.is_some()
            }
            Role::Manager => callback.is_some(),
        };

        let reqno = msg.reqno();
        let call = BusCall {
            destination,
            path,
            interface: interface.to_string(),
            member: member.to_string(),
            sender: self.bus.unique_name(),
            serial: 0,
            body: msg.encode(),
        };

        tracing::debug!(kind = %kind, set = rset.id(), need_reply, "bus send");

        if !need_reply {
            if self.bus.send(call) {
                return Ok(());
            }
            return Err(ProtoError::SendFailed {
                message: "bus send failed".to_string(),
            });
        }

        // The notify closure is built before the link assigns the serial;
        // it reads the slot at fire time, which the link guarantees happens
        // after call_with_reply returned.
        let serial_slot = Rc::new(Cell::new(0u32));
        let weak = conn.downgrade();
        let reply_set = rset.clone();
        let slot = serial_slot.clone();
        let notify: ReplyNotify = Box::new(move |result| {
            handle_reply(weak, reply_set, reqno, slot.get(), result);
        });

        match self.bus.call_with_reply(call, REPLY_TIMEOUT, notify) {
            Some(serial) => {
                serial_slot.set(serial);
                conn.open_reply(serial, kind, reqno, rset.clone(), callback, None);
                Ok(())
            }
            None => Err(ProtoError::SendFailed {
                message: "bus call failed".to_string(),
            }),
        }
    }

    fn disconn(&self, conn: &Connection, rset: &ResourceSet) {
        if rset.state() == SetState::Killed {
            return;
        }
        if self.role == Role::Client {
            self.bus.unregister_object(&client_path(rset.id()));
        }
        rset.set_state(SetState::Killed);
        conn.remove_set(rset);
    }

    fn reply(
        &self,
        _conn: &Connection,
        _rset: &ResourceSet,
        status: Message,
        token: &ReplyToken,
    ) -> Result<(), ProtoError> {
        match token {
            ReplyToken::None => Ok(()),
            ReplyToken::Bus { serial } => {
                if self.bus.send_reply(*serial, status.encode()) {
                    Ok(())
                } else {
                    Err(ProtoError::SendFailed {
                        message: "bus reply failed".to_string(),
                    })
                }
            }
            ReplyToken::Loopback { .. } => Err(ProtoError::SendFailed {
                message: "loopback token on bus transport".to_string(),
            }),
        }
    }
}
