//! In-process transport adapter.
//!
//! Used when manager and clients share an address space (tests, embedded
//! policy engines). There is no wire format; messages move between
//! connections registered on a shared [`LoopbackHub`].
//!
//! Delivery is never reentrant: every delivery is appended to the
//! destination's FIFO and drained one item at a time by a zero-delay
//! scheduled callback, so a handler that itself sends observes "arrives
//! later, not on this stack" semantics matching the bus transport.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::connection::{Connection, ConnectionCore, StatusCallback};
use crate::error::ProtoError;
use crate::message::{Message, MessageKind, Status};
use crate::set::{ResourceSet, SetState};
use crate::timer::{Scheduler as _, SharedScheduler};
use crate::transport::{ReplyToken, Transport};
use crate::types::{errcode, Role};

/// In-process name of the designated manager connection.
pub const MANAGER_NAME: &str = "ResourceManager";

/// Watchdog bound for manager-role reply-needing sends.
const NO_REPLY_TIMEOUT: Duration = Duration::from_millis(2000);

struct Delivery {
    /// Sender's in-process name.
    peer: String,
    /// Synthetic serial, 0 when no reply is expected.
    serial: u32,
    msg: Message,
}

#[derive(Clone)]
struct Endpoint {
    conn: Weak<ConnectionCore>,
    queue: Rc<RefCell<VecDeque<Delivery>>>,
}

struct HubInner {
    scheduler: SharedScheduler,
    manager: RefCell<Option<Endpoint>>,
    clients: RefCell<HashMap<String, Endpoint>>,
    next_serial: Cell<u32>,
}

/// Registry of in-process connections: one designated manager plus
/// self-named clients, and the serial allocator they share.
///
/// Replaces a process-global connection list with an explicit object the
/// application owns and injects.
#[derive(Clone)]
pub struct LoopbackHub {
    inner: Rc<HubInner>,
}

impl LoopbackHub {
    /// Create a hub draining deliveries through `scheduler`.
    pub fn new(scheduler: SharedScheduler) -> Self {
        Self {
            inner: Rc::new(HubInner {
                scheduler,
                manager: RefCell::new(None),
                clients: RefCell::new(HashMap::new()),
                next_serial: Cell::new(1),
            }),
        }
    }

    pub(crate) fn scheduler(&self) -> SharedScheduler {
        self.inner.scheduler.clone()
    }

    fn alloc_serial(&self) -> u32 {
        let serial = self.inner.next_serial.get();
        self.inner.next_serial.set(serial + 1);
        serial
    }

    fn endpoint(&self, name: &str) -> Option<Endpoint> {
        if name == MANAGER_NAME {
            let slot = self.inner.manager.borrow();
            slot.as_ref()
                .filter(|ep| ep.conn.strong_count() > 0)
                .cloned()
        } else {
            let clients = self.inner.clients.borrow();
            clients
                .get(name)
                .filter(|ep| ep.conn.strong_count() > 0)
                .cloned()
        }
    }

    fn register_manager(&self, endpoint: Endpoint) -> Result<(), ProtoError> {
        let mut slot = self.inner.manager.borrow_mut();
        if slot.as_ref().is_some_and(|ep| ep.conn.strong_count() > 0) {
            return Err(ProtoError::SetupFailed {
                message: "hub already has a manager".to_string(),
            });
        }
        *slot = Some(endpoint);
        Ok(())
    }

    fn register_client(&self, name: &str, endpoint: Endpoint) -> Result<(), ProtoError> {
        let mut clients = self.inner.clients.borrow_mut();
        if clients
            .get(name)
            .is_some_and(|ep| ep.conn.strong_count() > 0)
        {
            return Err(ProtoError::SetupFailed {
                message: format!("client name '{name}' already taken"),
            });
        }
        clients.insert(name.to_string(), endpoint);
        Ok(())
    }

    /// Raise link-up on every client connection. Fired when the manager
    /// endpoint attaches; embedders restarting an in-process manager get the
    /// same "manager is back" signal bus clients get from the name owner
    /// broadcast.
    pub fn announce_manager(&self) {
        let clients: Vec<Endpoint> = self.inner.clients.borrow().values().cloned().collect();
        for endpoint in clients {
            if let Some(core) = endpoint.conn.upgrade() {
                Connection::from_core(core).link_up();
            }
        }
    }

    /// Drop the endpoint named `name` from the hub and raise link-down on
    /// its counterparties, simulating peer loss for the in-process case.
    pub fn drop_peer(&self, name: &str) {
        if name == MANAGER_NAME {
            self.inner.manager.borrow_mut().take();
            let clients: Vec<Endpoint> = self.inner.clients.borrow().values().cloned().collect();
            for endpoint in clients {
                if let Some(core) = endpoint.conn.upgrade() {
                    Connection::from_core(core).link_down(MANAGER_NAME);
                }
            }
        } else {
            self.inner.clients.borrow_mut().remove(name);
            let manager = self.endpoint(MANAGER_NAME);
            if let Some(core) = manager.and_then(|endpoint| endpoint.conn.upgrade()) {
                Connection::from_core(core).link_down(name);
            }
        }
    }

    /// Queue a delivery for `endpoint` and schedule a zero-delay drain of
    /// exactly one item. Per-endpoint FIFO order is preserved because the
    /// scheduler fires same-deadline callbacks in submission order.
    fn enqueue(&self, endpoint: &Endpoint, delivery: Delivery) {
        endpoint.queue.borrow_mut().push_back(delivery);
        let drain = endpoint.clone();
        self.inner.scheduler.schedule(
            Duration::ZERO,
            Box::new(move || drain_one(&drain)),
        );
    }
}

fn drain_one(endpoint: &Endpoint) {
    let Some(item) = endpoint.queue.borrow_mut().pop_front() else {
        return;
    };
    let Some(core) = endpoint.conn.upgrade() else {
        return;
    };
    let conn = Connection::from_core(core);
    deliver(&conn, item);
}

fn deliver(conn: &Connection, item: Delivery) {
    let kind = item.msg.kind();
    let token = if item.serial != 0 {
        ReplyToken::Loopback {
            serial: item.serial,
            peer: item.peer.clone(),
        }
    } else {
        ReplyToken::None
    };

    if let Some(rset) = conn.find_set(&item.peer, item.msg.id()) {
        if kind == MessageKind::Register {
            tracing::debug!(peer = %item.peer, id = item.msg.id(), "duplicate register dropped");
            return;
        }
        conn.dispatch(&item.msg, &rset, token);
        return;
    }

    if conn.role() == Role::Manager {
        if let Message::Register(record) = &item.msg {
            if !record.rset.is_well_formed() {
                tracing::warn!(peer = %item.peer, id = record.id, "malformed registration dropped");
                return;
            }
            let rset = ResourceSet::new(
                &item.peer,
                record.id,
                SetState::Connected,
                &record.class,
                record.mode,
                record.rset,
            );
            conn.insert_set(rset.clone());
            conn.dispatch(&item.msg, &rset, token);
            return;
        }
    }

    tracing::debug!(peer = %item.peer, id = item.msg.id(), kind = %kind, "message for unknown set dropped");
}

pub(crate) struct LoopbackTransport {
    hub: LoopbackHub,
    name: String,
    role: Role,
}

impl LoopbackTransport {
    pub(crate) fn manager(hub: &LoopbackHub) -> Self {
        Self {
            hub: hub.clone(),
            name: MANAGER_NAME.to_string(),
            role: Role::Manager,
        }
    }

    pub(crate) fn client(hub: &LoopbackHub, name: &str) -> Self {
        Self {
            hub: hub.clone(),
            name: name.to_string(),
            role: Role::Client,
        }
    }
}

impl Transport for LoopbackTransport {
    fn attach(&self, conn: &Connection) -> Result<(), ProtoError> {
        let endpoint = Endpoint {
            conn: conn.downgrade(),
            queue: Rc::new(RefCell::new(VecDeque::new())),
        };
        match self.role {
            Role::Manager => {
                self.hub.register_manager(endpoint)?;
                self.hub.announce_manager();
                Ok(())
            }
            Role::Client => self.hub.register_client(&self.name, endpoint),
        }
    }

    fn connect(&self, conn: &Connection, msg: &Message) -> Option<ResourceSet> {
        let Message::Register(record) = msg else {
            return None;
        };
        if let Some(existing) = conn.find_set(MANAGER_NAME, record.id) {
            return Some(existing);
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
        if kind == MessageKind::Status {
            return Err(ProtoError::InvalidKind { kind });
        }

        let receiver_name = match self.role {
            Role::Client => MANAGER_NAME.to_string(),
            Role::Manager => rset.peer(),
        };
        let Some(receiver) = self.hub.endpoint(&receiver_name) else {
            return Err(ProtoError::NoPeer {
                peer: receiver_name,
            });
        };

        let need_reply = match self.role {
            Role::Client => {
                matches!(kind, MessageKind::Register | MessageKind::Unregister)
                    || callback.is_some()
            }
            Role::Manager => callback.is_some(),
        };

        let serial = if need_reply { self.hub.alloc_serial() } else { 0 };

        tracing::debug!(kind = %kind, set = rset.id(), serial, "loopback send");

        if need_reply {
            // A manager waiting on a client arms a watchdog that fabricates
            // a timeout Status if no reply callback fires in time.
            let timer = if self.role == Role::Manager {
                let weak = conn.downgrade();
                let id = rset.id();
                let reqno = msg.reqno();
                let scheduler = self.hub.scheduler();
                let handle = scheduler.schedule(
                    NO_REPLY_TIMEOUT,
                    Box::new(move || {
                        let Some(core) = weak.upgrade() else {
                            return;
                        };
                        tracing::warn!(serial, id, "no reply in time, synthesizing timeout");
                        Connection::from_core(core).complete_reply(
                            serial,
                            Status {
                                id,
                                reqno,
                                errcod: errcode::TIMEOUT,
                                errmsg: "Internal.NoReply".to_string(),
                            },
                        );
                    }),
                );
                Some((self.hub.scheduler(), handle))
            } else {
                None
            };
            conn.open_reply(serial, kind, msg.reqno(), rset.clone(), callback, timer);
        }

        self.hub.enqueue(
            &receiver,
            Delivery {
                peer: self.name.clone(),
                serial,
                msg,
            },
        );
        Ok(())
    }

    fn disconn(&self, conn: &Connection, rset: &ResourceSet) {
        if rset.state() == SetState::Killed {
            return;
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
        let (serial, peer) = match token {
            ReplyToken::None => return Ok(()),
            ReplyToken::Loopback { serial, peer } => (*serial, peer.clone()),
            ReplyToken::Bus { .. } => {
                return Err(ProtoError::SendFailed {
                    message: "bus token on loopback transport".to_string(),
                })
            }
        };
        let Message::Status(status) = status else {
            return Err(ProtoError::InvalidKind {
                kind: status.kind(),
            });
        };

        // The Status crosses back through the scheduler so the requester's
        // completion never runs on the responder's stack.
        let hub = self.hub.clone();
        self.hub.scheduler().schedule(
            Duration::ZERO,
            Box::new(move || {
                let Some(endpoint) = hub.endpoint(&peer) else {
                    tracing::debug!(%peer, serial, "reply target gone");
                    return;
                };
                let Some(core) = endpoint.conn.upgrade() else {
                    return;
                };
                Connection::from_core(core).complete_reply(serial, status);
            }),
        );
        Ok(())
    }
}
