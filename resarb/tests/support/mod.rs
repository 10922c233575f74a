//! Shared test fixtures: a scripted in-process manager and an in-memory
//! message-bus double implementing the `BusLink` capability.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use resarb::transport::bus::{BusCall, BusLink, MethodHandler, OwnerNotify, ReplyNotify};
use resarb::{
    errcode, Connection, LoopbackHub, ManualScheduler, Message, MessageKind, Notify, ReplyToken,
    ResourceFlags, ResourceSet, Scheduler, SharedScheduler, TimerHandle,
};

/// Install a fmt subscriber when `RESARB_DEBUG` asks for one.
pub fn init_logging() {
    if resarb::debug_enabled() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// Build a hub on a fresh manual scheduler.
pub fn hub_with_scheduler() -> (LoopbackHub, ManualScheduler) {
    init_logging();
    let scheduler = ManualScheduler::new();
    let shared: SharedScheduler = Rc::new(scheduler.clone());
    (LoopbackHub::new(shared), scheduler)
}

struct ScriptedInner {
    conn: Connection,
    /// Received request kinds with their set id, in arrival order.
    log: RefCell<Vec<(MessageKind, u32)>>,
    /// Resource sets observed in Register handlers, in arrival order.
    sets: RefCell<Vec<ResourceSet>>,
    /// When true, requests are stashed instead of answered.
    hold_replies: Cell<bool>,
    held: RefCell<Vec<(Message, ResourceSet, ReplyToken)>>,
    /// Error code to answer Unregister with.
    unregister_errcod: Cell<i32>,
}

/// A manager connection answering every request with success, granting the
/// full requested mask on Acquire and an empty one on Release. Tests can
/// hold replies back and release them one by one, or make Unregister fail.
#[derive(Clone)]
pub struct ScriptedManager {
    inner: Rc<ScriptedInner>,
}

impl ScriptedManager {
    pub fn new(hub: &LoopbackHub) -> Self {
        Self::with_connection(Connection::loopback_manager(hub).expect("loopback manager"))
    }

    /// Script an already-built manager connection (loopback or bus).
    pub fn with_connection(conn: Connection) -> Self {
        let inner = Rc::new(ScriptedInner {
            conn: conn.clone(),
            log: RefCell::new(Vec::new()),
            sets: RefCell::new(Vec::new()),
            hold_replies: Cell::new(false),
            held: RefCell::new(Vec::new()),
            unregister_errcod: Cell::new(errcode::NONE),
        });

        for kind in [
            MessageKind::Register,
            MessageKind::Unregister,
            MessageKind::Update,
            MessageKind::Acquire,
            MessageKind::Release,
            MessageKind::Audio,
            MessageKind::Video,
        ] {
            let weak = Rc::downgrade(&inner);
            conn.set_handler(kind, move |msg, rset, token| {
                if let Some(inner) = weak.upgrade() {
                    ScriptedManager { inner }.on_request(msg, rset, token);
                }
            })
            .expect("handler registration");
        }

        Self { inner }
    }

    pub fn connection(&self) -> Connection {
        self.inner.conn.clone()
    }

    pub fn log(&self) -> Vec<(MessageKind, u32)> {
        self.inner.log.borrow().clone()
    }

    pub fn kinds(&self) -> Vec<MessageKind> {
        self.inner.log.borrow().iter().map(|(k, _)| *k).collect()
    }

    pub fn sets(&self) -> Vec<ResourceSet> {
        self.inner.sets.borrow().clone()
    }

    pub fn hold_replies(&self, hold: bool) {
        self.inner.hold_replies.set(hold);
    }

    pub fn held_count(&self) -> usize {
        self.inner.held.borrow().len()
    }

    pub fn fail_unregister_with(&self, errcod: i32) {
        self.inner.unregister_errcod.set(errcod);
    }

    /// Answer the oldest held request.
    pub fn release_one_held(&self) {
        let entry = {
            let mut held = self.inner.held.borrow_mut();
            if held.is_empty() {
                None
            } else {
                Some(held.remove(0))
            }
        };
        if let Some((msg, rset, token)) = entry {
            self.respond(&msg, &rset, token);
        }
    }

    fn on_request(&self, msg: &Message, rset: &ResourceSet, token: ReplyToken) {
        self.inner.log.borrow_mut().push((msg.kind(), msg.id()));
        if msg.kind() == MessageKind::Register {
            self.inner.sets.borrow_mut().push(rset.clone());
        }
        if self.inner.hold_replies.get() {
            self.inner
                .held
                .borrow_mut()
                .push((msg.clone(), rset.clone(), token));
            return;
        }
        self.respond(msg, rset, token);
    }

    fn respond(&self, msg: &Message, rset: &ResourceSet, token: ReplyToken) {
        let conn = &self.inner.conn;
        match msg.kind() {
            MessageKind::Unregister => {
                let errcod = self.inner.unregister_errcod.get();
                let errmsg = if errcod == errcode::NONE { "" } else { "refused" };
                conn.reply(rset, msg, token, errcod, errmsg).expect("reply");
                if errcod == errcode::NONE {
                    conn.destroy_set(rset);
                }
            }
            MessageKind::Acquire => {
                conn.reply(rset, msg, token, errcode::NONE, "").expect("reply");
                let grant = Message::Grant(Notify {
                    id: rset.id(),
                    reqno: msg.reqno(),
                    resources: rset.flags().all,
                });
                conn.send(rset, grant, None).expect("grant send");
            }
            MessageKind::Release => {
                conn.reply(rset, msg, token, errcode::NONE, "").expect("reply");
                let grant = Message::Grant(Notify {
                    id: rset.id(),
                    reqno: msg.reqno(),
                    resources: ResourceFlags::empty(),
                });
                conn.send(rset, grant, None).expect("grant send");
            }
            _ => {
                conn.reply(rset, msg, token, errcode::NONE, "").expect("reply");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory bus
// ---------------------------------------------------------------------------

struct PendingCall {
    notify: ReplyNotify,
    timer: TimerHandle,
}

struct LinkInner {
    unique: String,
    fabric: Weak<FabricInner>,
    objects: RefCell<HashMap<String, MethodHandler>>,
    pending: RefCell<HashMap<u32, PendingCall>>,
}

struct FabricInner {
    scheduler: ManualScheduler,
    links: RefCell<HashMap<String, Rc<LinkInner>>>,
    /// well-known name -> unique name
    names: RefCell<HashMap<String, String>>,
    /// (watched name, notify)
    watches: RefCell<Vec<(String, OwnerNotify)>>,
    next_serial: Cell<u32>,
    next_unique: Cell<u32>,
}

/// The shared in-memory bus. Deliveries, replies and ownership broadcasts
/// all cross the fabric through its scheduler, never synchronously, matching
/// the `BusLink` contract.
#[derive(Clone)]
pub struct BusFabric {
    inner: Rc<FabricInner>,
}

/// One endpoint on the fabric, handed to the engine as `Rc<dyn BusLink>`.
pub struct TestBus {
    link: Rc<LinkInner>,
    fabric: Rc<FabricInner>,
}

impl BusFabric {
    pub fn new(scheduler: ManualScheduler) -> Self {
        init_logging();
        Self {
            inner: Rc::new(FabricInner {
                scheduler,
                links: RefCell::new(HashMap::new()),
                names: RefCell::new(HashMap::new()),
                watches: RefCell::new(Vec::new()),
                next_serial: Cell::new(1),
                next_unique: Cell::new(1),
            }),
        }
    }

    /// Attach a new endpoint with a fresh unique name.
    pub fn connect(&self) -> Rc<TestBus> {
        let n = self.inner.next_unique.get();
        self.inner.next_unique.set(n + 1);
        let unique = format!(":1.{n}");
        let link = Rc::new(LinkInner {
            unique: unique.clone(),
            fabric: Rc::downgrade(&self.inner),
            objects: RefCell::new(HashMap::new()),
            pending: RefCell::new(HashMap::new()),
        });
        self.inner.links.borrow_mut().insert(unique, link.clone());
        Rc::new(TestBus {
            link,
            fabric: self.inner.clone(),
        })
    }

    /// Owner of a well-known name, if any.
    pub fn owner_of(&self, name: &str) -> Option<String> {
        self.inner.names.borrow().get(name).cloned()
    }

    /// Tear an endpoint off the bus, broadcasting ownership losses for its
    /// unique name and every well-known name it owned.
    pub fn disconnect(&self, unique: &str) {
        let Some(_link) = self.inner.links.borrow_mut().remove(unique) else {
            return;
        };
        let owned: Vec<String> = {
            let mut names = self.inner.names.borrow_mut();
            let owned: Vec<String> = names
                .iter()
                .filter(|(_, owner)| owner.as_str() == unique)
                .map(|(name, _)| name.clone())
                .collect();
            for name in &owned {
                names.remove(name);
            }
            owned
        };

        self.broadcast_owner_change(unique, unique, "");
        for name in owned {
            self.broadcast_owner_change(&name, unique, "");
        }
    }

    fn broadcast_owner_change(&self, name: &str, old: &str, new: &str) {
        let watchers: Vec<OwnerNotify> = self
            .inner
            .watches
            .borrow()
            .iter()
            .filter(|(watched, _)| watched == name)
            .map(|(_, notify)| notify.clone())
            .collect();
        let name = name.to_string();
        let old = old.to_string();
        let new = new.to_string();
        for notify in watchers {
            let (name, old, new) = (name.clone(), old.clone(), new.clone());
            self.inner.scheduler.schedule(
                Duration::ZERO,
                Box::new(move || notify(&name, &old, &new)),
            );
        }
    }

    fn resolve(&self, destination: &str) -> Option<Rc<LinkInner>> {
        let unique = if destination.starts_with(':') {
            destination.to_string()
        } else {
            self.inner.names.borrow().get(destination)?.clone()
        };
        self.inner.links.borrow().get(&unique).cloned()
    }

    fn alloc_serial(&self) -> u32 {
        let serial = self.inner.next_serial.get();
        self.inner.next_serial.set(serial + 1);
        serial
    }

    fn deliver(&self, mut call: BusCall, serial: u32) -> bool {
        let Some(target) = self.resolve(&call.destination) else {
            return false;
        };
        call.serial = serial;
        let handler = target.objects.borrow().get(&call.path).cloned();
        let Some(handler) = handler else {
            return false;
        };
        self.inner
            .scheduler
            .schedule(Duration::ZERO, Box::new(move || handler(call)));
        true
    }
}

impl BusLink for TestBus {
    fn unique_name(&self) -> String {
        self.link.unique.clone()
    }

    fn request_name(&self, name: &str) -> bool {
        let fabric = BusFabric {
            inner: self.fabric.clone(),
        };
        {
            let mut names = self.fabric.names.borrow_mut();
            if let Some(owner) = names.get(name) {
                if owner != &self.link.unique {
                    return false;
                }
                return true;
            }
            names.insert(name.to_string(), self.link.unique.clone());
        }
        fabric.broadcast_owner_change(name, "", &self.link.unique);
        true
    }

    fn register_object(&self, path: &str, handler: MethodHandler) -> bool {
        self.link
            .objects
            .borrow_mut()
            .insert(path.to_string(), handler)
            .is_none()
    }

    fn unregister_object(&self, path: &str) {
        self.link.objects.borrow_mut().remove(path);
    }

    fn send(&self, call: BusCall) -> bool {
        let fabric = BusFabric {
            inner: self.fabric.clone(),
        };
        let serial = fabric.alloc_serial();
        fabric.deliver(call, serial)
    }

    fn call_with_reply(
        &self,
        call: BusCall,
        timeout: Duration,
        notify: ReplyNotify,
    ) -> Option<u32> {
        let fabric = BusFabric {
            inner: self.fabric.clone(),
        };
        let serial = fabric.alloc_serial();

        let weak = Rc::downgrade(&self.link);
        let timer = self.fabric.scheduler.schedule(
            timeout,
            Box::new(move || {
                let Some(link) = weak.upgrade() else {
                    return;
                };
                let pending = link.pending.borrow_mut().remove(&serial);
                if let Some(pending) = pending {
                    (pending.notify)(Err("org.freedesktop.DBus.Error.NoReply".to_string()));
                }
            }),
        );

        if !fabric.deliver(call, serial) {
            // Unknown destination: the bus answers with an error itself.
            self.fabric.scheduler.cancel(timer);
            let weak = Rc::downgrade(&self.link);
            self.fabric.scheduler.schedule(
                Duration::ZERO,
                Box::new(move || {
                    let Some(link) = weak.upgrade() else {
                        return;
                    };
                    let pending = link.pending.borrow_mut().remove(&serial);
                    if let Some(pending) = pending {
                        (pending.notify)(Err(
                            "org.freedesktop.DBus.Error.ServiceUnknown".to_string()
                        ));
                    }
                }),
            );
            self.link
                .pending
                .borrow_mut()
                .insert(serial, PendingCall { notify, timer });
            return Some(serial);
        }

        self.link
            .pending
            .borrow_mut()
            .insert(serial, PendingCall { notify, timer });
        Some(serial)
    }

    fn send_reply(&self, serial: u32, body: Vec<u8>) -> bool {
        // Find the caller holding this serial and complete it from the
        // scheduler, like a bus method-return. A return nobody correlates is
        // carried and dropped, exactly like a real bus.
        let links: Vec<Rc<LinkInner>> = self.fabric.links.borrow().values().cloned().collect();
        for link in links {
            let pending = link.pending.borrow_mut().remove(&serial);
            if let Some(pending) = pending {
                self.fabric.scheduler.cancel(pending.timer);
                let body = body.clone();
                self.fabric.scheduler.schedule(
                    Duration::ZERO,
                    Box::new(move || (pending.notify)(Ok(body))),
                );
                break;
            }
        }
        true
    }

    fn watch_owner(&self, name: &str, watch: bool, notify: Option<OwnerNotify>) -> bool {
        if watch {
            let Some(notify) = notify else {
                return false;
            };
            self.fabric
                .watches
                .borrow_mut()
                .push((name.to_string(), notify));
        } else {
            // Watches are per-name in this double; dropping all of them for
            // the name is enough for the adapter's usage.
            self.fabric
                .watches
                .borrow_mut()
                .retain(|(watched, _)| watched != name);
        }
        true
    }
}
