//! Client request sequencer.
//!
//! Applications do not drive the connection engine directly; they hold
//! [`ResourceSetHandle`]s obtained from a [`ResourceContext`]. The context
//! keeps a per-handle FIFO of pending operations and feeds the engine one at
//! a time: a request is marked busy when sent and only the arrival of its
//! Status lets the next one go out, so requests reach the manager in
//! application-issue order.
//!
//! The context also owns reconnection: when the manager reappears after
//! being down, every handle without a confirmed registration re-queues its
//! Register, its audio configuration and a pending Acquire.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use crate::connection::{Connection, StatusCallback};
use crate::error::ProtoError;
use crate::message::{
    AudioStream, Message, MessageKind, Possess, Record, Status, StreamProperty, VideoStream,
};
use crate::set::ResourceSet;
use crate::types::{errcode, res_str, ModeFlags, ResourceFlags, Role, RsetFlags};

/// Callback fired when the manager grants resources to the handle.
pub type GrantCallback = Rc<dyn Fn(ResourceFlags)>;

/// Callback fired when the manager advises about acquirable resources.
pub type AdviceCallback = Rc<dyn Fn(ResourceFlags)>;

/// Callback fired when a request completes with a non-zero error code.
pub type ErrorCallback = Rc<dyn Fn(i32, &str)>;

/// Property name attached to the audio stream pattern.
const AUDIO_STREAM_PROPERTY: &str = "media.name";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    /// Not registered with the manager (initial, after peer loss, or after
    /// a refused registration).
    Created,
    /// Register queued or in flight.
    Connecting,
    /// Registration confirmed.
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    None,
    /// This is the Register; drives the handle state.
    Connect,
    /// This is the destroy Unregister; success finalizes the handle.
    Disconnect,
}

struct QueuedRequest {
    kind: MessageKind,
    reqno: u32,
    busy: bool,
    completion: Completion,
}

#[derive(Default, Clone, PartialEq, Eq)]
struct AudioConfig {
    group: String,
    pid: u32,
    stream: String,
}

struct ClientSet {
    id: u32,
    class: String,
    mode: ModeFlags,
    all: Cell<ResourceFlags>,
    opt: Cell<ResourceFlags>,
    state: Cell<ClientState>,
    /// Whether the application currently wants the resources.
    wants: Cell<bool>,
    grant_cb: GrantCallback,
    advice_cb: RefCell<Option<AdviceCallback>>,
    error_cb: RefCell<Option<ErrorCallback>>,
    audio: RefCell<Option<AudioConfig>>,
    /// Pid of the video renderer, when configured.
    video: RefCell<Option<u32>>,
    queue: RefCell<VecDeque<QueuedRequest>>,
    rset: RefCell<Option<ResourceSet>>,
}

struct CtxInner {
    conn: Connection,
    sets: RefCell<HashMap<u32, Rc<ClientSet>>>,
    next_id: Cell<u32>,
    next_reqno: Cell<u32>,
}

/// Owner of the client-side connection and every live resource set handle.
#[derive(Clone)]
pub struct ResourceContext {
    inner: Rc<CtxInner>,
}

/// Application handle to one resource set.
#[derive(Clone)]
pub struct ResourceSetHandle {
    ctx: Weak<CtxInner>,
    set: Rc<ClientSet>,
}

impl ResourceContext {
    /// Wrap a client-role connection. Installs the context's Unregister,
    /// Grant and Advice handlers and the manager-up callback.
    pub fn new(conn: Connection) -> Result<Self, ProtoError> {
        if conn.role() != Role::Client {
            return Err(ProtoError::SetupFailed {
                message: "resource context needs a client connection".to_string(),
            });
        }

        let ctx = Self {
            inner: Rc::new(CtxInner {
                conn,
                sets: RefCell::new(HashMap::new()),
                next_id: Cell::new(1),
                next_reqno: Cell::new(1),
            }),
        };

        let weak = Rc::downgrade(&ctx.inner);
        ctx.inner.conn.set_handler(
            MessageKind::Unregister,
            move |msg: &Message, rset: &ResourceSet, _token| {
                if let Some(ctx) = upgrade(&weak) {
                    ctx.on_peer_unregister(msg.id(), rset);
                }
            },
        )?;

        let weak = Rc::downgrade(&ctx.inner);
        ctx.inner.conn.set_handler(
            MessageKind::Grant,
            move |msg: &Message, rset: &ResourceSet, _token| {
                if let (Some(ctx), Message::Grant(notify)) = (upgrade(&weak), msg) {
                    ctx.on_grant(notify.id, rset, notify.resources);
                }
            },
        )?;

        let weak = Rc::downgrade(&ctx.inner);
        ctx.inner.conn.set_handler(
            MessageKind::Advice,
            move |msg: &Message, rset: &ResourceSet, _token| {
                if let (Some(ctx), Message::Advice(notify)) = (upgrade(&weak), msg) {
                    ctx.on_advice(notify.id, rset, notify.resources);
                }
            },
        )?;

        let weak = Rc::downgrade(&ctx.inner);
        ctx.inner.conn.set_manager_up(move |_conn| {
            if let Some(ctx) = upgrade(&weak) {
                ctx.on_manager_up();
            }
        });

        Ok(ctx)
    }

    /// The underlying connection.
    pub fn connection(&self) -> Connection {
        self.inner.conn.clone()
    }

    /// Create a resource set handle and queue its registration.
    ///
    /// `optional` is masked to exclude bits already in `mandatory`. Returns
    /// `None` when the class is empty or no resource bit is requested.
    pub fn create_set(
        &self,
        class: &str,
        mandatory: ResourceFlags,
        optional: ResourceFlags,
        mode: ModeFlags,
        grant: impl Fn(ResourceFlags) + 'static,
    ) -> Option<ResourceSetHandle> {
        if class.is_empty() || (mandatory | optional).is_empty() {
            return None;
        }

        let optional = optional & !mandatory;
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);

        let set = Rc::new(ClientSet {
            id,
            class: class.to_string(),
            mode,
            all: Cell::new(mandatory | optional),
            opt: Cell::new(optional),
            state: Cell::new(ClientState::Created),
            wants: Cell::new(false),
            grant_cb: Rc::new(grant),
            advice_cb: RefCell::new(None),
            error_cb: RefCell::new(None),
            audio: RefCell::new(None),
            video: RefCell::new(None),
            queue: RefCell::new(VecDeque::new()),
            rset: RefCell::new(None),
        });
        self.inner.sets.borrow_mut().insert(id, set.clone());

        tracing::debug!(
            id,
            class,
            mandatory = %res_str(mandatory),
            optional = %res_str(optional),
            "created resource set handle"
        );

        self.connect_set(&set);

        Some(ResourceSetHandle {
            ctx: Rc::downgrade(&self.inner),
            set,
        })
    }

    fn alloc_reqno(&self) -> u32 {
        let reqno = self.inner.next_reqno.get();
        self.inner.next_reqno.set(reqno + 1);
        reqno
    }

    /// Queue the registration chain: Register, then the audio configuration
    /// and a pending Acquire if the application asked for them earlier.
    fn connect_set(&self, set: &Rc<ClientSet>) {
        set.state.set(ClientState::Connecting);
        self.push(set, MessageKind::Register, Completion::Connect);
        if set.audio.borrow().is_some() {
            self.push(set, MessageKind::Audio, Completion::None);
        }
        if set.video.borrow().is_some() {
            self.push(set, MessageKind::Video, Completion::None);
        }
        if set.wants.get() {
            self.push(set, MessageKind::Acquire, Completion::None);
        }
    }

    /// Append an operation to the handle's FIFO and try to pump.
    ///
    /// While the handle is disconnected nothing is queued; the local desired
    /// state is replayed wholesale when the link comes back.
    fn push(&self, set: &Rc<ClientSet>, kind: MessageKind, completion: Completion) -> Option<u32> {
        if set.state.get() == ClientState::Created {
            tracing::debug!(id = set.id, kind = %kind, "not connected, request not queued");
            return None;
        }

        let reqno = self.alloc_reqno();
        set.queue.borrow_mut().push_back(QueuedRequest {
            kind,
            reqno,
            busy: false,
            completion,
        });
        tracing::debug!(id = set.id, reqno, kind = %kind, "pushed request");

        self.pump(set);
        Some(reqno)
    }

    /// Dequeue loop: send the head while it is not busy, honoring the
    /// single-in-flight rule. A send failure pops and fails the request and
    /// moves on; a Register failure additionally drops the handle back to
    /// not-connected.
    fn pump(&self, set: &Rc<ClientSet>) {
        loop {
            let head = set
                .queue
                .borrow()
                .front()
                .map(|request| (request.kind, request.reqno, request.busy));
            let Some((kind, reqno, busy)) = head else {
                break;
            };
            if busy {
                break;
            }
            if set.state.get() == ClientState::Created {
                // wait for link-up
                break;
            }

            let sent = match kind {
                MessageKind::Register => self.send_register(set, reqno),
                MessageKind::Unregister => self.send_unregister(set, reqno),
                MessageKind::Update => self.send_update(set, reqno),
                MessageKind::Audio => self.send_audio(set, reqno),
                MessageKind::Video => self.send_video(set, reqno),
                MessageKind::Acquire | MessageKind::Release => {
                    self.send_possess(set, kind, reqno)
                }
                _ => false,
            };

            if sent {
                if let Some(request) = set.queue.borrow_mut().front_mut() {
                    request.busy = true;
                }
                break;
            }

            if kind == MessageKind::Register {
                set.state.set(ClientState::Created);
            }
            tracing::debug!(id = set.id, reqno, kind = %kind, "failed to send request");

            let request = set.queue.borrow_mut().pop_front();
            if let Some(request) = request {
                self.complete_request(set, request, errcode::SEND_FAILED, "send failed");
            }
        }
    }

    fn status_callback(&self, set_id: u32) -> StatusCallback {
        let weak = Rc::downgrade(&self.inner);
        Box::new(move |_rset: &ResourceSet, status: &Status| {
            if let Some(ctx) = upgrade(&weak) {
                ctx.on_status(set_id, status);
            }
        })
    }

    fn send_register(&self, set: &Rc<ClientSet>, reqno: u32) -> bool {
        tracing::debug!(id = set.id, "sending register message");
        let msg = Message::Register(Record {
            id: set.id,
            reqno,
            rset: RsetFlags::new(
                set.all.get(),
                set.opt.get(),
                ResourceFlags::empty(),
                ResourceFlags::empty(),
            ),
            class: set.class.clone(),
            app_id: String::new(),
            mode: set.mode,
        });
        match self.inner.conn.connect(msg, self.status_callback(set.id)) {
            Some(rset) => {
                *set.rset.borrow_mut() = Some(rset);
                true
            }
            None => false,
        }
    }

    fn send_unregister(&self, set: &Rc<ClientSet>, reqno: u32) -> bool {
        let Some(rset) = set.rset.borrow().clone() else {
            return false;
        };
        tracing::debug!(id = set.id, "sending unregister message");
        let msg = Message::Unregister(Possess { id: set.id, reqno });
        self.inner
            .conn
            .disconnect(&rset, msg, self.status_callback(set.id))
            .is_ok()
    }

    fn send_update(&self, set: &Rc<ClientSet>, reqno: u32) -> bool {
        let Some(rset) = set.rset.borrow().clone() else {
            return false;
        };
        tracing::debug!(id = set.id, "sending update message");
        let msg = Message::Update(Record {
            id: set.id,
            reqno,
            rset: RsetFlags::new(
                set.all.get(),
                set.opt.get(),
                ResourceFlags::empty(),
                ResourceFlags::empty(),
            ),
            class: set.class.clone(),
            app_id: String::new(),
            mode: set.mode,
        });
        self.inner
            .conn
            .send(&rset, msg, Some(self.status_callback(set.id)))
            .is_ok()
    }

    fn send_audio(&self, set: &Rc<ClientSet>, reqno: u32) -> bool {
        let Some(rset) = set.rset.borrow().clone() else {
            return false;
        };
        let Some(audio) = set.audio.borrow().clone() else {
            return false;
        };
        tracing::debug!(id = set.id, "sending audio message");
        let msg = Message::Audio(AudioStream {
            id: set.id,
            reqno,
            group: audio.group.clone(),
            pid: audio.pid,
            app_id: String::new(),
            property: StreamProperty {
                name: AUDIO_STREAM_PROPERTY.to_string(),
                method: Default::default(),
                pattern: audio.stream.clone(),
            },
        });
        self.inner
            .conn
            .send(&rset, msg, Some(self.status_callback(set.id)))
            .is_ok()
    }

    fn send_video(&self, set: &Rc<ClientSet>, reqno: u32) -> bool {
        let Some(rset) = set.rset.borrow().clone() else {
            return false;
        };
        let Some(pid) = *set.video.borrow() else {
            return false;
        };
        tracing::debug!(id = set.id, "sending video message");
        let msg = Message::Video(VideoStream {
            id: set.id,
            reqno,
            pid,
        });
        self.inner
            .conn
            .send(&rset, msg, Some(self.status_callback(set.id)))
            .is_ok()
    }

    fn send_possess(&self, set: &Rc<ClientSet>, kind: MessageKind, reqno: u32) -> bool {
        let Some(rset) = set.rset.borrow().clone() else {
            return false;
        };
        tracing::debug!(id = set.id, kind = %kind, "sending possess message");
        let possess = Possess { id: set.id, reqno };
        let msg = match kind {
            MessageKind::Acquire => Message::Acquire(possess),
            _ => Message::Release(possess),
        };
        self.inner
            .conn
            .send(&rset, msg, Some(self.status_callback(set.id)))
            .is_ok()
    }

    /// A request's Status arrived: pop it, run its completion, keep pumping.
    fn on_status(&self, set_id: u32, status: &Status) {
        let set = self.inner.sets.borrow().get(&set_id).cloned();
        let Some(set) = set else {
            tracing::debug!(set_id, "status for unknown handle ignored");
            return;
        };

        tracing::debug!(
            id = set_id,
            reqno = status.reqno,
            errcod = status.errcod,
            errmsg = %status.errmsg,
            "request completed"
        );

        let request = {
            let mut queue = set.queue.borrow_mut();
            queue
                .iter()
                .position(|request| request.reqno == status.reqno)
                .and_then(|index| queue.remove(index))
        };
        let Some(request) = request else {
            tracing::debug!(id = set_id, reqno = status.reqno, "status without request");
            return;
        };

        let kind = request.kind;
        self.complete_request(&set, request, status.errcod, &status.errmsg);

        if kind != MessageKind::Unregister {
            self.pump(&set);
        }
    }

    fn complete_request(
        &self,
        set: &Rc<ClientSet>,
        request: QueuedRequest,
        errcod: i32,
        errmsg: &str,
    ) {
        match request.completion {
            Completion::Connect => {
                if errcod == errcode::NONE {
                    tracing::debug!(id = set.id, "resource set is ready");
                    set.state.set(ClientState::Ready);
                } else {
                    tracing::debug!(id = set.id, errcod, errmsg, "registration failed");
                    set.state.set(ClientState::Created);
                }
            }
            Completion::Disconnect => {
                if errcod == errcode::NONE {
                    self.finalize_destroy(set);
                }
                // A refused Unregister leaves the handle alive; the engine
                // already rolled the set back to CONNECTED.
            }
            Completion::None => {}
        }

        if errcod != errcode::NONE {
            let error_cb = set.error_cb.borrow().clone();
            if let Some(error_cb) = error_cb {
                error_cb(errcod, errmsg);
            }
        }
    }

    fn finalize_destroy(&self, set: &Rc<ClientSet>) {
        tracing::debug!(id = set.id, "resource set handle destroyed");
        self.inner.sets.borrow_mut().remove(&set.id);
        set.queue.borrow_mut().clear();
        set.audio.borrow_mut().take();
        set.rset.borrow_mut().take();
    }

    // ---- connection-level events ----------------------------------------

    /// Synthetic or real Unregister from the manager: the registration is
    /// gone, fall back to not-connected and wait for link-up.
    fn on_peer_unregister(&self, set_id: u32, rset: &ResourceSet) {
        let set = self.inner.sets.borrow().get(&set_id).cloned();
        let Some(set) = set else {
            return;
        };
        if !same_rset(&set, rset) {
            return;
        }
        tracing::debug!(id = set_id, "manager dropped the registration");
        set.state.set(ClientState::Created);
        set.rset.borrow_mut().take();
    }

    fn on_grant(&self, set_id: u32, rset: &ResourceSet, resources: ResourceFlags) {
        let set = self.inner.sets.borrow().get(&set_id).cloned();
        let Some(set) = set else {
            return;
        };
        if !same_rset(&set, rset) {
            return;
        }
        tracing::debug!(id = set_id, resources = %res_str(resources), "received grant");
        (set.grant_cb)(resources);
    }

    fn on_advice(&self, set_id: u32, rset: &ResourceSet, resources: ResourceFlags) {
        let set = self.inner.sets.borrow().get(&set_id).cloned();
        let Some(set) = set else {
            return;
        };
        if !same_rset(&set, rset) {
            return;
        }
        let advice_cb = set.advice_cb.borrow().clone();
        if let Some(advice_cb) = advice_cb {
            advice_cb(resources);
        }
    }

    /// Manager is (back) up: replay every handle that has no confirmed
    /// registration.
    fn on_manager_up(&self) {
        let sets: Vec<Rc<ClientSet>> = self.inner.sets.borrow().values().cloned().collect();
        for set in sets {
            if set.state.get() == ClientState::Created {
                self.connect_set(&set);
            }
        }
    }

}

fn upgrade(weak: &Weak<CtxInner>) -> Option<ResourceContext> {
    weak.upgrade().map(|inner| ResourceContext { inner })
}

fn same_rset(set: &ClientSet, rset: &ResourceSet) -> bool {
    set.rset
        .borrow()
        .as_ref()
        .is_some_and(|own| own.same_set(rset))
}

impl ResourceSetHandle {
    /// Process-unique id of the underlying resource set.
    pub fn id(&self) -> u32 {
        self.set.id
    }

    /// Queue the destroy Unregister behind any pending work. The handle's
    /// final cleanup runs from the Unregister's completion, never here; a
    /// handle that never reached the manager is dropped synchronously.
    pub fn destroy(self) {
        let Some(ctx) = upgrade(&self.ctx) else {
            return;
        };
        if self.set.state.get() == ClientState::Created {
            ctx.finalize_destroy(&self.set);
            return;
        }
        ctx.push(&self.set, MessageKind::Unregister, Completion::Disconnect);
    }

    /// Install the advice callback.
    pub fn configure_advice_callback(&self, advice: impl Fn(ResourceFlags) + 'static) {
        *self.set.advice_cb.borrow_mut() = Some(Rc::new(advice));
    }

    /// Install the error callback, fired whenever a request completes with a
    /// non-zero error code.
    pub fn configure_error_callback(&self, error: impl Fn(i32, &str) + 'static) {
        *self.set.error_cb.borrow_mut() = Some(Rc::new(error));
    }

    /// Change the requested resource masks. Queues an Update only when the
    /// resulting masks differ from the current ones; returns whether an
    /// Update was queued.
    pub fn configure_resources(
        &self,
        mandatory: ResourceFlags,
        optional: ResourceFlags,
    ) -> bool {
        let Some(ctx) = upgrade(&self.ctx) else {
            return false;
        };

        let optional = optional & !mandatory;
        let all = mandatory | optional;

        tracing::debug!(
            id = self.set.id,
            mandatory = %res_str(mandatory),
            optional = %res_str(optional),
            "updating resource set handle"
        );

        if self.set.all.get() == all && self.set.opt.get() == optional {
            return false;
        }
        self.set.all.set(all);
        self.set.opt.set(optional);

        ctx.push(&self.set, MessageKind::Update, Completion::None)
            .is_some()
    }

    /// Attach or change the audio stream configuration.
    ///
    /// Requires the audio-playback bit in the requested resources. Empty
    /// `group`/`stream` and a zero `pid` leave the respective field
    /// unchanged; an Audio request is queued only when something actually
    /// changed.
    pub fn configure_audio(&self, group: &str, pid: u32, stream: &str) -> bool {
        if !self.set.all.get().contains(ResourceFlags::AUDIO_PLAYBACK) {
            return false;
        }
        let Some(ctx) = upgrade(&self.ctx) else {
            return false;
        };

        let mut config = self.set.audio.borrow_mut();
        let changed = match config.as_mut() {
            Some(config) => {
                let mut changed = false;
                if !group.is_empty() && config.group != group {
                    config.group = group.to_string();
                    changed = true;
                }
                if pid != 0 && config.pid != pid {
                    config.pid = pid;
                    changed = true;
                }
                if !stream.is_empty() && config.stream != stream {
                    config.stream = stream.to_string();
                    changed = true;
                }
                changed
            }
            None => {
                if group.is_empty() && pid == 0 && stream.is_empty() {
                    false
                } else {
                    *config = Some(AudioConfig {
                        group: group.to_string(),
                        pid,
                        stream: stream.to_string(),
                    });
                    true
                }
            }
        };
        drop(config);

        if changed {
            ctx.push(&self.set, MessageKind::Audio, Completion::None);
        }
        true
    }

    /// Attach or change the video renderer pid.
    ///
    /// Requires a video bit in the requested resources. A Video request is
    /// queued only when the pid actually changed.
    pub fn configure_video(&self, pid: u32) -> bool {
        let video_bits = ResourceFlags::VIDEO_PLAYBACK | ResourceFlags::VIDEO_RECORDING;
        if !self.set.all.get().intersects(video_bits) || pid == 0 {
            return false;
        }
        let Some(ctx) = upgrade(&self.ctx) else {
            return false;
        };

        let changed = {
            let mut video = self.set.video.borrow_mut();
            if *video == Some(pid) {
                false
            } else {
                *video = Some(pid);
                true
            }
        };
        if changed {
            ctx.push(&self.set, MessageKind::Video, Completion::None);
        }
        true
    }

    /// Ask for the resources. Idempotent: only the 0→1 edge of the internal
    /// wants-flag queues an Acquire.
    pub fn acquire(&self) -> bool {
        let Some(ctx) = upgrade(&self.ctx) else {
            return false;
        };
        if !self.set.wants.get() {
            self.set.wants.set(true);
            ctx.push(&self.set, MessageKind::Acquire, Completion::None);
        }
        true
    }

    /// Give the resources back. Idempotent: only the 1→0 edge queues a
    /// Release.
    pub fn release(&self) -> bool {
        let Some(ctx) = upgrade(&self.ctx) else {
            return false;
        };
        if self.set.wants.get() {
            self.set.wants.set(false);
            ctx.push(&self.set, MessageKind::Release, Completion::None);
        }
        true
    }
}

impl std::fmt::Debug for ResourceSetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSetHandle")
            .field("id", &self.set.id)
            .field("class", &self.set.class)
            .field("state", &self.set.state.get())
            .finish()
    }
}
