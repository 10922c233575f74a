//! Resource set lifecycle.
//!
//! A resource set is the unit of arbitration: one application's registered
//! interest in a bundle of resources. Its identity is the pair
//! (peer name, numeric id), unique within one connection.
//!
//! Sets are reference counted through `Rc`. The owning connection's set list
//! holds one clone; every outstanding pending reply holds another. The
//! transition into [`SetState::Killed`] removes the list clone, so the
//! backing store drops exactly once, only after the set is killed and the
//! last reply has resolved.

use std::cell::RefCell;
use std::rc::Rc;

use crate::types::{ModeFlags, RsetFlags};

/// Lifecycle state of a resource set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetState {
    /// Register sent (client) but not yet acknowledged.
    Created,
    /// Registration acknowledged; the set can carry traffic.
    Connected,
    /// Torn down. A set only leaves this state through the unregister
    /// rollback (an Unregister reply carrying an error).
    Killed,
}

pub(crate) struct SetInner {
    pub peer: String,
    pub id: u32,
    pub state: SetState,
    pub class: String,
    pub mode: ModeFlags,
    pub flags: RsetFlags,
}

/// Shared handle to a resource set.
#[derive(Clone)]
pub struct ResourceSet {
    inner: Rc<RefCell<SetInner>>,
}

impl ResourceSet {
    pub(crate) fn new(
        peer: &str,
        id: u32,
        state: SetState,
        class: &str,
        mode: ModeFlags,
        flags: RsetFlags,
    ) -> Self {
        tracing::debug!(peer, id, ?state, class, "creating resource set");
        Self {
            inner: Rc::new(RefCell::new(SetInner {
                peer: peer.to_string(),
                id,
                state,
                class: class.to_string(),
                mode,
                flags,
            })),
        }
    }

    /// Numeric id of the set.
    pub fn id(&self) -> u32 {
        self.inner.borrow().id
    }

    /// Peer name the set is bound to.
    pub fn peer(&self) -> String {
        self.inner.borrow().peer.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SetState {
        self.inner.borrow().state
    }

    /// Application class given at registration.
    pub fn class(&self) -> String {
        self.inner.borrow().class.clone()
    }

    /// Mode bits given at registration.
    pub fn mode(&self) -> ModeFlags {
        self.inner.borrow().mode
    }

    /// Current resource bitmask quadruple.
    pub fn flags(&self) -> RsetFlags {
        self.inner.borrow().flags
    }

    /// Number of live references, the list clone included.
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    /// Whether two handles refer to the same set.
    pub fn same_set(&self, other: &ResourceSet) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether this set is identified by (peer, id).
    pub(crate) fn matches(&self, peer: &str, id: u32) -> bool {
        let inner = self.inner.borrow();
        inner.peer == peer && inner.id == id
    }

    pub(crate) fn set_state(&self, state: SetState) {
        let mut inner = self.inner.borrow_mut();
        if inner.state != state {
            tracing::debug!(
                peer = %inner.peer,
                id = inner.id,
                from = ?inner.state,
                to = ?state,
                "resource set state change"
            );
            inner.state = state;
        }
    }

    pub(crate) fn update_flags(&self, flags: RsetFlags) {
        self.inner.borrow_mut().flags = flags;
    }
}

impl std::fmt::Debug for ResourceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ResourceSet")
            .field("peer", &inner.peer)
            .field("id", &inner.id)
            .field("state", &inner.state)
            .field("class", &inner.class)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ResourceFlags, RsetFlags};

    fn sample() -> ResourceSet {
        ResourceSet::new(
            "org.example.peer",
            7,
            SetState::Created,
            "player",
            ModeFlags::empty(),
            RsetFlags::new(
                ResourceFlags::AUDIO_PLAYBACK,
                ResourceFlags::empty(),
                ResourceFlags::empty(),
                ResourceFlags::empty(),
            ),
        )
    }

    #[test]
    fn identity_matches_peer_and_id() {
        let set = sample();
        assert!(set.matches("org.example.peer", 7));
        assert!(!set.matches("org.example.peer", 8));
        assert!(!set.matches("org.example.other", 7));
    }

    #[test]
    fn clones_share_state() {
        let set = sample();
        let other = set.clone();
        assert!(set.same_set(&other));
        assert_eq!(set.ref_count(), 2);

        other.set_state(SetState::Connected);
        assert_eq!(set.state(), SetState::Connected);

        drop(other);
        assert_eq!(set.ref_count(), 1);
    }

    #[test]
    fn state_transitions_recorded() {
        let set = sample();
        assert_eq!(set.state(), SetState::Created);
        set.set_state(SetState::Connected);
        set.set_state(SetState::Killed);
        assert_eq!(set.state(), SetState::Killed);

        // unregister rollback
        set.set_state(SetState::Connected);
        assert_eq!(set.state(), SetState::Connected);
    }
}
