//! Session state machine shared by the client and server roles.
//!
//! ```text
//!   Ready <------> Disconnected
//!     \               /
//!      +--> Destroyed <+
//! ```
//!
//! Every transition goes through the per-session lock. A request to move to
//! the current state is a no-op, so racing disconnect triggers produce a
//! single transition. `Destroyed` is terminal.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use ibtrs_types::Address;
use parking_lot::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    Ready = 0,
    Disconnected = 1,
    Destroyed = 2,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Ready,
            1 => SessionState::Disconnected,
            _ => SessionState::Destroyed,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SessionState::Ready => "ready",
            SessionState::Disconnected => "disconnected",
            SessionState::Destroyed => "destroyed",
        }
    }

    fn can_move_to(self, to: SessionState) -> bool {
        matches!(
            (self, to),
            (SessionState::Ready, SessionState::Disconnected)
                | (SessionState::Disconnected, SessionState::Ready)
                | (SessionState::Ready, SessionState::Destroyed)
                | (SessionState::Disconnected, SessionState::Destroyed)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

struct Inner {
    state: SessionState,
    users: Vec<String>,
}

/// Identity, state and reference count of one session.
pub struct SessionCore {
    uuid: Uuid,
    addr: Address,
    inner: Mutex<Inner>,
    state: AtomicU8,
    refs: AtomicUsize,
}

impl SessionCore {
    pub fn new(uuid: Uuid, addr: Address, initial: SessionState) -> Self {
        Self {
            uuid,
            addr,
            inner: Mutex::new(Inner {
                state: initial,
                users: Vec::new(),
            }),
            state: AtomicU8::new(initial as u8),
            refs: AtomicUsize::new(0),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn addr(&self) -> Address {
        self.addr
    }

    /// Lock-free snapshot; may be stale by the time it is read.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `to`. Returns the previous state if a transition happened,
    /// `None` if already there or the move is not allowed.
    pub fn transition(&self, to: SessionState) -> Option<SessionState> {
        let from = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            if !from.can_move_to(to) {
                None
            } else {
                inner.state = to;
                self.state.store(to as u8, Ordering::Release);
                Some(from)
            }
        };
        match from {
            Some(from) => {
                tracing::info!(session = %self.uuid, peer = %self.addr, %from, %to, "session state changed")
            }
            None => {
                tracing::debug!(session = %self.uuid, peer = %self.addr, %to, "session state unchanged")
            }
        }
        from
    }

    pub fn get(&self) -> usize {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop a reference; returns how many remain. Dropping one that was
    /// never taken is a bug.
    pub fn put(&self) -> usize {
        match self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(prev) => prev - 1,
            Err(_) => panic!("session {} reference count underflow", self.uuid),
        }
    }

    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn add_user(&self, name: impl Into<String>) {
        self.inner.lock().users.push(name.into());
    }

    pub fn remove_user(&self, name: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.users.iter().position(|u| u == name) {
            Some(idx) => {
                inner.users.swap_remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn users(&self) -> Vec<String> {
        self.inner.lock().users.clone()
    }

    /// Copies the user list under the lock and logs it after releasing it.
    pub fn log_users(&self) {
        let users = self.users();
        if users.is_empty() {
            tracing::info!(session = %self.uuid, peer = %self.addr, "session has no users");
            return;
        }
        for user in &users {
            tracing::info!(session = %self.uuid, peer = %self.addr, user = %user, "session user");
        }
    }
}
