//! Consumer callback tables and their registration.
//!
//! Each role accepts exactly one consumer. Callbacks run on the completion
//! context that produced the event and must return quickly.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arc_swap::ArcSwapOption;
use ibtrs_types::{OpCookie, Status};
use parking_lot::Mutex;

use crate::client::ClientSession;
use crate::error::TransportError;
use crate::server::{ServerOp, ServerSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Reconnected,
    /// Server side, before the session is torn down.
    Disconnecting,
    Disconnected,
    MaxReconnectExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRdmaEvent {
    /// A write issued with `rdma_write` was acknowledged.
    RdmaWriteComplete,
    /// The server answered a `request_rdma_write`; the result is passed in.
    RdmaRequestWriteComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRdmaEvent {
    /// The client wrote data into a receive buffer.
    Recv,
    /// The client asks for data to be written back.
    WriteRequest,
}

pub trait ClientOps: Send + Sync {
    /// Completion of a tag's operation. `data` holds the result of a
    /// request write and is empty otherwise.
    fn rdma_ev(&self, cookie: OpCookie, ev: ClientRdmaEvent, status: Status, data: &[u8]);

    fn sess_ev(&self, sess: &Arc<ClientSession>, ev: SessionEvent);

    fn recv(&self, sess: &Arc<ClientSession>, msg: &[u8]);
}

pub trait ServerOps: Send + Sync {
    /// The op must be answered with [`ServerOp::respond`]; dropping it
    /// answers with EIO.
    fn rdma_ev(&self, sess: &Arc<ServerSession>, ev: ServerRdmaEvent, op: ServerOp);

    fn sess_ev(&self, sess: &Arc<ServerSession>, ev: SessionEvent);

    fn recv(&self, sess: &Arc<ServerSession>, msg: &[u8]);
}

struct Registered<T: ?Sized>(Arc<T>);

/// Single-consumer registration with an open-session count.
pub struct OpsRegistry<T: ?Sized> {
    lock: Mutex<()>,
    ops: ArcSwapOption<Registered<T>>,
    open_sessions: AtomicUsize,
}

impl<T: ?Sized + Send + Sync> OpsRegistry<T> {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            ops: ArcSwapOption::empty(),
            open_sessions: AtomicUsize::new(0),
        }
    }

    pub fn register(&self, ops: Arc<T>) -> Result<(), TransportError> {
        let _guard = self.lock.lock();
        if self.ops.load().is_some() {
            return Err(TransportError::AlreadyRegistered);
        }
        self.ops.store(Some(Arc::new(Registered(ops))));
        Ok(())
    }

    pub fn unregister(&self) -> Result<(), TransportError> {
        let _guard = self.lock.lock();
        if self.ops.load().is_none() {
            return Err(TransportError::NotRegistered);
        }
        let open = self.open_sessions.load(Ordering::Acquire);
        if open > 0 {
            return Err(TransportError::SessionsOpen(open));
        }
        self.ops.store(None);
        Ok(())
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.ops.load().as_ref().map(|r| Arc::clone(&r.0))
    }

    pub fn is_registered(&self) -> bool {
        self.ops.load().is_some()
    }

    /// Count a new session against the current consumer.
    pub fn acquire_for_session(&self) -> Result<Arc<T>, TransportError> {
        let _guard = self.lock.lock();
        let ops = self.get().ok_or(TransportError::NotRegistered)?;
        self.open_sessions.fetch_add(1, Ordering::AcqRel);
        Ok(ops)
    }

    pub fn session_closed(&self) {
        let _guard = self.lock.lock();
        let prev = self.open_sessions.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "session closed with no open sessions");
    }

    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::Acquire)
    }
}

impl<T: ?Sized + Send + Sync> Default for OpsRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Named: Send + Sync {
        fn name(&self) -> &'static str;
    }

    struct A;
    impl Named for A {
        fn name(&self) -> &'static str {
            "a"
        }
    }

    struct B;
    impl Named for B {
        fn name(&self) -> &'static str {
            "b"
        }
    }

    #[test]
    fn test_single_registration() {
        let reg = OpsRegistry::<dyn Named>::new();
        assert!(!reg.is_registered());
        reg.register(Arc::new(A)).unwrap();
        assert!(matches!(
            reg.register(Arc::new(B)),
            Err(TransportError::AlreadyRegistered)
        ));
        assert_eq!(reg.get().unwrap().name(), "a");
    }

    #[test]
    fn test_unregister_refused_while_sessions_open() {
        let reg = OpsRegistry::<dyn Named>::new();
        assert!(matches!(reg.unregister(), Err(TransportError::NotRegistered)));
        assert!(matches!(
            reg.acquire_for_session(),
            Err(TransportError::NotRegistered)
        ));

        reg.register(Arc::new(A)).unwrap();
        let ops = reg.acquire_for_session().unwrap();
        assert_eq!(ops.name(), "a");
        assert!(matches!(reg.unregister(), Err(TransportError::SessionsOpen(1))));

        reg.session_closed();
        reg.unregister().unwrap();
        assert!(reg.get().is_none());
        reg.register(Arc::new(B)).unwrap();
        assert_eq!(reg.get().unwrap().name(), "b");
    }
}
