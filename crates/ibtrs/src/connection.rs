//! One RDMA path of a session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use ibtrs_types::ConId;
use parking_lot::RwLock;

use crate::error::RdmaError;
use crate::rdma::{RdmaPath, WorkRequest};

/// State of one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting = 0,
    /// Ready for data transfer.
    Ready = 1,
    /// Lost; posted work is flushed with errors.
    Error = 2,
    /// Closed by the owner.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Ready,
            2 => ConnectionState::Error,
            _ => ConnectionState::Closed,
        }
    }
}

/// Kind of work a completion id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WrKind {
    /// Write carrying a tag's request.
    Tag = 1,
    /// Send from the message pool.
    Msg = 2,
    /// Server response write.
    Resp = 3,
}

pub fn encode_wr_id(kind: WrKind, idx: u32) -> u64 {
    ((kind as u64) << 32) | idx as u64
}

pub fn decode_wr_id(wr_id: u64) -> Option<(WrKind, u32)> {
    let idx = wr_id as u32;
    let kind = match (wr_id >> 32) as u8 {
        1 => WrKind::Tag,
        2 => WrKind::Msg,
        3 => WrKind::Resp,
        _ => return None,
    };
    Some((kind, idx))
}

pub struct Connection {
    con_id: ConId,
    state: AtomicU8,
    path: RwLock<Option<Arc<dyn RdmaPath>>>,
    generation: AtomicU64,
    reconnecting: AtomicBool,
}

impl Connection {
    pub fn new(con_id: ConId) -> Self {
        Self {
            con_id,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            path: RwLock::new(None),
            generation: AtomicU64::new(0),
            reconnecting: AtomicBool::new(false),
        }
    }

    pub fn con_id(&self) -> ConId {
        self.con_id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Start a new incarnation. Completions tagged with an older generation
    /// belong to a path that is gone.
    pub fn next_generation(&self) -> u64 {
        self.state
            .store(ConnectionState::Connecting as u8, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    /// Install the path established for `generation`. Refused if a newer
    /// incarnation has started in the meantime.
    pub fn attach(&self, path: Arc<dyn RdmaPath>, generation: u64) -> bool {
        let mut slot = self.path.write();
        if !self.is_current(generation) {
            return false;
        }
        *slot = Some(path);
        self.state
            .store(ConnectionState::Ready as u8, Ordering::Release);
        true
    }

    /// Take the path out if it belongs to `generation`. The caller closes it.
    pub fn detach(&self, generation: u64) -> Option<Arc<dyn RdmaPath>> {
        let mut slot = self.path.write();
        if !self.is_current(generation) {
            return None;
        }
        self.state
            .store(ConnectionState::Error as u8, Ordering::Release);
        slot.take()
    }

    /// Detach whatever is installed and mark the path closed.
    pub fn shutdown(&self) -> Option<Arc<dyn RdmaPath>> {
        let mut slot = self.path.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        slot.take()
    }

    pub fn path(&self) -> Option<Arc<dyn RdmaPath>> {
        self.path.read().clone()
    }

    pub fn is_up(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn post(&self, wr: WorkRequest) -> Result<(), RdmaError> {
        let path = self.path().ok_or(RdmaError::PathDown)?;
        path.post(wr)
    }

    /// Claim the reconnect slot for this path. Returns `false` if a worker
    /// already owns it.
    pub fn begin_reconnect(&self) -> bool {
        !self.reconnecting.swap(true, Ordering::AcqRel)
    }

    pub fn end_reconnect(&self) {
        self.reconnecting.store(false, Ordering::Release);
    }

    pub fn describe(&self) -> String {
        let peer = self.path().map(|p| p.peer().to_string());
        format!(
            "Connection(con={}, state={:?}, peer={})",
            self.con_id,
            self.state(),
            peer.as_deref().unwrap_or("-")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::CompletionHandler;
    use async_trait::async_trait;
    use bytes::Bytes;
    use ibtrs_types::Address;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingPath {
        posted: AtomicUsize,
    }

    #[async_trait]
    impl RdmaPath for CountingPath {
        fn post(&self, _wr: WorkRequest) -> Result<(), RdmaError> {
            self.posted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn exchange(&self, _request: Bytes) -> Result<Bytes, RdmaError> {
            Err(RdmaError::NotInitiator)
        }

        fn bind(&self, _handler: Arc<dyn CompletionHandler>) {}

        fn close(&self) {}

        fn peer(&self) -> Address {
            Address::from_octets(10, 0, 0, 2, 4000)
        }

        fn is_up(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_wr_id_roundtrip() {
        let id = encode_wr_id(WrKind::Msg, 7);
        assert_eq!(decode_wr_id(id), Some((WrKind::Msg, 7)));
        assert_eq!(decode_wr_id(42), None);
    }

    #[test]
    fn test_attach_and_post() {
        let conn = Connection::new(ConId(0));
        assert!(matches!(conn.post(WorkRequest::Heartbeat), Err(RdmaError::PathDown)));

        let path = Arc::new(CountingPath::default());
        let generation = conn.next_generation();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(conn.attach(path.clone(), generation));
        assert!(conn.is_up());
        conn.post(WorkRequest::Heartbeat).unwrap();
        assert_eq!(path.posted.load(Ordering::SeqCst), 1);
        assert!(conn.describe().contains("10.0.0.2"));
    }

    #[test]
    fn test_stale_generation_ignored() {
        let conn = Connection::new(ConId(1));
        let old = conn.next_generation();
        assert!(conn.attach(Arc::new(CountingPath::default()), old));
        let new = conn.next_generation();
        assert!(conn.detach(old).is_none());
        assert!(conn.attach(Arc::new(CountingPath::default()), new));
        assert!(conn.detach(new).is_some());
        assert_eq!(conn.state(), ConnectionState::Error);
        assert!(!conn.is_up());
    }

    #[test]
    fn test_shutdown_invalidates_generation() {
        let conn = Connection::new(ConId(0));
        let generation = conn.next_generation();
        assert!(conn.attach(Arc::new(CountingPath::default()), generation));
        assert!(conn.shutdown().is_some());
        assert!(!conn.is_current(generation));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_reconnect_claim() {
        let conn = Connection::new(ConId(0));
        assert!(conn.begin_reconnect());
        assert!(!conn.begin_reconnect());
        conn.end_reconnect();
        assert!(conn.begin_reconnect());
    }
}
