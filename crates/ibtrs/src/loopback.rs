//! In-memory RDMA fabric.
//!
//! Implements the RDMA capability inside one process: every buffer mapped
//! through the fabric is addressable by key, writes copy between mapped
//! buffers, and completions are delivered synchronously on the posting
//! thread. Fault injection covers unreachable peers, path failure and
//! completions held back until flushed.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use ibtrs_proto::Descriptor;
use ibtrs_types::{Address, ConId};
use parking_lot::{Mutex, RwLock};

use crate::buf::IuBuf;
use crate::error::RdmaError;
use crate::rdma::{
    AcceptOutcome, CompletionHandler, ConnectionAcceptor, DmaDirection, DmaHandle, DmaMapper,
    RdmaConnector, RdmaPath, Sge, WorkRequest,
};

/// The fabric owns the accepting end; the initiator only holds it weakly.
struct Link {
    peer: Address,
    con_id: ConId,
    client: Weak<LoopbackPath>,
    server: Arc<LoopbackPath>,
}

/// Queued work keeps its path alive so a flush always completes it.
struct Held {
    from: Arc<LoopbackPath>,
    wr: WorkRequest,
}

pub struct LoopbackFabric {
    listeners: DashMap<Address, Arc<dyn ConnectionAcceptor>>,
    regions: DashMap<u32, Arc<IuBuf>>,
    next_key: AtomicU32,
    unreachable: Mutex<HashSet<Address>>,
    links: Mutex<Vec<Link>>,
    hold: AtomicBool,
    held: Mutex<VecDeque<Held>>,
    connect_attempts: AtomicUsize,
    drop_heartbeats: AtomicBool,
}

impl LoopbackFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: DashMap::new(),
            regions: DashMap::new(),
            next_key: AtomicU32::new(1),
            unreachable: Mutex::new(HashSet::new()),
            links: Mutex::new(Vec::new()),
            hold: AtomicBool::new(false),
            held: Mutex::new(VecDeque::new()),
            connect_attempts: AtomicUsize::new(0),
            drop_heartbeats: AtomicBool::new(false),
        })
    }

    pub fn connector(self: &Arc<Self>, local: Address) -> Arc<LoopbackConnector> {
        Arc::new(LoopbackConnector {
            fabric: Arc::clone(self),
            local,
        })
    }

    pub fn listen(&self, addr: Address, acceptor: Arc<dyn ConnectionAcceptor>) {
        self.listeners.insert(addr, acceptor);
    }

    pub fn unlisten(&self, addr: &Address) {
        self.listeners.remove(addr);
    }

    pub fn set_unreachable(&self, addr: Address, unreachable: bool) {
        let mut set = self.unreachable.lock();
        if unreachable {
            set.insert(addr);
        } else {
            set.remove(&addr);
        }
    }

    /// Take down one path to `peer`. Both ends see the loss.
    pub fn fail_path(&self, peer: &Address, con_id: ConId) -> bool {
        let victims = self.live_links(|l| l.peer == *peer && l.con_id == con_id);
        let failed = !victims.is_empty();
        for path in victims {
            path.fail();
        }
        failed
    }

    /// Take down every path to `peer`.
    pub fn fail_all(&self, peer: &Address) -> usize {
        let victims = self.live_links(|l| l.peer == *peer);
        let n = victims.len();
        for path in victims {
            path.fail();
        }
        n
    }

    fn live_links(&self, pred: impl Fn(&Link) -> bool) -> Vec<Arc<LoopbackPath>> {
        let mut links = self.links.lock();
        links.retain(|l| l.client.strong_count() > 0);
        links
            .iter()
            .filter(|l| pred(l))
            .filter_map(|l| l.client.upgrade())
            .filter(|p| p.is_up())
            .collect()
    }

    /// While set, posted work is queued instead of delivered.
    pub fn set_hold(&self, hold: bool) {
        self.hold.store(hold, Ordering::Release);
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Deliver queued work. Work whose path went down in the meantime
    /// completes with `Flushed`.
    pub fn flush(&self) -> usize {
        let held: Vec<_> = self.held.lock().drain(..).collect();
        let n = held.len();
        for Held { from, wr } in held {
            if from.is_up() {
                from.deliver(wr);
            } else {
                from.complete_with_error(&wr, RdmaError::Flushed);
            }
        }
        n
    }

    /// Complete every queued work request with `err`.
    pub fn flush_with_error(&self, err: RdmaError) -> usize {
        let held: Vec<_> = self.held.lock().drain(..).collect();
        let n = held.len();
        for Held { from, wr } in held {
            from.complete_with_error(&wr, err.clone());
        }
        n
    }

    pub fn set_drop_heartbeats(&self, drop: bool) {
        self.drop_heartbeats.store(drop, Ordering::Release);
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::Acquire)
    }

    pub fn mapped_count(&self) -> usize {
        self.regions.len()
    }

    fn region(&self, key: u32, addr: u64, len: usize) -> Option<(Arc<IuBuf>, usize)> {
        let buf = self.regions.get(&key).map(|r| Arc::clone(r.value()))?;
        let offset = addr.checked_sub((key as u64) << 32)? as usize;
        let end = offset.checked_add(len)?;
        (end <= buf.len()).then_some((buf, offset))
    }

    fn read_local(&self, sges: &[Sge]) -> Result<Vec<u8>, RdmaError> {
        let mut out = Vec::with_capacity(sges.iter().map(|s| s.len as usize).sum());
        for sge in sges {
            let err = || RdmaError::LocalAccess {
                key: sge.key,
                addr: sge.addr,
                len: sge.len as usize,
            };
            let (buf, offset) = self.region(sge.key, sge.addr, sge.len as usize).ok_or_else(err)?;
            buf.with_range(offset, sge.len as usize, |s| out.extend_from_slice(s))
                .ok_or_else(err)?;
        }
        Ok(out)
    }

    fn write_remote(&self, desc: &Descriptor, data: &[u8]) -> Result<(), RdmaError> {
        let err = || RdmaError::RemoteAccess {
            key: desc.key,
            addr: desc.addr,
            len: data.len(),
        };
        if data.len() > desc.len as usize {
            return Err(err());
        }
        let (buf, offset) = self.region(desc.key, desc.addr, data.len()).ok_or_else(err)?;
        if buf.write_at(offset, data) {
            Ok(())
        } else {
            Err(err())
        }
    }
}

impl DmaMapper for LoopbackFabric {
    fn map(&self, buf: &Arc<IuBuf>, _dir: DmaDirection) -> Result<DmaHandle, RdmaError> {
        let len = u32::try_from(buf.len())
            .map_err(|_| RdmaError::MapFailed(format!("buffer of {} bytes", buf.len())))?;
        let key = self.next_key.fetch_add(1, Ordering::AcqRel);
        self.regions.insert(key, Arc::clone(buf));
        Ok(DmaHandle {
            addr: (key as u64) << 32,
            key,
            len,
        })
    }

    fn unmap(&self, handle: &DmaHandle) {
        self.regions.remove(&handle.key);
    }
}

pub struct LoopbackConnector {
    fabric: Arc<LoopbackFabric>,
    local: Address,
}

#[async_trait]
impl RdmaConnector for LoopbackConnector {
    async fn connect(
        &self,
        peer: &Address,
        con_id: ConId,
        handler: Arc<dyn CompletionHandler>,
    ) -> Result<Arc<dyn RdmaPath>, RdmaError> {
        self.fabric.connect_attempts.fetch_add(1, Ordering::AcqRel);
        if self.fabric.unreachable.lock().contains(peer) {
            return Err(RdmaError::Unreachable(*peer));
        }
        let acceptor = self
            .fabric
            .listeners
            .get(peer)
            .map(|a| Arc::clone(a.value()))
            .ok_or(RdmaError::Unreachable(*peer))?;

        let fabric = Arc::downgrade(&self.fabric);
        let client = Arc::new(LoopbackPath::new(fabric.clone(), *peer, Some(acceptor)));
        let server = Arc::new(LoopbackPath::new(fabric, self.local, None));
        *client.remote.lock() = Arc::downgrade(&server);
        *server.remote.lock() = Arc::downgrade(&client);
        *client.me.lock() = Arc::downgrade(&client);
        *server.me.lock() = Arc::downgrade(&server);
        client.bind(handler);

        let mut links = self.fabric.links.lock();
        links.retain(|l| l.client.strong_count() > 0);
        links.push(Link {
            peer: *peer,
            con_id,
            client: Arc::downgrade(&client),
            server,
        });
        drop(links);
        tracing::debug!(peer = %peer, con = %con_id, "loopback path established");
        Ok(client)
    }
}

/// One end of a loopback path.
pub struct LoopbackPath {
    fabric: Weak<LoopbackFabric>,
    peer_addr: Address,
    up: AtomicBool,
    handler: RwLock<Option<Arc<dyn CompletionHandler>>>,
    remote: Mutex<Weak<LoopbackPath>>,
    me: Mutex<Weak<LoopbackPath>>,
    acceptor: Option<Arc<dyn ConnectionAcceptor>>,
}

impl LoopbackPath {
    fn new(
        fabric: Weak<LoopbackFabric>,
        peer_addr: Address,
        acceptor: Option<Arc<dyn ConnectionAcceptor>>,
    ) -> Self {
        Self {
            fabric,
            peer_addr,
            up: AtomicBool::new(true),
            handler: RwLock::new(None),
            remote: Mutex::new(Weak::new()),
            me: Mutex::new(Weak::new()),
            acceptor,
        }
    }

    fn handler(&self) -> Option<Arc<dyn CompletionHandler>> {
        self.handler.read().clone()
    }

    fn remote(&self) -> Option<Arc<LoopbackPath>> {
        self.remote.lock().upgrade()
    }

    /// Mark down without telling anyone. Returns whether it was up.
    fn mark_down(&self) -> bool {
        self.up.swap(false, Ordering::AcqRel)
    }

    fn notify_lost(&self) {
        if let Some(h) = self.handler() {
            h.on_connection_lost();
        }
    }

    /// Both ends go down and both are told.
    fn fail(&self) {
        let remote = self.remote();
        let was_up = self.mark_down();
        let remote_was_up = remote.as_ref().is_some_and(|r| r.mark_down());
        if was_up {
            self.notify_lost();
        }
        if let Some(r) = remote.filter(|_| remote_was_up) {
            r.notify_lost();
        }
    }

    fn complete_with_error(&self, wr: &WorkRequest, err: RdmaError) {
        let Some(h) = self.handler() else { return };
        match wr {
            WorkRequest::Send { wr_id, .. } => h.on_send_complete(*wr_id, Err(err)),
            WorkRequest::Write { wr_id, .. } => h.on_write_complete(*wr_id, Err(err)),
            WorkRequest::Heartbeat => {}
        }
    }

    fn deliver(&self, wr: WorkRequest) {
        let Some(fabric) = self.fabric.upgrade() else {
            self.complete_with_error(&wr, RdmaError::Flushed);
            return;
        };
        let remote = self.remote().filter(|r| r.is_up());
        let Some(remote) = remote else {
            self.complete_with_error(&wr, RdmaError::Flushed);
            return;
        };
        let local = self.handler();
        let peer = remote.handler();

        match wr {
            WorkRequest::Heartbeat => {
                if !fabric.drop_heartbeats.load(Ordering::Acquire) {
                    if let Some(h) = peer {
                        h.on_heartbeat();
                    }
                }
            }
            WorkRequest::Send { wr_id, sge } => {
                let data = match fabric.read_local(std::slice::from_ref(&sge)) {
                    Ok(data) => data,
                    Err(e) => {
                        if let Some(h) = local {
                            h.on_send_complete(wr_id, Err(e));
                        }
                        return;
                    }
                };
                if let Some(h) = local {
                    h.on_send_complete(wr_id, Ok(()));
                }
                match peer {
                    Some(h) => h.on_recv(&data),
                    None => tracing::debug!(peer = %self.peer_addr, "send to unbound path dropped"),
                }
            }
            WorkRequest::Write {
                wr_id,
                local: sges,
                remote: desc,
                imm,
            } => {
                let result = fabric.read_local(&sges).and_then(|data| {
                    if data.is_empty() {
                        Ok(())
                    } else {
                        fabric.write_remote(&desc, &data)
                    }
                });
                let ok = result.is_ok();
                if let Some(h) = local {
                    h.on_write_complete(wr_id, result);
                }
                if let (true, Some(imm)) = (ok, imm) {
                    match peer {
                        Some(h) => h.on_write_imm(imm),
                        None => {
                            tracing::debug!(peer = %self.peer_addr, "immediate to unbound path dropped")
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl RdmaPath for LoopbackPath {
    fn post(&self, wr: WorkRequest) -> Result<(), RdmaError> {
        if !self.is_up() {
            return Err(RdmaError::PathDown);
        }
        let fabric = self.fabric.upgrade().ok_or(RdmaError::PathDown)?;
        if fabric.hold.load(Ordering::Acquire) {
            let from = self.me.lock().upgrade().ok_or(RdmaError::PathDown)?;
            fabric.held.lock().push_back(Held { from, wr });
            return Ok(());
        }
        self.deliver(wr);
        Ok(())
    }

    async fn exchange(&self, request: Bytes) -> Result<Bytes, RdmaError> {
        let acceptor = self.acceptor.as_ref().ok_or(RdmaError::NotInitiator)?;
        let remote = self
            .remote()
            .filter(|_| self.is_up())
            .ok_or(RdmaError::PathDown)?;
        match acceptor.accept(remote.clone(), &request) {
            AcceptOutcome::Accepted(reply) => Ok(reply),
            AcceptOutcome::Rejected(reply) => {
                remote.mark_down();
                self.mark_down();
                Ok(reply)
            }
        }
    }

    fn bind(&self, handler: Arc<dyn CompletionHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// Only the other end is told; the closing side already knows.
    fn close(&self) {
        let was_up = self.mark_down();
        if let Some(remote) = self.remote() {
            if remote.mark_down() && was_up {
                remote.notify_lost();
            }
        }
    }

    fn peer(&self) -> Address {
        self.peer_addr
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }
}
