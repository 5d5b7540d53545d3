//! Client role: opens sessions, issues RDMA writes under tags and keeps
//! sessions alive across path failures.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use ibtrs_config::ConfigManager;
use ibtrs_logging::RateLimitedLog;
use ibtrs_proto::{
    ConOpen, DESC_SIZE, Descriptor, Imm, MAX_USER_MSG_SIZE, Message, MsgType, ProtoError,
    RDMA_WRITE_HDR_SIZE, RdmaWriteMsg, SessInfo, SessOpenResp, decode,
};
use ibtrs_types::{Address, ConId, OpCookie, Status, TagId, TransportCode};
use ibtrs_utils::{BackgroundRunner, ReconnectBackoff};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::connection::{Connection, WrKind, decode_wr_id, encode_wr_id};
use crate::dispatch::{ClientOps, ClientRdmaEvent, OpsRegistry, SessionEvent};
use crate::error::{RdmaError, TransportError};
use crate::heartbeat::{Clock, Heartbeat, MonotonicClock};
use crate::iu::MsgPool;
use crate::rdma::{CompletionHandler, DmaMapper, RdmaConnector, WorkRequest};
use crate::session::{SessionCore, SessionState};
use crate::tag::{Tag, TagPool};

pub struct IbtrsClient {
    connector: Arc<dyn RdmaConnector>,
    mapper: Arc<dyn DmaMapper>,
    registry: OpsRegistry<dyn ClientOps>,
    sessions: DashMap<Address, Arc<ClientSession>>,
    clock: Arc<dyn Clock>,
}

impl IbtrsClient {
    pub fn new(connector: Arc<dyn RdmaConnector>, mapper: Arc<dyn DmaMapper>) -> Arc<Self> {
        Self::with_clock(connector, mapper, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(
        connector: Arc<dyn RdmaConnector>,
        mapper: Arc<dyn DmaMapper>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector,
            mapper,
            registry: OpsRegistry::new(),
            sessions: DashMap::new(),
            clock,
        })
    }

    pub fn register(&self, ops: Arc<dyn ClientOps>) -> Result<(), TransportError> {
        self.registry.register(ops)
    }

    /// Refused while any session is open.
    pub fn unregister(&self) -> Result<(), TransportError> {
        self.registry.unregister()
    }

    pub async fn open(
        self: &Arc<Self>,
        addr: Address,
        config: SessionConfig,
    ) -> Result<Arc<ClientSession>, TransportError> {
        let manager = Arc::new(ConfigManager::new(config)?);
        self.open_with_manager(addr, manager).await
    }

    /// Open with a shared config manager, so hot updates reach the session.
    pub async fn open_with_manager(
        self: &Arc<Self>,
        addr: Address,
        config: Arc<ConfigManager<SessionConfig>>,
    ) -> Result<Arc<ClientSession>, TransportError> {
        let ops = self.registry.acquire_for_session()?;
        let sess = Arc::new(ClientSession::new(self, addr, ops, config));
        tracing::info!(peer = %addr, session = %sess.uuid(), "opening session");

        if let Err(e) = sess.establish().await {
            tracing::error!(peer = %addr, session = %sess.uuid(), error = %e, "session open failed");
            sess.core.transition(SessionState::Destroyed);
            sess.shutdown_paths();
            sess.unmap();
            self.registry.session_closed();
            return Err(e);
        }

        sess.core.transition(SessionState::Ready);
        self.sessions.insert(addr, Arc::clone(&sess));
        sess.send_info();
        sess.start_heartbeat();
        sess.emit(SessionEvent::Connected);
        Ok(sess)
    }

    pub fn find_session(&self, addr: &Address) -> Option<Arc<ClientSession>> {
        self.sessions.get(addr).map(|s| Arc::clone(s.value()))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Outstanding tag operation awaiting its response.
struct Pending {
    cookie: OpCookie,
    ev: ClientRdmaEvent,
    incarnation: u64,
    /// Offset and length of the result area for request writes.
    result: Option<(usize, usize)>,
    /// The local write completion has been seen; the buffer is no longer
    /// read by the fabric.
    local_done: bool,
    /// Its connection was replaced before a response came. Completes with
    /// a reset once the local write completion arrives.
    orphaned: bool,
}

/// State built from the first session-open response.
struct Pools {
    tags: Arc<TagPool>,
    msgs: MsgPool,
    inflight: Vec<Mutex<Option<Pending>>>,
    max_inflight_msg: u16,
}

/// Snapshot of a session's negotiated parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAttrs {
    pub addr: Address,
    pub uuid: Uuid,
    pub state: SessionState,
    pub queue_depth: u16,
    pub max_io_size: usize,
    pub max_inflight_msg: u16,
    pub max_segments: u16,
    pub con_count: usize,
    pub paths_up: usize,
    pub hostname: String,
}

pub struct ClientSession {
    core: SessionCore,
    client: Weak<IbtrsClient>,
    connector: Arc<dyn RdmaConnector>,
    mapper: Arc<dyn DmaMapper>,
    ops: Arc<dyn ClientOps>,
    config: Arc<ConfigManager<SessionConfig>>,
    /// Fields fixed at open time.
    fixed: SessionConfig,
    hostname: String,
    cons: Vec<Connection>,
    heartbeat: Heartbeat,
    pools: OnceLock<Pools>,
    /// Server receive buffers; replaced on every session-level reconnect.
    remote: RwLock<Vec<Descriptor>>,
    incarnation: AtomicU64,
    reconnecting: AtomicBool,
    reconnect_exhausted: AtomicBool,
    runner: BackgroundRunner,
    error_log: RateLimitedLog,
}

impl ClientSession {
    fn new(
        client: &Arc<IbtrsClient>,
        addr: Address,
        ops: Arc<dyn ClientOps>,
        config: Arc<ConfigManager<SessionConfig>>,
    ) -> Self {
        let fixed = config.snapshot();
        let cons = (0..fixed.con_count as u16)
            .map(|i| Connection::new(ConId(i)))
            .collect();
        Self {
            core: SessionCore::new(Uuid::new_v4(), addr, SessionState::Disconnected),
            client: Arc::downgrade(client),
            connector: Arc::clone(&client.connector),
            mapper: Arc::clone(&client.mapper),
            ops,
            heartbeat: Heartbeat::new(Arc::clone(&client.clock), fixed.heartbeat_timeout_ms as u64),
            hostname: fixed.hostname(),
            config,
            fixed,
            cons,
            pools: OnceLock::new(),
            remote: RwLock::new(Vec::new()),
            incarnation: AtomicU64::new(0),
            reconnecting: AtomicBool::new(false),
            reconnect_exhausted: AtomicBool::new(false),
            runner: BackgroundRunner::new("ibtrs-client-session"),
            error_log: RateLimitedLog::new(Duration::from_secs(5)),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.core.uuid()
    }

    pub fn addr(&self) -> Address {
        self.core.addr()
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    /// True once reconnecting has given up; only `close` remains.
    pub fn is_destroy_eligible(&self) -> bool {
        self.reconnect_exhausted.load(Ordering::Acquire) && self.state() == SessionState::Disconnected
    }

    pub fn config_manager(&self) -> &Arc<ConfigManager<SessionConfig>> {
        &self.config
    }

    pub fn get(&self) -> usize {
        self.core.get()
    }

    pub fn put(&self) -> usize {
        self.core.put()
    }

    pub fn add_user(&self, name: impl Into<String>) {
        self.core.add_user(name)
    }

    pub fn remove_user(&self, name: &str) -> bool {
        self.core.remove_user(name)
    }

    pub fn log_users(&self) {
        self.core.log_users()
    }

    fn pools(&self) -> Result<&Pools, TransportError> {
        self.pools.get().ok_or(TransportError::NotConnected)
    }

    fn emit(self: &Arc<Self>, ev: SessionEvent) {
        tracing::debug!(session = %self.uuid(), peer = %self.addr(), event = ?ev, "session event");
        self.ops.sess_ev(self, ev);
    }

    // ---- handshake ----

    /// Connect every path. Path 0 opens the session, the rest join it.
    async fn establish(self: &Arc<Self>) -> Result<(), TransportError> {
        let expected_qd = self.pools.get().map(|p| p.tags.queue_depth());
        for idx in 0..self.cons.len() {
            let request = if idx == 0 {
                Message::sess_open(self.uuid(), self.cons.len() as u8)
            } else {
                self.con_open(idx)
            };
            let resp = self.connect_path(idx, request, expected_qd).await?;
            if idx == 0 {
                self.apply_open_resp(resp)?;
            }
        }
        Ok(())
    }

    fn con_open(&self, idx: usize) -> Message {
        Message::ConOpen(ConOpen {
            uuid: self.uuid(),
            con_id: self.cons[idx].con_id(),
        })
    }

    async fn connect_path(
        self: &Arc<Self>,
        idx: usize,
        request: Message,
        expected_qd: Option<u16>,
    ) -> Result<SessOpenResp, TransportError> {
        let conn = &self.cons[idx];
        let generation = conn.next_generation();
        let handler = Arc::new(PathHandler {
            sess: Arc::downgrade(self),
            idx,
            generation,
        });
        let path = self
            .connector
            .connect(&self.addr(), conn.con_id(), handler)
            .await?;

        let resp = match path.exchange(request.encode()).await {
            Ok(reply) => parse_open_reply(&reply, expected_qd),
            Err(e) => Err(e.into()),
        };
        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(peer = %self.addr(), con = %conn.con_id(), error = %e, "handshake failed");
                path.close();
                return Err(e);
            }
        };
        if let Some(pools) = self.pools.get() {
            if resp.max_io_size as usize != pools.tags.max_io_size() {
                path.close();
                return Err(ProtoError::InvalidField {
                    msg_type: MsgType::SessOpenResp,
                    field: "max_io_size",
                    reason: format!(
                        "changed from {} to {}",
                        pools.tags.max_io_size(),
                        resp.max_io_size
                    ),
                }
                .into());
            }
        }
        if !conn.attach(Arc::clone(&path), generation) {
            path.close();
            return Err(TransportError::NotConnected);
        }
        tracing::info!(peer = %self.addr(), con = %conn.con_id(), "path established");
        Ok(resp)
    }

    fn apply_open_resp(&self, resp: SessOpenResp) -> Result<(), TransportError> {
        if self.pools.get().is_none() {
            let tags = TagPool::new(
                resp.queue_depth,
                resp.max_io_size as usize,
                self.fixed.tag_shards,
                self.mapper.as_ref(),
            )?;
            let msgs = match MsgPool::new(
                resp.max_inflight_msg as usize,
                MAX_USER_MSG_SIZE + ibtrs_proto::HDR_SIZE,
                self.mapper.as_ref(),
            ) {
                Ok(msgs) => msgs,
                Err(e) => {
                    tags.unmap_all(self.mapper.as_ref());
                    return Err(e.into());
                }
            };
            let pools = Pools {
                tags: Arc::new(tags),
                msgs,
                inflight: (0..resp.queue_depth).map(|_| Mutex::new(None)).collect(),
                max_inflight_msg: resp.max_inflight_msg,
            };
            if let Err(pools) = self.pools.set(pools) {
                pools.tags.unmap_all(self.mapper.as_ref());
                pools.msgs.unmap_all(self.mapper.as_ref());
            }
        }
        *self.remote.write() = resp.descs;
        Ok(())
    }

    fn send_info(&self) {
        let msg = Message::SessInfo(SessInfo {
            hostname: self.hostname.clone(),
        });
        if let Err(e) = self.post_msg(0, &msg) {
            tracing::warn!(session = %self.uuid(), error = %e, "failed to send session info");
        }
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.runner
            .spawn_periodic(self.fixed.heartbeat_interval(), move || {
                let weak = weak.clone();
                async move {
                    if let Some(sess) = weak.upgrade() {
                        sess.heartbeat_tick();
                    }
                }
            });
    }

    // ---- data path ----

    /// Blocking allocation; waits while the pool is exhausted.
    pub async fn get_tag(&self, cpu: usize, nr_bytes: usize) -> Result<Tag, TransportError> {
        self.check_ready()?;
        let tag = self.pools()?.tags.get(cpu, nr_bytes).await?;
        self.check_ready()?;
        Ok(tag)
    }

    /// Non-blocking allocation; `NoResources` when every tag is in use.
    pub fn try_get_tag(&self, cpu: usize, nr_bytes: usize) -> Result<Tag, TransportError> {
        self.check_ready()?;
        self.pools()?.tags.try_get(cpu, nr_bytes)
    }

    fn check_ready(&self) -> Result<(), TransportError> {
        match self.state() {
            SessionState::Ready => Ok(()),
            SessionState::Disconnected => Err(TransportError::NotConnected),
            SessionState::Destroyed => Err(TransportError::SessionClosed),
        }
    }

    /// Write `usr_msg` and the data segments into the server buffer
    /// reserved by `tag`. Completion arrives as `RdmaWriteComplete`.
    pub fn rdma_write(
        &self,
        tag: Tag,
        cookie: OpCookie,
        usr_msg: &[u8],
        segments: &[&[u8]],
    ) -> Result<(), TransportError> {
        self.check_ready()?;
        if segments.len() > self.fixed.max_segments as usize {
            return Err(TransportError::TooManySegments {
                count: segments.len(),
                max: self.fixed.max_segments as usize,
            });
        }
        self.check_usr(usr_msg)?;

        let ndesc = segments.len().max(1);
        let hdr = RDMA_WRITE_HDR_SIZE + ndesc * DESC_SIZE;
        let data_len: usize = segments.iter().map(|s| s.len()).sum();
        let total = hdr + usr_msg.len() + data_len;
        self.check_io_size(&tag, total)?;

        let mut descs = Vec::with_capacity(ndesc);
        let mut off = hdr + usr_msg.len();
        for seg in segments {
            descs.push(Descriptor {
                addr: off as u64,
                key: 0,
                len: seg.len() as u32,
            });
            off += seg.len();
        }
        if descs.is_empty() {
            descs.push(Descriptor {
                addr: off as u64,
                key: 0,
                len: 0,
            });
        }
        let msg = Message::RdmaWrite(RdmaWriteMsg {
            usr_len: usr_msg.len() as u16,
            descs,
        })
        .encode();

        let buf = tag.iu().buf();
        buf.write_at(0, &msg);
        buf.write_at(hdr, usr_msg);
        let mut off = hdr + usr_msg.len();
        for seg in segments {
            buf.write_at(off, seg);
            off += seg.len();
        }
        self.submit(tag, cookie, ClientRdmaEvent::RdmaWriteComplete, total, None)
    }

    /// Ask the server to write up to `result_len` bytes back. The result is
    /// handed to the `RdmaRequestWriteComplete` callback.
    pub fn request_rdma_write(
        &self,
        tag: Tag,
        cookie: OpCookie,
        usr_msg: &[u8],
        result_len: usize,
    ) -> Result<(), TransportError> {
        self.check_ready()?;
        self.check_usr(usr_msg)?;
        let hdr = RDMA_WRITE_HDR_SIZE + DESC_SIZE;
        let result_off = hdr + usr_msg.len();
        self.check_io_size(&tag, result_off + result_len)?;

        let iu = tag.iu();
        let msg = Message::ReqRdmaWrite(RdmaWriteMsg {
            usr_len: usr_msg.len() as u16,
            descs: vec![iu.desc(result_off, result_len)],
        })
        .encode();
        let buf = iu.buf();
        buf.write_at(0, &msg);
        buf.write_at(hdr, usr_msg);
        buf.with_range_mut(result_off, result_len, |r| r.fill(0));
        self.submit(
            tag,
            cookie,
            ClientRdmaEvent::RdmaRequestWriteComplete,
            result_off,
            Some((result_off, result_len)),
        )
    }

    fn check_usr(&self, usr_msg: &[u8]) -> Result<(), TransportError> {
        if usr_msg.len() > MAX_USER_MSG_SIZE {
            return Err(TransportError::MsgTooLarge {
                size: usr_msg.len(),
                max: MAX_USER_MSG_SIZE,
            });
        }
        Ok(())
    }

    fn check_io_size(&self, tag: &Tag, total: usize) -> Result<(), TransportError> {
        let pools = self.pools()?;
        assert!(
            Arc::ptr_eq(tag.pool(), &pools.tags),
            "tag {} belongs to another session",
            tag.id()
        );
        if total > pools.tags.max_io_size() {
            return Err(TransportError::IoTooLarge {
                size: total,
                max: pools.tags.max_io_size(),
            });
        }
        Ok(())
    }

    fn submit(
        &self,
        tag: Tag,
        cookie: OpCookie,
        ev: ClientRdmaEvent,
        len: usize,
        result: Option<(usize, usize)>,
    ) -> Result<(), TransportError> {
        let pools = self.pools()?;
        let id = tag.id();
        let remote = self
            .remote
            .read()
            .get(id.index())
            .copied()
            .ok_or(TransportError::NotConnected)?;
        let conn = self.pick_con(tag.cpu()).ok_or(TransportError::NotConnected)?;
        let incarnation = self.incarnation.load(Ordering::Acquire);
        let wr = WorkRequest::Write {
            wr_id: encode_wr_id(WrKind::Tag, tag_wr_idx(id, incarnation)),
            local: vec![tag.iu().sge(0, len)],
            remote: Descriptor {
                addr: remote.addr,
                key: remote.key,
                len: len as u32,
            },
            imm: Some(Imm::new(id.0, 0).encode()),
        };

        let id = tag.submit();
        *pools.inflight[id.index()].lock() = Some(Pending {
            cookie,
            ev,
            incarnation,
            result,
            local_done: false,
            orphaned: false,
        });
        if let Err(e) = conn.post(wr) {
            tracing::warn!(session = %self.uuid(), tag = %id, error = %e, "post failed");
            if pools.inflight[id.index()].lock().take().is_some() {
                pools.tags.complete(id);
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn pick_con(&self, cpu: usize) -> Option<&Connection> {
        let n = self.cons.len();
        (0..n).map(|k| &self.cons[(cpu + k) % n]).find(|c| c.is_up())
    }

    /// Send a user message over the message channel.
    pub fn send(&self, msg: &[u8]) -> Result<(), TransportError> {
        self.check_ready()?;
        if msg.len() > MAX_USER_MSG_SIZE {
            return Err(TransportError::MsgTooLarge {
                size: msg.len(),
                max: MAX_USER_MSG_SIZE,
            });
        }
        self.post_msg(ibtrs_utils::current_cpu(), &Message::user(msg.to_vec()))
    }

    fn post_msg(&self, cpu: usize, msg: &Message) -> Result<(), TransportError> {
        let pools = self.pools()?;
        let idx = pools.msgs.try_get().ok_or(TransportError::NoResources)?;
        let Some(iu) = pools.msgs.iu(idx) else {
            pools.msgs.put(idx);
            return Err(TransportError::NoResources);
        };
        let bytes = msg.encode();
        iu.buf().write_at(0, &bytes);
        let wr = WorkRequest::Send {
            wr_id: encode_wr_id(WrKind::Msg, idx as u32),
            sge: iu.sge(0, bytes.len()),
        };
        let posted = match self.pick_con(cpu) {
            Some(conn) => conn.post(wr),
            None => Err(RdmaError::PathDown),
        };
        if let Err(e) = posted {
            pools.msgs.put(idx);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn query(&self) -> Result<SessionAttrs, TransportError> {
        let pools = self.pools()?;
        Ok(SessionAttrs {
            addr: self.addr(),
            uuid: self.uuid(),
            state: self.state(),
            queue_depth: pools.tags.queue_depth(),
            max_io_size: pools.tags.max_io_size(),
            max_inflight_msg: pools.max_inflight_msg,
            max_segments: self.fixed.max_segments,
            con_count: self.cons.len(),
            paths_up: self.cons.iter().filter(|c| c.is_up()).count(),
            hostname: self.hostname.clone(),
        })
    }

    // ---- completions ----

    /// Complete a tag exactly once: the first caller to take the pending
    /// entry runs the callback and frees the tag.
    fn complete_tag(&self, id: TagId, status: Status) {
        self.complete_tag_from(id, status, None)
    }

    /// `incarnation` set: only complete a request issued in that
    /// incarnation, so a late error for a recycled tag is dropped.
    fn complete_tag_from(&self, id: TagId, status: Status, incarnation: Option<u16>) {
        let Ok(pools) = self.pools() else { return };
        let Some(slot) = pools.inflight.get(id.index()) else {
            if let Some(suppressed) = self.error_log.check() {
                tracing::error!(session = %self.uuid(), tag = %id, suppressed, "completion for unknown tag");
            }
            return;
        };
        let pending = {
            let mut slot = slot.lock();
            match slot.as_ref() {
                None => None,
                Some(p) if incarnation.is_some_and(|inc| p.incarnation as u16 != inc) => {
                    tracing::debug!(session = %self.uuid(), tag = %id, "stale completion ignored");
                    return;
                }
                Some(_) => slot.take(),
            }
        };
        let Some(pending) = pending else {
            tracing::warn!(session = %self.uuid(), tag = %id, "duplicate completion ignored");
            return;
        };
        self.finish_tag(pools, id, pending, status);
    }

    fn finish_tag(&self, pools: &Pools, id: TagId, pending: Pending, status: Status) {
        let data = match pending.result {
            Some((off, len)) if status.is_ok() => pools
                .tags
                .iu(id)
                .and_then(|iu| iu.buf().read_at(off, len))
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        self.ops.rdma_ev(pending.cookie, pending.ev, status, &data);
        pools.tags.complete(id);
    }

    /// Fail requests issued before `incarnation`; their responses will
    /// never come. A request whose local write has not completed yet only
    /// gets marked, its buffer may still be read by the fabric.
    fn fail_orphans(&self, incarnation: u64) {
        let Ok(pools) = self.pools() else { return };
        let mut failed = 0usize;
        let mut waiting = 0usize;
        for (i, slot) in pools.inflight.iter().enumerate() {
            let pending = {
                let mut slot = slot.lock();
                match slot.as_ref().map(|p| (p.incarnation < incarnation, p.local_done)) {
                    Some((true, true)) => slot.take(),
                    Some((true, false)) => {
                        if let Some(p) = slot.as_mut() {
                            p.orphaned = true;
                        }
                        waiting += 1;
                        None
                    }
                    _ => None,
                }
            };
            if let Some(pending) = pending {
                failed += 1;
                self.finish_tag(pools, TagId(i as u16), pending, connection_reset());
            }
        }
        if failed + waiting > 0 {
            tracing::warn!(
                session = %self.uuid(),
                failed,
                waiting,
                "failing requests from previous connection"
            );
        }
    }

    /// Successful local write completion for a tag.
    fn note_write_done(&self, id: TagId, incarnation: u16) {
        let Ok(pools) = self.pools() else { return };
        let Some(slot) = pools.inflight.get(id.index()) else { return };
        let pending = {
            let mut slot = slot.lock();
            let orphaned = match slot.as_mut() {
                Some(p) if p.incarnation as u16 == incarnation => {
                    p.local_done = true;
                    p.orphaned
                }
                _ => false,
            };
            if orphaned {
                slot.take()
            } else {
                None
            }
        };
        if let Some(pending) = pending {
            self.finish_tag(pools, id, pending, connection_reset());
        }
    }

    fn fail_all_pending(&self, status: &Status) {
        let Ok(pools) = self.pools() else { return };
        for i in 0..pools.inflight.len() {
            let id = TagId(i as u16);
            if pools.tags.is_in_flight(id) {
                self.complete_tag(id, status.clone());
            }
        }
    }

    fn on_write_imm(&self, imm: u32) {
        self.heartbeat.record_received();
        let imm = Imm::decode(imm);
        self.complete_tag(TagId(imm.buf_id), Status::from_remote_errno(imm.errno()));
    }

    fn on_write_complete(&self, wr_id: u64, result: Result<(), RdmaError>) {
        let Some((WrKind::Tag, idx)) = decode_wr_id(wr_id) else {
            tracing::error!(session = %self.uuid(), wr_id, "unexpected write completion");
            return;
        };
        let (id, incarnation) = (TagId(idx as u16), (idx >> 16) as u16);
        match result {
            Ok(()) => self.note_write_done(id, incarnation),
            Err(e) => {
                if let Some(suppressed) = self.error_log.check() {
                    tracing::error!(session = %self.uuid(), tag = %id, error = %e, suppressed, "rdma write failed");
                }
                self.complete_tag_from(id, e.into(), Some(incarnation));
            }
        }
    }

    fn on_send_complete(&self, wr_id: u64, result: Result<(), RdmaError>) {
        let Ok(pools) = self.pools() else { return };
        match decode_wr_id(wr_id) {
            Some((WrKind::Msg, idx)) => {
                if let Err(e) = result {
                    tracing::warn!(session = %self.uuid(), error = %e, "message send failed");
                }
                pools.msgs.put(idx as usize);
            }
            _ => tracing::error!(session = %self.uuid(), wr_id, "unexpected send completion"),
        }
    }

    fn on_recv(self: &Arc<Self>, data: &[u8]) {
        self.heartbeat.record_received();
        match decode(data, None) {
            Ok((Message::User(m), _)) => self.ops.recv(self, &m.payload),
            Ok((Message::Error(m), _)) => {
                tracing::error!(session = %self.uuid(), errno = m.errno, "peer reported error")
            }
            Ok((other, _)) => {
                tracing::error!(session = %self.uuid(), msg_type = %other.msg_type(), "unexpected message")
            }
            Err(e) => {
                if let Some(suppressed) = self.error_log.check() {
                    tracing::error!(session = %self.uuid(), error = %e, suppressed, "malformed message");
                }
            }
        }
    }

    // ---- liveness and reconnect ----

    pub(crate) fn heartbeat_tick(self: &Arc<Self>) {
        if self.state() != SessionState::Ready {
            return;
        }
        self.heartbeat
            .set_timeout(self.config.get().heartbeat_timeout_ms as u64);
        if self.heartbeat.check_timeout() {
            tracing::error!(
                session = %self.uuid(),
                peer = %self.addr(),
                silent_ms = self.heartbeat.now_ms().saturating_sub(self.heartbeat.last_received_ms()),
                "heartbeat timeout"
            );
            self.all_paths_down();
            return;
        }
        if self.heartbeat.check_warn() {
            tracing::warn!(session = %self.uuid(), peer = %self.addr(), "heartbeat late");
        }
        for conn in self.cons.iter().filter(|c| c.is_up()) {
            if conn.post(WorkRequest::Heartbeat).is_ok() {
                self.heartbeat.record_sent();
            }
        }
    }

    fn path_down(self: &Arc<Self>, idx: usize, generation: u64) {
        let conn = &self.cons[idx];
        let Some(path) = conn.detach(generation) else {
            return;
        };
        path.close();
        tracing::warn!(session = %self.uuid(), peer = %self.addr(), con = %conn.con_id(), "path down");
        if self.state() == SessionState::Destroyed {
            return;
        }
        if self.cons.iter().any(|c| c.is_up()) {
            self.spawn_path_reconnect(idx);
            return;
        }
        if self.core.transition(SessionState::Disconnected).is_some() {
            self.emit(SessionEvent::Disconnected);
            self.spawn_session_reconnect();
        }
    }

    fn all_paths_down(self: &Arc<Self>) {
        for conn in &self.cons {
            if let Some(path) = conn.detach(conn.generation()) {
                path.close();
            }
        }
        if self.core.transition(SessionState::Disconnected).is_some() {
            self.emit(SessionEvent::Disconnected);
            self.spawn_session_reconnect();
        }
    }

    fn spawn_session_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let sess = Arc::clone(self);
        self.runner.spawn(move |shutdown| async move {
            sess.reconnect_worker(shutdown).await;
            sess.reconnecting.store(false, Ordering::Release);
        });
    }

    fn backoff(&self) -> ReconnectBackoff {
        let cfg = self.config.get();
        ReconnectBackoff::new(cfg.reconnect_policy(), cfg.reconnect_limit())
    }

    async fn reconnect_worker(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = self.backoff();
        loop {
            if self.state() != SessionState::Disconnected {
                return;
            }
            let cfg = self.config.get_full();
            backoff.update(cfg.reconnect_policy(), cfg.reconnect_limit());
            let Some(wait) = backoff.next_wait() else {
                tracing::error!(
                    session = %self.uuid(),
                    peer = %self.addr(),
                    attempts = backoff.attempts(),
                    "max reconnect attempts reached"
                );
                self.reconnect_exhausted.store(true, Ordering::Release);
                self.emit(SessionEvent::MaxReconnectExceeded);
                return;
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => return,
            }
            if self.state() != SessionState::Disconnected {
                return;
            }
            match self.reconnect_once().await {
                Ok(()) => return,
                Err(e) => tracing::warn!(
                    session = %self.uuid(),
                    peer = %self.addr(),
                    attempt = backoff.attempts(),
                    error = %e,
                    "reconnect attempt failed"
                ),
            }
        }
    }

    async fn reconnect_once(self: &Arc<Self>) -> Result<(), TransportError> {
        if let Err(e) = self.establish().await {
            self.shutdown_paths();
            return Err(e);
        }
        let old = self.incarnation.fetch_add(1, Ordering::AcqRel);
        if self.core.transition(SessionState::Ready).is_none() {
            self.shutdown_paths();
            return Err(TransportError::SessionClosed);
        }
        self.heartbeat.reset();
        self.send_info();
        self.emit(SessionEvent::Reconnected);
        self.fail_orphans(old + 1);
        Ok(())
    }

    fn spawn_path_reconnect(self: &Arc<Self>, idx: usize) {
        if !self.cons[idx].begin_reconnect() {
            return;
        }
        let sess = Arc::clone(self);
        self.runner.spawn(move |shutdown| async move {
            sess.path_reconnect_worker(idx, shutdown).await;
            sess.cons[idx].end_reconnect();
        });
    }

    /// Rejoin one path while the others keep the session up.
    async fn path_reconnect_worker(self: &Arc<Self>, idx: usize, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = self.backoff();
        let con_id = self.cons[idx].con_id();
        while let Some(wait) = backoff.next_wait() {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => return,
            }
            if self.state() != SessionState::Ready || self.cons[idx].is_up() {
                return;
            }
            let qd = self.pools().ok().map(|p| p.tags.queue_depth());
            match self.connect_path(idx, self.con_open(idx), qd).await {
                Ok(_) => return,
                Err(e) => {
                    tracing::warn!(session = %self.uuid(), con = %con_id, error = %e, "path reconnect failed")
                }
            }
        }
        tracing::error!(session = %self.uuid(), con = %con_id, "giving up on path");
    }

    fn shutdown_paths(&self) {
        for conn in &self.cons {
            if let Some(path) = conn.shutdown() {
                path.close();
            }
        }
    }

    fn unmap(&self) {
        if let Some(pools) = self.pools.get() {
            pools.tags.unmap_all(self.mapper.as_ref());
            pools.msgs.unmap_all(self.mapper.as_ref());
        }
    }

    /// Tear the session down. Refused while references are held. Waits up
    /// to the drain timeout for in-flight operations.
    pub async fn close(self: &Arc<Self>) -> Result<(), TransportError> {
        let refs = self.core.refs();
        if refs > 0 {
            return Err(TransportError::SessionBusy { refs });
        }
        if self.core.transition(SessionState::Destroyed).is_none() {
            return Err(TransportError::SessionClosed);
        }
        if let Ok(pools) = self.pools() {
            pools.tags.close();
        }
        self.runner.shutdown().await;

        if let Ok(pools) = self.pools() {
            if !pools.tags.wait_idle(self.fixed.drain_timeout()).await {
                tracing::warn!(
                    session = %self.uuid(),
                    outstanding = pools.tags.outstanding(),
                    "in-flight operations did not drain"
                );
            }
        }
        self.shutdown_paths();
        self.fail_all_pending(&Status::with_message(
            TransportCode::SESSION_CLOSED,
            "session closed before response",
        ));
        self.unmap();

        if let Some(client) = self.client.upgrade() {
            client
                .sessions
                .remove_if(&self.addr(), |_, s| Arc::ptr_eq(s, self));
            client.registry.session_closed();
        }
        tracing::info!(session = %self.uuid(), peer = %self.addr(), "session closed");
        Ok(())
    }
}

fn connection_reset() -> Status {
    Status::with_message(TransportCode::CONNECTION_RESET, "connection reset before response")
}

fn tag_wr_idx(id: TagId, incarnation: u64) -> u32 {
    ((incarnation as u16 as u32) << 16) | id.0 as u32
}

fn parse_open_reply(reply: &[u8], expected_qd: Option<u16>) -> Result<SessOpenResp, TransportError> {
    let (msg, validated) = decode(reply, expected_qd)?;
    match msg {
        Message::SessOpenResp(resp) => {
            if let Some(ver) = validated.version_mismatch {
                tracing::warn!(
                    peer_version = ver,
                    our_version = ibtrs_proto::PROTO_VERSION,
                    "protocol version mismatch"
                );
            }
            Ok(resp)
        }
        Message::Error(e) => Err(TransportError::Remote { errno: e.errno }),
        other => Err(TransportError::UnexpectedMessage(other.msg_type())),
    }
}

/// Routes completions of one path incarnation to its session.
struct PathHandler {
    sess: Weak<ClientSession>,
    idx: usize,
    generation: u64,
}

impl CompletionHandler for PathHandler {
    fn on_send_complete(&self, wr_id: u64, result: Result<(), RdmaError>) {
        if let Some(sess) = self.sess.upgrade() {
            sess.on_send_complete(wr_id, result);
        }
    }

    fn on_write_complete(&self, wr_id: u64, result: Result<(), RdmaError>) {
        if let Some(sess) = self.sess.upgrade() {
            sess.on_write_complete(wr_id, result);
        }
    }

    fn on_recv(&self, data: &[u8]) {
        if let Some(sess) = self.sess.upgrade() {
            sess.on_recv(data);
        }
    }

    fn on_write_imm(&self, imm: u32) {
        if let Some(sess) = self.sess.upgrade() {
            sess.on_write_imm(imm);
        }
    }

    fn on_heartbeat(&self) {
        if let Some(sess) = self.sess.upgrade() {
            sess.heartbeat.record_received();
        }
    }

    fn on_connection_lost(&self) {
        if let Some(sess) = self.sess.upgrade() {
            sess.path_down(self.idx, self.generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::heartbeat::ManualClock;
    use crate::loopback::LoopbackFabric;
    use crate::testkit::{ClientEvent, Harness, Reply, client_addr, server_addr, small_server};
    use crate::dispatch::ServerRdmaEvent;

    fn retry_every_second(max_attempts: i16) -> SessionConfig {
        SessionConfig {
            reconnect_delay_secs: 1,
            max_reconnect_attempts: max_attempts,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_write_and_request_write() {
        let mut h = Harness::new(small_server());
        let sess = h.client.open(server_addr(), SessionConfig::default()).await.unwrap();
        h.wait_session(SessionEvent::Connected).await;
        assert_eq!(sess.state(), SessionState::Ready);
        assert!(h.client.find_session(&server_addr()).is_some());

        let tag = sess.get_tag(0, 100).await.unwrap();
        sess.rdma_write(tag, OpCookie(1), b"hdr", &[&b"abc"[..], &b"defg"[..]])
            .unwrap();
        let (cookie, ev, status, data) = h.next_completion().await;
        assert_eq!(cookie, OpCookie(1));
        assert_eq!(ev, ClientRdmaEvent::RdmaWriteComplete);
        assert!(status.is_ok(), "{}", status);
        assert!(data.is_empty());
        {
            let requests = h.srv_ops.requests.lock();
            assert_eq!(requests.len(), 1);
            assert_eq!(requests[0].ev, ServerRdmaEvent::Recv);
            assert_eq!(requests[0].usr, b"hdr");
            assert_eq!(requests[0].data, b"abcdefg");
        }

        let tag = sess.get_tag(1, 64).await.unwrap();
        sess.request_rdma_write(tag, OpCookie(2), b"read", 8).unwrap();
        let (cookie, ev, status, data) = h.next_completion().await;
        assert_eq!(cookie, OpCookie(2));
        assert_eq!(ev, ClientRdmaEvent::RdmaRequestWriteComplete);
        assert!(status.is_ok(), "{}", status);
        assert_eq!(data, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(h.srv_ops.requests.lock()[1].usr, b"read");

        let attrs = sess.query().unwrap();
        assert_eq!(attrs.queue_depth, 8);
        assert_eq!(attrs.max_io_size, 4096);
        assert_eq!(attrs.max_inflight_msg, 4);
        assert_eq!(attrs.paths_up, 1);
    }

    #[tokio::test]
    async fn test_tags_exhaust_and_recycle() {
        let h = Harness::new(small_server());
        let sess = h.client.open(server_addr(), SessionConfig::default()).await.unwrap();

        let mut tags: Vec<Tag> = (0..8).map(|cpu| sess.try_get_tag(cpu, 1).unwrap()).collect();
        assert!(matches!(sess.try_get_tag(0, 1), Err(TransportError::NoResources)));
        tags.pop();
        let tag = sess.try_get_tag(3, 1).unwrap();
        assert!(matches!(
            sess.try_get_tag(0, 4097),
            Err(TransportError::IoTooLarge { size: 4097, max: 4096 })
        ));
        drop(tag);
        drop(tags);
        assert_eq!(
            (0..8).filter_map(|cpu| sess.try_get_tag(cpu, 1).ok()).count(),
            8
        );
    }

    #[tokio::test]
    async fn test_request_limits() {
        let h = Harness::new(small_server());
        let cfg = SessionConfig {
            max_segments: 2,
            ..Default::default()
        };
        let sess = h.client.open(server_addr(), cfg).await.unwrap();

        let tag = sess.try_get_tag(0, 1).unwrap();
        let segs: [&[u8]; 3] = [b"a", b"b", b"c"];
        assert!(matches!(
            sess.rdma_write(tag, OpCookie(1), b"", &segs),
            Err(TransportError::TooManySegments { count: 3, max: 2 })
        ));

        let tag = sess.try_get_tag(0, 1).unwrap();
        let usr = vec![0u8; MAX_USER_MSG_SIZE + 1];
        assert!(matches!(
            sess.rdma_write(tag, OpCookie(1), &usr, &[]),
            Err(TransportError::MsgTooLarge { .. })
        ));

        let tag = sess.try_get_tag(0, 1).unwrap();
        let big = vec![7u8; 4096];
        assert!(matches!(
            sess.rdma_write(tag, OpCookie(1), b"", &[&big[..]]),
            Err(TransportError::IoTooLarge { .. })
        ));
        assert!(matches!(
            sess.send(&usr),
            Err(TransportError::MsgTooLarge { .. })
        ));
        // Rejected requests hand their tags back.
        assert_eq!(
            (0..8).filter_map(|cpu| sess.try_get_tag(cpu, 1).ok()).count(),
            8
        );
    }

    #[tokio::test]
    async fn test_server_status_reaches_callback() {
        let mut h = Harness::new(small_server());
        let sess = h.client.open(server_addr(), SessionConfig::default()).await.unwrap();

        h.srv_ops.set_reply(Reply::Errno(libc::ENOSPC));
        let tag = sess.try_get_tag(0, 1).unwrap();
        sess.rdma_write(tag, OpCookie(3), b"", &[&b"x"[..]]).unwrap();
        let (cookie, _, status, _) = h.next_completion().await;
        assert_eq!(cookie, OpCookie(3));
        assert_eq!(status.code(), TransportCode::REMOTE_ERROR);
        assert_eq!(status.errno(), libc::ENOSPC);

        h.srv_ops.set_reply(Reply::Drop);
        let tag = sess.try_get_tag(0, 1).unwrap();
        sess.request_rdma_write(tag, OpCookie(4), b"", 16).unwrap();
        let (cookie, _, status, data) = h.next_completion().await;
        assert_eq!(cookie, OpCookie(4));
        assert_eq!(status.errno(), libc::EIO);
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_user_messages() {
        let mut h = Harness::new(small_server());
        let cfg = SessionConfig {
            hostname: Some("client-a".to_string()),
            ..Default::default()
        };
        let sess = h.client.open(server_addr(), cfg).await.unwrap();
        let srv = h.server.find_session(&sess.uuid()).unwrap();
        assert_eq!(srv.hostname().as_deref(), Some("client-a"));

        sess.send(b"ping").unwrap();
        assert_eq!(h.srv_ops.messages.lock().as_slice(), &[b"ping".to_vec()]);

        srv.send(b"pong").unwrap();
        loop {
            if let ClientEvent::Recv(msg) = h.next_event().await {
                assert_eq!(msg, b"pong");
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_open_failures_release_registration() {
        let fabric = LoopbackFabric::new();
        let client = IbtrsClient::new(fabric.connector(client_addr()), fabric.clone());
        assert!(matches!(
            client.open(server_addr(), SessionConfig::default()).await,
            Err(TransportError::NotRegistered)
        ));

        let h = Harness::new(small_server());
        h.fabric.set_unreachable(server_addr(), true);
        assert!(matches!(
            h.client.open(server_addr(), SessionConfig::default()).await,
            Err(TransportError::Rdma(RdmaError::Unreachable(_)))
        ));
        assert_eq!(h.client.session_count(), 0);
        assert_eq!(h.fabric.mapped_count(), 0);
        h.client.unregister().unwrap();
    }

    #[tokio::test]
    async fn test_registration_rules() {
        let h = Harness::new(small_server());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let other = Arc::new(crate::testkit::ClientRecorder::new(tx));
        assert!(matches!(
            h.client.register(other),
            Err(TransportError::AlreadyRegistered)
        ));

        let sess = h.client.open(server_addr(), SessionConfig::default()).await.unwrap();
        assert!(matches!(h.client.unregister(), Err(TransportError::SessionsOpen(1))));
        assert!(matches!(h.server.unregister(), Err(TransportError::SessionsOpen(1))));
        sess.close().await.unwrap();
        h.client.unregister().unwrap();
        h.server.unregister().unwrap();
    }

    #[tokio::test]
    async fn test_close_refused_while_referenced() {
        let h = Harness::new(small_server());
        let sess = h.client.open(server_addr(), SessionConfig::default()).await.unwrap();
        assert_eq!(h.server.session_count(), 1);

        sess.get();
        assert!(matches!(
            sess.close().await,
            Err(TransportError::SessionBusy { refs: 1 })
        ));
        assert_eq!(sess.state(), SessionState::Ready);
        sess.put();

        sess.close().await.unwrap();
        assert_eq!(sess.state(), SessionState::Destroyed);
        assert!(matches!(sess.close().await, Err(TransportError::SessionClosed)));
        assert!(matches!(sess.try_get_tag(0, 1), Err(TransportError::SessionClosed)));
        assert_eq!(h.client.session_count(), 0);

        // The server saw the path go and dropped its side.
        assert_eq!(h.server.session_count(), 0);
        let events = h.srv_ops.events.lock().clone();
        assert_eq!(
            events,
            vec![
                SessionEvent::Connected,
                SessionEvent::Disconnecting,
                SessionEvent::Disconnected
            ]
        );
        assert_eq!(h.fabric.mapped_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let mut h = Harness::new(small_server());
        let sess = h.client.open(server_addr(), retry_every_second(3)).await.unwrap();
        h.wait_session(SessionEvent::Connected).await;

        h.fabric.set_unreachable(server_addr(), true);
        assert_eq!(h.fabric.fail_all(&server_addr()), 1);
        h.wait_session(SessionEvent::Disconnected).await;
        assert!(matches!(sess.try_get_tag(0, 1), Err(TransportError::NotConnected)));

        h.wait_session(SessionEvent::MaxReconnectExceeded).await;
        assert_eq!(h.fabric.connect_attempts(), 1 + 3);
        assert_eq!(sess.state(), SessionState::Disconnected);
        assert!(sess.is_destroy_eligible());

        assert!(matches!(h.client.unregister(), Err(TransportError::SessionsOpen(1))));
        sess.close().await.unwrap();
        assert_eq!(h.client.session_count(), 0);
        h.client.unregister().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_restores_session() {
        let mut h = Harness::new(small_server());
        let sess = h.client.open(server_addr(), retry_every_second(-1)).await.unwrap();
        let first = h.server.find_session(&sess.uuid()).unwrap();

        h.fabric.fail_all(&server_addr());
        h.wait_session(SessionEvent::Disconnected).await;
        h.wait_session(SessionEvent::Reconnected).await;
        assert_eq!(sess.state(), SessionState::Ready);
        assert_eq!(h.fabric.connect_attempts(), 2);
        assert_eq!(first.state(), SessionState::Destroyed);

        let second = h.server.find_session(&sess.uuid()).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(h.server.session_count(), 1);

        let tag = sess.get_tag(0, 16).await.unwrap();
        sess.rdma_write(tag, OpCookie(9), b"again", &[]).unwrap();
        let (cookie, _, status, _) = h.next_completion().await;
        assert_eq!(cookie, OpCookie(9));
        assert!(status.is_ok(), "{}", status);
    }

    #[tokio::test]
    async fn test_in_flight_write_fails_when_path_lost() {
        let mut h = Harness::new(small_server());
        let sess = h.client.open(server_addr(), retry_every_second(0)).await.unwrap();

        let tag = sess.try_get_tag(0, 4).unwrap();
        h.fabric.set_hold(true);
        sess.rdma_write(tag, OpCookie(5), b"x", &[&b"data"[..]]).unwrap();
        assert_eq!(h.fabric.held_count(), 1);

        h.fabric.fail_all(&server_addr());
        h.fabric.set_hold(false);
        assert_eq!(h.fabric.flush(), 1);
        let (cookie, ev, status, _) = h.next_completion().await;
        assert_eq!(cookie, OpCookie(5));
        assert_eq!(ev, ClientRdmaEvent::RdmaWriteComplete);
        assert_eq!(status.code(), TransportCode::RDMA_ERROR);

        h.wait_session(SessionEvent::MaxReconnectExceeded).await;
        assert_eq!(h.fabric.connect_attempts(), 1);
        sess.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_fails_after_reconnect() {
        let mut h = Harness::new(small_server());
        h.srv_ops.set_reply(Reply::Hold);
        let sess = h.client.open(server_addr(), retry_every_second(-1)).await.unwrap();

        let tag = sess.try_get_tag(0, 4).unwrap();
        sess.rdma_write(tag, OpCookie(7), b"slow", &[]).unwrap();
        assert_eq!(h.srv_ops.held.lock().len(), 1);
        assert!(h.try_completion().is_none());

        h.fabric.fail_all(&server_addr());
        h.wait_session(SessionEvent::Reconnected).await;
        let (cookie, _, status, _) = h.next_completion().await;
        assert_eq!(cookie, OpCookie(7));
        assert_eq!(status.code(), TransportCode::CONNECTION_RESET);

        // The old server session is gone; its late answer goes nowhere.
        h.srv_ops.held.lock().clear();
        assert!(h.try_completion().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_still_in_fabric_keeps_tag_across_reconnect() {
        let mut h = Harness::new(small_server());
        let sess = h.client.open(server_addr(), retry_every_second(-1)).await.unwrap();
        let pools = sess.pools().unwrap();
        let qd = pools.tags.queue_depth() as usize;

        let tag = sess.try_get_tag(0, 4).unwrap();
        let id = tag.id();
        h.fabric.set_hold(true);
        sess.rdma_write(tag, OpCookie(7), b"x", &[&b"data"[..]]).unwrap();

        h.fabric.fail_all(&server_addr());
        h.wait_session(SessionEvent::Reconnected).await;
        assert!(h.try_completion().is_none());
        assert!(pools.tags.is_in_flight(id));
        assert_eq!(pools.tags.available(), qd - 1);

        h.fabric.set_hold(false);
        h.fabric.flush();
        let (cookie, _, status, _) = h.next_completion().await;
        assert_eq!(cookie, OpCookie(7));
        assert_eq!(status.code(), TransportCode::RDMA_ERROR);
        assert!(!pools.tags.is_in_flight(id));
        assert_eq!(pools.tags.available(), qd);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_depth_change_fails_reconnect() {
        let mut h = Harness::new(small_server());
        let sess = h.client.open(server_addr(), retry_every_second(1)).await.unwrap();

        let bigger = ServerConfig {
            queue_depth: 16,
            ..small_server()
        };
        let (server2, _ops2) = Harness::start_server(&h.fabric, bigger, Arc::new(MonotonicClock::new()));
        h.fabric.fail_all(&server_addr());
        h.wait_session(SessionEvent::MaxReconnectExceeded).await;
        assert_eq!(h.fabric.connect_attempts(), 2);
        assert_eq!(sess.state(), SessionState::Disconnected);
        assert_eq!(server2.session_count(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_disconnects() {
        let clock = Arc::new(ManualClock::new(0));
        let mut h = Harness::with_client_clock(small_server(), clock.clone());
        h.fabric.set_drop_heartbeats(true);
        let sess = h.client.open(server_addr(), retry_every_second(0)).await.unwrap();
        h.wait_session(SessionEvent::Connected).await;

        clock.advance(10_000);
        sess.heartbeat_tick();
        assert_eq!(sess.state(), SessionState::Ready);

        clock.advance(10_000);
        sess.heartbeat_tick();
        assert_eq!(sess.state(), SessionState::Disconnected);
        h.wait_session(SessionEvent::Disconnected).await;
        h.wait_session(SessionEvent::MaxReconnectExceeded).await;
        assert_eq!(h.server.session_count(), 0);
    }

    #[test]
    fn test_tag_wr_idx_keeps_incarnation() {
        let idx = tag_wr_idx(TagId(5), 0x1_0003);
        assert_eq!(idx & 0xffff, 5);
        assert_eq!(idx >> 16, 3);
    }
}
