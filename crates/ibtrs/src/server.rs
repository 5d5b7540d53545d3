//! Server role: accepts sessions, dispatches incoming writes to the
//! consumer and writes responses back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use ibtrs_config::ConfigManager;
use ibtrs_logging::RateLimitedLog;
use ibtrs_proto::{
    ConOpen, Descriptor, ErrorMsg, HDR_SIZE, Imm, MAX_USER_MSG_SIZE, Message, MessageHeader,
    SessOpen, decode,
};
use ibtrs_types::{Address, ConId, Status};
use ibtrs_utils::BackgroundRunner;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::connection::{Connection, WrKind, decode_wr_id, encode_wr_id};
use crate::dispatch::{OpsRegistry, ServerOps, ServerRdmaEvent, SessionEvent};
use crate::error::{RdmaError, TransportError};
use crate::heartbeat::{Clock, Heartbeat, MonotonicClock};
use crate::iu::{Iu, MsgPool};
use crate::rdma::{
    AcceptOutcome, CompletionHandler, ConnectionAcceptor, DmaDirection, DmaMapper, RdmaPath,
    WorkRequest,
};
use crate::session::{SessionCore, SessionState};

pub struct IbtrsServer {
    config: ConfigManager<ServerConfig>,
    mapper: Arc<dyn DmaMapper>,
    registry: OpsRegistry<dyn ServerOps>,
    sessions: DashMap<Uuid, Arc<ServerSession>>,
    clock: Arc<dyn Clock>,
    me: Weak<IbtrsServer>,
}

impl IbtrsServer {
    pub fn new(config: ServerConfig, mapper: Arc<dyn DmaMapper>) -> Result<Arc<Self>, TransportError> {
        Self::with_clock(config, mapper, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(
        config: ServerConfig,
        mapper: Arc<dyn DmaMapper>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, TransportError> {
        let config = ConfigManager::new(config)?;
        Ok(Arc::new_cyclic(|me| Self {
            config,
            mapper,
            registry: OpsRegistry::new(),
            sessions: DashMap::new(),
            clock,
            me: me.clone(),
        }))
    }

    pub fn register(&self, ops: Arc<dyn ServerOps>) -> Result<(), TransportError> {
        self.registry.register(ops)
    }

    /// Refused while any session is open.
    pub fn unregister(&self) -> Result<(), TransportError> {
        self.registry.unregister()
    }

    pub fn config(&self) -> &ConfigManager<ServerConfig> {
        &self.config
    }

    pub fn find_session(&self, uuid: &Uuid) -> Option<Arc<ServerSession>> {
        self.sessions.get(uuid).map(|s| Arc::clone(s.value()))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Disconnect every session.
    pub fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.iter().map(|s| Arc::clone(s.value())).collect();
        for sess in sessions {
            sess.close();
        }
    }

    fn open_session(&self, path: Arc<dyn RdmaPath>, req: SessOpen) -> AcceptOutcome {
        let ops = match self.registry.acquire_for_session() {
            Ok(ops) => ops,
            Err(e) => {
                tracing::error!(peer = %path.peer(), error = %e, "session open refused");
                return reject(e.errno());
            }
        };
        if let Some((_, old)) = self.sessions.remove(&req.uuid) {
            tracing::info!(session = %req.uuid, peer = %path.peer(), "replacing existing session");
            old.disconnect("replaced by a new session");
        }

        let cfg = self.config.get_full();
        let sess = match ServerSession::new(self, &cfg, &req, path.peer(), ops) {
            Ok(sess) => Arc::new(sess),
            Err(e) => {
                tracing::error!(peer = %path.peer(), error = %e, "cannot allocate session buffers");
                self.registry.session_closed();
                return reject(e.errno());
            }
        };
        sess.attach_path(0, path);
        self.sessions.insert(req.uuid, Arc::clone(&sess));
        tracing::info!(
            session = %req.uuid,
            peer = %sess.addr(),
            paths = req.con_cnt,
            queue_depth = cfg.queue_depth,
            "session opened"
        );
        sess.start_heartbeat(cfg.heartbeat_interval());
        sess.emit(SessionEvent::Connected);
        AcceptOutcome::Accepted(sess.open_resp())
    }

    fn add_path(&self, path: Arc<dyn RdmaPath>, req: ConOpen) -> AcceptOutcome {
        let Some(sess) = self.find_session(&req.uuid) else {
            tracing::error!(session = %req.uuid, peer = %path.peer(), "path for unknown session");
            return reject(libc::ENOENT);
        };
        let idx = req.con_id.0 as usize;
        if idx >= sess.cons.len() {
            tracing::error!(session = %req.uuid, con = %req.con_id, "path index out of range");
            return reject(libc::EINVAL);
        }
        if sess.state() != SessionState::Ready {
            return reject(libc::ECONNRESET);
        }
        sess.attach_path(idx, path);
        tracing::info!(session = %req.uuid, con = %req.con_id, "path joined session");
        AcceptOutcome::Accepted(sess.open_resp())
    }
}

fn reject(errno: i32) -> AcceptOutcome {
    AcceptOutcome::Rejected(Message::Error(ErrorMsg { errno }).encode())
}

impl ConnectionAcceptor for IbtrsServer {
    fn accept(&self, path: Arc<dyn RdmaPath>, request: &[u8]) -> AcceptOutcome {
        match decode(request, None) {
            Ok((Message::SessOpen(req), _)) => self.open_session(path, req),
            Ok((Message::ConOpen(req), _)) => self.add_path(path, req),
            Ok((other, _)) => {
                tracing::error!(peer = %path.peer(), msg_type = %other.msg_type(), "unexpected connection request");
                reject(libc::EINVAL)
            }
            Err(e) => {
                tracing::error!(peer = %path.peer(), error = %e, "malformed connection request");
                reject(e.errno())
            }
        }
    }
}

pub struct ServerSession {
    core: SessionCore,
    server: Weak<IbtrsServer>,
    mapper: Arc<dyn DmaMapper>,
    ops: Arc<dyn ServerOps>,
    cons: Vec<Connection>,
    recv: Vec<Iu>,
    busy: Vec<AtomicBool>,
    msgs: MsgPool,
    max_io_size: u32,
    max_inflight_msg: u16,
    heartbeat: Heartbeat,
    hostname: RwLock<Option<String>>,
    runner: BackgroundRunner,
    error_log: RateLimitedLog,
}

impl ServerSession {
    fn new(
        server: &IbtrsServer,
        cfg: &ServerConfig,
        req: &SessOpen,
        addr: Address,
        ops: Arc<dyn ServerOps>,
    ) -> Result<Self, TransportError> {
        let mapper = server.mapper.as_ref();
        let recv = Iu::alloc_many(
            cfg.queue_depth as usize,
            cfg.max_io_size as usize,
            DmaDirection::Bidirectional,
            mapper,
        )?;
        let msgs = match MsgPool::new(cfg.max_inflight_msg as usize, HDR_SIZE + MAX_USER_MSG_SIZE, mapper) {
            Ok(msgs) => msgs,
            Err(e) => {
                for iu in &recv {
                    iu.unmap(mapper);
                }
                return Err(e.into());
            }
        };
        Ok(Self {
            core: SessionCore::new(req.uuid, addr, SessionState::Ready),
            server: server.me.clone(),
            mapper: Arc::clone(&server.mapper),
            ops,
            cons: (0..req.con_cnt as u16).map(|i| Connection::new(ConId(i))).collect(),
            busy: (0..recv.len()).map(|_| AtomicBool::new(false)).collect(),
            recv,
            msgs,
            max_io_size: cfg.max_io_size,
            max_inflight_msg: cfg.max_inflight_msg,
            heartbeat: Heartbeat::new(Arc::clone(&server.clock), cfg.heartbeat_timeout_ms as u64),
            hostname: RwLock::new(None),
            runner: BackgroundRunner::new("ibtrs-server-session"),
            error_log: RateLimitedLog::new(Duration::from_secs(5)),
        })
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

    /// Client hostname, once its session info arrived.
    pub fn hostname(&self) -> Option<String> {
        self.hostname.read().clone()
    }

    pub fn queue_depth(&self) -> u16 {
        self.recv.len() as u16
    }

    pub fn max_io_size(&self) -> u32 {
        self.max_io_size
    }

    pub fn paths_up(&self) -> usize {
        self.cons.iter().filter(|c| c.is_up()).count()
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

    fn open_resp(&self) -> Bytes {
        let descs = self
            .recv
            .iter()
            .map(|iu| iu.desc(0, iu.size()))
            .collect();
        Message::sess_open_resp(self.max_inflight_msg, self.max_io_size, descs).encode()
    }

    fn emit(self: &Arc<Self>, ev: SessionEvent) {
        tracing::debug!(session = %self.uuid(), peer = %self.addr(), event = ?ev, "session event");
        self.ops.sess_ev(self, ev);
    }

    fn attach_path(self: &Arc<Self>, idx: usize, path: Arc<dyn RdmaPath>) {
        let conn = &self.cons[idx];
        if let Some(old) = conn.detach(conn.generation()) {
            old.close();
        }
        let generation = conn.next_generation();
        path.bind(Arc::new(SrvPathHandler {
            sess: Arc::downgrade(self),
            idx,
            generation,
        }));
        conn.attach(path, generation);
        self.heartbeat.record_received();
    }

    fn start_heartbeat(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        self.runner.spawn_periodic(interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(sess) = weak.upgrade() {
                    sess.heartbeat_tick();
                }
            }
        });
    }

    pub(crate) fn heartbeat_tick(self: &Arc<Self>) {
        if self.state() != SessionState::Ready {
            return;
        }
        if let Some(server) = self.server.upgrade() {
            self.heartbeat
                .set_timeout(server.config.get().heartbeat_timeout_ms as u64);
        }
        if self.heartbeat.check_timeout() {
            tracing::error!(
                session = %self.uuid(),
                peer = %self.addr(),
                silent_ms = self.heartbeat.now_ms().saturating_sub(self.heartbeat.last_received_ms()),
                "heartbeat timeout"
            );
            self.disconnect("heartbeat timeout");
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

    fn pick_con(&self, preferred: usize) -> Option<&Connection> {
        let n = self.cons.len();
        (0..n).map(|k| &self.cons[(preferred + k) % n]).find(|c| c.is_up())
    }

    /// Send a user message to the client.
    pub fn send(&self, msg: &[u8]) -> Result<(), TransportError> {
        if self.state() != SessionState::Ready {
            return Err(TransportError::SessionClosed);
        }
        if msg.len() > MAX_USER_MSG_SIZE {
            return Err(TransportError::MsgTooLarge {
                size: msg.len(),
                max: MAX_USER_MSG_SIZE,
            });
        }
        let idx = self.msgs.try_get().ok_or(TransportError::NoResources)?;
        let Some(iu) = self.msgs.iu(idx) else {
            self.msgs.put(idx);
            return Err(TransportError::NoResources);
        };
        let bytes = Message::user(msg.to_vec()).encode();
        iu.buf().write_at(0, &bytes);
        let wr = WorkRequest::Send {
            wr_id: encode_wr_id(WrKind::Msg, idx as u32),
            sge: iu.sge(0, bytes.len()),
        };
        let posted = match self.pick_con(0) {
            Some(conn) => conn.post(wr),
            None => Err(RdmaError::PathDown),
        };
        if let Err(e) = posted {
            self.msgs.put(idx);
            return Err(e.into());
        }
        Ok(())
    }

    /// Close the session from the server side.
    pub fn close(self: &Arc<Self>) {
        self.disconnect("closed by server");
    }

    fn disconnect(self: &Arc<Self>, reason: &str) {
        if self.core.transition(SessionState::Destroyed).is_none() {
            return;
        }
        tracing::info!(session = %self.uuid(), peer = %self.addr(), reason, "disconnecting session");
        self.emit(SessionEvent::Disconnecting);
        self.runner.stop();
        for conn in &self.cons {
            if let Some(path) = conn.shutdown() {
                path.close();
            }
        }
        self.emit(SessionEvent::Disconnected);
        for iu in &self.recv {
            iu.unmap(self.mapper.as_ref());
        }
        self.msgs.unmap_all(self.mapper.as_ref());
        if let Some(server) = self.server.upgrade() {
            server
                .sessions
                .remove_if(&self.uuid(), |_, s| Arc::ptr_eq(s, self));
            server.registry.session_closed();
        }
    }

    fn path_down(self: &Arc<Self>, idx: usize, generation: u64) {
        let conn = &self.cons[idx];
        let Some(path) = conn.detach(generation) else {
            return;
        };
        path.close();
        tracing::warn!(session = %self.uuid(), peer = %self.addr(), con = %conn.con_id(), "path down");
        if !self.cons.iter().any(|c| c.is_up()) {
            self.disconnect("connection lost");
        }
    }

    // ---- inbound ----

    fn on_recv(self: &Arc<Self>, data: &[u8]) {
        self.heartbeat.record_received();
        match decode(data, None) {
            Ok((Message::SessInfo(info), _)) => {
                tracing::info!(session = %self.uuid(), hostname = %info.hostname, "client identified");
                *self.hostname.write() = Some(info.hostname);
            }
            Ok((Message::User(m), _)) => self.ops.recv(self, &m.payload),
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

    fn on_write_imm(self: &Arc<Self>, idx: usize, imm: u32) {
        self.heartbeat.record_received();
        if self.state() != SessionState::Ready {
            return;
        }
        let buf_id = Imm::decode(imm).buf_id;
        let slot = buf_id as usize;
        if slot >= self.recv.len() {
            if let Some(suppressed) = self.error_log.check() {
                tracing::error!(session = %self.uuid(), buf_id, suppressed, "write to unknown buffer");
            }
            self.answer_error(buf_id, idx, libc::EINVAL);
            return;
        }
        if self.busy[slot].swap(true, Ordering::AcqRel) {
            tracing::error!(session = %self.uuid(), buf_id, "write to a buffer still in use");
            self.answer_error(buf_id, idx, libc::EBUSY);
            return;
        }
        match self.parse_request(slot) {
            Ok((ev, usr, data, resp)) => {
                let op = ServerOp {
                    sess: Arc::clone(self),
                    buf_id,
                    con: idx,
                    usr,
                    data,
                    resp,
                    done: false,
                };
                self.ops.rdma_ev(self, ev, op);
            }
            Err(errno) => self.respond(buf_id, idx, errno, &[], &[]),
        }
    }

    /// Decode the request in receive buffer `slot`. Errors are the errno
    /// answered to the client.
    #[allow(clippy::type_complexity)]
    fn parse_request(
        &self,
        slot: usize,
    ) -> Result<(ServerRdmaEvent, Vec<u8>, Vec<u8>, Vec<Descriptor>), i32> {
        let iu = &self.recv[slot];
        let buf = iu.buf();
        let fail = |e: &dyn std::fmt::Display| {
            if let Some(suppressed) = self.error_log.check() {
                tracing::error!(session = %self.uuid(), buf_id = slot, error = %e, suppressed, "invalid request");
            }
            libc::EINVAL
        };
        let hdr = buf.read_at(0, HDR_SIZE).ok_or(libc::EINVAL)?;
        let tsize = MessageHeader::peek(&hdr).map_err(|e| fail(&e))?.tsize as usize;
        let raw = buf
            .read_at(0, tsize)
            .ok_or_else(|| fail(&format!("declared size {} exceeds buffer", tsize)))?;
        let (msg, _) = decode(&raw, None).map_err(|e| fail(&e))?;
        let (ev, w) = match msg {
            Message::RdmaWrite(w) => (ServerRdmaEvent::Recv, w),
            Message::ReqRdmaWrite(w) => (ServerRdmaEvent::WriteRequest, w),
            other => return Err(fail(&format!("unexpected {} in receive buffer", other.msg_type()))),
        };
        let usr = buf
            .read_at(tsize, w.usr_len as usize)
            .ok_or_else(|| fail(&"user message exceeds buffer"))?;

        match ev {
            ServerRdmaEvent::Recv => {
                let mut data = Vec::new();
                for d in &w.descs {
                    buf.with_range(d.addr as usize, d.len as usize, |s| data.extend_from_slice(s))
                        .ok_or_else(|| fail(&format!("segment {:#x}+{} outside buffer", d.addr, d.len)))?;
                }
                Ok((ev, usr, data, Vec::new()))
            }
            ServerRdmaEvent::WriteRequest => {
                let want: usize = w.descs.iter().map(|d| d.len as usize).sum();
                if want > iu.size() {
                    return Err(fail(&format!("response of {} bytes exceeds buffer", want)));
                }
                Ok((ev, usr, vec![0; want], w.descs))
            }
        }
    }

    /// Answer buffer `buf_id`: copy `data` out through the client's
    /// descriptors, then notify with the status in the immediate.
    fn respond(&self, buf_id: u16, con: usize, errno: i32, data: &[u8], descs: &[Descriptor]) {
        let slot = buf_id as usize;
        if self.state() != SessionState::Ready {
            self.busy[slot].store(false, Ordering::Release);
            return;
        }
        let iu = &self.recv[slot];
        let wr_id = encode_wr_id(WrKind::Resp, buf_id as u32);
        let mut writes = Vec::new();
        if errno == 0 && !data.is_empty() && !descs.is_empty() {
            iu.buf().write_at(0, data);
            let mut off = 0usize;
            for d in descs {
                let len = (d.len as usize).min(data.len() - off);
                if len == 0 {
                    continue;
                }
                writes.push(WorkRequest::Write {
                    wr_id,
                    local: vec![iu.sge(off, len)],
                    remote: Descriptor {
                        addr: d.addr,
                        key: d.key,
                        len: len as u32,
                    },
                    imm: None,
                });
                off += len;
            }
        }
        let imm = Imm::new(buf_id, errno).encode();
        match writes.last_mut() {
            Some(WorkRequest::Write { imm: last, .. }) => *last = Some(imm),
            _ => writes.push(WorkRequest::Write {
                wr_id,
                local: Vec::new(),
                remote: Descriptor::default(),
                imm: Some(imm),
            }),
        }

        let Some(conn) = self.pick_con(con) else {
            self.busy[slot].store(false, Ordering::Release);
            tracing::warn!(session = %self.uuid(), buf_id, "no path for response");
            return;
        };
        let last = writes.len() - 1;
        for (i, wr) in writes.into_iter().enumerate() {
            // The client may reuse the buffer as soon as it sees the
            // immediate.
            if i == last {
                self.busy[slot].store(false, Ordering::Release);
            }
            if let Err(e) = conn.post(wr) {
                tracing::error!(session = %self.uuid(), buf_id, error = %e, "response post failed");
                self.busy[slot].store(false, Ordering::Release);
                return;
            }
        }
    }

    /// Error immediate for a write that was never dispatched. The buffer's
    /// busy flag belongs to whoever holds it and is left alone.
    fn answer_error(&self, buf_id: u16, con: usize, errno: i32) {
        let wr = WorkRequest::Write {
            wr_id: encode_wr_id(WrKind::Resp, buf_id as u32),
            local: Vec::new(),
            remote: Descriptor::default(),
            imm: Some(Imm::new(buf_id, errno).encode()),
        };
        let posted = match self.pick_con(con) {
            Some(conn) => conn.post(wr),
            None => Err(RdmaError::PathDown),
        };
        if let Err(e) = posted {
            tracing::warn!(session = %self.uuid(), buf_id, errno, error = %e, "error response not sent");
        }
    }

    fn on_write_complete(&self, wr_id: u64, result: Result<(), RdmaError>) {
        if let Err(e) = result {
            if let Some(suppressed) = self.error_log.check() {
                tracing::error!(session = %self.uuid(), wr = ?decode_wr_id(wr_id), error = %e, suppressed, "response write failed");
            }
        }
    }

    fn on_send_complete(&self, wr_id: u64, result: Result<(), RdmaError>) {
        match decode_wr_id(wr_id) {
            Some((WrKind::Msg, idx)) => {
                if let Err(e) = result {
                    tracing::warn!(session = %self.uuid(), error = %e, "message send failed");
                }
                self.msgs.put(idx as usize);
            }
            _ => tracing::error!(session = %self.uuid(), wr_id, "unexpected send completion"),
        }
    }
}

/// A received request awaiting the consumer's answer.
pub struct ServerOp {
    sess: Arc<ServerSession>,
    buf_id: u16,
    con: usize,
    usr: Vec<u8>,
    data: Vec<u8>,
    resp: Vec<Descriptor>,
    done: bool,
}

impl ServerOp {
    pub fn buf_id(&self) -> u16 {
        self.buf_id
    }

    pub fn usr_msg(&self) -> &[u8] {
        &self.usr
    }

    /// Data written by the client, or the response area for a write
    /// request.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn respond(mut self, status: Status) {
        self.finish(status.errno());
    }

    fn finish(&mut self, errno: i32) {
        self.done = true;
        let data = std::mem::take(&mut self.data);
        self.sess
            .respond(self.buf_id, self.con, errno, &data, &self.resp);
    }
}

impl Drop for ServerOp {
    fn drop(&mut self) {
        if !self.done {
            tracing::warn!(session = %self.sess.uuid(), buf_id = self.buf_id, "request dropped without response");
            self.finish(libc::EIO);
        }
    }
}

impl std::fmt::Debug for ServerOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerOp")
            .field("session", &self.sess.uuid())
            .field("buf_id", &self.buf_id)
            .field("usr_len", &self.usr.len())
            .field("data_len", &self.data.len())
            .finish()
    }
}

struct SrvPathHandler {
    sess: Weak<ServerSession>,
    idx: usize,
    generation: u64,
}

impl CompletionHandler for SrvPathHandler {
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
            sess.on_write_imm(self.idx, imm);
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
