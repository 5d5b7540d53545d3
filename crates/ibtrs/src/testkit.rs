//! Recording consumers and a loopback client/server pair for tests.

use std::sync::Arc;
use std::time::Duration;

use ibtrs_types::{Address, OpCookie, Status};
use parking_lot::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::client::{ClientSession, IbtrsClient};
use crate::config::ServerConfig;
use crate::dispatch::{ClientOps, ClientRdmaEvent, ServerOps, ServerRdmaEvent, SessionEvent};
use crate::heartbeat::{Clock, MonotonicClock};
use crate::loopback::LoopbackFabric;
use crate::server::{IbtrsServer, ServerOp, ServerSession};

pub fn server_addr() -> Address {
    Address::from_octets(10, 0, 0, 1, 7000)
}

pub fn client_addr() -> Address {
    Address::from_octets(10, 0, 0, 2, 7001)
}

#[derive(Debug)]
pub enum ClientEvent {
    Rdma {
        cookie: OpCookie,
        ev: ClientRdmaEvent,
        status: Status,
        data: Vec<u8>,
    },
    Session(SessionEvent),
    Recv(Vec<u8>),
}

pub struct ClientRecorder {
    tx: UnboundedSender<ClientEvent>,
}

impl ClientRecorder {
    pub fn new(tx: UnboundedSender<ClientEvent>) -> Self {
        Self { tx }
    }
}

impl ClientOps for ClientRecorder {
    fn rdma_ev(&self, cookie: OpCookie, ev: ClientRdmaEvent, status: Status, data: &[u8]) {
        let _ = self.tx.send(ClientEvent::Rdma {
            cookie,
            ev,
            status,
            data: data.to_vec(),
        });
    }

    fn sess_ev(&self, _sess: &Arc<ClientSession>, ev: SessionEvent) {
        let _ = self.tx.send(ClientEvent::Session(ev));
    }

    fn recv(&self, _sess: &Arc<ClientSession>, msg: &[u8]) {
        let _ = self.tx.send(ClientEvent::Recv(msg.to_vec()));
    }
}

/// How the recording server answers requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Succeed; write requests get bytes 1, 2, 3, ...
    Ok,
    /// Fail with this errno.
    Errno(i32),
    /// Keep the op unanswered.
    Hold,
    /// Drop the op without answering.
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub ev: ServerRdmaEvent,
    pub usr: Vec<u8>,
    pub data: Vec<u8>,
}

pub struct ServerRecorder {
    pub reply: Mutex<Reply>,
    pub requests: Mutex<Vec<Request>>,
    pub held: Mutex<Vec<ServerOp>>,
    pub events: Mutex<Vec<SessionEvent>>,
    pub messages: Mutex<Vec<Vec<u8>>>,
}

impl ServerRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            reply: Mutex::new(Reply::Ok),
            requests: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
        })
    }

    pub fn set_reply(&self, reply: Reply) {
        *self.reply.lock() = reply;
    }
}

impl ServerOps for ServerRecorder {
    fn rdma_ev(&self, _sess: &Arc<ServerSession>, ev: ServerRdmaEvent, mut op: ServerOp) {
        self.requests.lock().push(Request {
            ev,
            usr: op.usr_msg().to_vec(),
            data: op.data().to_vec(),
        });
        let reply = *self.reply.lock();
        match reply {
            Reply::Ok => {
                if ev == ServerRdmaEvent::WriteRequest {
                    for (i, b) in op.data_mut().iter_mut().enumerate() {
                        *b = (i + 1) as u8;
                    }
                }
                op.respond(Status::ok());
            }
            Reply::Errno(errno) => op.respond(Status::from_remote_errno(errno)),
            Reply::Hold => self.held.lock().push(op),
            Reply::Drop => drop(op),
        }
    }

    fn sess_ev(&self, _sess: &Arc<ServerSession>, ev: SessionEvent) {
        self.events.lock().push(ev);
    }

    fn recv(&self, _sess: &Arc<ServerSession>, msg: &[u8]) {
        self.messages.lock().push(msg.to_vec());
    }
}

pub struct Harness {
    pub fabric: Arc<LoopbackFabric>,
    pub server: Arc<IbtrsServer>,
    pub srv_ops: Arc<ServerRecorder>,
    pub client: Arc<IbtrsClient>,
    pub events: UnboundedReceiver<ClientEvent>,
}

impl Harness {
    pub fn new(config: ServerConfig) -> Self {
        Self::build(config, Arc::new(MonotonicClock::new()), Arc::new(MonotonicClock::new()))
    }

    pub fn with_server_clock(config: ServerConfig, clock: Arc<dyn Clock>) -> Self {
        Self::build(config, clock, Arc::new(MonotonicClock::new()))
    }

    pub fn with_client_clock(config: ServerConfig, clock: Arc<dyn Clock>) -> Self {
        Self::build(config, Arc::new(MonotonicClock::new()), clock)
    }

    fn build(config: ServerConfig, server_clock: Arc<dyn Clock>, client_clock: Arc<dyn Clock>) -> Self {
        let fabric = LoopbackFabric::new();
        let (server, srv_ops) = Self::start_server(&fabric, config, server_clock);
        let client = IbtrsClient::with_clock(fabric.connector(client_addr()), fabric.clone(), client_clock);
        let (tx, events) = unbounded_channel();
        client.register(Arc::new(ClientRecorder::new(tx))).unwrap();
        Self {
            fabric,
            server,
            srv_ops,
            client,
            events,
        }
    }

    /// Start a server on the fabric, replacing any listener at the address.
    pub fn start_server(
        fabric: &Arc<LoopbackFabric>,
        config: ServerConfig,
        clock: Arc<dyn Clock>,
    ) -> (Arc<IbtrsServer>, Arc<ServerRecorder>) {
        let server = IbtrsServer::with_clock(config, fabric.clone(), clock).unwrap();
        let srv_ops = ServerRecorder::new();
        server.register(srv_ops.clone()).unwrap();
        fabric.listen(server_addr(), server.clone());
        (server, srv_ops)
    }

    pub async fn next_event(&mut self) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(600), self.events.recv())
            .await
            .expect("timed out waiting for a client event")
            .expect("event channel closed")
    }

    /// Skip events until `want` arrives.
    pub async fn wait_session(&mut self, want: SessionEvent) {
        loop {
            if let ClientEvent::Session(ev) = self.next_event().await {
                if ev == want {
                    return;
                }
            }
        }
    }

    pub async fn next_completion(&mut self) -> (OpCookie, ClientRdmaEvent, Status, Vec<u8>) {
        loop {
            if let ClientEvent::Rdma {
                cookie,
                ev,
                status,
                data,
            } = self.next_event().await
            {
                return (cookie, ev, status, data);
            }
        }
    }

    pub fn try_completion(&mut self) -> Option<(OpCookie, Status)> {
        while let Ok(ev) = self.events.try_recv() {
            if let ClientEvent::Rdma { cookie, status, .. } = ev {
                return Some((cookie, status));
            }
        }
        None
    }
}

pub fn small_server() -> ServerConfig {
    ServerConfig {
        queue_depth: 8,
        max_inflight_msg: 4,
        max_io_size: 4096,
        ..Default::default()
    }
}
