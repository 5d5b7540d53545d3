use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use clap::Parser;
use ibtrs::{
    ClientOps, ClientRdmaEvent, ClientSession, IbtrsClient, IbtrsServer, LoopbackFabric, ServerConfig,
    ServerOp, ServerOps, ServerRdmaEvent, ServerSession, SessionConfig, SessionEvent,
};
use ibtrs_logging::{LogConfig, init_logging};
use ibtrs_types::{Address, OpCookie, Status};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// Run a client and a server over the in-process fabric and report what
/// happened.
#[derive(Parser, Debug)]
#[command(name = "ibtrs-loopback", version, about)]
struct Args {
    /// Path to a TOML file with [log], [server] and [session] sections
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of requests to issue
    #[arg(short = 'n', long, default_value_t = 64)]
    requests: u64,

    /// Payload size per request in bytes
    #[arg(short, long, default_value_t = 4096)]
    size: usize,

    /// Take every path down halfway through and wait for the reconnect
    #[arg(long)]
    fail_path: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    dump_default_config: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct DemoConfig {
    log: LogConfig,
    server: ServerConfig,
    session: SessionConfig,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            server: ServerConfig::default(),
            session: SessionConfig {
                reconnect_delay_secs: 1,
                ..Default::default()
            },
        }
    }
}

impl DemoConfig {
    fn load(path: Option<&PathBuf>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Answers every request: received data is accepted, write requests get a
/// position-derived pattern.
struct PatternServer;

fn pattern(i: usize) -> u8 {
    (i % 251) as u8
}

impl ServerOps for PatternServer {
    fn rdma_ev(&self, _sess: &Arc<ServerSession>, ev: ServerRdmaEvent, mut op: ServerOp) {
        if ev == ServerRdmaEvent::WriteRequest {
            for (i, b) in op.data_mut().iter_mut().enumerate() {
                *b = pattern(i);
            }
        }
        op.respond(Status::ok());
    }

    fn sess_ev(&self, sess: &Arc<ServerSession>, ev: SessionEvent) {
        tracing::info!(session = %sess.uuid(), peer = %sess.addr(), event = ?ev, "server session event");
    }

    fn recv(&self, sess: &Arc<ServerSession>, msg: &[u8]) {
        tracing::info!(session = %sess.uuid(), len = msg.len(), "server got message");
    }
}

struct Completion {
    cookie: OpCookie,
    ev: ClientRdmaEvent,
    status: Status,
    data: Vec<u8>,
}

struct Collector {
    completions: UnboundedSender<Completion>,
    events: UnboundedSender<SessionEvent>,
}

impl ClientOps for Collector {
    fn rdma_ev(&self, cookie: OpCookie, ev: ClientRdmaEvent, status: Status, data: &[u8]) {
        let _ = self.completions.send(Completion {
            cookie,
            ev,
            status,
            data: data.to_vec(),
        });
    }

    fn sess_ev(&self, sess: &Arc<ClientSession>, ev: SessionEvent) {
        tracing::info!(session = %sess.uuid(), event = ?ev, "client session event");
        let _ = self.events.send(ev);
    }

    fn recv(&self, _sess: &Arc<ClientSession>, msg: &[u8]) {
        tracing::info!(len = msg.len(), "client got message");
    }
}

#[derive(Debug, Default)]
struct Summary {
    writes: u64,
    reads: u64,
    failed: u64,
    corrupt: u64,
    bytes: u64,
}

async fn wait_for(events: &mut UnboundedReceiver<SessionEvent>, want: SessionEvent, within: Duration) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(ev)) if ev == want => return Ok(()),
            Ok(Some(SessionEvent::MaxReconnectExceeded)) => bail!("session gave up reconnecting"),
            Ok(Some(_)) => continue,
            Ok(None) => bail!("client event channel closed"),
            Err(_) => bail!("no {:?} within {:?}", want, within),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = DemoConfig::load(args.config.as_ref())?;

    if args.dump_default_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }
    let _log_guard = init_logging(&config.log)?;

    let server_addr = Address::from_octets(192, 168, 0, 1, 1234);
    let client_addr = Address::from_octets(192, 168, 0, 2, 1234);
    let fabric = LoopbackFabric::new();

    let server = IbtrsServer::new(config.server.clone(), fabric.clone())?;
    server.register(Arc::new(PatternServer))?;
    fabric.listen(server_addr, server.clone());

    let (completions_tx, mut completions) = unbounded_channel();
    let (events_tx, mut events) = unbounded_channel();
    let client = IbtrsClient::new(fabric.connector(client_addr), fabric.clone());
    client.register(Arc::new(Collector {
        completions: completions_tx,
        events: events_tx,
    }))?;

    let sess = client.open(server_addr, config.session.clone()).await?;
    let attrs = sess.query()?;
    tracing::info!(
        queue_depth = attrs.queue_depth,
        max_io_size = attrs.max_io_size,
        paths = attrs.con_count,
        "session ready"
    );
    if args.size + 64 > attrs.max_io_size {
        bail!("--size {} does not fit max_io_size {}", args.size, attrs.max_io_size);
    }

    let payload: Vec<u8> = (0..args.size).map(pattern).collect();
    let reconnect_wait = Duration::from_secs(config.session.reconnect_delay_secs as u64 * 4 + 5);
    let mut summary = Summary::default();
    let started = Instant::now();

    for i in 0..args.requests {
        if args.fail_path && i == args.requests / 2 {
            let n = fabric.fail_all(&server_addr);
            tracing::warn!(paths = n, "injected path failure");
            wait_for(&mut events, SessionEvent::Reconnected, reconnect_wait).await?;
        }

        let tag = sess.get_tag(i as usize, args.size + 64).await?;
        let cookie = OpCookie(i);
        if i % 2 == 0 {
            sess.rdma_write(tag, cookie, &i.to_le_bytes(), &[&payload[..]])?;
        } else {
            sess.request_rdma_write(tag, cookie, &i.to_le_bytes(), args.size)?;
        }

        let done = tokio::time::timeout(Duration::from_secs(10), completions.recv())
            .await
            .context("request timed out")?
            .context("completion channel closed")?;
        if done.cookie != cookie {
            bail!("completion for {} while waiting for {}", done.cookie, cookie);
        }
        if !done.status.is_ok() {
            tracing::warn!(cookie = %done.cookie, status = %done.status, "request failed");
            summary.failed += 1;
            continue;
        }
        match done.ev {
            ClientRdmaEvent::RdmaWriteComplete => summary.writes += 1,
            ClientRdmaEvent::RdmaRequestWriteComplete => {
                summary.reads += 1;
                if done.data != payload {
                    summary.corrupt += 1;
                }
            }
        }
        summary.bytes += args.size as u64;
    }
    let elapsed = started.elapsed();

    sess.close().await?;
    client.unregister()?;
    server.close_all();
    server.unregister()?;

    println!("requests:  {}", args.requests);
    println!("writes:    {}", summary.writes);
    println!("reads:     {}", summary.reads);
    println!("failed:    {}", summary.failed);
    println!("corrupt:   {}", summary.corrupt);
    println!("bytes:     {}", summary.bytes);
    println!("elapsed:   {:?}", elapsed);
    println!("redials:   {}", fabric.connect_attempts().saturating_sub(attrs.con_count));

    if summary.corrupt > 0 {
        bail!("{} read results did not match", summary.corrupt);
    }
    Ok(())
}
