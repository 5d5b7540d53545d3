//! Block-oriented RDMA transport.
//!
//! A client opens a session to a server over one or more paths. Each
//! session exposes `queue_depth` tags; a tag owns one pre-registered
//! buffer on both sides, so a request is a single RDMA write into the
//! server's buffer followed by an immediate carrying the tag id. The
//! server answers with an immediate (and, for request-writes, data written
//! back into the client's buffer).
//!
//! # Architecture
//!
//! - [`rdma`]: the verbs layer as traits (`DmaMapper`, `RdmaPath`,
//!   `RdmaConnector`, `ConnectionAcceptor`).
//! - [`loopback`]: an in-process fabric implementing those traits.
//! - [`tag`] / [`iu`]: tag pool and registered buffers.
//! - [`session`] / [`connection`] / [`heartbeat`]: session state, paths and
//!   liveness.
//! - [`client`] / [`server`]: the two roles; consumers plug in through
//!   [`dispatch`].

pub mod buf;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod heartbeat;
pub mod iu;
pub mod loopback;
pub mod rdma;
pub mod server;
pub mod session;
pub mod tag;

#[cfg(test)]
mod testkit;

pub use client::{ClientSession, IbtrsClient, SessionAttrs};
pub use config::{ReconnectBackoff, ServerConfig, SessionConfig};
pub use dispatch::{ClientOps, ClientRdmaEvent, ServerOps, ServerRdmaEvent, SessionEvent};
pub use error::{RdmaError, TransportError};
pub use heartbeat::{Clock, ManualClock, MonotonicClock};
pub use loopback::LoopbackFabric;
pub use rdma::{ConnectionAcceptor, DmaMapper, RdmaConnector, RdmaPath};
pub use server::{IbtrsServer, ServerOp, ServerSession};
pub use session::SessionState;
pub use tag::Tag;
