//! The RDMA capability the transport is written against.
//!
//! A provider supplies DMA mapping, path establishment and one-sided writes.
//! Completions come back through a [`CompletionHandler`] bound to the path.
//! Handlers run on the provider's completion context and must not block.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ibtrs_proto::Descriptor;
use ibtrs_types::{Address, ConId};

use crate::buf::IuBuf;
use crate::error::RdmaError;

/// Direction a buffer is mapped for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    ToDevice,
    FromDevice,
    Bidirectional,
}

/// Device address and key of a mapped buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaHandle {
    pub addr: u64,
    pub key: u32,
    pub len: u32,
}

impl DmaHandle {
    /// Descriptor for `len` bytes at `offset`, as advertised to the peer.
    pub fn desc(&self, offset: u32, len: u32) -> Descriptor {
        Descriptor {
            addr: self.addr + offset as u64,
            key: self.key,
            len,
        }
    }

    pub fn sge(&self, offset: u32, len: u32) -> Sge {
        Sge {
            addr: self.addr + offset as u64,
            key: self.key,
            len,
        }
    }
}

/// Scatter/gather element in local registered memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub key: u32,
    pub len: u32,
}

pub trait DmaMapper: Send + Sync {
    fn map(&self, buf: &Arc<IuBuf>, dir: DmaDirection) -> Result<DmaHandle, RdmaError>;

    fn unmap(&self, handle: &DmaHandle);
}

/// Work posted to a path. Posting never blocks; the outcome arrives as a
/// completion on the bound handler.
#[derive(Debug, Clone)]
pub enum WorkRequest {
    /// Two-sided send of a control or user message.
    Send { wr_id: u64, sge: Sge },
    /// One-sided write into `remote`, optionally with immediate data.
    /// An empty `local` list with an immediate is a pure notification.
    Write {
        wr_id: u64,
        local: Vec<Sge>,
        remote: Descriptor,
        imm: Option<u32>,
    },
    Heartbeat,
}

impl WorkRequest {
    pub fn wr_id(&self) -> Option<u64> {
        match self {
            WorkRequest::Send { wr_id, .. } | WorkRequest::Write { wr_id, .. } => Some(*wr_id),
            WorkRequest::Heartbeat => None,
        }
    }
}

/// Completion callbacks for one path.
pub trait CompletionHandler: Send + Sync {
    fn on_send_complete(&self, wr_id: u64, result: Result<(), RdmaError>);

    fn on_write_complete(&self, wr_id: u64, result: Result<(), RdmaError>);

    fn on_recv(&self, data: &[u8]);

    fn on_write_imm(&self, imm: u32);

    fn on_heartbeat(&self);

    /// The path went down. Posted work is flushed with errors.
    fn on_connection_lost(&self);
}

/// One established RDMA connection.
#[async_trait]
pub trait RdmaPath: Send + Sync {
    fn post(&self, wr: WorkRequest) -> Result<(), RdmaError>;

    /// Connection-setup request/reply. Only the initiating end may call it.
    async fn exchange(&self, request: Bytes) -> Result<Bytes, RdmaError>;

    /// Route completions on this path to `handler`.
    fn bind(&self, handler: Arc<dyn CompletionHandler>);

    fn close(&self);

    fn peer(&self) -> Address;

    fn is_up(&self) -> bool;
}

/// Client-side path establishment.
#[async_trait]
pub trait RdmaConnector: Send + Sync {
    async fn connect(
        &self,
        peer: &Address,
        con_id: ConId,
        handler: Arc<dyn CompletionHandler>,
    ) -> Result<Arc<dyn RdmaPath>, RdmaError>;
}

/// Server decision on an incoming connection request.
#[derive(Debug, Clone)]
pub enum AcceptOutcome {
    Accepted(Bytes),
    /// The reply carries the error; the provider tears the path down.
    Rejected(Bytes),
}

impl AcceptOutcome {
    pub fn reply(&self) -> &Bytes {
        match self {
            AcceptOutcome::Accepted(b) | AcceptOutcome::Rejected(b) => b,
        }
    }
}

/// Server-side hook invoked for every connection request.
pub trait ConnectionAcceptor: Send + Sync {
    fn accept(&self, path: Arc<dyn RdmaPath>, request: &[u8]) -> AcceptOutcome;
}
