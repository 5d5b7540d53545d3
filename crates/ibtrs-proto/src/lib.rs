//! Wire messages exchanged between the two ends of a session.
//!
//! Every inbound buffer goes through [`validate`] before any field is read;
//! [`decode`] validates on its own. Outbound messages are built with
//! [`Message::encode`], which fills type, size and version.

pub mod error;
pub mod imm;
pub mod message;

pub use error::ProtoError;
pub use imm::{Imm, decode_imm, encode_imm};
pub use message::{
    ConOpen, Descriptor, ErrorMsg, Message, MessageHeader, MsgType, RdmaWriteMsg, SessInfo,
    SessOpen, SessOpenResp, UserMsg, Validated, decode, validate,
};
pub use message::{
    CON_OPEN_SIZE, DESC_SIZE, ERROR_SIZE, HDR_SIZE, MAX_USER_MSG_SIZE, PROTO_VERSION,
    RDMA_WRITE_HDR_SIZE, SESS_INFO_SIZE, SESS_OPEN_RESP_BASE_SIZE, SESS_OPEN_SIZE,
};
