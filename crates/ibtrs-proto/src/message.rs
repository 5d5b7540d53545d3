use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use ibtrs_types::{ConId, MAX_HOSTNAME_LEN};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use uuid::Uuid;

use crate::error::ProtoError;

pub const PROTO_VERSION: u8 = 1;

/// Common header: `type u16, tsize u32`.
pub const HDR_SIZE: usize = 6;
pub const DESC_SIZE: usize = 16;

pub const SESS_OPEN_SIZE: usize = HDR_SIZE + 2 + 16;
pub const SESS_OPEN_RESP_BASE_SIZE: usize = HDR_SIZE + 12;
pub const CON_OPEN_SIZE: usize = HDR_SIZE + 16 + 2;
pub const SESS_INFO_SIZE: usize = HDR_SIZE + MAX_HOSTNAME_LEN;
pub const ERROR_SIZE: usize = HDR_SIZE + 4;
pub const RDMA_WRITE_HDR_SIZE: usize = HDR_SIZE + 2;

/// Cap on the opaque payload of a user message.
pub const MAX_USER_MSG_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum MsgType {
    SessOpen = 1,
    SessOpenResp = 2,
    ConOpen = 3,
    SessInfo = 4,
    Error = 5,
    User = 6,
    RdmaWrite = 7,
    ReqRdmaWrite = 8,
}

impl MsgType {
    pub fn name(self) -> &'static str {
        match self {
            MsgType::SessOpen => "SESS_OPEN",
            MsgType::SessOpenResp => "SESS_OPEN_RESP",
            MsgType::ConOpen => "CON_OPEN",
            MsgType::SessInfo => "SESS_INFO",
            MsgType::Error => "ERROR",
            MsgType::User => "USER",
            MsgType::RdmaWrite => "RDMA_WRITE",
            MsgType::ReqRdmaWrite => "REQ_RDMA_WRITE",
        }
    }

    /// Exact size for fixed-size types.
    fn fixed_size(self) -> Option<usize> {
        match self {
            MsgType::SessOpen => Some(SESS_OPEN_SIZE),
            MsgType::ConOpen => Some(CON_OPEN_SIZE),
            MsgType::SessInfo => Some(SESS_INFO_SIZE),
            MsgType::Error => Some(ERROR_SIZE),
            _ => None,
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Header prepended to every wire message, little-endian.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub msg_type: u16,
    /// Total size including the header.
    pub tsize: u32,
}

impl MessageHeader {
    pub fn from_bytes(data: &[u8; HDR_SIZE]) -> Self {
        Self {
            msg_type: LittleEndian::read_u16(&data[0..2]),
            tsize: LittleEndian::read_u32(&data[2..6]),
        }
    }

    pub fn to_bytes(&self) -> [u8; HDR_SIZE] {
        let mut buf = [0u8; HDR_SIZE];
        LittleEndian::write_u16(&mut buf[0..2], self.msg_type);
        LittleEndian::write_u32(&mut buf[2..6], self.tsize);
        buf
    }

    /// Read the header at the start of `buf`.
    pub fn peek(buf: &[u8]) -> Result<Self, ProtoError> {
        let data: &[u8; HDR_SIZE] = buf
            .get(..HDR_SIZE)
            .and_then(|s| s.try_into().ok())
            .ok_or(ProtoError::Truncated {
                need: HDR_SIZE,
                have: buf.len(),
            })?;
        Ok(Self::from_bytes(data))
    }
}

/// A remote memory region: where to read or write, and the key that
/// authorizes it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: u64,
    pub key: u32,
    pub len: u32,
}

impl Descriptor {
    fn read(buf: &[u8]) -> Self {
        Self {
            addr: LittleEndian::read_u64(&buf[0..8]),
            key: LittleEndian::read_u32(&buf[8..12]),
            len: LittleEndian::read_u32(&buf[12..16]),
        }
    }

    fn put(&self, out: &mut BytesMut) {
        out.put_u64_le(self.addr);
        out.put_u32_le(self.key);
        out.put_u32_le(self.len);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessOpen {
    pub ver: u8,
    pub con_cnt: u8,
    pub uuid: Uuid,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessOpenResp {
    pub ver: u8,
    pub queue_depth: u16,
    pub max_inflight_msg: u16,
    pub max_io_size: u32,
    /// One receive buffer per tag slot.
    pub descs: Vec<Descriptor>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConOpen {
    pub uuid: Uuid,
    pub con_id: ConId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessInfo {
    pub hostname: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorMsg {
    pub errno: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserMsg {
    pub payload: Bytes,
}

/// Header of an RDMA-write or request-RDMA-write: the length of the user
/// message that follows it, and the data segments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RdmaWriteMsg {
    pub usr_len: u16,
    pub descs: Vec<Descriptor>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    SessOpen(SessOpen),
    SessOpenResp(SessOpenResp),
    ConOpen(ConOpen),
    SessInfo(SessInfo),
    Error(ErrorMsg),
    User(UserMsg),
    RdmaWrite(RdmaWriteMsg),
    ReqRdmaWrite(RdmaWriteMsg),
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::SessOpen(_) => MsgType::SessOpen,
            Message::SessOpenResp(_) => MsgType::SessOpenResp,
            Message::ConOpen(_) => MsgType::ConOpen,
            Message::SessInfo(_) => MsgType::SessInfo,
            Message::Error(_) => MsgType::Error,
            Message::User(_) => MsgType::User,
            Message::RdmaWrite(_) => MsgType::RdmaWrite,
            Message::ReqRdmaWrite(_) => MsgType::ReqRdmaWrite,
        }
    }

    pub fn sess_open(uuid: Uuid, con_cnt: u8) -> Self {
        Message::SessOpen(SessOpen {
            ver: PROTO_VERSION,
            con_cnt,
            uuid,
        })
    }

    pub fn sess_open_resp(max_inflight_msg: u16, max_io_size: u32, descs: Vec<Descriptor>) -> Self {
        Message::SessOpenResp(SessOpenResp {
            ver: PROTO_VERSION,
            queue_depth: descs.len() as u16,
            max_inflight_msg,
            max_io_size,
            descs,
        })
    }

    pub fn user(payload: impl Into<Bytes>) -> Self {
        Message::User(UserMsg {
            payload: payload.into(),
        })
    }

    /// Total encoded size.
    pub fn tsize(&self) -> usize {
        match self {
            Message::SessOpenResp(m) => SESS_OPEN_RESP_BASE_SIZE + m.descs.len() * DESC_SIZE,
            Message::User(m) => HDR_SIZE + m.payload.len(),
            Message::RdmaWrite(m) | Message::ReqRdmaWrite(m) => {
                RDMA_WRITE_HDR_SIZE + m.descs.len() * DESC_SIZE
            }
            other => other.msg_type().fixed_size().unwrap_or(HDR_SIZE),
        }
    }

    /// Serialize, filling type and total size.
    pub fn encode(&self) -> Bytes {
        let tsize = self.tsize();
        let mut out = BytesMut::with_capacity(tsize);
        out.put_slice(
            &MessageHeader {
                msg_type: self.msg_type().into(),
                tsize: tsize as u32,
            }
            .to_bytes(),
        );
        match self {
            Message::SessOpen(m) => {
                out.put_u8(m.ver);
                out.put_u8(m.con_cnt);
                out.put_slice(m.uuid.as_bytes());
            }
            Message::SessOpenResp(m) => {
                out.put_u8(m.ver);
                out.put_u8(0);
                out.put_u16_le(m.queue_depth);
                out.put_u16_le(m.max_inflight_msg);
                out.put_u32_le(m.max_io_size);
                out.put_u16_le(m.descs.len() as u16);
                for d in &m.descs {
                    d.put(&mut out);
                }
            }
            Message::ConOpen(m) => {
                out.put_slice(m.uuid.as_bytes());
                out.put_u16_le(m.con_id.0);
            }
            Message::SessInfo(m) => {
                let name = ibtrs_types::truncate_hostname(&m.hostname);
                out.put_slice(name.as_bytes());
                out.put_bytes(0, MAX_HOSTNAME_LEN - name.len());
            }
            Message::Error(m) => out.put_i32_le(m.errno),
            Message::User(m) => out.put_slice(&m.payload),
            Message::RdmaWrite(m) | Message::ReqRdmaWrite(m) => {
                out.put_u16_le(m.usr_len);
                for d in &m.descs {
                    d.put(&mut out);
                }
            }
        }
        debug_assert_eq!(out.len(), tsize);
        out.freeze()
    }
}

/// Result of a successful validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Validated {
    pub msg_type: MsgType,
    pub tsize: usize,
    /// Set when a session-open response carries a version other than ours.
    /// Tolerated; the caller logs it.
    pub version_mismatch: Option<u8>,
}

/// Check `buf` against the wire rules without interpreting it further.
///
/// `expected_queue_depth` is the depth negotiated earlier in this session's
/// life; a session-open response that disagrees with it is rejected.
pub fn validate(buf: &[u8], expected_queue_depth: Option<u16>) -> Result<Validated, ProtoError> {
    let hdr = MessageHeader::peek(buf)?;
    let msg_type = MsgType::try_from(hdr.msg_type).map_err(|_| ProtoError::UnknownType(hdr.msg_type))?;
    let tsize = hdr.tsize as usize;
    if tsize < HDR_SIZE {
        return Err(ProtoError::TooShort {
            msg_type,
            declared: tsize,
            min: HDR_SIZE,
        });
    }
    if tsize > buf.len() {
        return Err(ProtoError::Truncated {
            need: tsize,
            have: buf.len(),
        });
    }
    if let Some(expected) = msg_type.fixed_size() {
        if tsize != expected {
            return Err(ProtoError::SizeMismatch {
                msg_type,
                declared: tsize,
                expected,
            });
        }
    }

    let mut version_mismatch = None;
    match msg_type {
        MsgType::SessOpen => {
            let ver = buf[HDR_SIZE];
            if ver != PROTO_VERSION {
                return Err(ProtoError::VersionNotSupported {
                    got: ver,
                    expected: PROTO_VERSION,
                });
            }
            if buf[HDR_SIZE + 1] == 0 {
                return Err(ProtoError::InvalidField {
                    msg_type,
                    field: "con_cnt",
                    reason: "must be at least 1".into(),
                });
            }
        }
        MsgType::SessOpenResp => {
            if tsize < SESS_OPEN_RESP_BASE_SIZE {
                return Err(ProtoError::TooShort {
                    msg_type,
                    declared: tsize,
                    min: SESS_OPEN_RESP_BASE_SIZE,
                });
            }
            let ver = buf[HDR_SIZE];
            let queue_depth = LittleEndian::read_u16(&buf[8..10]);
            let max_inflight_msg = LittleEndian::read_u16(&buf[10..12]);
            let cnt = LittleEndian::read_u16(&buf[16..18]);
            let expected = SESS_OPEN_RESP_BASE_SIZE + cnt as usize * DESC_SIZE;
            if tsize != expected {
                return Err(ProtoError::SizeMismatch {
                    msg_type,
                    declared: tsize,
                    expected,
                });
            }
            if max_inflight_msg == 0 {
                return Err(ProtoError::InvalidField {
                    msg_type,
                    field: "max_inflight_msg",
                    reason: "must be at least 1".into(),
                });
            }
            if queue_depth == 0 {
                return Err(ProtoError::InvalidField {
                    msg_type,
                    field: "queue_depth",
                    reason: "must be at least 1".into(),
                });
            }
            if cnt != queue_depth {
                return Err(ProtoError::QueueDepthMismatch {
                    got: cnt,
                    expected: queue_depth,
                });
            }
            if let Some(expected) = expected_queue_depth {
                if queue_depth != expected {
                    return Err(ProtoError::QueueDepthMismatch {
                        got: queue_depth,
                        expected,
                    });
                }
            }
            if ver != PROTO_VERSION {
                version_mismatch = Some(ver);
            }
        }
        MsgType::User => {
            if tsize > HDR_SIZE + MAX_USER_MSG_SIZE {
                return Err(ProtoError::TooLarge {
                    msg_type,
                    declared: tsize,
                    max: HDR_SIZE + MAX_USER_MSG_SIZE,
                });
            }
        }
        MsgType::RdmaWrite | MsgType::ReqRdmaWrite => {
            if tsize <= RDMA_WRITE_HDR_SIZE {
                return Err(ProtoError::TooShort {
                    msg_type,
                    declared: tsize,
                    min: RDMA_WRITE_HDR_SIZE + 1,
                });
            }
            if (tsize - RDMA_WRITE_HDR_SIZE) % DESC_SIZE != 0 {
                return Err(ProtoError::InvalidField {
                    msg_type,
                    field: "tsize",
                    reason: format!("{} bytes is not a whole number of descriptors", tsize - RDMA_WRITE_HDR_SIZE),
                });
            }
        }
        MsgType::ConOpen | MsgType::SessInfo | MsgType::Error => {}
    }

    Ok(Validated {
        msg_type,
        tsize,
        version_mismatch,
    })
}

fn read_uuid(buf: &[u8]) -> Uuid {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&buf[..16]);
    Uuid::from_bytes(raw)
}

fn read_descs(buf: &[u8]) -> Vec<Descriptor> {
    buf.chunks_exact(DESC_SIZE).map(Descriptor::read).collect()
}

/// Validate `buf`, then decode it into a typed message.
pub fn decode(buf: &[u8], expected_queue_depth: Option<u16>) -> Result<(Message, Validated), ProtoError> {
    let v = validate(buf, expected_queue_depth)?;
    let body = &buf[HDR_SIZE..v.tsize];
    let msg = match v.msg_type {
        MsgType::SessOpen => Message::SessOpen(SessOpen {
            ver: body[0],
            con_cnt: body[1],
            uuid: read_uuid(&body[2..]),
        }),
        MsgType::SessOpenResp => Message::SessOpenResp(SessOpenResp {
            ver: body[0],
            queue_depth: LittleEndian::read_u16(&body[2..4]),
            max_inflight_msg: LittleEndian::read_u16(&body[4..6]),
            max_io_size: LittleEndian::read_u32(&body[6..10]),
            descs: read_descs(&body[12..]),
        }),
        MsgType::ConOpen => Message::ConOpen(ConOpen {
            uuid: read_uuid(body),
            con_id: ConId(LittleEndian::read_u16(&body[16..18])),
        }),
        MsgType::SessInfo => {
            let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
            let hostname = std::str::from_utf8(&body[..end]).map_err(|e| ProtoError::InvalidField {
                msg_type: v.msg_type,
                field: "hostname",
                reason: e.to_string(),
            })?;
            Message::SessInfo(SessInfo {
                hostname: hostname.to_string(),
            })
        }
        MsgType::Error => Message::Error(ErrorMsg {
            errno: LittleEndian::read_i32(body),
        }),
        MsgType::User => Message::User(UserMsg {
            payload: Bytes::copy_from_slice(body),
        }),
        MsgType::RdmaWrite | MsgType::ReqRdmaWrite => {
            let m = RdmaWriteMsg {
                usr_len: LittleEndian::read_u16(&body[0..2]),
                descs: read_descs(&body[2..]),
            };
            if v.msg_type == MsgType::RdmaWrite {
                Message::RdmaWrite(m)
            } else {
                Message::ReqRdmaWrite(m)
            }
        }
    };
    Ok((msg, v))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descs(n: usize) -> Vec<Descriptor> {
        (0..n)
            .map(|i| Descriptor {
                addr: 0x1000 * i as u64,
                key: 7,
                len: 4096,
            })
            .collect()
    }

    fn with_tsize(encoded: &[u8], tsize: u32) -> Vec<u8> {
        let mut buf = encoded.to_vec();
        LittleEndian::write_u32(&mut buf[2..6], tsize);
        buf
    }

    #[test]
    fn test_header_layout() {
        let hdr = MessageHeader {
            msg_type: 3,
            tsize: 24,
        };
        assert_eq!(hdr.to_bytes(), [3, 0, 24, 0, 0, 0]);
        assert_eq!(MessageHeader::from_bytes(&hdr.to_bytes()), hdr);
    }

    #[test]
    fn test_fixed_sizes() {
        assert_eq!(SESS_OPEN_SIZE, 24);
        assert_eq!(SESS_OPEN_RESP_BASE_SIZE, 18);
        assert_eq!(CON_OPEN_SIZE, 24);
        assert_eq!(SESS_INFO_SIZE, 70);
        assert_eq!(ERROR_SIZE, 10);
        assert_eq!(RDMA_WRITE_HDR_SIZE, 8);
    }

    #[test]
    fn test_fixed_messages_decode_to_originals() {
        let uuid = Uuid::from_u128(0x0123_4567_89ab_cdef_0011_2233_4455_6677);
        let msgs = vec![
            Message::sess_open(uuid, 4),
            Message::ConOpen(ConOpen {
                uuid,
                con_id: ConId(3),
            }),
            Message::SessInfo(SessInfo {
                hostname: "storage-node-7".into(),
            }),
            Message::Error(ErrorMsg { errno: 5 }),
        ];
        for msg in msgs {
            let bytes = msg.encode();
            assert_eq!(bytes.len(), msg.tsize());
            let (decoded, v) = decode(&bytes, None).unwrap();
            assert_eq!(decoded, msg);
            assert_eq!(v.msg_type, msg.msg_type());
            assert_eq!(v.version_mismatch, None);
        }
    }

    #[test]
    fn test_fixed_messages_reject_wrong_size() {
        let uuid = Uuid::nil();
        let msgs = vec![
            Message::sess_open(uuid, 1),
            Message::ConOpen(ConOpen {
                uuid,
                con_id: ConId(0),
            }),
            Message::SessInfo(SessInfo { hostname: "h".into() }),
            Message::Error(ErrorMsg { errno: 1 }),
        ];
        for msg in msgs {
            let mut bytes = msg.encode().to_vec();
            let size = bytes.len();
            bytes.extend_from_slice(&[0u8; 8]);
            for declared in [size - 1, size + 1, size + 8] {
                let buf = with_tsize(&bytes, declared as u32);
                match validate(&buf, None) {
                    Err(ProtoError::SizeMismatch { expected, .. }) => assert_eq!(expected, size),
                    other => panic!("{}: declared {} gave {:?}", msg.msg_type(), declared, other),
                }
            }
        }
    }

    #[test]
    fn test_sess_open_version_is_strict() {
        let mut buf = Message::sess_open(Uuid::nil(), 1).encode().to_vec();
        buf[HDR_SIZE] = PROTO_VERSION + 1;
        assert_eq!(
            validate(&buf, None),
            Err(ProtoError::VersionNotSupported {
                got: PROTO_VERSION + 1,
                expected: PROTO_VERSION
            })
        );
    }

    #[test]
    fn test_sess_open_requires_a_connection() {
        let buf = Message::sess_open(Uuid::nil(), 0).encode();
        assert!(matches!(
            validate(&buf, None),
            Err(ProtoError::InvalidField { field: "con_cnt", .. })
        ));
    }

    #[test]
    fn test_sess_open_resp_round_trip() {
        let msg = Message::sess_open_resp(64, 128 * 1024, descs(4));
        let bytes = msg.encode();
        assert_eq!(bytes.len(), 18 + 4 * 16);
        let (decoded, v) = decode(&bytes, Some(4)).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(v.tsize, bytes.len());
    }

    #[test]
    fn test_sess_open_resp_version_is_tolerated() {
        let mut buf = Message::sess_open_resp(8, 4096, descs(2)).encode().to_vec();
        buf[HDR_SIZE] = 9;
        let v = validate(&buf, None).unwrap();
        assert_eq!(v.version_mismatch, Some(9));
    }

    #[test]
    fn test_sess_open_resp_size_must_match_count() {
        let bytes = Message::sess_open_resp(8, 4096, descs(3)).encode();
        let mut buf = bytes.to_vec();
        buf.extend_from_slice(&[0u8; 16]);
        let buf = with_tsize(&buf, (bytes.len() + 16) as u32);
        assert!(matches!(
            validate(&buf, None),
            Err(ProtoError::SizeMismatch { expected: 66, .. })
        ));
    }

    #[test]
    fn test_sess_open_resp_count_must_equal_queue_depth() {
        let mut msg = match Message::sess_open_resp(8, 4096, descs(3)) {
            Message::SessOpenResp(m) => m,
            _ => unreachable!(),
        };
        msg.queue_depth = 4;
        let buf = Message::SessOpenResp(msg).encode();
        assert_eq!(
            validate(&buf, None),
            Err(ProtoError::QueueDepthMismatch { got: 3, expected: 4 })
        );
    }

    #[test]
    fn test_sess_open_resp_negotiated_depth_enforced() {
        let buf = Message::sess_open_resp(8, 4096, descs(2)).encode();
        assert_eq!(
            validate(&buf, Some(3)),
            Err(ProtoError::QueueDepthMismatch { got: 2, expected: 3 })
        );
    }

    #[test]
    fn test_sess_open_resp_needs_inflight_credit() {
        let buf = Message::sess_open_resp(0, 4096, descs(1)).encode();
        assert!(matches!(
            validate(&buf, None),
            Err(ProtoError::InvalidField { field: "max_inflight_msg", .. })
        ));
    }

    #[test]
    fn test_rdma_write_needs_a_descriptor() {
        let empty = Message::RdmaWrite(RdmaWriteMsg {
            usr_len: 0,
            descs: vec![],
        })
        .encode();
        assert_eq!(empty.len(), RDMA_WRITE_HDR_SIZE);
        assert!(matches!(validate(&empty, None), Err(ProtoError::TooShort { .. })));

        let one = Message::ReqRdmaWrite(RdmaWriteMsg {
            usr_len: 12,
            descs: descs(1),
        });
        let bytes = one.encode();
        let (decoded, _) = decode(&bytes, None).unwrap();
        assert_eq!(decoded, one);
    }

    #[test]
    fn test_rdma_write_rejects_partial_descriptor() {
        let mut buf = Message::RdmaWrite(RdmaWriteMsg {
            usr_len: 0,
            descs: descs(1),
        })
        .encode()
        .to_vec();
        buf.extend_from_slice(&[0u8; 4]);
        let buf = with_tsize(&buf, 28);
        assert!(matches!(
            validate(&buf, None),
            Err(ProtoError::InvalidField { field: "tsize", .. })
        ));
    }

    #[test]
    fn test_user_message_cap() {
        let ok = Message::user(vec![1u8; MAX_USER_MSG_SIZE]).encode();
        assert!(validate(&ok, None).is_ok());

        let too_big = Message::user(vec![1u8; MAX_USER_MSG_SIZE + 1]).encode();
        assert!(matches!(validate(&too_big, None), Err(ProtoError::TooLarge { .. })));

        let empty = Message::user(Bytes::new()).encode();
        let (decoded, _) = decode(&empty, None).unwrap();
        assert_eq!(decoded, Message::user(Bytes::new()));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let buf = MessageHeader {
            msg_type: 99,
            tsize: 6,
        }
        .to_bytes();
        assert_eq!(validate(&buf, None), Err(ProtoError::UnknownType(99)));
    }

    #[test]
    fn test_truncated_buffers_rejected() {
        assert!(matches!(
            validate(&[1, 0, 24], None),
            Err(ProtoError::Truncated { need: 6, have: 3 })
        ));
        let bytes = Message::sess_open(Uuid::nil(), 1).encode();
        assert!(matches!(
            validate(&bytes[..20], None),
            Err(ProtoError::Truncated { need: 24, have: 20 })
        ));
    }

    #[test]
    fn test_trailing_bytes_after_message_are_ignored() {
        let mut buf = Message::Error(ErrorMsg { errno: 11 }).encode().to_vec();
        buf.extend_from_slice(b"slot padding");
        let (msg, v) = decode(&buf, None).unwrap();
        assert_eq!(v.tsize, ERROR_SIZE);
        assert_eq!(msg, Message::Error(ErrorMsg { errno: 11 }));
    }

    #[test]
    fn test_long_hostname_is_truncated() {
        let msg = Message::SessInfo(SessInfo {
            hostname: "x".repeat(100),
        });
        let bytes = msg.encode();
        assert_eq!(bytes.len(), SESS_INFO_SIZE);
        match decode(&bytes, None).unwrap().0 {
            Message::SessInfo(info) => assert_eq!(info.hostname.len(), MAX_HOSTNAME_LEN),
            other => panic!("unexpected {:?}", other),
        }
    }
}
