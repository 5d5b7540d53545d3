//! 32-bit immediate data carried by RDMA-write-with-immediate.
//!
//! Layout: buffer id in the high half, status in the low half. The status
//! is a positive errno, zero for success.

/// Decoded immediate value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Imm {
    pub buf_id: u16,
    pub status: u16,
}

impl Imm {
    pub fn new(buf_id: u16, errno: i32) -> Self {
        Self {
            buf_id,
            status: errno_to_status(errno),
        }
    }

    pub fn encode(self) -> u32 {
        encode_imm(self.buf_id, self.status)
    }

    pub fn decode(imm: u32) -> Self {
        let (buf_id, status) = decode_imm(imm);
        Self { buf_id, status }
    }

    /// Positive errno, zero on success.
    pub fn errno(self) -> i32 {
        self.status as i32
    }
}

pub fn encode_imm(buf_id: u16, status: u16) -> u32 {
    ((buf_id as u32) << 16) | status as u32
}

pub fn decode_imm(imm: u32) -> (u16, u16) {
    ((imm >> 16) as u16, (imm & 0xffff) as u16)
}

/// Errno values above the 16-bit range do not exist on any supported
/// platform; anything out of range is reported as EIO.
fn errno_to_status(errno: i32) -> u16 {
    u16::try_from(errno.unsigned_abs()).unwrap_or(EIO)
}

const EIO: u16 = 5;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(encode_imm(0x0102, 0x0304), 0x0102_0304);
        assert_eq!(decode_imm(0x0102_0304), (0x0102, 0x0304));
    }

    #[test]
    fn test_imm_errno_sign_is_dropped() {
        let imm = Imm::new(9, -11);
        assert_eq!(imm.errno(), 11);
        assert_eq!(Imm::decode(imm.encode()), imm);
        assert_eq!(Imm::new(9, 0).errno(), 0);
    }

    #[test]
    fn test_out_of_range_errno() {
        assert_eq!(Imm::new(1, 1 << 20).errno(), 5);
    }
}
