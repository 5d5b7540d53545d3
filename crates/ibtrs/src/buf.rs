//! Registered memory backing information units.

use parking_lot::Mutex;

/// A fixed-size buffer that local code and the RDMA provider both touch.
///
/// The provider reads and writes it through its DMA handle while the
/// transport fills or drains it, so access goes through short critical
/// sections rather than borrowed slices.
#[derive(Debug)]
pub struct IuBuf {
    data: Mutex<Box<[u8]>>,
    len: usize,
}

impl IuBuf {
    pub fn allocate(size: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; size].into_boxed_slice()),
            len: size,
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            data: Mutex::new(data.into_boxed_slice()),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `src` in at `offset`. Returns `false` if it would not fit.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> bool {
        let Some(end) = offset.checked_add(src.len()).filter(|&e| e <= self.len) else {
            return false;
        };
        self.data.lock()[offset..end].copy_from_slice(src);
        true
    }

    /// Copy `len` bytes out from `offset`.
    pub fn read_at(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let end = offset.checked_add(len).filter(|&e| e <= self.len)?;
        Some(self.data.lock()[offset..end].to_vec())
    }

    /// Run `f` over a range without copying.
    pub fn with_range<R>(&self, offset: usize, len: usize, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let end = offset.checked_add(len).filter(|&e| e <= self.len)?;
        Some(f(&self.data.lock()[offset..end]))
    }

    pub fn with_range_mut<R>(
        &self,
        offset: usize,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Option<R> {
        let end = offset.checked_add(len).filter(|&e| e <= self.len)?;
        Some(f(&mut self.data.lock()[offset..end]))
    }

    pub fn fill(&self, byte: u8) {
        self.data.lock().fill(byte);
    }
}
