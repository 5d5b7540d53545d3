//! Information units: DMA-mapped buffers carrying a message or I/O payload.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ibtrs_proto::Descriptor;
use parking_lot::Mutex;

use crate::buf::IuBuf;
use crate::error::RdmaError;
use crate::rdma::{DmaDirection, DmaHandle, DmaMapper, Sge};

pub struct Iu {
    buf: Arc<IuBuf>,
    dma: DmaHandle,
    dir: DmaDirection,
    mapped: AtomicBool,
}

impl Iu {
    pub fn alloc(size: usize, dir: DmaDirection, mapper: &dyn DmaMapper) -> Result<Self, RdmaError> {
        let buf = Arc::new(IuBuf::allocate(size));
        let dma = mapper.map(&buf, dir)?;
        Ok(Self {
            buf,
            dma,
            dir,
            mapped: AtomicBool::new(true),
        })
    }

    /// Allocate `count` units; on failure everything mapped so far is
    /// unmapped again.
    pub fn alloc_many(
        count: usize,
        size: usize,
        dir: DmaDirection,
        mapper: &dyn DmaMapper,
    ) -> Result<Vec<Iu>, RdmaError> {
        let mut ius = Vec::with_capacity(count);
        for _ in 0..count {
            match Iu::alloc(size, dir, mapper) {
                Ok(iu) => ius.push(iu),
                Err(e) => {
                    tracing::error!(count, size, error = %e, "iu allocation failed");
                    for iu in &ius {
                        iu.unmap(mapper);
                    }
                    return Err(e);
                }
            }
        }
        Ok(ius)
    }

    /// Idempotent.
    pub fn unmap(&self, mapper: &dyn DmaMapper) {
        if self.mapped.swap(false, Ordering::AcqRel) {
            mapper.unmap(&self.dma);
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Acquire)
    }

    pub fn buf(&self) -> &IuBuf {
        &self.buf
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn dir(&self) -> DmaDirection {
        self.dir
    }

    pub fn dma(&self) -> DmaHandle {
        self.dma
    }

    pub fn sge(&self, offset: usize, len: usize) -> Sge {
        self.dma.sge(offset as u32, len as u32)
    }

    pub fn desc(&self, offset: usize, len: usize) -> Descriptor {
        self.dma.desc(offset as u32, len as u32)
    }
}

impl std::fmt::Debug for Iu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Iu")
            .field("dma", &self.dma)
            .field("dir", &self.dir)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

/// Fixed set of send buffers for control and user messages. A slot is
/// taken when a send is posted and returned by its send completion.
pub struct MsgPool {
    ius: Vec<Iu>,
    free: Mutex<Vec<usize>>,
}

impl MsgPool {
    pub fn new(count: usize, size: usize, mapper: &dyn DmaMapper) -> Result<Self, RdmaError> {
        let ius = Iu::alloc_many(count, size, DmaDirection::ToDevice, mapper)?;
        Ok(Self {
            free: Mutex::new((0..ius.len()).rev().collect()),
            ius,
        })
    }

    pub fn try_get(&self) -> Option<usize> {
        self.free.lock().pop()
    }

    /// Return a slot. Returning a slot that is already free is a bug.
    pub fn put(&self, idx: usize) {
        let mut free = self.free.lock();
        assert!(idx < self.ius.len(), "msg slot {} out of range", idx);
        assert!(!free.contains(&idx), "msg slot {} released twice", idx);
        free.push(idx);
    }

    pub fn iu(&self, idx: usize) -> Option<&Iu> {
        self.ius.get(idx)
    }

    pub fn capacity(&self) -> usize {
        self.ius.len()
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub fn unmap_all(&self, mapper: &dyn DmaMapper) {
        for iu in &self.ius {
            iu.unmap(mapper);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Maps until `limit` buffers are live.
    struct CountingMapper {
        live: AtomicUsize,
        limit: usize,
    }

    impl CountingMapper {
        fn new(limit: usize) -> Self {
            Self {
                live: AtomicUsize::new(0),
                limit,
            }
        }
    }

    impl DmaMapper for CountingMapper {
        fn map(&self, buf: &Arc<IuBuf>, _dir: DmaDirection) -> Result<DmaHandle, RdmaError> {
            let n = self.live.fetch_add(1, Ordering::SeqCst);
            if n >= self.limit {
                self.live.fetch_sub(1, Ordering::SeqCst);
                return Err(RdmaError::MapFailed("out of mappings".into()));
            }
            Ok(DmaHandle {
                addr: (n as u64 + 1) << 32,
                key: n as u32 + 1,
                len: buf.len() as u32,
            })
        }

        fn unmap(&self, _handle: &DmaHandle) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_unmap_is_idempotent() {
        let mapper = CountingMapper::new(4);
        let iu = Iu::alloc(64, DmaDirection::Bidirectional, &mapper).unwrap();
        assert_eq!(mapper.live.load(Ordering::SeqCst), 1);
        assert_eq!(iu.size(), 64);
        iu.unmap(&mapper);
        iu.unmap(&mapper);
        assert!(!iu.is_mapped());
        assert_eq!(mapper.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_bulk_alloc_rolls_back() {
        let mapper = CountingMapper::new(3);
        let err = Iu::alloc_many(5, 32, DmaDirection::FromDevice, &mapper).unwrap_err();
        assert!(matches!(err, RdmaError::MapFailed(_)));
        assert_eq!(mapper.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_desc_offsets() {
        let mapper = CountingMapper::new(1);
        let iu = Iu::alloc(128, DmaDirection::ToDevice, &mapper).unwrap();
        let d = iu.desc(8, 16);
        assert_eq!(d.addr, iu.dma().addr + 8);
        assert_eq!(d.len, 16);
        assert_eq!(iu.sge(0, 4).key, iu.dma().key);
    }

    #[test]
    fn test_msg_pool_credits() {
        let mapper = CountingMapper::new(8);
        let pool = MsgPool::new(2, 64, &mapper).unwrap();
        let a = pool.try_get().unwrap();
        let b = pool.try_get().unwrap();
        assert_ne!(a, b);
        assert!(pool.try_get().is_none());
        pool.put(a);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.try_get(), Some(a));
        pool.unmap_all(&mapper);
        assert_eq!(mapper.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn test_msg_pool_double_put_panics() {
        let mapper = CountingMapper::new(8);
        let pool = MsgPool::new(2, 64, &mapper).unwrap();
        let a = pool.try_get().unwrap();
        pool.put(a);
        pool.put(a);
    }
}
