//! Buffer/tag pool.
//!
//! A session owns `queue_depth` DMA-mapped units, one per tag. A tag grants
//! exclusive use of its unit for one RDMA operation and goes back to the
//! free list only from the completion path. Free ids are spread over
//! per-CPU shards; a semaphore with one permit per free id provides the
//! blocking and non-blocking allocation policies.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use ibtrs_types::TagId;
use ibtrs_utils::{AcquireError, Semaphore, Shards};
use tokio::sync::Notify;

use crate::error::{RdmaError, TransportError};
use crate::iu::Iu;
use crate::rdma::{DmaDirection, DmaMapper};

const FREE: u8 = 0;
const HELD: u8 = 1;
const IN_FLIGHT: u8 = 2;

struct Slot {
    iu: Iu,
    state: AtomicU8,
}

pub struct TagPool {
    slots: Vec<Slot>,
    free: Shards<Vec<u16>>,
    permits: Semaphore,
    outstanding: AtomicUsize,
    max_io_size: usize,
    released: Notify,
}

impl TagPool {
    pub fn new(
        queue_depth: u16,
        max_io_size: usize,
        num_shards: usize,
        mapper: &dyn DmaMapper,
    ) -> Result<Self, RdmaError> {
        let ius = Iu::alloc_many(
            queue_depth as usize,
            max_io_size,
            DmaDirection::Bidirectional,
            mapper,
        )?;
        let free = Shards::new(num_shards, Vec::new);
        let n = free.num_shards();
        for id in (0..queue_depth).rev() {
            free.shard_by_index(id as usize % n).push(id);
        }
        Ok(Self {
            slots: ius
                .into_iter()
                .map(|iu| Slot {
                    iu,
                    state: AtomicU8::new(FREE),
                })
                .collect(),
            free,
            permits: Semaphore::new(queue_depth as usize),
            outstanding: AtomicUsize::new(0),
            max_io_size,
            released: Notify::new(),
        })
    }

    pub fn queue_depth(&self) -> u16 {
        self.slots.len() as u16
    }

    pub fn max_io_size(&self) -> usize {
        self.max_io_size
    }

    /// Non-blocking allocation. Exhaustion is `NoResources`.
    pub fn try_get(self: &Arc<Self>, cpu: usize, nr_bytes: usize) -> Result<Tag, TransportError> {
        self.check_size(nr_bytes)?;
        self.permits.try_acquire().map_err(|e| match e {
            AcquireError::NoPermits => TransportError::NoResources,
            AcquireError::Closed => TransportError::SessionClosed,
        })?;
        Ok(self.take(cpu, nr_bytes))
    }

    /// Waits until a tag frees up or the pool is closed.
    pub async fn get(self: &Arc<Self>, cpu: usize, nr_bytes: usize) -> Result<Tag, TransportError> {
        self.check_size(nr_bytes)?;
        self.permits
            .acquire()
            .await
            .map_err(|_| TransportError::SessionClosed)?;
        Ok(self.take(cpu, nr_bytes))
    }

    fn check_size(&self, nr_bytes: usize) -> Result<(), TransportError> {
        if nr_bytes > self.max_io_size {
            return Err(TransportError::IoTooLarge {
                size: nr_bytes,
                max: self.max_io_size,
            });
        }
        Ok(())
    }

    /// Caller holds a permit, so some shard has a free id. A racing release
    /// can land in a shard already scanned; rescan until found.
    fn take(self: &Arc<Self>, cpu: usize, nr_bytes: usize) -> Tag {
        let home = cpu % self.free.num_shards();
        let id = loop {
            if let Some(id) = self.free.find_map_from(home, |ids| ids.pop()) {
                break id;
            }
            std::hint::spin_loop();
        };
        let prev = self.slots[id as usize].state.swap(HELD, Ordering::AcqRel);
        assert_eq!(prev, FREE, "tag {} allocated while not free", id);
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Tag {
            pool: Arc::clone(self),
            id: TagId(id),
            cpu,
            nr_bytes,
            armed: true,
        }
    }

    /// Completion path: an in-flight tag goes back to the free list.
    /// Completing a tag that is not in flight is a bug.
    pub fn complete(&self, id: TagId) {
        let slot = &self.slots[id.index()];
        if let Err(state) =
            slot.state
                .compare_exchange(IN_FLIGHT, FREE, Ordering::AcqRel, Ordering::Acquire)
        {
            panic!("tag {} completed in state {}", id, state);
        }
        self.release(id);
    }

    pub fn is_in_flight(&self, id: TagId) -> bool {
        self.slots
            .get(id.index())
            .is_some_and(|s| s.state.load(Ordering::Acquire) == IN_FLIGHT)
    }

    fn submit(&self, id: TagId) {
        let slot = &self.slots[id.index()];
        if let Err(state) =
            slot.state
                .compare_exchange(HELD, IN_FLIGHT, Ordering::AcqRel, Ordering::Acquire)
        {
            panic!("tag {} submitted in state {}", id, state);
        }
    }

    fn put_back(&self, id: TagId) {
        let slot = &self.slots[id.index()];
        if let Err(state) = slot
            .state
            .compare_exchange(HELD, FREE, Ordering::AcqRel, Ordering::Acquire)
        {
            panic!("tag {} returned in state {}", id, state);
        }
        self.release(id);
    }

    fn release(&self, id: TagId) {
        let n = self.free.num_shards();
        self.free.shard_by_index(id.index() % n).push(id.0);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.permits.release(1);
        self.released.notify_waiters();
    }

    pub fn iu(&self, id: TagId) -> Option<&Iu> {
        self.slots.get(id.index()).map(|s| &s.iu)
    }

    /// Tags held or in flight.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Refuse further allocation and wake blocked allocators.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Wait for every outstanding tag to come back. Returns `false` on
    /// timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.released.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.outstanding() == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    pub fn unmap_all(&self, mapper: &dyn DmaMapper) {
        for slot in &self.slots {
            slot.iu.unmap(mapper);
        }
    }
}

/// Exclusive right to one pool slot.
///
/// Dropping a tag that was never submitted returns it to the pool. Once
/// submitted, only [`TagPool::complete`] frees it.
pub struct Tag {
    pool: Arc<TagPool>,
    id: TagId,
    cpu: usize,
    nr_bytes: usize,
    armed: bool,
}

impl Tag {
    pub fn id(&self) -> TagId {
        self.id
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    pub fn nr_bytes(&self) -> usize {
        self.nr_bytes
    }

    pub fn iu(&self) -> &Iu {
        &self.pool.slots[self.id.index()].iu
    }

    pub(crate) fn pool(&self) -> &Arc<TagPool> {
        &self.pool
    }

    /// Hand the slot to the hardware.
    pub(crate) fn submit(mut self) -> TagId {
        self.pool.submit(self.id);
        self.armed = false;
        self.id
    }
}

impl Drop for Tag {
    fn drop(&mut self) {
        if self.armed {
            self.pool.put_back(self.id);
        }
    }
}

impl std::fmt::Debug for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tag")
            .field("id", &self.id)
            .field("cpu", &self.cpu)
            .field("nr_bytes", &self.nr_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::IuBuf;
    use crate::rdma::DmaHandle;
    use std::collections::HashSet;

    struct NopMapper;

    impl DmaMapper for NopMapper {
        fn map(&self, buf: &Arc<IuBuf>, _dir: DmaDirection) -> Result<DmaHandle, RdmaError> {
            Ok(DmaHandle {
                addr: 0,
                key: 0,
                len: buf.len() as u32,
            })
        }

        fn unmap(&self, _handle: &DmaHandle) {}
    }

    fn pool(qd: u16, shards: usize) -> Arc<TagPool> {
        Arc::new(TagPool::new(qd, 256, shards, &NopMapper).unwrap())
    }

    #[test]
    fn test_exhaustion_is_retryable() {
        let pool = pool(4, 2);
        let tags: Vec<_> = (0..4).map(|cpu| pool.try_get(cpu, 16).unwrap()).collect();
        let err = pool.try_get(0, 16).unwrap_err();
        assert!(matches!(err, TransportError::NoResources));
        assert!(err.is_retryable());
        drop(tags);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_oversized_request_rejected() {
        let pool = pool(2, 1);
        let err = pool.try_get(0, 257).unwrap_err();
        assert!(matches!(err, TransportError::IoTooLarge { size: 257, max: 256 }));
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_submitted_tag_needs_completion() {
        let pool = pool(1, 1);
        let tag = pool.try_get(0, 8).unwrap();
        let id = tag.submit();
        assert!(pool.is_in_flight(id));
        assert!(pool.try_get(0, 8).is_err());
        pool.complete(id);
        assert!(!pool.is_in_flight(id));
        assert!(pool.try_get(0, 8).is_ok());
    }

    #[test]
    #[should_panic(expected = "completed in state")]
    fn test_double_completion_panics() {
        let pool = pool(2, 1);
        let id = pool.try_get(0, 8).unwrap().submit();
        pool.complete(id);
        pool.complete(id);
    }

    #[test]
    fn test_tags_borrow_from_other_shards() {
        let pool = pool(4, 4);
        let ids: HashSet<_> = (0..4).map(|_| pool.try_get(0, 1).unwrap().submit()).collect();
        assert_eq!(ids.len(), 4);
        for id in ids {
            pool.complete(id);
        }
    }

    #[tokio::test]
    async fn test_no_double_allocation_under_contention() {
        let pool = pool(16, 4);
        let mut handles = Vec::new();
        for cpu in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                for _ in 0..200 {
                    let tag = pool.get(cpu, 1).await.unwrap();
                    seen.push(tag.id());
                    let id = tag.submit();
                    tokio::task::yield_now().await;
                    pool.complete(id);
                }
                seen.len()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), 200);
        }
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 16);
    }

    #[tokio::test]
    async fn test_blocking_get_woken_by_completion() {
        let pool = pool(1, 1);
        let id = pool.try_get(0, 1).unwrap().submit();
        let p = pool.clone();
        let waiter = tokio::spawn(async move { p.get(0, 1).await.map(|t| t.id()) });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        pool.complete(id);
        assert_eq!(waiter.await.unwrap().unwrap(), id);
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let pool = pool(1, 1);
        let _held = pool.try_get(0, 1).unwrap();
        let p = pool.clone();
        let waiter = tokio::spawn(async move { p.get(0, 1).await });
        tokio::task::yield_now().await;
        pool.close();
        assert!(matches!(waiter.await.unwrap(), Err(TransportError::SessionClosed)));
        assert!(matches!(pool.try_get(0, 1), Err(TransportError::SessionClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle() {
        let pool = pool(2, 1);
        assert!(pool.wait_idle(Duration::from_millis(1)).await);

        let id = pool.try_get(0, 1).unwrap().submit();
        assert!(!pool.wait_idle(Duration::from_millis(100)).await);

        let p = pool.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            p.complete(id);
        });
        assert!(pool.wait_idle(Duration::from_secs(1)).await);
    }
}
