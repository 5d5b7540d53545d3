use parking_lot::{Mutex, MutexGuard};

/// Sharded data structure for reducing lock contention.
///
/// Callers pick a home shard (typically the current CPU) and fall back to
/// the others in ring order when the home shard has nothing to offer.
pub struct Shards<T> {
    shards: Vec<Mutex<T>>,
}

impl<T> Shards<T> {
    pub fn new(num_shards: usize, init: impl Fn() -> T) -> Self {
        let num_shards = num_shards.max(1);
        let mut shards = Vec::with_capacity(num_shards);
        for _ in 0..num_shards {
            shards.push(Mutex::new(init()));
        }
        Self { shards }
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_by_index(&self, index: usize) -> MutexGuard<'_, T> {
        self.shards[index % self.shards.len()].lock()
    }

    /// Visit shards starting at `home` and wrapping around, stopping at the
    /// first one for which `f` yields a value.
    pub fn find_map_from<R>(&self, home: usize, mut f: impl FnMut(&mut T) -> Option<R>) -> Option<R> {
        let n = self.shards.len();
        for step in 0..n {
            let mut guard = self.shards[(home + step) % n].lock();
            if let Some(r) = f(&mut guard) {
                return Some(r);
            }
        }
        None
    }

    pub fn for_each(&self, mut f: impl FnMut(&mut T)) {
        for shard in &self.shards {
            f(&mut shard.lock());
        }
    }
}

impl<T: Default> Shards<T> {
    pub fn with_default(num_shards: usize) -> Self {
        Self::new(num_shards, T::default)
    }
}

/// Best-effort index of the CPU the calling thread runs on.
#[cfg(target_os = "linux")]
pub fn current_cpu() -> usize {
    // SAFETY: sched_getcpu has no preconditions.
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 { 0 } else { cpu as usize }
}

#[cfg(not(target_os = "linux"))]
pub fn current_cpu() -> usize {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_shards_rounds_up() {
        let s: Shards<Vec<u32>> = Shards::with_default(0);
        assert_eq!(s.num_shards(), 1);
    }

    #[test]
    fn test_find_map_from_borrows_other_shards() {
        let s: Shards<Vec<u32>> = Shards::with_default(4);
        s.shard_by_index(2).push(7);

        // Home shard 0 is empty; the search wraps to shard 2.
        assert_eq!(s.find_map_from(0, |v| v.pop()), Some(7));
        assert_eq!(s.find_map_from(3, |v| v.pop()), None);
    }

    #[test]
    fn test_for_each_visits_all() {
        let s: Shards<u32> = Shards::with_default(3);
        s.for_each(|v| *v += 1);
        let mut total = 0;
        s.for_each(|v| total += *v);
        assert_eq!(total, 3);
    }

    #[test]
    fn test_current_cpu_is_usable_as_index() {
        let s: Shards<u32> = Shards::with_default(2);
        *s.shard_by_index(current_cpu()) += 1;
    }
}
