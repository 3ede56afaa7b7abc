use crossbeam::queue::ArrayQueue;

use crate::results::serializer::WrResultSerializer;
use crate::results::QueryResults;

/// Builders kept warm between requests.
pub const QUERY_RESULTS_POOL_SIZE: usize = 1024;
/// Hard cap on concurrently live result handles.
pub const MAX_CONCURRENT_QUERIES: i32 = 65534;
/// Builders whose buffer grew past this are dropped instead of pooled.
pub const MAX_POOLED_RESULTS_CAP: usize = 0x10000;
/// A single result at or past this capacity is logged as suspicious.
pub const WARN_LARGE_RESULTS_LIMIT: usize = 0x4000_0000;

/// A pooled result builder: the result set plus its serializer buffer.
#[derive(Default)]
pub struct ResultsWrapper {
    pub results: QueryResults,
    pub ser: WrResultSerializer,
}

/// Bounded pool of result builders over a lock-free stack. Acquisition
/// beyond the pooled capacity allocates fresh builders up to the hard
/// cap; that excess is legitimate burst traffic, not a leak.
pub struct SyncPool {
    stack: ArrayQueue<Box<ResultsWrapper>>,
}

impl Default for SyncPool {
    fn default() -> Self {
        SyncPool::new()
    }
}

impl SyncPool {
    pub fn new() -> Self {
        SyncPool { stack: ArrayQueue::new(QUERY_RESULTS_POOL_SIZE) }
    }

    /// `live_count` is the number of currently outstanding serialized
    /// results; at the cap the pool refuses and the operation fails with
    /// `too-many-parallel-queries`.
    pub fn get(&self, live_count: i32) -> Option<Box<ResultsWrapper>> {
        if live_count >= MAX_CONCURRENT_QUERIES {
            return None;
        }
        Some(self.stack.pop().unwrap_or_default())
    }

    /// Clears the builder and returns it to the stack; oversized buffers
    /// are replaced, overflow beyond the pooled capacity is dropped.
    pub fn put(&self, mut wrapper: Box<ResultsWrapper>) {
        wrapper.results.clear();
        if wrapper.ser.cap() > MAX_POOLED_RESULTS_CAP {
            wrapper.ser = WrResultSerializer::new();
        } else {
            wrapper.ser.reset();
        }
        let _ = self.stack.push(wrapper);
    }

    pub fn pooled(&self) -> usize {
        self.stack.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_reuses_builders() {
        let pool = SyncPool::new();
        let w = pool.get(0).unwrap();
        assert_eq!(pool.pooled(), 0);
        pool.put(w);
        assert_eq!(pool.pooled(), 1);
        let _again = pool.get(0).unwrap();
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn refuses_at_the_live_cap() {
        let pool = SyncPool::new();
        assert!(pool.get(MAX_CONCURRENT_QUERIES - 1).is_some());
        assert!(pool.get(MAX_CONCURRENT_QUERIES).is_none());
    }

    #[test]
    fn oversized_buffers_are_not_pooled_back() {
        let pool = SyncPool::new();
        let mut w = pool.get(0).unwrap();
        w.ser.write(&vec![0u8; MAX_POOLED_RESULTS_CAP + 1]);
        pool.put(w);
        let w = pool.get(0).unwrap();
        assert!(w.ser.cap() <= MAX_POOLED_RESULTS_CAP);
        assert_eq!(w.ser.len(), 0);
    }
}
