use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Heap cell behind a [`PayloadValue`]: mutable LSN metadata plus the raw
/// item bytes. The strong count of the owning `Arc` is the refcount.
pub struct PayloadData {
    lsn: AtomicI64,
    bytes: Vec<u8>,
}

/// The full item's payload object. It must be speed & size optimized.
///
/// Shared across queries, results and indexes by refcount; any mutation
/// through a shared handle must go through [`PayloadValue::clone_into_unique`]
/// first. A free (default) value holds no allocation; dereferencing it is
/// a bug in the caller, not a recoverable error.
pub struct PayloadValue {
    cell: Option<Arc<PayloadData>>,
}

impl PayloadValue {
    /// Free value, no allocation.
    pub fn empty() -> Self {
        PayloadValue { cell: None }
    }

    /// Alloc payload store with `size` live bytes and capacity at least
    /// `max(size, cap)`, optionally copying initial data.
    pub fn new(size: usize, data: Option<&[u8]>, cap: usize) -> Self {
        let mut bytes = Vec::with_capacity(size.max(cap));
        match data {
            Some(src) => {
                bytes.extend_from_slice(&src[..size]);
            }
            None => bytes.resize(size, 0),
        }
        PayloadValue {
            cell: Some(Arc::new(PayloadData { lsn: AtomicI64::new(-1), bytes })),
        }
    }

    pub fn is_free(&self) -> bool {
        self.cell.is_none()
    }

    /// Drop the reference; the last holder releases the allocation.
    pub fn free(&mut self) {
        self.cell = None;
    }

    pub fn refcount(&self) -> usize {
        self.cell.as_ref().map_or(0, Arc::strong_count)
    }

    pub fn size(&self) -> usize {
        self.data().bytes.len()
    }

    pub fn capacity(&self) -> usize {
        self.data().bytes.capacity()
    }

    /// Raw payload bytes. Panics on a free value.
    pub fn bytes(&self) -> &[u8] {
        &self.data().bytes
    }

    /// Mutable payload bytes. The value must be unique; the caller is
    /// responsible for `clone_into_unique` before any write.
    pub fn bytes_mut(&mut self) -> &mut Vec<u8> {
        let cell = match &mut self.cell {
            Some(cell) => cell,
            None => panic!("dereferencing a free PayloadValue"),
        };
        match Arc::get_mut(cell) {
            Some(data) => &mut data.bytes,
            None => panic!("writing a shared PayloadValue (refcount > 1) without clone"),
        }
    }

    /// Clone if data is shared, for copy-on-write. After the call the
    /// holder owns a unique cell with capacity at least `size`.
    pub fn clone_into_unique(&mut self, size: usize) {
        let need_copy = match &self.cell {
            None => true,
            Some(cell) => Arc::strong_count(cell) > 1 || cell.bytes.capacity() < size,
        };
        if !need_copy {
            return;
        }
        let (lsn, old) = match &self.cell {
            Some(cell) => (cell.lsn.load(Ordering::Acquire), cell.bytes.as_slice()),
            None => (-1, &[][..]),
        };
        let mut bytes = Vec::with_capacity(size.max(old.len()));
        bytes.extend_from_slice(old);
        self.cell = Some(Arc::new(PayloadData { lsn: AtomicI64::new(lsn), bytes }));
    }

    /// Grow or shrink the live size, preserving the first
    /// `min(old, new)` bytes and zero-filling growth.
    pub fn resize(&mut self, old_size: usize, new_size: usize) {
        debug_assert_eq!(self.cell.as_ref().map_or(0, |c| c.bytes.len()), old_size);
        self.clone_into_unique(new_size);
        self.bytes_mut().resize(new_size, 0);
    }

    pub fn set_lsn(&self, lsn: i64) {
        self.data().lsn.store(lsn, Ordering::Release);
    }

    pub fn get_lsn(&self) -> i64 {
        self.cell.as_ref().map_or(0, |c| c.lsn.load(Ordering::Acquire))
    }

    fn data(&self) -> &PayloadData {
        match &self.cell {
            Some(cell) => cell,
            None => panic!("dereferencing a free PayloadValue"),
        }
    }
}

impl Default for PayloadValue {
    fn default() -> Self {
        PayloadValue::empty()
    }
}

// Copy semantics: another handle to the same cell, refcount + 1.
impl Clone for PayloadValue {
    fn clone(&self) -> Self {
        PayloadValue { cell: self.cell.clone() }
    }
}

// LSN is metadata and does not participate in equality.
impl PartialEq for PayloadValue {
    fn eq(&self, other: &Self) -> bool {
        match (&self.cell, &other.cell) {
            (None, None) => true,
            (Some(a), Some(b)) => a.bytes == b.bytes,
            _ => false,
        }
    }
}

impl fmt::Debug for PayloadValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.cell {
            None => write!(f, "PayloadValue(free)"),
            Some(c) => write!(
                f,
                "PayloadValue(refs={}, size={}, cap={}, lsn={})",
                Arc::strong_count(c),
                c.bytes.len(),
                c.bytes.capacity(),
                c.lsn.load(Ordering::Relaxed)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_on_write_keeps_source_intact() {
        let a = PayloadValue::new(8, Some(&[1, 2, 3, 4, 5, 6, 7, 8]), 16);
        let mut b = a.clone();
        assert_eq!(a.refcount(), 2);
        assert_eq!(b.refcount(), 2);

        b.clone_into_unique(8);
        b.bytes_mut()[0] = 0xFF;

        assert_eq!(a.bytes()[0], 1);
        assert_eq!(b.bytes()[0], 0xFF);
        assert_eq!(a.refcount(), 1);
        assert_eq!(b.refcount(), 1);
    }

    #[test]
    fn resize_preserves_prefix_and_zero_fills() {
        let mut v = PayloadValue::new(4, Some(&[9, 8, 7, 6]), 0);
        v.resize(4, 8);
        assert_eq!(v.bytes(), &[9, 8, 7, 6, 0, 0, 0, 0]);
        v.resize(8, 2);
        assert_eq!(v.bytes(), &[9, 8]);
        assert!(v.capacity() >= 2);
    }

    #[test]
    fn lsn_is_mutable_metadata() {
        let v = PayloadValue::new(2, None, 0);
        assert_eq!(v.get_lsn(), -1);
        v.set_lsn(42);
        assert_eq!(v.get_lsn(), 42);

        let w = PayloadValue::new(2, None, 0);
        w.set_lsn(7);
        assert_eq!(v, w); // equality ignores LSN
    }

    #[test]
    fn move_nulls_source() {
        let mut a = PayloadValue::new(1, Some(&[5]), 0);
        let b = std::mem::take(&mut a);
        assert!(a.is_free());
        assert_eq!(b.bytes(), &[5]);
    }

    #[test]
    fn clone_into_unique_on_undersized_cell_grows_capacity() {
        let mut v = PayloadValue::new(2, Some(&[1, 2]), 2);
        v.clone_into_unique(32);
        assert!(v.capacity() >= 32);
        assert_eq!(v.bytes(), &[1, 2]);
    }
}
