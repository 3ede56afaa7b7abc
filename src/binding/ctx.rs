use parking_lot::Mutex;

use crate::core::ctx::{CancelType, RdxContext};

/// Slots of the process-wide cancellation table.
pub const CTX_ARR_SIZE: usize = 1024;

/// Opaque (caller, request) identity attached to every cancellable call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CtxInfo {
    pub ctx_id: u64,
    /// Per-request deadline in milliseconds; 0 means none.
    pub exec_timeout_ms: i64,
}

#[derive(Default)]
struct SlotState {
    ctx_id: u64,
    refs: u32,
    ctx: RdxContext,
}

/// Fixed-size table of active contexts, indexed by id modulo the table
/// size. Each slot carries a small mutex; entries are refcounted through
/// scoped attachment.
pub struct CtxPool {
    slots: Vec<Mutex<SlotState>>,
}

impl CtxPool {
    pub fn new(size: usize) -> Self {
        CtxPool {
            slots: (0..size.max(1)).map(|_| Mutex::new(SlotState::default())).collect(),
        }
    }

    fn slot(&self, ctx_id: u64) -> &Mutex<SlotState> {
        &self.slots[(ctx_id as usize) % self.slots.len()]
    }

    /// Binds a context for the duration of one operation. Id 0 is the
    /// anonymous uncancellable context; a slot occupied by a different id
    /// yields a detached context that cancel calls can not reach.
    pub fn attach(&self, info: CtxInfo) -> RdxContext {
        let with_deadline = |ctx: RdxContext| {
            if info.exec_timeout_ms > 0 {
                ctx.with_deadline(std::time::Duration::from_millis(info.exec_timeout_ms as u64))
            } else {
                ctx
            }
        };
        if info.ctx_id == 0 {
            return with_deadline(RdxContext::empty());
        }
        let mut st = self.slot(info.ctx_id).lock();
        if st.refs == 0 {
            st.ctx_id = info.ctx_id;
            st.ctx = RdxContext::cancellable();
            st.refs = 1;
            with_deadline(st.ctx.clone())
        } else if st.ctx_id == info.ctx_id {
            st.refs += 1;
            with_deadline(st.ctx.clone())
        } else {
            with_deadline(RdxContext::cancellable())
        }
    }

    pub fn detach(&self, info: CtxInfo) {
        if info.ctx_id == 0 {
            return;
        }
        let mut st = self.slot(info.ctx_id).lock();
        if st.ctx_id == info.ctx_id && st.refs > 0 {
            st.refs -= 1;
            if st.refs == 0 {
                *st = SlotState::default();
            }
        }
    }

    /// Marks the context canceled. False when no live operation carries
    /// this id.
    pub fn cancel_context(&self, info: CtxInfo, how: CancelType) -> bool {
        let st = self.slot(info.ctx_id).lock();
        if st.refs > 0 && st.ctx_id == info.ctx_id {
            st.ctx.cancel(how);
            true
        } else {
            false
        }
    }
}

/// Scoped binding of a context to the current operation; releases the
/// slot on every exit path.
pub struct CtxKeeper<'a> {
    pool: &'a CtxPool,
    info: CtxInfo,
    pub ctx: RdxContext,
}

impl<'a> CtxKeeper<'a> {
    pub fn new(pool: &'a CtxPool, info: CtxInfo) -> Self {
        let ctx = pool.attach(info);
        CtxKeeper { pool, info, ctx }
    }
}

impl Drop for CtxKeeper<'_> {
    fn drop(&mut self) {
        self.pool.detach(self.info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_cancel_detach_cycle() {
        let pool = CtxPool::new(CTX_ARR_SIZE);
        let info = CtxInfo { ctx_id: 42, exec_timeout_ms: 0 };
        let keeper = CtxKeeper::new(&pool, info);
        assert!(!keeper.ctx.is_cancelled());

        assert!(pool.cancel_context(info, CancelType::Explicit));
        assert!(keeper.ctx.is_cancelled());
        drop(keeper);

        // the slot is free again; cancel finds nothing
        assert!(!pool.cancel_context(info, CancelType::Explicit));
    }

    #[test]
    fn nested_attachments_share_the_context() {
        let pool = CtxPool::new(CTX_ARR_SIZE);
        let info = CtxInfo { ctx_id: 7, exec_timeout_ms: 0 };
        let outer = CtxKeeper::new(&pool, info);
        let inner = CtxKeeper::new(&pool, info);
        pool.cancel_context(info, CancelType::Timeout);
        assert!(outer.ctx.is_cancelled());
        assert!(inner.ctx.is_cancelled());
        drop(inner);
        // still attached through the outer keeper
        assert!(pool.cancel_context(info, CancelType::Timeout));
    }

    #[test]
    fn colliding_ids_get_detached_contexts() {
        let pool = CtxPool::new(4);
        let a = CtxInfo { ctx_id: 1, exec_timeout_ms: 0 };
        let b = CtxInfo { ctx_id: 5, exec_timeout_ms: 0 }; // same slot
        let _ka = CtxKeeper::new(&pool, a);
        let kb = CtxKeeper::new(&pool, b);
        assert!(!pool.cancel_context(b, CancelType::Explicit));
        assert!(!kb.ctx.is_cancelled());
    }

    #[test]
    fn anonymous_context_is_uncancellable() {
        let pool = CtxPool::new(4);
        let keeper = CtxKeeper::new(&pool, CtxInfo::default());
        assert!(keeper.ctx.check().is_ok());
        assert!(!pool.cancel_context(CtxInfo::default(), CancelType::Explicit));
    }
}
