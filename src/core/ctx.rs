use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelType {
    None = 0,
    Explicit = 1,
    Timeout = 2,
}

/// Cooperative cancellation token. Long-running operations poll it at
/// suspension points (index scans, merge-step iterations, aggregation
/// batches) and abort with a `Canceled` error; the cause lands in the
/// message, the kind is the same for both. An optional per-request
/// deadline fails polls with `Timeout` once exceeded.
#[derive(Debug, Clone, Default)]
pub struct RdxContext {
    flag: Option<Arc<AtomicU8>>,
    deadline: Option<Instant>,
}

impl RdxContext {
    /// A context that can never be canceled.
    pub fn empty() -> Self {
        RdxContext { flag: None, deadline: None }
    }

    pub fn cancellable() -> Self {
        RdxContext {
            flag: Some(Arc::new(AtomicU8::new(CancelType::None as u8))),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn cancel(&self, how: CancelType) {
        if let Some(flag) = &self.flag {
            flag.store(how as u8, Ordering::Release);
        }
    }

    pub fn reset(&self) {
        if let Some(flag) = &self.flag {
            flag.store(CancelType::None as u8, Ordering::Release);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag
            .as_ref()
            .map(|f| f.load(Ordering::Acquire) != CancelType::None as u8)
            .unwrap_or(false)
    }

    pub fn check(&self) -> Result<()> {
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                return Err(Error::new(ErrorKind::Timeout, "request deadline exceeded"));
            }
        }
        match self.flag.as_ref().map(|f| f.load(Ordering::Acquire)) {
            Some(v) if v == CancelType::Explicit as u8 => Err(Error::new(
                ErrorKind::Canceled,
                "context was canceled explicitly",
            )),
            Some(v) if v == CancelType::Timeout as u8 => Err(Error::new(
                ErrorKind::Canceled,
                "context was canceled on timeout",
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_and_timeout_share_the_error_kind() {
        let ctx = RdxContext::cancellable();
        assert!(ctx.check().is_ok());

        ctx.cancel(CancelType::Explicit);
        let e1 = ctx.check().unwrap_err();
        assert_eq!(e1.kind, ErrorKind::Canceled);
        assert!(e1.context.contains("explicitly"));

        ctx.reset();
        ctx.cancel(CancelType::Timeout);
        let e2 = ctx.check().unwrap_err();
        assert_eq!(e2.kind, ErrorKind::Canceled);
        assert!(e2.context.contains("timeout"));
    }

    #[test]
    fn empty_context_never_cancels() {
        let ctx = RdxContext::empty();
        ctx.cancel(CancelType::Explicit);
        assert!(ctx.check().is_ok());
    }

    #[test]
    fn exceeded_deadline_is_a_timeout() {
        let ctx = RdxContext::cancellable().with_deadline(Duration::from_secs(0));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(ctx.check().unwrap_err().kind, ErrorKind::Timeout);
    }
}
