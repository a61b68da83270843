//! Cancellation-propagating scope with timeouts.
//!
//! `Context` is a tree: [`Background`](Context::background) is the root and
//! never cancels; every derived context either adds cancellability
//! ([`with_cancel`](Context::with_cancel)) or a timeout
//! ([`with_timeout`](Context::with_timeout)). Cancelling a parent cancels
//! every descendant. Blocking primitives (`Channel`, the RDMA buffer pool,
//! sleeps) consult [`Context::cancelled`] on every wake-up rather than
//! relying solely on an eager notification, so propagation is correct even
//! if a waiter is registered after the parent was already cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    parent: Option<Context>,
    wake: Condvar,
    wake_lock: Mutex<()>,
    children: Mutex<Vec<Weak<Inner>>>,
}

/// A cancellation-propagating scope. Cheap to clone (`Arc` inside).
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

/// Returned by [`Context::with_cancel`]; calling it cancels the context and
/// every context derived from it.
#[derive(Clone)]
pub struct CancelFn {
    target: Weak<Inner>,
}

impl CancelFn {
    /// Marks the associated context (and its descendants) cancelled.
    /// Idempotent: calling it more than once, or after the target context
    /// has already been dropped, is a no-op.
    pub fn cancel(&self) {
        if let Some(inner) = self.target.upgrade() {
            Context::propagate_cancel(&inner);
        }
    }
}

impl Context {
    /// The root context. Never cancels; all other contexts derive from it
    /// (directly or transitively).
    pub fn background() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: None,
                parent: None,
                wake: Condvar::new(),
                wake_lock: Mutex::new(()),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Derives a cancellable child. The returned `CancelFn` is the only way
    /// to cancel it directly; it also becomes cancelled if `self` (or any
    /// of its ancestors) is cancelled.
    pub fn with_cancel(&self) -> (Self, CancelFn) {
        let child = Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: None,
                parent: Some(self.clone()),
                wake: Condvar::new(),
                wake_lock: Mutex::new(()),
                children: Mutex::new(Vec::new()),
            }),
        };
        self.register_child(&child.inner);
        let cancel = CancelFn {
            target: Arc::downgrade(&child.inner),
        };
        (child, cancel)
    }

    /// Derives a child that cancels itself after `duration`, or when `self`
    /// cancels, whichever happens first.
    pub fn with_timeout(&self, duration: Duration) -> Self {
        let child = Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: Some(Instant::now() + duration),
                parent: Some(self.clone()),
                wake: Condvar::new(),
                wake_lock: Mutex::new(()),
                children: Mutex::new(Vec::new()),
            }),
        };
        self.register_child(&child.inner);
        child
    }

    fn register_child(&self, child: &Arc<Inner>) {
        self.inner.children.lock().unwrap().push(Arc::downgrade(child));
    }

    /// Non-blocking cancellation test. Lazily evaluates the deadline and
    /// walks the parent chain, so a parent cancelled after this context was
    /// created is still observed correctly.
    pub fn cancelled(&self) -> bool {
        Self::is_cancelled(&self.inner)
    }

    fn is_cancelled(inner: &Arc<Inner>) -> bool {
        if inner.cancelled.load(Ordering::Acquire) {
            return true;
        }
        if let Some(deadline) = inner.deadline {
            if Instant::now() >= deadline {
                inner.cancelled.store(true, Ordering::Release);
                return true;
            }
        }
        match &inner.parent {
            Some(parent) => Self::is_cancelled(&parent.inner),
            None => false,
        }
    }

    fn propagate_cancel(inner: &Arc<Inner>) {
        if inner
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let _guard = inner.wake_lock.lock().unwrap();
        drop(_guard);
        inner.wake.notify_all();
        let children = inner.children.lock().unwrap();
        for child in children.iter() {
            if let Some(child) = child.upgrade() {
                Self::propagate_cancel(&child);
            }
        }
    }

    /// Blocks until `duration` elapses or the context cancels, whichever
    /// comes first. Returns `true` if it woke because of cancellation.
    ///
    /// Implemented as a bounded condvar wait with a short repoll interval so
    /// that a parent-triggered cancellation (which only eagerly notifies
    /// contexts reachable from the canceller at the moment of cancel) is
    /// still observed promptly even by a waiter that raced the
    /// registration.
    pub fn sleep(&self, duration: Duration) -> bool {
        const POLL: Duration = Duration::from_millis(10);
        let deadline = Instant::now() + duration;
        loop {
            if self.cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let remaining = deadline - now;
            let step = remaining.min(POLL);
            let guard = self.inner.wake_lock.lock().unwrap();
            let _ = self.inner.wake.wait_timeout(guard, step).unwrap();
        }
    }

    /// Blocks until cancellation, with no timeout of its own. Used by
    /// worker loops that otherwise have their own wake source (e.g. a CQ
    /// poll) but need to park when idle.
    pub fn wait_cancelled(&self) {
        while !self.cancelled() {
            let guard = self.inner.wake_lock.lock().unwrap();
            let _ = self
                .inner
                .wake
                .wait_timeout(guard, Duration::from_millis(10))
                .unwrap();
        }
    }

    /// A recv-only handle that closes when this context cancels, for
    /// plumbing into select-like waits alongside a `Channel`.
    pub fn done_channel(&self) -> Done {
        Done { ctx: self.clone() }
    }
}

/// Handle returned by [`Context::done_channel`]. Closes (i.e. `recv`
/// returns) exactly when the underlying context becomes cancelled.
#[derive(Clone)]
pub struct Done {
    ctx: Context,
}

impl Done {
    /// Blocks until the context cancels.
    pub fn recv(&self) {
        self.ctx.wait_cancelled();
    }

    /// Non-blocking check, mirroring `Context::cancelled`.
    pub fn is_closed(&self) -> bool {
        self.ctx.cancelled()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn background_never_cancels() {
        let bg = Context::background();
        assert!(!bg.cancelled());
        assert!(!bg.sleep(Duration::from_millis(5)));
    }

    #[test]
    fn with_cancel_propagates_to_child() {
        let (parent, cancel) = Context::background().with_cancel();
        let (child, _child_cancel) = parent.with_cancel();
        assert!(!child.cancelled());
        cancel.cancel();
        assert!(parent.cancelled());
        assert!(child.cancelled());
    }

    #[test]
    fn with_timeout_expires() {
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        assert!(!ctx.cancelled());
        thread::sleep(Duration::from_millis(40));
        assert!(ctx.cancelled());
    }

    #[test]
    fn cancel_wakes_sleeper_promptly() {
        let (ctx, cancel) = Context::background().with_cancel();
        let waiter = ctx.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let woke_for_cancel = waiter.sleep(Duration::from_secs(5));
            (woke_for_cancel, start.elapsed())
        });
        thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        let (woke_for_cancel, elapsed) = handle.join().unwrap();
        assert!(woke_for_cancel);
        assert!(elapsed < Duration::from_millis(100));
    }

    #[test]
    fn cancel_is_idempotent() {
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        cancel.cancel();
        assert!(ctx.cancelled());
    }
}
