//! Bounded blocking FIFO channel.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::context::Context;

struct State<T> {
    queue: VecDeque<T>,
    closed: bool,
}

/// A bounded FIFO, safe for any number of producers and consumers.
/// `send`/`receive` are cancellation-aware via the `Context` passed in.
pub struct Channel<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> Channel<T> {
    /// `capacity` must be at least 1.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "channel capacity must be >= 1");
        Self {
            capacity,
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Blocks until a slot is free, the channel closes, or `ctx` cancels.
    /// Returns `false` in the latter two cases; the item is not enqueued.
    pub fn send(&self, ctx: &Context, value: T) -> bool {
        const POLL: Duration = Duration::from_millis(10);
        let mut guard = self.state.lock().unwrap();
        loop {
            if guard.closed {
                return false;
            }
            if guard.queue.len() < self.capacity {
                guard.queue.push_back(value);
                self.not_empty.notify_one();
                return true;
            }
            if ctx.cancelled() {
                return false;
            }
            let (g, _) = self.not_full.wait_timeout(guard, POLL).unwrap();
            guard = g;
        }
    }

    /// Blocks until an item is available, the channel closes with nothing
    /// queued, or `ctx` cancels.
    pub fn receive(&self, ctx: &Context) -> Option<T> {
        const POLL: Duration = Duration::from_millis(10);
        let mut guard = self.state.lock().unwrap();
        loop {
            if let Some(item) = guard.queue.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if guard.closed {
                return None;
            }
            if ctx.cancelled() {
                return None;
            }
            let (g, _) = self.not_empty.wait_timeout(guard, POLL).unwrap();
            guard = g;
        }
    }

    /// Closes the channel, unblocking every waiter with an empty result.
    pub fn close(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.closed = true;
        drop(guard);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn fifo_order_single_producer_consumer() {
        let ch: Channel<i32> = Channel::new(4);
        let ctx = Context::background();
        for i in 0..4 {
            assert!(ch.send(&ctx, i));
        }
        for i in 0..4 {
            assert_eq!(ch.receive(&ctx), Some(i));
        }
    }

    #[test]
    fn send_blocks_until_slot_free() {
        let ch = Arc::new(Channel::<i32>::new(1));
        let ctx = Context::background();
        assert!(ch.send(&ctx, 1));

        let ch2 = ch.clone();
        let ctx2 = ctx.clone();
        let handle = thread::spawn(move || ch2.send(&ctx2, 2));

        thread::sleep(Duration::from_millis(30));
        assert_eq!(ch.receive(&ctx), Some(1));
        assert!(handle.join().unwrap());
        assert_eq!(ch.receive(&ctx), Some(2));
    }

    #[test]
    fn receive_returns_none_on_cancel() {
        let ch: Channel<i32> = Channel::new(1);
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        let start = Instant::now();
        assert_eq!(ch.receive(&ctx), None);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn close_unblocks_all_waiters() {
        let ch = Arc::new(Channel::<i32>::new(1));
        let ctx = Context::background();
        let ch2 = ch.clone();
        let ctx2 = ctx.clone();
        let handle = thread::spawn(move || ch2.receive(&ctx2));
        thread::sleep(Duration::from_millis(20));
        ch.close();
        assert_eq!(handle.join().unwrap(), None);
    }
}
