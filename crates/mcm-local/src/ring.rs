//! The external interface to the shared-memory ring a local application
//! reads/writes. Modeled as a trait so tests can substitute
//! an in-process fake instead of a real memif socket.

use std::time::Duration;

use mcm_core::{Context, McmError, Result};

/// One frame's worth of bytes moved across the ring in either direction.
pub type Frame = Vec<u8>;

/// A shared-memory ring endpoint. One `Local` connection owns exactly one
/// `RingPort`; `Tx`/`Rx` connections use it asymmetrically (`send_frame` vs
/// `recv_frame`) but both need `connect`/`pump_events`/`disconnect` to drive
/// the underlying socket's connection handshake and interrupt delivery.
pub trait RingPort: Send + Sync {
    /// Opens (or, for a master socket, starts listening for) the ring.
    fn connect(&self, ctx: &Context) -> Result<()>;

    fn disconnect(&self, ctx: &Context) -> Result<()>;

    /// Writes `frame` into the ring for the local application to consume.
    /// Used by the receiver-from-network side (`Tx` in the connection
    /// graph's vocabulary — it is the sink of a forward link).
    fn send_frame(&self, ctx: &Context, frame: &[u8]) -> Result<usize>;

    /// Blocks up to `timeout` for a frame the local application produced.
    /// Returns `Ok(None)` on a plain timeout so the polling worker can
    /// re-check cancellation; never blocks past `ctx`'s cancellation.
    fn recv_frame(&self, ctx: &Context, timeout: Duration) -> Result<Option<Frame>>;

    /// Services the underlying socket's event loop (accept, interrupt
    /// dispatch, keepalive) for one polling interval. Connections that need
    /// no background pumping may no-op.
    fn pump_events(&self, ctx: &Context, timeout: Duration) -> Result<()>;
}

/// In-memory fake used by unit tests: a bounded `VecDeque` guarded by a
/// mutex, standing in for the memif socket.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub struct FakeRing {
        inbound: Mutex<VecDeque<Frame>>,
        connected: Mutex<bool>,
    }

    impl FakeRing {
        pub fn new() -> Self {
            Self {
                inbound: Mutex::new(VecDeque::new()),
                connected: Mutex::new(false),
            }
        }

        /// Test helper: simulates the local application producing a frame.
        pub fn push_inbound(&self, frame: Frame) {
            self.inbound.lock().unwrap().push_back(frame);
        }
    }

    impl RingPort for FakeRing {
        fn connect(&self, _ctx: &Context) -> Result<()> {
            *self.connected.lock().unwrap() = true;
            Ok(())
        }

        fn disconnect(&self, _ctx: &Context) -> Result<()> {
            *self.connected.lock().unwrap() = false;
            Ok(())
        }

        fn send_frame(&self, _ctx: &Context, frame: &[u8]) -> Result<usize> {
            if !*self.connected.lock().unwrap() {
                return Err(McmError::wrong_state("fake_ring.send_frame", "not connected"));
            }
            Ok(frame.len())
        }

        fn recv_frame(&self, ctx: &Context, timeout: Duration) -> Result<Option<Frame>> {
            if ctx.cancelled() {
                return Ok(None);
            }
            if let Some(frame) = self.inbound.lock().unwrap().pop_front() {
                return Ok(Some(frame));
            }
            ctx.sleep(timeout.min(Duration::from_millis(5)));
            Ok(self.inbound.lock().unwrap().pop_front())
        }

        fn pump_events(&self, _ctx: &Context, _timeout: Duration) -> Result<()> {
            Ok(())
        }
    }
}
