//! `Local` connections: the shared-memory ring endpoint a local
//! application attaches to. `LocalRx` sources frames the application wrote
//! into the ring and feeds them into the connection graph; `LocalTx` is the
//! sink that writes inbound frames back into the ring for the application
//! to read.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mcm_core::{CancelFn, Connection, ConnectionBase, Context, Kind, McmError, Result};

use crate::ring::RingPort;

const CTX_ESTABLISH: &str = "local.on_establish";
const CTX_ON_RECEIVE: &str = "local.on_receive";
const RING_POLL: Duration = Duration::from_millis(20);

struct Worker {
    cancel: CancelFn,
    handle: JoinHandle<()>,
}

/// Ring ownership and worker thread lifecycle shared by both directions.
struct LocalShared {
    ring: Arc<dyn RingPort>,
    worker: Mutex<Option<Worker>>,
}

impl LocalShared {
    fn new(ring: Arc<dyn RingPort>) -> Self {
        Self {
            ring,
            worker: Mutex::new(None),
        }
    }

    fn start(&self, ctx: &Context, body: impl FnOnce(Context) + Send + 'static) -> Result<()> {
        self.ring.connect(ctx)?;
        let (worker_ctx, cancel) = ctx.with_cancel();
        let handle = thread::Builder::new()
            .name("mcm-local-ring".into())
            .spawn(move || body(worker_ctx))
            .map_err(|e| McmError::ThreadCreationFailed {
                context: CTX_ESTABLISH,
                source: Some(e),
            })?;
        *self.worker.lock().unwrap() = Some(Worker { cancel, handle });
        Ok(())
    }

    fn stop(&self, ctx: &Context) -> Result<()> {
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.cancel.cancel();
            let _ = worker.handle.join();
        }
        self.ring.disconnect(ctx)
    }
}

/// Sources frames written into the shared-memory ring by a local
/// application and transmits them onward into the link graph. `Kind::
/// Transmitter`: it has no meaningful `on_receive` of its own.
pub struct LocalRx {
    base: ConnectionBase,
    shared: LocalShared,
}

impl LocalRx {
    pub fn new(id: impl Into<String>, ring: Arc<dyn RingPort>) -> Arc<dyn Connection> {
        mcm_core::wrap(Self {
            base: ConnectionBase::new(id, Kind::Transmitter),
            shared: LocalShared::new(ring),
        })
    }
}

impl Connection for LocalRx {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn on_establish(&self, ctx: &Context) -> Result<()> {
        let ring = self.shared.ring.clone();
        // The worker outlives this call, so it needs an owned handle back
        // into the connection graph rather than `&self`.
        let conn = self
            .base
            .self_arc()
            .expect("LocalRx must be constructed through mcm_core::wrap");
        self.shared.start(ctx, move |worker_ctx| {
            while !worker_ctx.cancelled() {
                match ring.recv_frame(&worker_ctx, RING_POLL) {
                    Ok(Some(frame)) => {
                        if let Err(err) = conn.transmit(&worker_ctx, &frame) {
                            tracing::warn!(connection = conn.id(), error = %err, "local rx transmit failed");
                        }
                    }
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::warn!(connection = conn.id(), error = %err, "local rx ring read failed");
                        break;
                    }
                }
            }
        })
    }

    fn on_shutdown(&self, ctx: &Context) -> Result<()> {
        self.shared.stop(ctx)
    }

    fn on_receive(&self, _ctx: &Context, _data: &[u8], _sent: &mut usize) -> Result<()> {
        Err(McmError::Unsupported {
            context: CTX_ON_RECEIVE,
        })
    }
}

/// Sink for the forward link: writes inbound frames into the ring for the
/// local application to read. `Kind::Receiver`.
pub struct LocalTx {
    base: ConnectionBase,
    shared: LocalShared,
}

impl LocalTx {
    pub fn new(id: impl Into<String>, ring: Arc<dyn RingPort>) -> Arc<dyn Connection> {
        mcm_core::wrap(Self {
            base: ConnectionBase::new(id, Kind::Receiver),
            shared: LocalShared::new(ring),
        })
    }
}

impl Connection for LocalTx {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn on_establish(&self, ctx: &Context) -> Result<()> {
        let ring = self.shared.ring.clone();
        self.shared.start(ctx, move |worker_ctx| {
            while !worker_ctx.cancelled() {
                if ring.pump_events(&worker_ctx, RING_POLL).is_err() {
                    break;
                }
            }
        })
    }

    fn on_shutdown(&self, ctx: &Context) -> Result<()> {
        self.shared.stop(ctx)
    }

    fn on_receive(&self, ctx: &Context, data: &[u8], sent: &mut usize) -> Result<()> {
        let n = self.shared.ring.send_frame(ctx, data)?;
        *sent = n;
        Ok(())
    }
}
