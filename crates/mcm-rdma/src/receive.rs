//! RDMA receive pipeline, grounded on the donor's
//! `conn_rdma_rx.cc`: a posting thread keeps the pool drained onto the
//! endpoints' receive queues; a CQ-reactor thread reassembles completions
//! in order through a [`ReorderRing`] and forwards each payload onward via
//! `transmit`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mcm_core::{CancelFn, Connection, ConnectionBase, Context, Kind, McmError, Result};

use crate::buffer_pool::{Buffer, BufferPool};
use crate::config::RdmaConfig;
use crate::device::RdmaDeviceHandle;
use crate::endpoint::{open_striped, RdmaEndpoint};
use crate::ops::{Direction, EndpointToken, Fabric, MrToken};
use crate::reorder::ReorderRing;

const CTX_CONFIGURE: &str = "rdma_rx.configure";
const CTX_ESTABLISH: &str = "rdma_rx.establish";
const CTX_ON_RECEIVE: &str = "rdma_rx.on_receive";
const REORDER_WINDOW: usize = 256;
const CQ_BATCH: usize = 32;
const CQ_POLL_TIMEOUT: Duration = Duration::from_millis(1);
const POST_IDLE_POLL: Duration = Duration::from_millis(5);

struct Established {
    device: RdmaDeviceHandle,
    endpoints: Vec<RdmaEndpoint>,
    mrs: Vec<MrToken>,
    poster_cancel: CancelFn,
    poster: JoinHandle<()>,
    reactor_cancel: CancelFn,
    reactor: JoinHandle<()>,
}

/// The receiver half of an RDMA connection: `Kind::Transmitter` (it
/// produces data off the wire and forwards it onward via `transmit`).
pub struct RdmaRx {
    base: ConnectionBase,
    config: RdmaConfig,
    fabric: Arc<dyn Fabric>,
    pool: BufferPool,
    next_rx_idx: AtomicU64,
    established: Mutex<Option<Established>>,
}

impl RdmaRx {
    pub fn new(id: impl Into<String>, config: RdmaConfig, fabric: Arc<dyn Fabric>) -> Arc<dyn Connection> {
        let pool = BufferPool::new(config.transfer_size, config.queue_size);
        mcm_core::wrap(Self {
            base: ConnectionBase::new(id, Kind::Transmitter),
            config,
            fabric,
            pool,
            next_rx_idx: AtomicU64::new(0),
            established: Mutex::new(None),
        })
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }
}

impl Connection for RdmaRx {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn on_configure(&self, _ctx: &Context) -> Result<()> {
        self.config.validate().map_err(|_| McmError::bad_argument(CTX_CONFIGURE))
    }

    fn on_establish(&self, ctx: &Context) -> Result<()> {
        let mut slot = self.established.lock().unwrap();
        if slot.is_some() {
            return Err(McmError::AlreadyInitialized {
                context: CTX_ESTABLISH,
            });
        }

        let device = RdmaDeviceHandle::init(self.fabric.clone())?;
        let endpoints = open_striped(
            device.clone(),
            Direction::Rx,
            self.config.provider,
            &self.config.local_addr,
            &self.config.remote_addr,
            self.config.num_endpoints,
        )?;
        let endpoint_tokens: Vec<_> = endpoints.iter().map(|e| e.token()).collect();

        // Register the pool's whole region on every endpoint, never per slot.
        let (region_ptr, region_len) = self.pool.region();
        let mut mrs = Vec::with_capacity(endpoints.len());
        for _ep in &endpoints {
            match self.fabric.reg_mr(device.token(), region_ptr, region_len) {
                Ok(mr) => mrs.push(mr),
                Err(err) => {
                    tracing::error!(error = %err, "rdma rx mr registration failed");
                    for mr in mrs {
                        let _ = self.fabric.unreg_mr(mr);
                    }
                    return Err(McmError::MemoryRegistrationFailed { context: CTX_ESTABLISH });
                }
            }
        }

        let posted: Arc<Mutex<HashMap<u64, Buffer>>> = Arc::new(Mutex::new(HashMap::new()));

        let (poster_ctx, poster_cancel) = ctx.with_cancel();
        let poster = spawn_posting_thread(
            poster_ctx,
            self.pool.clone(),
            endpoint_tokens.clone(),
            self.fabric.clone(),
            posted.clone(),
            self.next_rx_idx.load(Ordering::Relaxed),
            self.base.id().to_string(),
        )?;

        let (reactor_ctx, reactor_cancel) = ctx.with_cancel();
        let conn = self
            .base
            .self_arc()
            .expect("RdmaRx must be constructed through mcm_core::wrap");
        let fabric = self.fabric.clone();
        let id = self.base.id().to_string();
        let reactor = thread::Builder::new()
            .name("mcm-rdma-rx-cq".into())
            .spawn(move || cq_reactor(reactor_ctx, conn, fabric, endpoint_tokens, posted, id))
            .map_err(|e| McmError::ThreadCreationFailed {
                context: CTX_ESTABLISH,
                source: Some(e),
            })?;

        *slot = Some(Established {
            device,
            endpoints,
            mrs,
            poster_cancel,
            poster,
            reactor_cancel,
            reactor,
        });
        Ok(())
    }

    fn on_shutdown(&self, _ctx: &Context) -> Result<()> {
        let Some(mut established) = self.established.lock().unwrap().take() else {
            return Ok(());
        };
        established.poster_cancel.cancel();
        established.reactor_cancel.cancel();
        let _ = established.poster.join();
        let _ = established.reactor.join();
        established.endpoints.sort_by_key(|e| std::cmp::Reverse(e.index()));
        drop(established.endpoints);
        for mr in established.mrs {
            if let Err(err) = self.fabric.unreg_mr(mr) {
                tracing::warn!(error = %err, "rdma rx mr deregistration failed");
            }
        }
        drop(established.device);
        Ok(())
    }

    fn on_receive(&self, _ctx: &Context, _data: &[u8], _sent: &mut usize) -> Result<()> {
        Err(McmError::Unsupported {
            context: CTX_ON_RECEIVE,
        })
    }
}

/// Posting thread: drains the pool onto the endpoints'
/// receive queues round-robin; parks on `POST_IDLE_POLL` when the pool is
/// empty (all slots currently posted or in the reorder ring).
#[allow(clippy::too_many_arguments)]
fn spawn_posting_thread(
    ctx: Context,
    pool: BufferPool,
    endpoints: Vec<EndpointToken>,
    fabric: Arc<dyn Fabric>,
    posted: Arc<Mutex<HashMap<u64, Buffer>>>,
    start_idx: u64,
    connection_id: String,
) -> Result<JoinHandle<()>> {
    let counter = AtomicU64::new(start_idx);
    thread::Builder::new()
        .name("mcm-rdma-rx-post".into())
        .spawn(move || {
            while !ctx.cancelled() {
                while let Some(buf) = pool.try_acquire() {
                    let idx = (counter.fetch_add(1, Ordering::Relaxed) as usize) % endpoints.len();
                    let ep = endpoints[idx];
                    let tag = buf.tag();
                    let (ptr, _) = buf.as_raw_parts();
                    let len = buf.wire_len();
                    match fabric.ep_post_recv(ep, ptr, len, tag) {
                        Ok(()) => {
                            posted.lock().unwrap().insert(tag, buf);
                        }
                        Err(err) => {
                            tracing::error!(connection = %connection_id, error = %err, "rdma rx post-recv failed");
                            // `buf` drops here, recycling itself.
                        }
                    }
                }
                ctx.sleep(POST_IDLE_POLL);
            }
        })
        .map_err(|e| McmError::ThreadCreationFailed {
            context: CTX_ESTABLISH,
            source: Some(e),
        })
}

/// CQ reactor: reads completions off every endpoint,
/// reassembles them in order through a [`ReorderRing`], delivers each
/// payload via `transmit`, then recycles the slot.
fn cq_reactor(
    ctx: Context,
    conn: Arc<dyn Connection>,
    fabric: Arc<dyn Fabric>,
    endpoints: Vec<EndpointToken>,
    posted: Arc<Mutex<HashMap<u64, Buffer>>>,
    connection_id: String,
) {
    let mut ring: ReorderRing<Buffer> = ReorderRing::new(REORDER_WINDOW);
    let mut spins = 0u32;

    while !ctx.cancelled() {
        let mut did_work = false;
        'endpoints: for ep in &endpoints {
            for _ in 0..CQ_BATCH {
                match fabric.read_cq(*ep, CQ_POLL_TIMEOUT) {
                    Ok(Some(event)) => {
                        did_work = true;
                        deliver_completion(&conn, &ctx, &posted, &mut ring, event.buf_ctx, &connection_id);
                    }
                    Ok(None) => continue 'endpoints,
                    Err(err) => {
                        tracing::error!(connection = %connection_id, error = %err, "rdma rx cq read failed");
                        continue 'endpoints;
                    }
                }
            }
        }
        if did_work {
            spins = 0;
        } else {
            back_off(&ctx, &mut spins);
        }
    }

    // Shutdown: whatever is still posted or sitting in the
    // reorder ring is dropped here, recycling it to the pool so the
    // no-slot-leak invariant holds even mid-flight.
    for (_, buf) in posted.lock().unwrap().drain() {
        drop(buf);
    }
    for buf in ring.drain() {
        drop(buf);
    }
}

fn deliver_completion(
    conn: &Arc<dyn Connection>,
    ctx: &Context,
    posted: &Arc<Mutex<HashMap<u64, Buffer>>>,
    ring: &mut ReorderRing<Buffer>,
    buf_ctx: u64,
    connection_id: &str,
) {
    let Some(buf) = posted.lock().unwrap().remove(&buf_ctx) else {
        tracing::warn!(connection = %connection_id, "rdma rx cq completion for unposted buffer");
        return;
    };
    let seq = buf.sequence();
    let flushed = ring.push(seq, buf);
    for ready in flushed.items {
        let payload = ready.read_payload();
        if let Err(err) = conn.transmit(ctx, &payload) {
            tracing::warn!(connection = %connection_id, error = %err, "rdma rx transmit failed");
        }
        drop(ready); // recycles back to the pool
    }
}

/// Hybrid back-off matching the donor's `-EAGAIN` handling:
/// spin, then yield, then sleep.
fn back_off(ctx: &Context, spins: &mut u32) {
    const PAUSE_SPINS: u32 = 50;
    const YIELD_SPINS: u32 = 200;
    *spins += 1;
    if *spins <= PAUSE_SPINS {
        std::hint::spin_loop();
    } else if *spins <= PAUSE_SPINS + YIELD_SPINS {
        thread::yield_now();
    } else {
        ctx.sleep(Duration::from_micros(100));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointAddr, Provider};
    use crate::ops::fake::FakeFabric;
    use crate::transmit::RdmaTx;
    use std::time::Duration as StdDuration;

    fn tx_config() -> RdmaConfig {
        RdmaConfig {
            local_addr: EndpointAddr::new("192.168.1.21", 8002),
            remote_addr: EndpointAddr::new("192.168.1.22", 8002),
            transfer_size: 12,
            queue_size: 16,
            provider: Provider::Verbs,
            num_endpoints: 1,
        }
    }

    fn rx_config() -> RdmaConfig {
        RdmaConfig {
            local_addr: EndpointAddr::new("192.168.1.22", 8002),
            remote_addr: EndpointAddr::new("192.168.1.21", 8002),
            transfer_size: 12,
            queue_size: 16,
            provider: Provider::Verbs,
            num_endpoints: 1,
        }
    }

    struct Sink {
        base: ConnectionBase,
        received: Mutex<Vec<Vec<u8>>>,
    }

    impl Sink {
        fn new() -> Arc<dyn Connection> {
            mcm_core::wrap(Self {
                base: ConnectionBase::new("sink", Kind::Receiver),
                received: Mutex::new(Vec::new()),
            })
        }
    }

    impl Connection for Sink {
        fn base(&self) -> &ConnectionBase {
            &self.base
        }
        fn on_establish(&self, _ctx: &Context) -> Result<()> {
            Ok(())
        }
        fn on_shutdown(&self, _ctx: &Context) -> Result<()> {
            Ok(())
        }
        fn on_receive(&self, _ctx: &Context, data: &[u8], sent: &mut usize) -> Result<()> {
            self.received.lock().unwrap().push(data.to_vec());
            *sent = data.len();
            Ok(())
        }
    }

    /// Upstream feeder driving `tx` through the connection graph's normal
    /// `transmit()` path, rather than calling `tx.on_receive` directly, so
    /// `tx`'s own metrics (bumped by its *feeder's* `transmit`, not by
    /// `on_receive` itself) get exercised the way they would in production.
    struct Source {
        base: ConnectionBase,
    }

    impl Source {
        fn new() -> Arc<dyn Connection> {
            mcm_core::wrap(Self {
                base: ConnectionBase::new("source", Kind::Transmitter),
            })
        }
    }

    impl Connection for Source {
        fn base(&self) -> &ConnectionBase {
            &self.base
        }
        fn on_establish(&self, _ctx: &Context) -> Result<()> {
            Ok(())
        }
        fn on_shutdown(&self, _ctx: &Context) -> Result<()> {
            Ok(())
        }
        fn on_receive(&self, _ctx: &Context, _data: &[u8], _sent: &mut usize) -> Result<()> {
            unreachable!("Source never receives")
        }
    }

    /// Scenario 1: single-endpoint RDMA echo, five identical
    /// 12-byte buffers delivered in order.
    #[test]
    fn single_endpoint_echo_delivers_in_order() {
        let ctx = Context::background();
        let fabric = Arc::new(FakeFabric::new());

        let tx = RdmaTx::new("tx", tx_config(), fabric.clone());
        let rx = RdmaRx::new("rx", rx_config(), fabric.clone());
        let sink = Sink::new();
        let source = Source::new();

        tx.configure(&ctx).unwrap();
        rx.configure(&ctx).unwrap();
        sink.configure(&ctx).unwrap();
        source.configure(&ctx).unwrap();
        sink.establish(&ctx).unwrap();
        rx.set_link(&ctx, Some(sink.clone()), None).unwrap();
        source.set_link(&ctx, Some(tx.clone()), None).unwrap();
        // `rx_config`'s local/remote addresses mirror `tx_config`'s, so
        // `FakeFabric::ep_init` auto-pairs endpoint 0 on each side.
        rx.establish(&ctx).unwrap();
        tx.establish(&ctx).unwrap();
        source.establish(&ctx).unwrap();

        for _ in 0..5 {
            let sent = source.transmit(&ctx, b"Hello World\0").unwrap();
            assert_eq!(sent, 12);
        }

        std::thread::sleep(StdDuration::from_millis(200));

        assert_eq!(sink.metrics().transactions_successful(), 5);
        assert_eq!(tx.metrics().transactions_successful(), 5);
        assert_eq!(sink.metrics().errors(), 0);

        source.shutdown(&ctx).unwrap();
        tx.shutdown(&ctx).unwrap();
        rx.shutdown(&ctx).unwrap();
    }
}
