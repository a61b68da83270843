//! RDMA transmit pipeline, grounded on the donor's
//! `conn_rdma_tx.cc`: `on_receive` stamps and posts a send per call; a
//! dedicated CQ-reactor thread recycles buffers as send completions land.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mcm_core::{CancelFn, Connection, ConnectionBase, Context, Kind, McmError, Result};

use crate::buffer_pool::{Buffer, BufferPool};
use crate::config::RdmaConfig;
use crate::device::RdmaDeviceHandle;
use crate::endpoint::{open_striped, RdmaEndpoint};
use crate::ops::{Direction, Fabric, MrToken};

const CTX_CONFIGURE: &str = "rdma_tx.configure";
const CTX_ESTABLISH: &str = "rdma_tx.establish";
const CTX_ON_RECEIVE: &str = "rdma_tx.on_receive";
const ACQUIRE_RETRY: Duration = Duration::from_micros(100);
const ACQUIRE_BUDGET: Duration = Duration::from_millis(500);
const CQ_BATCH: usize = 32;
const CQ_POLL_TIMEOUT: Duration = Duration::from_millis(1);
const CQ_IDLE_SLEEP: Duration = Duration::from_micros(100);

struct Established {
    device: RdmaDeviceHandle,
    endpoints: Vec<RdmaEndpoint>,
    mrs: Vec<MrToken>,
    inflight: Arc<Mutex<HashMap<u64, Buffer>>>,
    cancel: CancelFn,
    reactor: JoinHandle<()>,
}

/// The transmitter half of an RDMA connection: `Kind::Receiver` in the
/// connection graph's vocabulary (it receives from its upstream link and
/// sends onto the wire).
pub struct RdmaTx {
    base: ConnectionBase,
    config: RdmaConfig,
    fabric: Arc<dyn Fabric>,
    pool: BufferPool,
    global_seq: AtomicU64,
    next_tx_idx: AtomicU64,
    established: Mutex<Option<Established>>,
}

impl RdmaTx {
    pub fn new(id: impl Into<String>, config: RdmaConfig, fabric: Arc<dyn Fabric>) -> Arc<dyn Connection> {
        let pool = BufferPool::new(config.transfer_size, config.queue_size);
        mcm_core::wrap(Self {
            base: ConnectionBase::new(id, Kind::Receiver),
            config,
            fabric,
            pool,
            global_seq: AtomicU64::new(0),
            next_tx_idx: AtomicU64::new(0),
            established: Mutex::new(None),
        })
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    fn acquire_with_retry(&self, ctx: &Context) -> Result<Buffer> {
        let deadline = Instant::now() + ACQUIRE_BUDGET;
        loop {
            if let Some(buf) = self.pool.try_acquire() {
                return Ok(buf);
            }
            if ctx.cancelled() {
                return Err(McmError::ContextCancelled {
                    context: CTX_ON_RECEIVE,
                });
            }
            if Instant::now() >= deadline {
                return Err(McmError::Timeout {
                    context: CTX_ON_RECEIVE,
                });
            }
            ctx.sleep(ACQUIRE_RETRY);
        }
    }
}

impl Connection for RdmaTx {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn on_configure(&self, _ctx: &Context) -> Result<()> {
        self.config.validate().map_err(|_| McmError::bad_argument(CTX_CONFIGURE))
    }

    /// Init the device, open N striped endpoints (endpoint 0 owns the CQ;
    /// 1..N-1 share it on the receive side — transmitters instead
    /// round-robin their own sends across all N), register the
    /// pool, spawn the CQ reactor.
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
            Direction::Tx,
            self.config.provider,
            &self.config.local_addr,
            &self.config.remote_addr,
            self.config.num_endpoints,
        )?;

        // Register the pool's whole region on every endpoint, never per slot.
        let (region_ptr, region_len) = self.pool.region();
        let mut mrs = Vec::with_capacity(endpoints.len());
        for _ep in &endpoints {
            match self.fabric.reg_mr(device.token(), region_ptr, region_len) {
                Ok(mr) => mrs.push(mr),
                Err(err) => {
                    tracing::error!(error = %err, "rdma tx mr registration failed");
                    for mr in mrs {
                        let _ = self.fabric.unreg_mr(mr);
                    }
                    return Err(McmError::MemoryRegistrationFailed { context: CTX_ESTABLISH });
                }
            }
        }

        let inflight: Arc<Mutex<HashMap<u64, Buffer>>> = Arc::new(Mutex::new(HashMap::new()));
        let (reactor_ctx, cancel) = ctx.with_cancel();
        let endpoint_tokens: Vec<_> = endpoints.iter().map(|e| e.token()).collect();
        let fabric = self.fabric.clone();
        let reactor_inflight = inflight.clone();
        let id = self.base.id().to_string();
        let reactor = thread::Builder::new()
            .name("mcm-rdma-tx-cq".into())
            .spawn(move || cq_reactor(reactor_ctx, fabric, endpoint_tokens, reactor_inflight, id))
            .map_err(|e| McmError::ThreadCreationFailed {
                context: CTX_ESTABLISH,
                source: Some(e),
            })?;

        *slot = Some(Established {
            device,
            endpoints,
            mrs,
            inflight,
            cancel,
            reactor,
        });
        Ok(())
    }

    /// Cancel the reactor, join it, destroy endpoints highest index first,
    /// release the device refcount.
    fn on_shutdown(&self, _ctx: &Context) -> Result<()> {
        let Some(mut established) = self.established.lock().unwrap().take() else {
            return Ok(());
        };
        established.cancel.cancel();
        let _ = established.reactor.join();
        established.endpoints.sort_by_key(|e| std::cmp::Reverse(e.index()));
        drop(established.endpoints);
        for mr in established.mrs {
            if let Err(err) = self.fabric.unreg_mr(mr) {
                tracing::warn!(error = %err, "rdma tx mr deregistration failed");
            }
        }
        drop(established.inflight);
        drop(established.device);
        Ok(())
    }

    /// Acquires a buffer, stamps it with the next sequence number, posts
    /// the send, and tracks it as in-flight until the CQ reactor recycles
    /// it.
    fn on_receive(&self, ctx: &Context, data: &[u8], sent: &mut usize) -> Result<()> {
        let guard = self.established.lock().unwrap();
        let Some(established) = guard.as_ref() else {
            return Err(McmError::wrong_state(CTX_ON_RECEIVE, "not established"));
        };

        let mut buf = self.acquire_with_retry(ctx)?;
        let n = data.len().min(self.pool.payload_len());
        buf.fill(&data[..n])?;
        buf.set_len(n);
        buf.set_sequence(self.global_seq.fetch_add(1, Ordering::Relaxed));

        let idx = (self.next_tx_idx.fetch_add(1, Ordering::Relaxed) as usize) % established.endpoints.len();
        let endpoint = &established.endpoints[idx];
        let tag = buf.tag();
        let wire = buf.wire_bytes();

        match endpoint.send(&wire, tag) {
            Ok(()) => {
                established.inflight.lock().unwrap().insert(tag, buf);
                *sent = n;
                Ok(())
            }
            Err(_) => Err(McmError::general_failure(CTX_ON_RECEIVE, "rdma post-send failed")),
        }
    }
}

/// CQ reactor: round-robins endpoints, batches up to
/// `CQ_BATCH` completions per endpoint, recycles the matching in-flight
/// buffer on each one.
fn cq_reactor(
    ctx: Context,
    fabric: Arc<dyn Fabric>,
    endpoints: Vec<crate::ops::EndpointToken>,
    inflight: Arc<Mutex<HashMap<u64, Buffer>>>,
    connection_id: String,
) {
    while !ctx.cancelled() {
        let mut did_work = false;
        for ep in &endpoints {
            for _ in 0..CQ_BATCH {
                match fabric.read_cq(*ep, CQ_POLL_TIMEOUT) {
                    Ok(Some(event)) => {
                        did_work = true;
                        if inflight.lock().unwrap().remove(&event.buf_ctx).is_none() {
                            tracing::warn!(connection = %connection_id, "tx cq completion for unknown buffer");
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::error!(connection = %connection_id, error = %err, "rdma tx cq read failed");
                        break;
                    }
                }
            }
        }
        if !did_work {
            ctx.sleep(CQ_IDLE_SLEEP);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointAddr, Provider};
    use crate::ops::fake::FakeFabric;

    fn config() -> RdmaConfig {
        RdmaConfig {
            local_addr: EndpointAddr::new("192.168.1.21", 8002),
            remote_addr: EndpointAddr::new("192.168.1.22", 8002),
            transfer_size: 12,
            queue_size: 4,
            provider: Provider::Verbs,
            num_endpoints: 1,
        }
    }

    #[test]
    fn establish_then_shutdown_leaves_pool_full() {
        let ctx = Context::background();
        let fabric = Arc::new(FakeFabric::new());
        let tx = RdmaTx::new("tx", config(), fabric);
        tx.configure(&ctx).unwrap();
        tx.establish(&ctx).unwrap();
        tx.shutdown(&ctx).unwrap();
        assert_eq!(tx.state(), mcm_core::State::Closed);
    }

    #[test]
    fn on_receive_without_establish_is_wrong_state() {
        let ctx = Context::background();
        let fabric = Arc::new(FakeFabric::new());
        let tx = RdmaTx::new("tx", config(), fabric);
        tx.configure(&ctx).unwrap();
        let mut sent = 0;
        let err = tx.on_receive(&ctx, b"hi", &mut sent).unwrap_err();
        assert!(matches!(err, McmError::WrongState { .. }));
    }

    #[test]
    fn establish_twice_is_already_initialized() {
        let ctx = Context::background();
        let fabric = Arc::new(FakeFabric::new());
        let tx = RdmaTx::new("tx", config(), fabric);
        tx.configure(&ctx).unwrap();
        tx.establish(&ctx).unwrap();
        let err = tx.on_establish(&ctx).unwrap_err();
        assert!(matches!(err, McmError::AlreadyInitialized { .. }));
        tx.shutdown(&ctx).unwrap();
    }
}
