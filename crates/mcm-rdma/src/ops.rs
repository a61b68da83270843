//! External interface to libfabric, split into
//! the same four isolation seams the donor exposes for its own unit tests
//! (`libfabric_cq_ops_t`, `libfabric_mr_ops_t`, and the device/endpoint
//! open calls): `DeviceOps`, `EndpointOps`, `CqOps`, `MrOps`. Production
//! code wires these to real `libfabric`-backed implementations; tests
//! substitute an in-process fake (see `fake` module, test-only).

use std::time::Duration;

use mcm_core::Result;

/// Opaque handle to an initialized fabric/domain pair. Never dereferenced
/// by connection-graph code; only ever threaded back through `DeviceOps`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceToken(pub u64);

/// Opaque handle to one endpoint (one QP-equivalent) opened on a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EndpointToken(pub u64);

/// Opaque handle to a registered memory region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MrToken(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

/// Local/remote socket pair an endpoint binds to, plus the provider name
/// (e.g. "verbs", "sockets") `configure` validates.
#[derive(Clone, Debug)]
pub struct EndpointConfig {
    pub provider: String,
    pub local_ip: String,
    pub local_port: u16,
    pub remote_ip: String,
    pub remote_port: u16,
    pub direction: Direction,
}

/// One completion queue entry, carrying back the `buf_ctx` tag the caller
/// handed to `ep_recv_buf`/`ep_send_buf` so it can find the matching
/// buffer.
#[derive(Clone, Copy, Debug)]
pub struct CqEvent {
    pub buf_ctx: u64,
    pub len: usize,
}

/// `rdma_init`/`rdma_deinit`.
pub trait DeviceOps: Send + Sync {
    fn rdma_init(&self) -> Result<DeviceToken>;
    fn rdma_deinit(&self, device: DeviceToken) -> Result<()>;
}

/// `ep_init`/`ep_destroy`/`ep_send_buf`/`ep_recv_buf`.
pub trait EndpointOps: Send + Sync {
    fn ep_init(&self, device: DeviceToken, cfg: &EndpointConfig) -> Result<EndpointToken>;
    fn ep_destroy(&self, ep: EndpointToken) -> Result<()>;

    /// Posts `buf` for sending; completion surfaces later via `CqOps`.
    fn ep_send_buf(&self, ep: EndpointToken, buf: &[u8], buf_ctx: u64) -> Result<()>;

    /// Posts a registered receive buffer (`ptr`/`len` must come from memory
    /// already passed to `MrOps::reg_mr`). A completion carrying `buf_ctx`
    /// arrives via `CqOps::read_cq` once the peer writes into it.
    ///
    /// # Safety
    /// `ptr` must stay valid and uniquely posted until the matching
    /// completion is read or the endpoint is destroyed.
    fn ep_post_recv(&self, ep: EndpointToken, ptr: *mut u8, len: usize, buf_ctx: u64) -> Result<()>;
}

/// `rdma_read_cq` (one seam per direction, like the donor's `txcq`/`rxcq`).
pub trait CqOps: Send + Sync {
    fn read_cq(&self, ep: EndpointToken, timeout: Duration) -> Result<Option<CqEvent>>;
}

/// `rdma_reg_mr`/`rdma_unreg_mr`.
pub trait MrOps: Send + Sync {
    /// # Safety
    /// `ptr` must remain valid and exclusively owned by the registration
    /// for as long as the returned token is in use.
    fn reg_mr(&self, device: DeviceToken, ptr: *mut u8, len: usize) -> Result<MrToken>;
    fn unreg_mr(&self, mr: MrToken) -> Result<()>;
}

/// Bundles the four seams so a connection only needs to carry one `Arc`.
pub trait Fabric: DeviceOps + EndpointOps + CqOps + MrOps {}
impl<T: DeviceOps + EndpointOps + CqOps + MrOps> Fabric for T {}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use mcm_core::Channel;

    /// A posted receive buffer, recorded as a raw address/length pair so it
    /// can live in a `HashMap` across the `Send + Sync` boundary; dereferenced
    /// only inside `ep_send_buf`, while the buffer is still guaranteed live
    /// by the `EndpointOps::ep_post_recv` safety contract.
    struct PostedRecv {
        addr: usize,
        len: usize,
        buf_ctx: u64,
    }

    /// A process-wide in-memory "wire": `ep_send_buf` on one endpoint
    /// copies directly into the peer's next posted receive buffer (mimicking
    /// RDMA write-to-registered-memory) and signals completion over a
    /// channel that `read_cq` drains. Endpoints whose `EndpointConfig`s
    /// declare each other as local/remote auto-pair in `ep_init`;
    /// `register_pair` is available for tests that want to wire two
    /// endpoints without matching addresses.
    pub struct FakeFabric {
        next_id: AtomicU64,
        peers: Mutex<HashMap<u64, u64>>,
        posted: Mutex<HashMap<u64, VecDeque<PostedRecv>>>,
        completions: Mutex<HashMap<u64, std::sync::Arc<Channel<CqEvent>>>>,
        /// `(local_ip, local_port, remote_ip, remote_port) -> endpoint id`,
        /// used to auto-pair a Tx and an Rx endpoint configured as each
        /// other's peer without the test having to thread tokens through.
        addrs: Mutex<HashMap<(String, u16, String, u16), u64>>,
    }

    impl FakeFabric {
        pub fn new() -> Self {
            Self {
                next_id: AtomicU64::new(1),
                peers: Mutex::new(HashMap::new()),
                posted: Mutex::new(HashMap::new()),
                completions: Mutex::new(HashMap::new()),
                addrs: Mutex::new(HashMap::new()),
            }
        }

        /// Registers two endpoints as each other's wire peer.
        pub fn register_pair(&self, a: EndpointToken, b: EndpointToken) {
            self.peers.lock().unwrap().insert(a.0, b.0);
            self.peers.lock().unwrap().insert(b.0, a.0);
        }

        fn completion_channel(&self, ep: u64) -> std::sync::Arc<Channel<CqEvent>> {
            self.completions
                .lock()
                .unwrap()
                .entry(ep)
                .or_insert_with(|| std::sync::Arc::new(Channel::new(64)))
                .clone()
        }
    }

    impl DeviceOps for FakeFabric {
        fn rdma_init(&self) -> Result<DeviceToken> {
            Ok(DeviceToken(self.next_id.fetch_add(1, Ordering::SeqCst)))
        }

        fn rdma_deinit(&self, _device: DeviceToken) -> Result<()> {
            Ok(())
        }
    }

    impl EndpointOps for FakeFabric {
        fn ep_init(&self, _device: DeviceToken, cfg: &EndpointConfig) -> Result<EndpointToken> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.posted.lock().unwrap().insert(id, VecDeque::new());

            // Auto-pair with whichever previously-opened endpoint declared
            // us as its remote — lets a Tx/Rx pair wire up without the test
            // threading tokens through `register_pair` by hand.
            let mine = (cfg.local_ip.clone(), cfg.local_port, cfg.remote_ip.clone(), cfg.remote_port);
            let theirs = (cfg.remote_ip.clone(), cfg.remote_port, cfg.local_ip.clone(), cfg.local_port);
            let mut addrs = self.addrs.lock().unwrap();
            if let Some(&peer_id) = addrs.get(&theirs) {
                self.peers.lock().unwrap().insert(id, peer_id);
                self.peers.lock().unwrap().insert(peer_id, id);
            }
            addrs.insert(mine, id);

            Ok(EndpointToken(id))
        }

        fn ep_destroy(&self, ep: EndpointToken) -> Result<()> {
            self.posted.lock().unwrap().remove(&ep.0);
            self.completions.lock().unwrap().remove(&ep.0);
            self.peers.lock().unwrap().remove(&ep.0);
            Ok(())
        }

        fn ep_send_buf(&self, ep: EndpointToken, buf: &[u8], buf_ctx: u64) -> Result<()> {
            let peer = *self
                .peers
                .lock()
                .unwrap()
                .get(&ep.0)
                .expect("ep_send_buf on an unpaired fake endpoint");
            let posted = self
                .posted
                .lock()
                .unwrap()
                .get_mut(&peer)
                .and_then(VecDeque::pop_front);
            let Some(slot) = posted else {
                return Err(mcm_core::McmError::general_failure(
                    "fake_fabric.ep_send_buf",
                    "peer has no posted receive buffer",
                ));
            };
            if buf.len() > slot.len {
                return Err(mcm_core::McmError::bad_argument("fake_fabric.ep_send_buf"));
            }
            // SAFETY: `ep_post_recv`'s contract guarantees the buffer behind
            // `slot.addr` is still live and uniquely posted.
            unsafe {
                std::ptr::copy_nonoverlapping(buf.as_ptr(), slot.addr as *mut u8, buf.len());
            }
            self.completion_channel(peer).send(
                &mcm_core::Context::background(),
                CqEvent {
                    buf_ctx: slot.buf_ctx,
                    len: buf.len(),
                },
            );
            // The sender's own send completion, so its CQ reactor can
            // recycle the buffer it just posted.
            self.completion_channel(ep.0).send(
                &mcm_core::Context::background(),
                CqEvent {
                    buf_ctx,
                    len: buf.len(),
                },
            );
            Ok(())
        }

        fn ep_post_recv(&self, ep: EndpointToken, ptr: *mut u8, len: usize, buf_ctx: u64) -> Result<()> {
            self.posted.lock().unwrap().entry(ep.0).or_default().push_back(PostedRecv {
                addr: ptr as usize,
                len,
                buf_ctx,
            });
            Ok(())
        }
    }

    impl CqOps for FakeFabric {
        fn read_cq(&self, ep: EndpointToken, timeout: Duration) -> Result<Option<CqEvent>> {
            let channel = self.completion_channel(ep.0);
            let ctx = mcm_core::Context::background().with_timeout(timeout);
            Ok(channel.receive(&ctx))
        }
    }

    impl MrOps for FakeFabric {
        fn reg_mr(&self, _device: DeviceToken, _ptr: *mut u8, _len: usize) -> Result<MrToken> {
            Ok(MrToken(0))
        }

        fn unreg_mr(&self, _mr: MrToken) -> Result<()> {
            Ok(())
        }
    }
}
