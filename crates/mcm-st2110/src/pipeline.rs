//! External interface to the ST 2110 media pipeline library, split the
//! way the donor splits its own MTL wrapper into
//! `get_frame`/`put_frame`/`create_session`/`close_session` per
//! session type: `DeviceOps` (process-wide device) and `SessionOps`
//! (per-connection session plus per-frame transfer). Production code
//! wires these to a real pipeline-library binding; tests substitute an
//! in-process fake (see `fake` module, test-only).

use std::time::Duration;

use mcm_core::Result;

use crate::config::SessionConfig;

/// Opaque handle to the process-wide pipeline device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceToken(pub u64);

/// Opaque handle to one ST 2110 session (one `st20p`/`st22p`/`st30p`
/// handle-equivalent).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionToken(pub u64);

/// Opaque handle to one frame buffer owned by the pipeline library.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameToken(pub u64);

/// Payload plus the header fields a receive-side frame carries.
#[derive(Clone, Debug)]
pub struct FrameData {
    pub timestamp: u64,
    pub sequence: u64,
    pub payload: Vec<u8>,
}

/// Pipeline device init/start/uninit, mirroring `st_init`/`st_start`/
/// `st_stop`/`st_uninit` (called once per `dev_port`, shared across every
/// session opened against it).
pub trait DeviceOps: Send + Sync {
    fn device_init(&self, dev_port: &str) -> Result<DeviceToken>;
    fn device_uninit(&self, device: DeviceToken) -> Result<()>;
}

/// Per-session lifecycle and frame transfer, mirroring
/// `st20p_tx_create`/`st20p_tx_get_frame`/`st20p_tx_put_frame`/
/// `st20p_tx_free` (and the `st22p_*`/`st30p_*` equivalents).
pub trait SessionOps: Send + Sync {
    fn create_session(&self, device: DeviceToken, cfg: &SessionConfig) -> Result<SessionToken>;
    fn close_session(&self, session: SessionToken) -> Result<()>;

    /// Tx: acquires an empty frame ready to be filled. Rx: acquires the
    /// next fully received frame. Returns `Ok(None)` on a polling timeout,
    /// matching the donor's null-on-timeout convention.
    fn get_frame(&self, session: SessionToken, timeout: Duration) -> Result<Option<FrameToken>>;

    /// Tx: submits a filled frame for transmission. Rx: releases a drained
    /// frame back to the pipeline for reuse.
    fn put_frame(&self, session: SessionToken, frame: FrameToken) -> Result<()>;

    /// Copies `data` into the frame's payload region (Tx fill step).
    fn write_frame(&self, frame: FrameToken, data: &[u8]) -> Result<usize>;

    /// Reads the frame's payload and header fields (Rx drain step).
    fn read_frame(&self, frame: FrameToken) -> Result<FrameData>;
}

/// Bundles both seams so a connection only needs to carry one `Arc`.
pub trait Pipeline: DeviceOps + SessionOps {}
impl<T: DeviceOps + SessionOps> Pipeline for T {}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use mcm_core::{Channel, McmError};

    use crate::config::Direction;

    struct FrameSlot {
        timestamp: u64,
        sequence: u64,
        payload: Vec<u8>,
    }

    /// A process-wide in-memory pipeline: sessions created with matching
    /// `(local_ip, local_port, remote_ip, remote_port)` auto-pair, the way
    /// `ops::fake::FakeFabric` pairs RDMA endpoints. `put_frame` on the Tx
    /// side of a pair delivers the frame straight into the Rx side's
    /// pending queue; `get_frame` on the Rx side drains it.
    pub struct FakePipeline {
        next_id: AtomicU64,
        peers: Mutex<HashMap<u64, u64>>,
        addrs: Mutex<HashMap<(String, u16, String, u16), u64>>,
        frames: Mutex<HashMap<u64, FrameSlot>>,
        pending: Mutex<HashMap<u64, Channel<u64>>>,
        seq: Mutex<HashMap<u64, u64>>,
        directions: Mutex<HashMap<u64, Direction>>,
    }

    impl FakePipeline {
        pub fn new() -> Self {
            Self {
                next_id: AtomicU64::new(1),
                peers: Mutex::new(HashMap::new()),
                addrs: Mutex::new(HashMap::new()),
                frames: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                seq: Mutex::new(HashMap::new()),
                directions: Mutex::new(HashMap::new()),
            }
        }

        fn pending_channel(&self, session: u64) -> std::sync::MutexGuard<'_, HashMap<u64, Channel<u64>>> {
            let mut pending = self.pending.lock().unwrap();
            pending.entry(session).or_insert_with(|| Channel::new(64));
            pending
        }
    }

    impl DeviceOps for FakePipeline {
        fn device_init(&self, _dev_port: &str) -> Result<DeviceToken> {
            Ok(DeviceToken(self.next_id.fetch_add(1, Ordering::SeqCst)))
        }

        fn device_uninit(&self, _device: DeviceToken) -> Result<()> {
            Ok(())
        }
    }

    impl SessionOps for FakePipeline {
        fn create_session(&self, _device: DeviceToken, cfg: &SessionConfig) -> Result<SessionToken> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.seq.lock().unwrap().insert(id, 0);
            self.pending.lock().unwrap().insert(id, Channel::new(64));
            self.directions.lock().unwrap().insert(id, cfg.direction);

            let mine = (cfg.local_ip.clone(), cfg.local_port, cfg.remote_ip.clone(), cfg.remote_port);
            let theirs = (cfg.remote_ip.clone(), cfg.remote_port, cfg.local_ip.clone(), cfg.local_port);
            let mut addrs = self.addrs.lock().unwrap();
            if let Some(&peer_id) = addrs.get(&theirs) {
                self.peers.lock().unwrap().insert(id, peer_id);
                self.peers.lock().unwrap().insert(peer_id, id);
            }
            addrs.insert(mine, id);

            Ok(SessionToken(id))
        }

        fn close_session(&self, session: SessionToken) -> Result<()> {
            self.peers.lock().unwrap().remove(&session.0);
            self.pending.lock().unwrap().remove(&session.0);
            self.seq.lock().unwrap().remove(&session.0);
            self.directions.lock().unwrap().remove(&session.0);
            Ok(())
        }

        fn get_frame(&self, session: SessionToken, timeout: Duration) -> Result<Option<FrameToken>> {
            let direction = *self
                .directions
                .lock()
                .unwrap()
                .get(&session.0)
                .expect("get_frame on an unknown fake session");
            if direction == Direction::Tx {
                // Tx side: an empty frame to fill is always immediately available.
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                self.frames.lock().unwrap().insert(
                    id,
                    FrameSlot {
                        timestamp: 0,
                        sequence: 0,
                        payload: Vec::new(),
                    },
                );
                return Ok(Some(FrameToken(id)));
            }
            let pending = self.pending.lock().unwrap();
            let channel = pending.get(&session.0).unwrap();
            let ctx = mcm_core::Context::background().with_timeout(timeout);
            drop(pending);
            Ok(channel.receive(&ctx).map(FrameToken))
        }

        fn put_frame(&self, session: SessionToken, frame: FrameToken) -> Result<()> {
            let peer = self.peers.lock().unwrap().get(&session.0).copied();
            let Some(peer) = peer else {
                // Rx side releasing a drained frame: nothing further to do.
                self.frames.lock().unwrap().remove(&frame.0);
                return Ok(());
            };
            let pending = self.pending_channel(peer);
            let channel = pending.get(&peer).unwrap();
            channel.send(&mcm_core::Context::background(), frame.0);
            Ok(())
        }

        fn write_frame(&self, frame: FrameToken, data: &[u8]) -> Result<usize> {
            let mut frames = self.frames.lock().unwrap();
            let Some(slot) = frames.get_mut(&frame.0) else {
                return Err(McmError::bad_argument("fake_pipeline.write_frame"));
            };
            slot.payload = data.to_vec();
            Ok(data.len())
        }

        fn read_frame(&self, frame: FrameToken) -> Result<FrameData> {
            let frames = self.frames.lock().unwrap();
            let Some(slot) = frames.get(&frame.0) else {
                return Err(McmError::bad_argument("fake_pipeline.read_frame"));
            };
            Ok(FrameData {
                timestamp: slot.timestamp,
                sequence: slot.sequence,
                payload: slot.payload.clone(),
            })
        }
    }
}
