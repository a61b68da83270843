//! Process-wide fabric/domain singleton.
//!
//! The donor's `Rdma` base class keeps a static `active_connections`
//! refcount and tears the libfabric device down only when the last
//! connection releases it (`deinit_rdma_if_needed`). `RdmaDeviceHandle`
//! models the same lifecycle as an `Arc`-backed guard: cloning it bumps the
//! refcount, dropping the last clone tears down the device under a mutex.
//! `init` itself is reference-counted across independent connections too —
//! concurrent `establish` calls passing the same `fabric` instance share one
//! underlying `rdma_init` token rather than each paying for their own,
//! matching the donor's single-fabric-per-process model. The registry keys
//! on the `Arc<dyn DeviceOps>` pointer so tests that inject distinct fakes
//! still get independent devices.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use mcm_core::Result;

use crate::ops::{DeviceOps, DeviceToken};

struct Shared {
    fabric: Arc<dyn DeviceOps>,
    token: Mutex<Option<DeviceToken>>,
}

fn registry() -> &'static Mutex<HashMap<usize, Weak<Shared>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<usize, Weak<Shared>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A reference-counted handle to the process-wide fabric/domain. The last
/// clone to drop tears the device down.
#[derive(Clone)]
pub struct RdmaDeviceHandle {
    shared: Arc<Shared>,
}

impl RdmaDeviceHandle {
    /// Initialises the fabric/domain the first time it's called for a given
    /// `fabric` instance; every subsequent call (from a concurrent
    /// `establish` on another connection sharing the same `fabric`) reuses
    /// the live `Shared` and just bumps its `Arc` refcount — a
    /// reference-counted device singleton per fabric.
    pub fn init(fabric: Arc<dyn DeviceOps>) -> Result<Self> {
        let key = Arc::as_ptr(&fabric) as *const () as usize;
        let mut reg = registry().lock().unwrap();
        if let Some(shared) = reg.get(&key).and_then(Weak::upgrade) {
            return Ok(Self { shared });
        }
        let token = fabric.rdma_init()?;
        let shared = Arc::new(Shared {
            fabric,
            token: Mutex::new(Some(token)),
        });
        reg.insert(key, Arc::downgrade(&shared));
        Ok(Self { shared })
    }

    pub fn token(&self) -> DeviceToken {
        self.shared
            .token
            .lock()
            .unwrap()
            .expect("device handle used after teardown")
    }

    pub fn fabric(&self) -> &Arc<dyn DeviceOps> {
        &self.shared.fabric
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let key = Arc::as_ptr(&self.fabric) as *const () as usize;
        registry().lock().unwrap().remove(&key);
        if let Some(token) = self.token.lock().unwrap().take() {
            if let Err(err) = self.fabric.rdma_deinit(token) {
                tracing::error!(error = %err, "rdma device teardown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::fake::FakeFabric;

    #[test]
    fn shares_refcount_across_clones() {
        let fabric = Arc::new(FakeFabric::new());
        let a = RdmaDeviceHandle::init(fabric).unwrap();
        let b = a.clone();
        assert_eq!(a.token(), b.token());
        drop(a);
        // `b` still holds the shared `Arc<Shared>`; device stays alive.
        let _ = b.token();
    }

    #[test]
    fn separate_init_calls_share_one_device_for_the_same_fabric() {
        let fabric = Arc::new(FakeFabric::new());
        let a = RdmaDeviceHandle::init(fabric.clone()).unwrap();
        let b = RdmaDeviceHandle::init(fabric).unwrap();
        assert_eq!(a.token(), b.token());
    }

    #[test]
    fn distinct_fabrics_get_distinct_devices() {
        let a = RdmaDeviceHandle::init(Arc::new(FakeFabric::new())).unwrap();
        let b = RdmaDeviceHandle::init(Arc::new(FakeFabric::new())).unwrap();
        assert_ne!(a.token(), b.token());
    }

    #[test]
    fn device_tears_down_only_after_last_handle_drops() {
        let fabric = Arc::new(FakeFabric::new());
        let a = RdmaDeviceHandle::init(fabric.clone()).unwrap();
        drop(a);
        // Registry entry is gone; a fresh `init` allocates a new device
        // rather than resurrecting the torn-down one.
        let b = RdmaDeviceHandle::init(fabric).unwrap();
        let _ = b.token();
    }
}
