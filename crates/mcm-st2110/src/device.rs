//! Process-wide pipeline device singleton, grounded on
//! the donor's `get_mtl_handle`: the first session to configure against a
//! `dev_port` initialises the device; later sessions share it through a
//! clone. `St2110DeviceHandle` models the same lifecycle as an
//! `Arc`-backed guard, mirroring `mcm_rdma::RdmaDeviceHandle` — including
//! the process-wide reuse across independent `init` calls keyed on the
//! `dev_port` string, so every session opened against the same config file
//! shares one `device_init`/`device_uninit` pair regardless of which
//! connection establishes first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use mcm_core::Result;

use crate::pipeline::{DeviceToken, Pipeline};

struct Shared {
    pipeline: Arc<dyn Pipeline>,
    token: Mutex<Option<DeviceToken>>,
}

type RegistryKey = (usize, String);

fn registry() -> &'static Mutex<HashMap<RegistryKey, Weak<Shared>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<RegistryKey, Weak<Shared>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A reference-counted handle to the process-wide pipeline device. The
/// last clone to drop tears the device down.
#[derive(Clone)]
pub struct St2110DeviceHandle {
    shared: Arc<Shared>,
}

impl St2110DeviceHandle {
    /// Initialises the device the first time it's called for a given
    /// `(pipeline, dev_port)` pair; subsequent sessions against the same
    /// pipeline instance and port reuse the live `Shared` and just bump its
    /// `Arc` refcount. Keying on the pipeline's identity too (not just the
    /// port string) keeps independently-injected fakes — e.g. one per test
    /// — from colliding on a shared literal `dev_port`.
    pub fn init(pipeline: Arc<dyn Pipeline>, dev_port: &str) -> Result<Self> {
        let key = (Arc::as_ptr(&pipeline) as *const () as usize, dev_port.to_string());
        let mut reg = registry().lock().unwrap();
        if let Some(shared) = reg.get(&key).and_then(Weak::upgrade) {
            return Ok(Self { shared });
        }
        let token = pipeline.device_init(dev_port)?;
        let shared = Arc::new(Shared {
            pipeline,
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

    pub fn pipeline(&self) -> &Arc<dyn Pipeline> {
        &self.shared.pipeline
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let key = (Arc::as_ptr(&self.pipeline) as *const () as usize, String::new());
        registry().lock().unwrap().retain(|k, _| k.0 != key.0);
        if let Some(token) = self.token.lock().unwrap().take() {
            if let Err(err) = self.pipeline.device_uninit(token) {
                tracing::error!(error = %err, "st2110 device teardown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fake::FakePipeline;

    #[test]
    fn shares_refcount_across_clones() {
        let pipeline = Arc::new(FakePipeline::new());
        let a = St2110DeviceHandle::init(pipeline, "0000:4b:01.0").unwrap();
        let b = a.clone();
        assert_eq!(a.token(), b.token());
        drop(a);
        let _ = b.token();
    }

    #[test]
    fn separate_init_calls_share_one_device_for_the_same_pipeline_and_port() {
        let pipeline = Arc::new(FakePipeline::new());
        let a = St2110DeviceHandle::init(pipeline.clone(), "0000:4b:01.1").unwrap();
        let b = St2110DeviceHandle::init(pipeline, "0000:4b:01.1").unwrap();
        assert_eq!(a.token(), b.token());
    }

    #[test]
    fn distinct_pipelines_get_distinct_devices() {
        let a = St2110DeviceHandle::init(Arc::new(FakePipeline::new()), "0000:4b:01.2").unwrap();
        let b = St2110DeviceHandle::init(Arc::new(FakePipeline::new()), "0000:4b:01.2").unwrap();
        assert_ne!(a.token(), b.token());
    }
}
