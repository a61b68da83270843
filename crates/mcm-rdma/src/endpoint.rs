//! One libfabric endpoint, bound to a completion queue and address vector.
//!
//! A receiver endpoint binds its own `local_addr` (FI_SOURCE); a
//! transmitter endpoint targets `remote_addr`. Each striped endpoint owns
//! its own completion queue here — the `CqOps::read_cq` seam is keyed per
//! endpoint token, not per connection — so the CQ reactor polls every
//! endpoint's queue in turn rather than draining one shared queue the way
//! the donor's `shared_rx_cq` wiring does in `conn_rdma.cc`.

use mcm_core::Result;

use crate::config::{EndpointAddr, Provider};
use crate::device::RdmaDeviceHandle;
use crate::ops::{Direction, EndpointConfig, EndpointToken};

/// One stripe of a multi-endpoint RDMA connection.
pub struct RdmaEndpoint {
    index: u32,
    token: EndpointToken,
    device: RdmaDeviceHandle,
}

impl RdmaEndpoint {
    /// Opens endpoint `index`, with `local`/`remote` already bumped by the
    /// caller via `EndpointAddr::bumped`.
    pub fn open(
        device: RdmaDeviceHandle,
        index: u32,
        direction: Direction,
        provider: Provider,
        local: &EndpointAddr,
        remote: &EndpointAddr,
    ) -> Result<Self> {
        let cfg = EndpointConfig {
            provider: match provider {
                Provider::Tcp => "tcp".to_string(),
                Provider::Verbs => "verbs".to_string(),
            },
            local_ip: local.ip.clone(),
            local_port: local.port,
            remote_ip: remote.ip.clone(),
            remote_port: remote.port,
            direction,
        };
        let token = device.fabric().ep_init(device.token(), &cfg)?;
        Ok(Self { index, token, device })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn token(&self) -> EndpointToken {
        self.token
    }

    pub fn send(&self, buf: &[u8], buf_ctx: u64) -> Result<()> {
        self.device.fabric().ep_send_buf(self.token, buf, buf_ctx)
    }

    /// # Safety
    /// `ptr` must remain valid and uniquely posted until the matching
    /// completion is read (see `EndpointOps::ep_post_recv`).
    pub fn post_recv(&self, ptr: *mut u8, len: usize, buf_ctx: u64) -> Result<()> {
        self.device.fabric().ep_post_recv(self.token, ptr, len, buf_ctx)
    }
}

impl Drop for RdmaEndpoint {
    fn drop(&mut self) {
        if let Err(err) = self.device.fabric().ep_destroy(self.token) {
            tracing::error!(index = self.index, error = %err, "endpoint teardown failed");
        }
    }
}

/// Opens `num_endpoints` stripes, 0..N-1, with ports bumped by index.
/// Endpoint destruction order (highest index first) is the
/// caller's responsibility: drop the returned `Vec` in reverse, or just let
/// it drop normally since `Vec`'s `Drop` already runs front-to-back —
/// callers that care about exact teardown order should `drain(..).rev()`.
pub fn open_striped(
    device: RdmaDeviceHandle,
    direction: Direction,
    provider: Provider,
    local: &EndpointAddr,
    remote: &EndpointAddr,
    num_endpoints: u8,
) -> Result<Vec<RdmaEndpoint>> {
    let mut endpoints = Vec::with_capacity(num_endpoints as usize);
    for idx in 0..num_endpoints as u32 {
        let ep = RdmaEndpoint::open(
            device.clone(),
            idx,
            direction,
            provider,
            &local.bumped(idx),
            &remote.bumped(idx),
        )?;
        endpoints.push(ep);
    }
    Ok(endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::fake::FakeFabric;
    use std::sync::Arc;

    #[test]
    fn opens_one_endpoint_per_stripe() {
        let fabric = Arc::new(FakeFabric::new());
        let device = RdmaDeviceHandle::init(fabric).unwrap();
        let local = EndpointAddr::new("192.168.1.21", 8002);
        let remote = EndpointAddr::new("192.168.1.22", 8002);
        let eps = open_striped(device, Direction::Tx, Provider::Verbs, &local, &remote, 3).unwrap();
        assert_eq!(eps.len(), 3);
        assert_eq!(eps[0].index(), 0);
        assert_eq!(eps[2].index(), 2);
    }
}
