//! RDMA connection configuration.

use mcm_core::{McmError, Result};

const CTX_VALIDATE: &str = "rdma_config.validate";
const MAX_ENDPOINTS: u8 = 8;

/// libfabric provider selection. `Verbs` is the default (hardware RDMA);
/// `Tcp` is the software fallback used in environments without RDMA-capable
/// NICs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provider {
    Tcp,
    Verbs,
}

impl Default for Provider {
    fn default() -> Self {
        Provider::Verbs
    }
}

/// An `{ip, port}` pair, bumped by endpoint index when `num_endpoints > 1`
///.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointAddr {
    pub ip: String,
    pub port: u16,
}

impl EndpointAddr {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    /// Ports `base`, `base+1`, ... stripe traffic across multiple endpoints
    /// to exploit multi-queue NICs.
    pub fn bumped(&self, idx: u32) -> Self {
        Self {
            ip: self.ip.clone(),
            port: self.port.wrapping_add(idx as u16),
        }
    }
}

/// Validated configuration for one `RdmaTx`/`RdmaRx` connection (spec
/// §4.5's enumerated parameters).
#[derive(Clone, Debug)]
pub struct RdmaConfig {
    pub local_addr: EndpointAddr,
    pub remote_addr: EndpointAddr,
    pub transfer_size: usize,
    pub queue_size: usize,
    pub provider: Provider,
    pub num_endpoints: u8,
}

impl RdmaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.transfer_size == 0 {
            return Err(McmError::bad_argument(CTX_VALIDATE));
        }
        if self.queue_size == 0 {
            return Err(McmError::bad_argument(CTX_VALIDATE));
        }
        if self.num_endpoints == 0 || self.num_endpoints > MAX_ENDPOINTS {
            return Err(McmError::bad_argument(CTX_VALIDATE));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> RdmaConfig {
        RdmaConfig {
            local_addr: EndpointAddr::new("192.168.1.21", 8002),
            remote_addr: EndpointAddr::new("192.168.1.22", 8002),
            transfer_size: 12,
            queue_size: 16,
            provider: Provider::Verbs,
            num_endpoints: 1,
        }
    }

    #[test]
    fn default_provider_is_verbs() {
        assert_eq!(Provider::default(), Provider::Verbs);
    }

    #[test]
    fn bumped_port_increments_by_index() {
        let addr = EndpointAddr::new("10.0.0.1", 9000);
        assert_eq!(addr.bumped(0).port, 9000);
        assert_eq!(addr.bumped(3).port, 9003);
    }

    #[test]
    fn rejects_num_endpoints_out_of_range() {
        let mut cfg = base_config();
        cfg.num_endpoints = 0;
        assert!(cfg.validate().is_err());
        cfg.num_endpoints = 9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_queue_size() {
        let mut cfg = base_config();
        cfg.queue_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_valid_config() {
        assert!(base_config().validate().is_ok());
    }
}
