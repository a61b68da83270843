//! Zero-copy gateway placeholder.
//!
//! The donor wraps a local ring connection with a second party, a
//! multipoint zero-copy group the gateway attaches to for the actual
//! cross-process data path — but the group's own implementation
//! (`multipoint_zc.h`, `zc_init_gateway_from_group`) isn't part of the
//! retrieved sources, so there's no wire protocol here to port faithfully.
//! This module reserves the shape a real implementation would take instead:
//! a `Connection` pair keyed on `(sysv_key, mem_region_sz)` with the same
//! five-callback contract as `Local`'s ring pair, plus a `GatewayConfig`. The
//! actual segment attach/detach and framing are left as stubs returning
//! `McmError::Unsupported` rather than guessed at; see DESIGN.md.

use mcm_core::{Connection, ConnectionBase, Context, Kind, McmError, Result};

const CTX_ESTABLISH: &str = "gateway.on_establish";
const CTX_ON_RECEIVE: &str = "gateway.on_receive";

/// Identifies the System V shared memory segment a gateway connection would
/// attach to: the IPC key and the region size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayConfig {
    pub sysv_key: i32,
    pub mem_region_sz: usize,
}

impl GatewayConfig {
    pub fn new(sysv_key: i32, mem_region_sz: usize) -> Self {
        Self {
            sysv_key,
            mem_region_sz,
        }
    }
}

/// Would source frames out of the multipoint-group segment. `Kind::
/// Transmitter`, mirroring `LocalRx`. Every callback that would need the
/// undefined wire protocol returns `McmError::Unsupported`.
pub struct GatewayRx {
    base: ConnectionBase,
    config: GatewayConfig,
}

impl GatewayRx {
    pub fn new(id: impl Into<String>, config: GatewayConfig) -> std::sync::Arc<dyn Connection> {
        mcm_core::wrap(Self {
            base: ConnectionBase::new(id, Kind::Transmitter),
            config,
        })
    }

    pub fn config(&self) -> GatewayConfig {
        self.config
    }
}

impl Connection for GatewayRx {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn on_establish(&self, _ctx: &Context) -> Result<()> {
        Err(McmError::Unsupported {
            context: CTX_ESTABLISH,
        })
    }

    fn on_shutdown(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    fn on_receive(&self, _ctx: &Context, _data: &[u8], _sent: &mut usize) -> Result<()> {
        Err(McmError::Unsupported {
            context: CTX_ON_RECEIVE,
        })
    }
}

/// Would write inbound frames into the multipoint-group segment. `Kind::
/// Receiver`, mirroring `LocalTx`.
pub struct GatewayTx {
    base: ConnectionBase,
    config: GatewayConfig,
}

impl GatewayTx {
    pub fn new(id: impl Into<String>, config: GatewayConfig) -> std::sync::Arc<dyn Connection> {
        mcm_core::wrap(Self {
            base: ConnectionBase::new(id, Kind::Receiver),
            config,
        })
    }

    pub fn config(&self) -> GatewayConfig {
        self.config
    }
}

impl Connection for GatewayTx {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn on_establish(&self, _ctx: &Context) -> Result<()> {
        Err(McmError::Unsupported {
            context: CTX_ESTABLISH,
        })
    }

    fn on_shutdown(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    fn on_receive(&self, _ctx: &Context, _data: &[u8], _sent: &mut usize) -> Result<()> {
        Err(McmError::Unsupported {
            context: CTX_ON_RECEIVE,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn establish_is_unsupported_until_the_wire_protocol_is_defined() {
        let ctx = Context::background();
        let config = GatewayConfig::new(0x4d434d, 1 << 20);
        let rx = GatewayRx::new("gw-rx", config);
        rx.configure(&ctx).unwrap();
        let err = rx.establish(&ctx).unwrap_err();
        assert!(matches!(err, McmError::Unsupported { .. }));
    }

    #[test]
    fn config_round_trips_through_the_connection() {
        let config = GatewayConfig::new(42, 4096);
        let tx = GatewayTx {
            base: ConnectionBase::new("gw-tx", Kind::Receiver),
            config,
        };
        assert_eq!(tx.config().sysv_key, 42);
        assert_eq!(tx.config().mem_region_sz, 4096);
    }
}
