//! Session registry: allocates a session id, builds the Local
//! and transport connection pair for the requested payload type, links
//! them, and records the pair so `stop` can tear both down by id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use mcm_core::broker::EventBroker;
use mcm_core::{Connection, Context, McmError, Result};
use mcm_local::{LocalRx, LocalTx};
use mcm_local::ring::RingPort;
use mcm_rdma::ops::Fabric;
use mcm_rdma::{EndpointAddr as RdmaEndpointAddr, Provider, RdmaConfig, RdmaRx, RdmaTx};
use mcm_st2110::pipeline::Pipeline;
use mcm_st2110::{AudioParams as St2110AudioParams, Direction as St2110Direction, SessionConfig, St2110Rx, St2110Tx, TransportKind, VideoParams as St2110VideoParams};

use crate::request::{PayloadType, SessionId, SessionRequest, TransportParams};

/// Opens a shared-memory ring for a session's local side. Real callers
/// wire this to the memif socket library; tests substitute an in-process
/// fake.
pub trait RingFactory: Send + Sync {
    fn open(&self, name: &str) -> Result<Arc<dyn RingPort>>;
}

/// Opens the libfabric handle sessions transport RDMA traffic over.
pub trait FabricFactory: Send + Sync {
    fn open(&self) -> Result<Arc<dyn Fabric>>;
}

/// Opens the ST 2110 pipeline handle sessions transport video/audio over.
pub trait PipelineFactory: Send + Sync {
    fn open(&self) -> Result<Arc<dyn Pipeline>>;
}

struct SessionRecord {
    local: Arc<dyn Connection>,
    transport: Arc<dyn Connection>,
}

pub struct SessionRegistry {
    sessions: DashMap<u64, SessionRecord>,
    next_id: AtomicU64,
    dev_port: String,
    rings: Arc<dyn RingFactory>,
    fabrics: Arc<dyn FabricFactory>,
    pipelines: Arc<dyn PipelineFactory>,
    broker: Arc<EventBroker>,
}

impl SessionRegistry {
    pub fn new(
        dev_port: impl Into<String>,
        rings: Arc<dyn RingFactory>,
        fabrics: Arc<dyn FabricFactory>,
        pipelines: Arc<dyn PipelineFactory>,
        broker: Arc<EventBroker>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            dev_port: dev_port.into(),
            rings,
            fabrics,
            pipelines,
            broker,
        }
    }

    fn build_transport(
        &self,
        id: &str,
        direction: St2110Direction,
        request: &SessionRequest,
    ) -> Result<Arc<dyn Connection>> {
        match request.payload_type {
            PayloadType::RdmaVideo => {
                let TransportParams::Rdma(params) = &request.params else {
                    return Err(McmError::bad_argument("registry.build_transport"));
                };
                let provider = match params.provider.as_str() {
                    "verbs" => Provider::Verbs,
                    "tcp" => Provider::Tcp,
                    _ => return Err(McmError::bad_argument("registry.build_transport")),
                };
                let config = RdmaConfig {
                    local_addr: RdmaEndpointAddr::new(&request.local_addr.ip, request.local_addr.port),
                    remote_addr: RdmaEndpointAddr::new(&request.remote_addr.ip, request.remote_addr.port),
                    transfer_size: params.transfer_size,
                    queue_size: params.queue_size,
                    provider,
                    num_endpoints: params.num_endpoints,
                };
                let fabric = self.fabrics.open()?;
                Ok(match direction {
                    St2110Direction::Tx => RdmaTx::new(id, config, fabric),
                    St2110Direction::Rx => RdmaRx::new(id, config, fabric),
                })
            }
            PayloadType::St20Video | PayloadType::St22Video => {
                let TransportParams::Video(params) = &request.params else {
                    return Err(McmError::bad_argument("registry.build_transport"));
                };
                let kind = if request.payload_type == PayloadType::St20Video {
                    TransportKind::St2110_20
                } else {
                    TransportKind::St2110_22
                };
                let config = SessionConfig {
                    kind,
                    direction,
                    dev_port: self.dev_port.clone(),
                    local_ip: request.local_addr.ip.clone(),
                    local_port: request.local_addr.port,
                    remote_ip: request.remote_addr.ip.clone(),
                    remote_port: request.remote_addr.port,
                    video: Some(St2110VideoParams {
                        width: params.width,
                        height: params.height,
                        fps: params.fps,
                        pixel_format: params.pix_fmt.clone(),
                    }),
                    audio: None,
                    framebuff_cnt: 4,
                };
                let pipeline = self.pipelines.open()?;
                Ok(match direction {
                    St2110Direction::Tx => St2110Tx::new(id, config, pipeline),
                    St2110Direction::Rx => St2110Rx::new(id, config, pipeline),
                })
            }
            PayloadType::St30Audio => {
                let TransportParams::Audio(params) = &request.params else {
                    return Err(McmError::bad_argument("registry.build_transport"));
                };
                let config = SessionConfig {
                    kind: TransportKind::St2110_30,
                    direction,
                    dev_port: self.dev_port.clone(),
                    local_ip: request.local_addr.ip.clone(),
                    local_port: request.local_addr.port,
                    remote_ip: request.remote_addr.ip.clone(),
                    remote_port: request.remote_addr.port,
                    video: None,
                    audio: Some(St2110AudioParams {
                        channels: params.channels,
                        sample_rate: params.sample_rate,
                        format: params.format.clone(),
                        packet_time_us: params.packet_time,
                    }),
                    framebuff_cnt: 4,
                };
                let pipeline = self.pipelines.open()?;
                Ok(match direction {
                    St2110Direction::Tx => St2110Tx::new(id, config, pipeline),
                    St2110Direction::Rx => St2110Rx::new(id, config, pipeline),
                })
            }
            PayloadType::St40Ancillary | PayloadType::RtspVideo => Err(McmError::Unsupported {
                context: "registry.build_transport",
            }),
        }
    }

    /// Builds a transmit session: the local ring sources frames
    /// (`LocalRx`) and feeds the transport's send side.
    pub fn tx_start(&self, ctx: &Context, request: SessionRequest) -> Result<SessionId> {
        let numeric_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("tx-{numeric_id}");

        let transport = self.build_transport(&id, St2110Direction::Tx, &request)?;
        let ring = self.rings.open(&format!("mcm_tx_memif_{numeric_id}"))?;
        let local = LocalRx::new(&id, ring);
        transport.base().attach_broker(self.broker.clone());
        local.base().attach_broker(self.broker.clone());

        transport.configure(ctx)?;
        local.configure(ctx)?;
        transport.establish(ctx)?;
        local.set_link(ctx, Some(transport.clone()), None)?;
        local.establish(ctx)?;

        self.sessions.insert(numeric_id, SessionRecord { local, transport });
        Ok(SessionId(numeric_id))
    }

    /// Builds a receive session: the transport's receive side sources
    /// frames off the wire and feeds the local ring (`LocalTx`).
    pub fn rx_start(&self, ctx: &Context, request: SessionRequest) -> Result<SessionId> {
        let numeric_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("rx-{numeric_id}");

        let transport = self.build_transport(&id, St2110Direction::Rx, &request)?;
        let ring = self.rings.open(&format!("mcm_rx_memif_{numeric_id}"))?;
        let local = LocalTx::new(&id, ring);
        transport.base().attach_broker(self.broker.clone());
        local.base().attach_broker(self.broker.clone());

        local.configure(ctx)?;
        transport.configure(ctx)?;
        local.establish(ctx)?;
        transport.set_link(ctx, Some(local.clone()), None)?;
        transport.establish(ctx)?;

        self.sessions.insert(numeric_id, SessionRecord { local, transport });
        Ok(SessionId(numeric_id))
    }

    /// Shuts both sides of a recorded session down and erases the record.
    /// Never tears down the shared RDMA/pipeline device: that lives behind
    /// its own refcounted handle, released only when the last connection
    /// holding it drops.
    pub fn stop(&self, ctx: &Context, session_id: SessionId) -> Result<()> {
        let Some((_, record)) = self.sessions.remove(&session_id.0) else {
            return Err(McmError::bad_argument("registry.stop"));
        };
        let local_result = record.local.shutdown(ctx);
        let transport_result = record.transport.shutdown(ctx);
        local_result.and(transport_result)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{EndpointAddr, RdmaParams};
    use mcm_local::ring::fake::FakeRing;
    use mcm_rdma::ops::fake::FakeFabric;
    use mcm_st2110::pipeline::fake::FakePipeline;

    struct FakeRings;
    impl RingFactory for FakeRings {
        fn open(&self, _name: &str) -> Result<Arc<dyn RingPort>> {
            Ok(Arc::new(FakeRing::new()))
        }
    }

    struct SharedFakeFabric(Arc<FakeFabric>);
    impl FabricFactory for SharedFakeFabric {
        fn open(&self) -> Result<Arc<dyn Fabric>> {
            Ok(self.0.clone())
        }
    }

    struct SharedFakePipeline(Arc<FakePipeline>);
    impl PipelineFactory for SharedFakePipeline {
        fn open(&self) -> Result<Arc<dyn Pipeline>> {
            Ok(self.0.clone())
        }
    }

    fn registry() -> SessionRegistry {
        // Leaked rather than joined: the broker thread only matters to these
        // tests if a session actually displaces a link, which none of them do.
        let handle = Box::leak(Box::new(mcm_core::broker::EventBroker::spawn()));
        SessionRegistry::new(
            "0000:31:00.1",
            Arc::new(FakeRings),
            Arc::new(SharedFakeFabric(Arc::new(FakeFabric::new()))),
            Arc::new(SharedFakePipeline(Arc::new(FakePipeline::new()))),
            Arc::new(handle.broker().clone()),
        )
    }

    fn rdma_request(local_port: u16, remote_port: u16) -> SessionRequest {
        SessionRequest {
            local_addr: EndpointAddr {
                ip: "192.168.1.20".into(),
                port: local_port,
            },
            remote_addr: EndpointAddr {
                ip: "192.168.1.21".into(),
                port: remote_port,
            },
            payload_type: PayloadType::RdmaVideo,
            params: TransportParams::Rdma(RdmaParams {
                transfer_size: 1200,
                queue_size: 8,
                provider: "verbs".into(),
                num_endpoints: 1,
            }),
        }
    }

    #[test]
    fn tx_start_then_stop_removes_the_session() {
        let ctx = Context::background();
        let registry = registry();
        let id = registry.tx_start(&ctx, rdma_request(21000, 21000)).unwrap();
        assert_eq!(registry.len(), 1);
        registry.stop(&ctx, id).unwrap();
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn stop_on_unknown_session_is_bad_argument() {
        let ctx = Context::background();
        let registry = registry();
        let err = registry.stop(&ctx, SessionId(999)).unwrap_err();
        assert!(matches!(err, McmError::BadArgument { .. }));
    }

    #[test]
    fn unsupported_payload_type_is_rejected() {
        let ctx = Context::background();
        let registry = registry();
        let mut request = rdma_request(21100, 21100);
        request.payload_type = PayloadType::RtspVideo;
        let err = registry.tx_start(&ctx, request).unwrap_err();
        assert!(matches!(err, McmError::Unsupported { .. }));
    }
}
