//! Control plane: the five verbs `TxStart`/`RxStart`/`TxStop`/
//! `RxStop`/`Stop`, exposed here as a plain trait so both a gRPC front end
//! and the plain-TCP-framed front end below can drive the same registry.
//! `media_proxy.cc`'s gRPC `Configure` service and its TCP twin share
//! identical semantics; we build the TCP one, since a gRPC front end is an
//! external collaborator this crate only needs to be able to sit behind.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};

use mcm_core::{Context, McmError, Result};

use crate::registry::SessionRegistry;
use crate::request::{SessionId, SessionReply, SessionRequest};

/// The five control-plane verbs, dispatched against one
/// [`SessionRegistry`].
pub trait ControlPlane: Send + Sync {
    fn tx_start(&self, ctx: &Context, request: SessionRequest) -> SessionReply;
    fn rx_start(&self, ctx: &Context, request: SessionRequest) -> SessionReply;
    fn tx_stop(&self, ctx: &Context, session_id: SessionId) -> SessionReply;
    fn rx_stop(&self, ctx: &Context, session_id: SessionId) -> SessionReply;
    fn stop(&self, ctx: &Context, session_id: SessionId) -> SessionReply;
}

impl ControlPlane for SessionRegistry {
    fn tx_start(&self, ctx: &Context, request: SessionRequest) -> SessionReply {
        match self.tx_start(ctx, request) {
            Ok(id) => SessionReply::Accepted(id),
            Err(err) => {
                tracing::warn!(error = %err, "tx_start failed");
                SessionReply::Failed
            }
        }
    }

    fn rx_start(&self, ctx: &Context, request: SessionRequest) -> SessionReply {
        match self.rx_start(ctx, request) {
            Ok(id) => SessionReply::Accepted(id),
            Err(err) => {
                tracing::warn!(error = %err, "rx_start failed");
                SessionReply::Failed
            }
        }
    }

    fn tx_stop(&self, ctx: &Context, session_id: SessionId) -> SessionReply {
        ControlPlane::stop(self, ctx, session_id)
    }

    fn rx_stop(&self, ctx: &Context, session_id: SessionId) -> SessionReply {
        ControlPlane::stop(self, ctx, session_id)
    }

    fn stop(&self, ctx: &Context, session_id: SessionId) -> SessionReply {
        match SessionRegistry::stop(self, ctx, session_id) {
            Ok(()) => SessionReply::Accepted(session_id),
            Err(err) => {
                tracing::warn!(error = %err, "stop failed");
                SessionReply::Failed
            }
        }
    }
}

/// One framed request body, tagged by verb. `TxStop`/`RxStop`/`Stop` all
/// carry just the session id; the registry doesn't distinguish direction
/// when tearing a session down, so all three map onto the same lookup.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "verb", content = "body")]
pub enum WireRequest {
    TxStart(SessionRequest),
    RxStart(SessionRequest),
    TxStop(SessionId),
    RxStop(SessionId),
    Stop(SessionId),
}

/// Length-prefixed JSON framing: a 4-byte big-endian length followed by
/// that many bytes of UTF-8 JSON. Used for both the request and the reply.
fn read_frame(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(body)
}

fn write_frame(stream: &mut TcpStream, body: &[u8]) -> io::Result<()> {
    let len = (body.len() as u32).to_be_bytes();
    stream.write_all(&len)?;
    stream.write_all(body)?;
    stream.flush()
}

fn dispatch(registry: &SessionRegistry, ctx: &Context, request: WireRequest) -> SessionReply {
    match request {
        WireRequest::TxStart(req) => ControlPlane::tx_start(registry, ctx, req),
        WireRequest::RxStart(req) => ControlPlane::rx_start(registry, ctx, req),
        WireRequest::TxStop(id) => ControlPlane::tx_stop(registry, ctx, id),
        WireRequest::RxStop(id) => ControlPlane::rx_stop(registry, ctx, id),
        WireRequest::Stop(id) => ControlPlane::stop(registry, ctx, id),
    }
}

fn serve_connection(mut stream: TcpStream, registry: Arc<SessionRegistry>, ctx: Context) {
    loop {
        if ctx.cancelled() {
            return;
        }
        let body = match read_frame(&mut stream) {
            Ok(body) => body,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return,
            Err(err) => {
                tracing::debug!(error = %err, "control connection read failed");
                return;
            }
        };
        let request: WireRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(error = %err, "malformed control request");
                let _ = write_frame(&mut stream, b"\"Failed\"");
                continue;
            }
        };
        let reply = dispatch(&registry, &ctx, request);
        let encoded = serde_json::to_vec(&reply.to_string()).unwrap_or_else(|_| b"\"Failed\"".to_vec());
        if write_frame(&mut stream, &encoded).is_err() {
            return;
        }
    }
}

/// Blocking accept loop for the plain-TCP control-plane front end (spec
/// §6). Runs until `ctx` is cancelled; each connection is served on its
/// own thread, matching the rest of this workspace's one-thread-per-duty
/// concurrency model rather than an async executor.
pub fn serve_tcp(ctx: &Context, port: u16, registry: Arc<SessionRegistry>) -> Result<()> {
    let addr: std::net::SocketAddr = (std::net::Ipv4Addr::UNSPECIFIED, port).into();
    let socket = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
        .map_err(|e| McmError::InitializationFailed {
            context: "control.serve_tcp",
            source: Some(Box::new(e)),
        })?;
    // A restarted proxy must be able to rebind immediately after a crash,
    // without waiting out the previous listener's TIME_WAIT sockets.
    socket.set_reuse_address(true).map_err(|e| McmError::InitializationFailed {
        context: "control.serve_tcp",
        source: Some(Box::new(e)),
    })?;
    socket.bind(&addr.into()).map_err(|e| McmError::InitializationFailed {
        context: "control.serve_tcp",
        source: Some(Box::new(e)),
    })?;
    socket.listen(128).map_err(|e| McmError::InitializationFailed {
        context: "control.serve_tcp",
        source: Some(Box::new(e)),
    })?;
    let listener: TcpListener = socket.into();
    listener
        .set_nonblocking(true)
        .map_err(|e| McmError::InitializationFailed {
            context: "control.serve_tcp",
            source: Some(Box::new(e)),
        })?;

    while !ctx.cancelled() {
        match listener.accept() {
            Ok((stream, _addr)) => {
                let registry = registry.clone();
                let conn_ctx = ctx.clone();
                let _ = stream.set_nonblocking(false);
                thread::Builder::new()
                    .name("mcm-control-conn".into())
                    .spawn(move || serve_connection(stream, registry, conn_ctx))
                    .map_err(|e| McmError::ThreadCreationFailed {
                        context: "control.serve_tcp",
                        source: Some(e),
                    })?;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                ctx.sleep(std::time::Duration::from_millis(20));
            }
            Err(err) => {
                return Err(McmError::general_failure("control.serve_tcp", err.to_string()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{EndpointAddr, PayloadType, RdmaParams, TransportParams};
    use mcm_local::ring::fake::FakeRing;
    use mcm_local::ring::RingPort;
    use mcm_rdma::ops::fake::FakeFabric;
    use mcm_rdma::ops::Fabric;
    use mcm_st2110::pipeline::fake::FakePipeline;
    use mcm_st2110::pipeline::Pipeline;
    use crate::registry::{FabricFactory, PipelineFactory, RingFactory};
    use std::net::TcpStream;

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

    fn registry() -> Arc<SessionRegistry> {
        let handle = Box::leak(Box::new(mcm_core::broker::EventBroker::spawn()));
        Arc::new(SessionRegistry::new(
            "0000:31:00.1",
            Arc::new(FakeRings),
            Arc::new(SharedFakeFabric(Arc::new(FakeFabric::new()))),
            Arc::new(SharedFakePipeline(Arc::new(FakePipeline::new()))),
            Arc::new(handle.broker().clone()),
        ))
    }

    fn rdma_request(port: u16) -> SessionRequest {
        SessionRequest {
            local_addr: EndpointAddr {
                ip: "192.168.1.20".into(),
                port,
            },
            remote_addr: EndpointAddr {
                ip: "192.168.1.21".into(),
                port,
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
    fn dispatch_tx_start_then_stop_round_trips() {
        let ctx = Context::background();
        let registry = registry();
        let reply = dispatch(&registry, &ctx, WireRequest::TxStart(rdma_request(22000)));
        let SessionReply::Accepted(id) = reply else {
            panic!("expected Accepted, got {reply}");
        };
        let reply = dispatch(&registry, &ctx, WireRequest::Stop(id));
        assert_eq!(reply, SessionReply::Accepted(id));
    }

    #[test]
    fn dispatch_stop_on_unknown_session_is_failed() {
        let ctx = Context::background();
        let registry = registry();
        let reply = dispatch(&registry, &ctx, WireRequest::Stop(SessionId(404)));
        assert_eq!(reply, SessionReply::Failed);
    }

    #[test]
    fn serve_tcp_accepts_a_tx_start_request_end_to_end() {
        let ctx = Context::background();
        let registry = registry();
        let port = 23456;
        let (server_ctx, cancel) = ctx.with_cancel();
        let server_registry = registry.clone();
        let handle = thread::spawn(move || serve_tcp(&server_ctx, port, server_registry));

        // Give the accept loop a moment to bind before connecting.
        thread::sleep(std::time::Duration::from_millis(50));

        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let request = WireRequest::TxStart(rdma_request(22100));
        let body = serde_json::to_vec(&request).unwrap();
        write_frame(&mut stream, &body).unwrap();
        let reply_body = read_frame(&mut stream).unwrap();
        let reply: String = serde_json::from_slice(&reply_body).unwrap();
        assert_ne!(reply, "Failed");

        drop(stream);
        cancel.cancel();
        let _ = handle.join();
    }
}
