//! Media proxy entry point: parses CLI flags, wires
//! SIGINT/SIGTERM into the root context's cancellation, starts the event
//! broker and the plain-TCP control-plane accept loop, and blocks until
//! shutdown.

mod cli;
mod config;

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use mcm_core::broker::EventBroker;
use mcm_core::Context;
use mcm_local::ring::fake::FakeRing;
use mcm_local::ring::RingPort;
use mcm_rdma::ops::fake::FakeFabric;
use mcm_rdma::ops::Fabric;
use mcm_registry::{serve_tcp, FabricFactory, PipelineFactory, RingFactory, SessionRegistry};
use mcm_st2110::pipeline::fake::FakePipeline;
use mcm_st2110::pipeline::Pipeline;

use config::ProxyConfig;

/// Until a real memif binding lands, every session's shared-memory ring is
/// this in-process fake; the sessions it serves are loopback pairs within
/// this process rather than real application sockets.
struct LoopbackRings;
impl RingFactory for LoopbackRings {
    fn open(&self, _name: &str) -> mcm_core::Result<Arc<dyn RingPort>> {
        Ok(Arc::new(FakeRing::new()))
    }
}

/// Process-wide fabric/pipeline fakes shared across every session of their
/// kind, standing in for the real libfabric/MTL bindings this crate treats
/// as external collaborators.
struct LoopbackFabric(Arc<FakeFabric>);
impl FabricFactory for LoopbackFabric {
    fn open(&self) -> mcm_core::Result<Arc<dyn Fabric>> {
        Ok(self.0.clone())
    }
}

struct LoopbackPipeline(Arc<FakePipeline>);
impl PipelineFactory for LoopbackPipeline {
    fn open(&self) -> mcm_core::Result<Arc<dyn Pipeline>> {
        Ok(self.0.clone())
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Registers SIGINT/SIGTERM to flip a process-wide flag, then spawns a
/// thread that turns the flag into root-context cancellation. The signal
/// handler itself only sets the flag; `shutdown` is never called from
/// handler context directly.
fn install_signal_handlers(ctx: &Context, cancel: mcm_core::CancelFn) -> mcm_core::Result<()> {
    let flag = Arc::new(AtomicBool::new(false));
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(sig, flag.clone()).map_err(|e| mcm_core::McmError::InitializationFailed {
            context: "main.install_signal_handlers",
            source: Some(Box::new(e)),
        })?;
    }
    let watch_ctx = ctx.clone();
    std::thread::Builder::new()
        .name("mcm-signal-watch".into())
        .spawn(move || {
            while !flag.load(Ordering::Relaxed) {
                if watch_ctx.cancelled() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            tracing::info!("shutdown signal received");
            cancel.cancel();
        })
        .map_err(|e| mcm_core::McmError::ThreadCreationFailed {
            context: "main.install_signal_handlers",
            source: Some(e),
        })?;
    Ok(())
}

fn run() -> mcm_core::Result<()> {
    let cli = cli::Cli::parse();
    let config = ProxyConfig::load(cli)?;
    tracing::info!(dev = %config.dev, ip = %config.ip, tcp_port = config.tcp_port, "starting mcm-proxy");

    let (ctx, cancel) = Context::background().with_cancel();
    install_signal_handlers(&ctx, cancel.clone())?;

    let broker_handle = EventBroker::spawn();
    let broker = Arc::new(broker_handle.broker().clone());

    let registry = Arc::new(SessionRegistry::new(
        config.dev.clone(),
        Arc::new(LoopbackRings),
        Arc::new(LoopbackFabric(Arc::new(FakeFabric::new()))),
        Arc::new(LoopbackPipeline(Arc::new(FakePipeline::new()))),
        broker,
    ));

    let result = serve_tcp(&ctx, config.tcp_port, registry);
    cancel.cancel();
    result
}

fn main() -> ExitCode {
    init_logging();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "mcm-proxy exited with an error");
            ExitCode::FAILURE
        }
    }
}
