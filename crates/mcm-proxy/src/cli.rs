//! Command-line flags: PCI device, bind address, and the two
//! control-plane listener ports.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "mcm-proxy", about = "Media proxy: connects local shared-memory rings to RDMA and ST 2110 transports")]
pub struct Cli {
    /// PCI bus-device-function of the NIC the ST 2110 pipeline binds to.
    #[arg(long, default_value = "0000:31:00.1")]
    pub dev: String,

    /// Local IP address sessions bind endpoints against.
    #[arg(long, default_value = "192.168.1.20")]
    pub ip: String,

    /// gRPC control-plane port. Accepted for compatibility with the
    /// two-front-end control plane; this binary only serves the
    /// plain-TCP front end, so the port is parsed but otherwise unused.
    #[arg(long, default_value_t = 8001)]
    pub grpc: u16,

    /// Plain-TCP framed control-plane port.
    #[arg(long, default_value_t = 8002)]
    pub tcp: u16,
}
