//! tether guest agent: runs inside the VM as a root system service.
//!
//! Connects to the host over vsock, reports listening TCP ports as they
//! come and go, and relays the guest's DNS queries to the host resolver.
#![allow(unsafe_code, clippy::print_stderr)]

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("tether-guest only runs inside a Linux guest");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
mod agent;
#[cfg(target_os = "linux")]
mod audit;
#[cfg(target_os = "linux")]
mod clock;
#[cfg(target_os = "linux")]
mod dns;
#[cfg(target_os = "linux")]
mod firewall;
#[cfg(target_os = "linux")]
mod iptables;
#[cfg(target_os = "linux")]
mod observer;
#[cfg(target_os = "linux")]
mod procnet;

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> std::io::Result<()> {
    use std::time::Duration;

    use clap::Parser;
    use tracing_subscriber::EnvFilter;

    let args = Args::parse();
    let level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let tick = Duration::from_secs(args.tick);
    let opts = agent::Options {
        tick,
        iptables_idle: args
            .iptables_idle
            .map_or(tick * 20, Duration::from_secs),
        dns_udp_port: args.dns_udp_port,
        dns_tcp_port: args.dns_tcp_port,
        dns_timeout: Duration::from_secs(args.dns_timeout),
        vsock_port: args.vsock_port,
    };
    let result = agent::run(opts).await;
    if let Err(ref e) = result {
        tracing::error!(error = %e, "guest agent exiting");
    }
    result
}

/// Command-line flags.
#[cfg(target_os = "linux")]
#[derive(Debug, clap::Parser)]
#[command(name = "tether-guest", version, about)]
struct Args {
    /// Seconds between listener scans.
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u64).range(1..))]
    tick: u64,

    /// Seconds without netfilter changes before iptables is no longer
    /// re-read [default: 20 × tick].
    #[arg(long)]
    iptables_idle: Option<u64>,

    /// UDP port of the DNS relay (0 disables).
    #[arg(long, default_value_t = 53)]
    dns_udp_port: u16,

    /// TCP port of the DNS relay (0 disables).
    #[arg(long, default_value_t = 53)]
    dns_tcp_port: u16,

    /// Seconds to wait for the host to answer one DNS query.
    #[arg(long, default_value_t = 5)]
    dns_timeout: u64,

    /// Host vsock port to connect to.
    #[arg(long, default_value_t = tether_proto::HOST_PORT)]
    vsock_port: u32,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}
