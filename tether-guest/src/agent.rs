//! Guest agent startup: connect to the host and start every worker.

use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use nix::unistd::Uid;
use tether_proto::Session;
use tokio::net::{TcpListener, UdpSocket};
use tokio_vsock::{VsockAddr, VsockStream};
use tracing::{info, warn};

use crate::audit::AuditSocket;
use crate::clock;
use crate::dns::{self, Relay};
use crate::firewall::FirewallWatch;
use crate::observer::Observer;

/// Provisioning file written by the host with `KEY=VALUE` lines.
const HOSTS_FILE: &str = "/etc/tether_hosts";
/// Key holding the gateway address in [`HOSTS_FILE`].
const GATEWAY_KEY: &str = "GATEWAY_IPADDR";

/// Runtime settings for the guest agent.
#[derive(Debug, Clone)]
pub struct Options {
    /// Interval between listener scans.
    pub tick: Duration,
    /// Quiet period after which NAT rules stop being re-read.
    pub iptables_idle: Duration,
    /// UDP port for the DNS relay (0 disables).
    pub dns_udp_port: u16,
    /// TCP port for the DNS relay (0 disables).
    pub dns_tcp_port: u16,
    /// Bound on one DNS round trip to the host.
    pub dns_timeout: Duration,
    /// Host vsock port to connect to.
    pub vsock_port: u32,
}

/// Connects to the host agent and runs until the connection is lost.
pub async fn run(opts: Options) -> io::Result<()> {
    if !Uid::effective().is_root() {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "tether-guest must run as root",
        ));
    }

    let addr = VsockAddr::new(libc::VMADDR_CID_HOST, opts.vsock_port);
    let conn = VsockStream::connect(addr).await?;
    info!(port = opts.vsock_port, "connected to host agent");
    let session = Arc::new(Session::client(conn));

    tokio::spawn(clock::run());

    let firewall = FirewallWatch::new(opts.iptables_idle);
    tokio::spawn(Arc::clone(&firewall).run_watchdog());
    start_audit(Arc::clone(&firewall));

    let gateway = fs::read_to_string(HOSTS_FILE)
        .ok()
        .and_then(|text| gateway_from(&text));
    if gateway.is_none() {
        warn!(path = HOSTS_FILE, "gateway address unknown");
    }

    let relay = Arc::new(Relay::new(
        Arc::clone(&session),
        gateway.map(|ip| ip.to_string()).unwrap_or_default(),
        opts.dns_timeout,
    ));
    start_dns(&relay, opts.dns_udp_port, opts.dns_tcp_port).await;

    let mut observer = Observer::new(session, firewall);
    observer.publish_info(gateway).await?;
    observer.run(opts.tick).await
}

/// Subscribes to netfilter change records, or pins the firewall watch
/// when auditing is unavailable.
fn start_audit(watch: Arc<FirewallWatch>) {
    let sock = match AuditSocket::open().and_then(|s| s.enable().map(|()| s)) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "kernel audit unavailable, reading iptables every tick");
            watch.pin();
            return;
        }
    };
    tokio::task::spawn_blocking(move || {
        if let Err(e) = sock.listen(&watch) {
            warn!(error = %e, "audit listener stopped, reading iptables every tick");
            watch.pin();
        }
    });
}

/// Binds and spawns the UDP and TCP relay listeners.
async fn start_dns(relay: &Arc<Relay>, udp_port: u16, tcp_port: u16) {
    let any = |port| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    if udp_port != 0 {
        match UdpSocket::bind(any(udp_port)).await {
            Ok(sock) => {
                tokio::spawn(log_exit("udp", dns::serve_udp(Arc::clone(relay), sock)));
            }
            Err(e) => warn!(port = udp_port, error = %e, "failed to bind DNS relay (udp)"),
        }
    }
    if tcp_port != 0 {
        match TcpListener::bind(any(tcp_port)).await {
            Ok(listener) => {
                tokio::spawn(log_exit("tcp", dns::serve_tcp(Arc::clone(relay), listener)));
            }
            Err(e) => warn!(port = tcp_port, error = %e, "failed to bind DNS relay (tcp)"),
        }
    }
}

/// Logs why a relay listener stopped.
async fn log_exit(proto: &'static str, serve: impl Future<Output = io::Result<()>>) {
    if let Err(e) = serve.await {
        warn!(proto, error = %e, "DNS relay stopped");
    }
}

/// Reads the gateway address from a `KEY=VALUE` provisioning file.
fn gateway_from(text: &str) -> Option<IpAddr> {
    text.lines()
        .filter_map(|line| line.trim().split_once('='))
        .find(|(k, _)| k.trim() == GATEWAY_KEY)
        .and_then(|(_, v)| v.trim().trim_matches('"').parse().ok())
}
