//! Ports exposed through NAT rules rather than a local listener.
//!
//! Container runtimes inside the guest often publish ports with `DNAT`
//! rules instead of binding them, so `/proc/net/tcp` alone misses them.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tether_proto::Endpoint;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::debug;

/// How long a liveness connect may take before the port is treated as closed.
const CONNECT_TIMEOUT: Duration = Duration::from_millis(200);

/// Lists the TCP ports published by `DNAT` rules that accept connections.
pub async fn ports() -> io::Result<Vec<Endpoint>> {
    let out = Command::new("iptables")
        .args(["--wait", "-t", "nat", "-S"])
        .output()
        .await?;
    if !out.status.success() {
        return Err(io::Error::other(format!(
            "iptables -t nat -S failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    let rules = parse_rules(&String::from_utf8_lossy(&out.stdout));
    let mut open = Vec::with_capacity(rules.len());
    for ep in rules {
        if is_open(ep).await {
            open.push(ep);
        } else {
            debug!(endpoint = %ep, "DNAT port is not accepting connections");
        }
    }
    Ok(open)
}

/// Extracts `-d <ip>/32 -p tcp ... --dport <port> -j DNAT` rules.
pub fn parse_rules(listing: &str) -> Vec<Endpoint> {
    listing.lines().filter_map(parse_rule).collect()
}

/// Parses one `-A` line.
fn parse_rule(line: &str) -> Option<Endpoint> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.first() != Some(&"-A") {
        return None;
    }
    let value = |flag: &str| {
        tokens
            .iter()
            .position(|t| *t == flag)
            .and_then(|i| tokens.get(i + 1).copied())
    };
    if value("-j") != Some("DNAT") || value("-p") != Some("tcp") {
        return None;
    }
    let port = value("--dport")?.parse().ok()?;
    let ip = match value("-d") {
        Some(dest) => dest.strip_suffix("/32").unwrap_or(dest).parse().ok()?,
        None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };
    Some(Endpoint::new(ip, port))
}

/// Checks whether something answers on `ep`.
async fn is_open(ep: Endpoint) -> bool {
    let ip = if ep.ip.is_unspecified() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        ep.ip
    };
    matches!(
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(SocketAddr::new(ip, ep.port))).await,
        Ok(Ok(_))
    )
}
