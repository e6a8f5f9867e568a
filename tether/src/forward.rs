//! Turns guest listener changes into SSH local forwards.
//!
//! Rules are scanned in order and the first match wins, even when it is an
//! ignore rule. Each live forward is recorded in a ledger keyed by
//! `(local, remote)` so a repeated arrival does not spawn a second tunnel.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use tether_proto::{Endpoint, PortEvent};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ForwardRule;
use crate::error::{Error, Result};
use crate::ssh::SshControl;

/// Host side of a forward for `rule`.
///
/// `guest_port` is `None` for socket rules, which use the rule's own host
/// port. A shift that leaves the port space keeps the guest port; validated
/// rules never produce one for ports inside their guest range.
pub fn host_address(rule: &ForwardRule, guest_port: Option<u16>) -> String {
    if let Some(sock) = &rule.host_socket {
        return sock.clone();
    }
    let port = guest_port.map_or(rule.host_port, |p| {
        let shifted = i32::from(p) + i32::from(rule.host_port_range[0])
            - i32::from(rule.guest_port_range[0]);
        u16::try_from(shifted)
            .ok()
            .filter(|&port| port != 0)
            .unwrap_or_else(|| {
                warn!(guest_port = p, shifted, "host port out of range, keeping the guest port");
                p
            })
    });
    Endpoint::new(rule.host_ip(), port).to_string()
}

/// Returns `true` if `guest`'s address satisfies `rule`'s guest address.
fn ip_matches(rule: &ForwardRule, guest: IpAddr) -> bool {
    let want = rule.guest_ip();
    guest.is_unspecified()
        || guest == want
        || (guest == IpAddr::V6(std::net::Ipv6Addr::LOCALHOST)
            && want == IpAddr::V4(std::net::Ipv4Addr::LOCALHOST))
        || (want.is_unspecified() && !rule.guest_ip_must_be_zero)
}

/// Finds the forward for `guest`: `(local, remote)` or `None` when no rule
/// applies or the first applicable rule ignores it.
pub fn match_rule(rules: &[ForwardRule], guest: &Endpoint) -> Option<(String, String)> {
    for rule in rules {
        if rule.guest_socket.is_some() {
            continue;
        }
        let [lo, hi] = rule.guest_port_range;
        if guest.port < lo || guest.port > hi {
            continue;
        }
        if !ip_matches(rule, guest.ip) {
            continue;
        }
        if rule.ignore {
            // An address-specific ignore rule does not block a wildcard listener.
            if guest.ip.is_unspecified() && !rule.guest_ip().is_unspecified() {
                continue;
            }
            return None;
        }
        return Some((host_address(rule, Some(guest.port)), guest.to_string()));
    }
    None
}

/// Reconciles guest listener changes with live SSH forwards.
pub struct PortForwarder {
    /// Ordered rules, read-only after construction.
    rules: Vec<ForwardRule>,
    /// Control connection used for every forward and cancel.
    ssh: Arc<dyn SshControl>,
    /// Live forwards keyed by `(local, remote)`.
    active: Mutex<HashSet<(String, String)>>,
}

impl std::fmt::Debug for PortForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortForwarder")
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl PortForwarder {
    /// Creates a forwarder over an ordered rule list.
    pub fn new(rules: Vec<ForwardRule>, ssh: Arc<dyn SshControl>) -> Self {
        Self {
            rules,
            ssh,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// The rules in evaluation order.
    pub fn rules(&self) -> &[ForwardRule] {
        &self.rules
    }

    /// Finds the forward for `guest` under this forwarder's rules.
    pub fn match_rule(&self, guest: &Endpoint) -> Option<(String, String)> {
        match_rule(&self.rules, guest)
    }

    /// Returns the live forwards, sorted.
    pub async fn active(&self) -> Vec<(String, String)> {
        let mut v: Vec<_> = self.active.lock().await.iter().cloned().collect();
        v.sort();
        v
    }

    /// Applies one listener delta: removals first, then additions.
    ///
    /// Failures are logged and do not stop the remaining endpoints.
    pub async fn on_event(&self, ev: &PortEvent) {
        for err in &ev.errors {
            warn!(error = %err, "guest reported an error");
        }
        for ep in &ev.local_ports_removed {
            let Some((local, remote)) = self.match_rule(ep) else {
                continue;
            };
            info!(%local, %remote, "stopping TCP forward");
            self.cancel(local, remote).await;
        }
        for ep in &ev.local_ports_added {
            let Some((local, remote)) = self.match_rule(ep) else {
                info!(endpoint = %ep, "not forwarding TCP");
                continue;
            };
            info!(%local, %remote, "forwarding TCP");
            self.forward(local, remote).await;
        }
    }

    /// Forwards every rule with a guest socket.
    pub async fn forward_defined_sockets(&self) {
        debug!("forwarding unix sockets");
        for (local, remote) in self.socket_pairs() {
            self.forward(local, remote).await;
        }
    }

    /// Cancels every rule with a guest socket, collecting failures.
    pub async fn cancel_defined_sockets(&self) -> Result<()> {
        debug!("stopping unix socket forwards");
        let mut errors = Vec::new();
        for (local, remote) in self.socket_pairs() {
            if let Err(e) = self.ssh.cancel(&local, &remote).await {
                errors.push(e.to_string());
            }
            self.active.lock().await.remove(&(local, remote));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Requirements(errors))
        }
    }

    /// `(local, remote)` for every socket rule.
    fn socket_pairs(&self) -> Vec<(String, String)> {
        self.rules
            .iter()
            .filter_map(|rule| {
                let guest = rule.guest_socket.clone()?;
                Some((host_address(rule, None), guest))
            })
            .collect()
    }

    /// Opens a forward unless the ledger already has it.
    async fn forward(&self, local: String, remote: String) {
        let key = (local, remote);
        let mut active = self.active.lock().await;
        if active.contains(&key) {
            warn!(local = %key.0, remote = %key.1, "already forwarded");
            return;
        }
        match self.ssh.forward(&key.0, &key.1).await {
            Ok(()) => {
                active.insert(key);
            }
            Err(e) => warn!(
                local = %key.0,
                remote = %key.1,
                error = %e,
                "failed to set up forwarding (negligible if already forwarded)"
            ),
        }
    }

    /// Cancels a forward and drops it from the ledger.
    async fn cancel(&self, local: String, remote: String) {
        let key = (local, remote);
        let mut active = self.active.lock().await;
        if let Err(e) = self.ssh.cancel(&key.0, &key.1).await {
            warn!(local = %key.0, remote = %key.1, error = %e, "failed to stop forwarding");
        }
        active.remove(&key);
    }
}
