//! Periodic listener scan and delta reporting.

use std::collections::BTreeMap;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tether_proto::{Endpoint, Event, InfoEvent, PortEvent, Session};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::firewall::FirewallWatch;
use crate::{iptables, procnet};

/// Splits the change between two snapshots into `(added, removed)`.
///
/// Endpoints are compared by their string form; output is sorted by it.
pub fn diff(old: &[Endpoint], new: &[Endpoint]) -> (Vec<Endpoint>, Vec<Endpoint>) {
    let keyed = |eps: &[Endpoint]| -> BTreeMap<String, Endpoint> {
        eps.iter().map(|e| (e.to_string(), *e)).collect()
    };
    let old = keyed(old);
    let new = keyed(new);
    let added = new
        .iter()
        .filter(|(k, _)| !old.contains_key(*k))
        .map(|(_, e)| *e)
        .collect();
    let removed = old
        .iter()
        .filter(|(k, _)| !new.contains_key(*k))
        .map(|(_, e)| *e)
        .collect();
    (added, removed)
}

/// Adds firewall-published endpoints whose port no listener already has.
fn merge(mut listeners: Vec<Endpoint>, published: Vec<Endpoint>) -> Vec<Endpoint> {
    for ep in published {
        if !listeners.iter().any(|l| l.port == ep.port) {
            listeners.push(ep);
        }
    }
    listeners
}

/// Combines one listener read with the firewall result into a snapshot
/// and the errors hit along the way. The snapshot is `None` when the
/// listener table could not be read.
fn snapshot(
    listeners: io::Result<Vec<Endpoint>>,
    published: Vec<Endpoint>,
    firewall_error: Option<String>,
) -> (Option<Vec<Endpoint>>, Vec<String>) {
    let mut errors = Vec::new();
    let current = match listeners {
        Ok(l) => Some(merge(l, published)),
        Err(e) => {
            errors.push(e.to_string());
            None
        }
    };
    errors.extend(firewall_error);
    (current, errors)
}

/// Tracks the guest's listening sockets and reports changes to the host.
#[derive(Debug)]
pub struct Observer {
    /// Connection to the host agent.
    session: Arc<Session>,
    /// Decides when NAT rules are re-read.
    firewall: Arc<FirewallWatch>,
    /// Snapshot from the previous tick.
    previous: Vec<Endpoint>,
    /// Errors not yet reported, carried into the next port event.
    pending: Vec<String>,
}

impl Observer {
    /// Creates an observer with an empty previous snapshot.
    pub const fn new(session: Arc<Session>, firewall: Arc<FirewallWatch>) -> Self {
        Self {
            session,
            firewall,
            previous: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Sends the startup handshake with the current listeners and
    /// firewall-published ports.
    pub async fn publish_info(&mut self, gateway: Option<IpAddr>) -> io::Result<()> {
        let (current, errors) = self.scan().await;
        let ev = self.info_with(current, errors, gateway);
        info!(ports = ev.local_ports.len(), gateway = ?gateway, "sending info event");
        self.send(&Event::Info(ev))
    }

    /// Builds the info event from one scan. The event has no room for
    /// errors, so they wait for the first port event.
    fn info_with(
        &mut self,
        current: Option<Vec<Endpoint>>,
        errors: Vec<String>,
        gateway: Option<IpAddr>,
    ) -> InfoEvent {
        for e in &errors {
            warn!(error = %e, "incomplete info event");
        }
        self.pending = errors;
        InfoEvent::new(current.unwrap_or_default(), gateway)
    }

    /// Replaces the snapshot and returns the event to send, if any.
    ///
    /// `current` is `None` when the listener table could not be read; the
    /// previous snapshot is then kept and only the errors are reported.
    pub fn tick_with(
        &mut self,
        current: Option<Vec<Endpoint>>,
        errors: Vec<String>,
    ) -> Option<PortEvent> {
        let mut all = std::mem::take(&mut self.pending);
        all.extend(errors);
        let (added, removed) = match current {
            Some(current) => {
                let delta = diff(&self.previous, &current);
                self.previous = current;
                delta
            }
            None => (Vec::new(), Vec::new()),
        };
        let ev = PortEvent::new(added, removed, all);
        (!ev.is_empty()).then_some(ev)
    }

    /// Reads the listener table and the NAT rules.
    async fn scan(&self) -> (Option<Vec<Endpoint>>, Vec<String>) {
        let listeners = procnet::listeners();
        let (published, err) = self.firewall.ports_from(iptables::ports()).await;
        snapshot(listeners, published, err)
    }

    /// Scans, then diffs against the previous snapshot.
    async fn poll(&mut self) -> Option<PortEvent> {
        let (current, errors) = self.scan().await;
        self.tick_with(current, errors)
    }

    /// Polls every `tick` and sends each non-empty delta on a fresh stream.
    ///
    /// Returns when the connection to the host is gone.
    pub async fn run(mut self, tick: Duration) -> io::Result<()> {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if self.session.is_closed() {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "connection to host closed",
                ));
            }
            if let Some(ev) = self.poll().await {
                debug!(
                    added = ev.local_ports_added.len(),
                    removed = ev.local_ports_removed.len(),
                    errors = ev.errors.len(),
                    "sending port event"
                );
                self.send(&Event::Port(ev))?;
            }
        }
    }

    /// Sends one event on its own stream.
    fn send(&self, ev: &Event) -> io::Result<()> {
        let stream = self.session.open()?;
        stream.send(ev)?;
        Ok(())
    }
}
