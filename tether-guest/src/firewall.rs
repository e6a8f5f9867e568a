//! Decides when the NAT table is worth re-reading.
//!
//! Listing iptables rules and probing every published port is expensive,
//! so the observer only does it for a while after the kernel reports a
//! netfilter configuration change. Between changes the last result is
//! reused.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tether_proto::Endpoint;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Mutable part of [`FirewallWatch`].
#[derive(Debug, Default)]
struct State {
    /// Whether the next poll should list the NAT table.
    worth_checking: bool,
    /// When the last change signal arrived.
    last_signal: Option<Instant>,
    /// Audit is unavailable, so every poll checks.
    pinned: bool,
}

/// Tracks netfilter change signals and caches the last NAT listing.
#[derive(Debug)]
pub struct FirewallWatch {
    /// How long a signal keeps checking enabled.
    idle: Duration,
    /// Flag and timestamps.
    state: RwLock<State>,
    /// Endpoints from the last successful listing.
    cache: RwLock<Vec<Endpoint>>,
}

impl FirewallWatch {
    /// Creates a watch that starts in the "worth checking" state so the
    /// first poll reads the table.
    pub fn new(idle: Duration) -> Arc<Self> {
        Arc::new(Self {
            idle,
            state: RwLock::new(State {
                worth_checking: true,
                last_signal: Some(Instant::now()),
                pinned: false,
            }),
            cache: RwLock::new(Vec::new()),
        })
    }

    /// Returns `true` when the next poll should list the NAT table.
    pub fn worth_checking(&self) -> bool {
        let s = self.state.read().unwrap_or_else(PoisonError::into_inner);
        s.pinned || s.worth_checking
    }

    /// Records a netfilter configuration change.
    pub fn signal(&self) {
        let mut s = self.state.write().unwrap_or_else(PoisonError::into_inner);
        s.worth_checking = true;
        s.last_signal = Some(Instant::now());
        trace!("netfilter change signalled");
    }

    /// Keeps checking enabled forever.
    pub fn pin(&self) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .pinned = true;
    }

    /// Clears the flag if no signal arrived within the idle window.
    pub fn expire(&self) {
        let mut s = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let quiet = s
            .last_signal
            .is_none_or(|at| at.elapsed() >= self.idle);
        if quiet && s.worth_checking {
            debug!("no netfilter changes recently, pausing iptables checks");
            s.worth_checking = false;
        }
    }

    /// Periodically expires the flag. Never returns.
    pub async fn run_watchdog(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.idle).await;
            self.expire();
        }
    }

    /// Returns the NAT-published ports, re-listing only when worthwhile.
    ///
    /// On a failed listing the previous result is returned together with
    /// the error.
    pub async fn ports_from<F>(&self, list: F) -> (Vec<Endpoint>, Option<String>)
    where
        F: Future<Output = std::io::Result<Vec<Endpoint>>>,
    {
        if !self.worth_checking() {
            return (self.cached(), None);
        }
        match list.await {
            Ok(ports) => {
                *self.cache.write().unwrap_or_else(PoisonError::into_inner) = ports.clone();
                (ports, None)
            }
            Err(e) => (self.cached(), Some(format!("iptables: {e}"))),
        }
    }

    /// Returns the last successful listing.
    fn cached(&self) -> Vec<Endpoint> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    const IDLE: Duration = Duration::from_secs(60);

    fn ep(port: u16) -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
    }

    #[tokio::test(start_paused = true)]
    async fn flag_follows_signals() {
        let w = FirewallWatch::new(IDLE);
        w.signal();
        assert!(w.worth_checking());

        tokio::time::advance(IDLE + Duration::from_secs(1)).await;
        w.expire();
        assert!(!w.worth_checking());

        w.signal();
        tokio::time::advance(IDLE / 2).await;
        w.expire();
        assert!(w.worth_checking());
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_expires_quiet_flag() {
        let w = FirewallWatch::new(IDLE);
        tokio::spawn(Arc::clone(&w).run_watchdog());
        tokio::time::sleep(IDLE * 2 + Duration::from_secs(1)).await;
        assert!(!w.worth_checking());
    }

    #[tokio::test(start_paused = true)]
    async fn pinned_watch_always_checks() {
        let w = FirewallWatch::new(IDLE);
        w.pin();
        tokio::time::advance(IDLE * 3).await;
        w.expire();
        assert!(w.worth_checking());
    }

    #[tokio::test(start_paused = true)]
    async fn cache_serves_quiet_periods_and_failures() {
        let w = FirewallWatch::new(IDLE);
        let (ports, err) = w.ports_from(async { Ok(vec![ep(8080)]) }).await;
        assert_eq!(ports, vec![ep(8080)]);
        assert!(err.is_none());

        let (ports, err) = w
            .ports_from(async { Err(io::Error::other("iptables missing")) })
            .await;
        assert_eq!(ports, vec![ep(8080)]);
        assert!(err.unwrap().contains("iptables missing"));

        tokio::time::advance(IDLE).await;
        w.expire();
        let (ports, _) = w.ports_from(async { Ok(Vec::new()) }).await;
        assert_eq!(ports, vec![ep(8080)]);
    }
}
