//! Host agent: boots the guest through the readiness phases, then keeps
//! port forwards and DNS live until told to stop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::HostConfig;
use crate::dispatch::{Dispatcher, GuestLink, RETRY_DELAY, open_link};
use crate::dns::{DnsResponder, SystemResolver};
use crate::error::{Error, Result};
use crate::events::{Status, StatusEmitter};
use crate::forward::PortForwarder;
use crate::readiness::{
    Gate, Phase, Requirement, essential_requirements, final_requirements, host_requirements,
    ip_from_mac, optional_requirements,
};
use crate::ssh::{SshControl, SshMaster};

/// Stops the VM when the agent shuts down.
#[async_trait]
pub trait VmController: Send + Sync {
    /// Asks the VM to stop and waits for it to go away.
    async fn request_stop(&self) -> Result<()>;
}

/// [`VmController`] that signals the VM process directly.
#[cfg(unix)]
#[derive(Debug)]
pub struct PidController {
    /// VM process.
    pid: nix::unistd::Pid,
    /// Time allowed between `SIGTERM` and `SIGKILL`.
    grace: Duration,
}

#[cfg(unix)]
impl PidController {
    /// Controls process `pid` with a 5 s grace period.
    pub fn new(pid: u32) -> Result<Self> {
        let raw = i32::try_from(pid)
            .map_err(|_| Error::Config(format!("invalid VM pid {pid}")))?;
        Ok(Self {
            pid: nix::unistd::Pid::from_raw(raw),
            grace: Duration::from_secs(5),
        })
    }

    /// Overrides the grace period.
    #[must_use]
    pub const fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Sends `signal`; a process that is already gone is not an error.
    fn signal(&self, signal: nix::sys::signal::Signal) -> Result<()> {
        match nix::sys::signal::kill(self.pid, signal) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(std::io::Error::from(e).into()),
        }
    }

    /// Returns `true` while the process exists.
    fn is_alive(&self) -> bool {
        nix::sys::signal::kill(self.pid, None).is_ok()
    }
}

#[cfg(unix)]
#[async_trait]
impl VmController for PidController {
    async fn request_stop(&self) -> Result<()> {
        use nix::sys::signal::Signal;

        info!(pid = self.pid.as_raw(), "stopping VM");
        self.signal(Signal::SIGTERM)?;
        let deadline = tokio::time::Instant::now() + self.grace;
        while tokio::time::Instant::now() < deadline {
            if !self.is_alive() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        warn!(pid = self.pid.as_raw(), "VM did not exit in time, killing it");
        self.signal(Signal::SIGKILL)
    }
}

/// Cleanup registered during boot, run in reverse order at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseHook {
    /// Close the SSH master connection.
    ExitMaster,
    /// Cancel the configured socket forwards.
    CancelSockets,
}

/// Orchestrates boot readiness, the guest link, and shutdown.
pub struct HostAgent {
    /// Defaulted configuration.
    config: HostConfig,
    /// SSH control connection.
    ssh: Arc<dyn SshControl>,
    /// Where the guest agent connects.
    link: Box<dyn GuestLink>,
    /// Status sink.
    events: StatusEmitter,
    /// DNS responder, when enabled.
    dns: Option<Arc<DnsResponder>>,
    /// VM stopper, when known.
    vm: Option<Box<dyn VmController>>,
    /// Delay before accepting a new guest connection.
    retry: Duration,
}

impl std::fmt::Debug for HostAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostAgent")
            .field("name", &self.config.name)
            .field("dns", &self.dns)
            .finish_non_exhaustive()
    }
}

impl HostAgent {
    /// Creates an agent from its collaborators.
    pub fn new(
        config: HostConfig,
        ssh: Arc<dyn SshControl>,
        link: Box<dyn GuestLink>,
        events: StatusEmitter,
    ) -> Self {
        Self {
            config,
            ssh,
            link,
            events,
            dns: None,
            vm: None,
            retry: RETRY_DELAY,
        }
    }

    /// Wires the default collaborators for `config`: the OpenSSH master,
    /// the configured guest link, the system resolver and, when a VM pid
    /// is configured, a signal-based VM controller.
    pub fn from_config(config: HostConfig, events: StatusEmitter) -> Result<Self> {
        let ssh: Arc<dyn SshControl> = Arc::new(SshMaster::from_config(&config));
        let link = open_link(&config.guest_link())?;
        let resolver = &config.host_resolver;
        let dns = resolver.enabled.then(|| {
            let dns = DnsResponder::new(Box::new(SystemResolver::from_system()), resolver.ipv6);
            dns.update_hosts(&resolver.hosts);
            Arc::new(dns)
        });
        #[cfg(unix)]
        let vm = match config.vm_pid {
            Some(pid) => Some(Box::new(PidController::new(pid)?) as Box<dyn VmController>),
            None => None,
        };
        #[cfg(not(unix))]
        let vm = None;

        let mut agent = Self::new(config, ssh, link, events);
        agent.dns = dns;
        agent.vm = vm;
        Ok(agent)
    }

    /// Uses `dns` to answer the guest's DNS queries.
    #[must_use]
    pub fn with_dns(mut self, dns: Arc<DnsResponder>) -> Self {
        self.dns = Some(dns);
        self
    }

    /// Stops the VM through `vm` at shutdown.
    #[must_use]
    pub fn with_vm(mut self, vm: Box<dyn VmController>) -> Self {
        self.vm = Some(vm);
        self
    }

    /// Overrides the delay before accepting a new guest connection.
    #[must_use]
    pub fn with_retry(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    /// Boots, serves until `cancel` fires, then shuts down.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let port = self.config.ssh.local_port;
        self.emit(Status::booting(port));

        let forwarder = Arc::new(PortForwarder::new(
            self.config.forward_rules(),
            Arc::clone(&self.ssh),
        ));
        let (ready_tx, ready_rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(Arc::clone(&forwarder), self.dns.clone())
            .with_ready(ready_rx)
            .with_retry(self.retry);

        let mut hooks = Vec::new();
        let dispatch = async {
            dispatcher.run(self.link.as_ref(), cancel.clone()).await;
        };
        let serve = async {
            let boot = tokio::select! {
                errors = self.boot(&forwarder, ready_tx, &cancel, &mut hooks) => Some(errors),
                () = cancel.cancelled() => None,
            };
            if let Some(errors) = boot {
                for e in &errors {
                    warn!(error = %e, "boot requirement failed");
                }
                info!(degraded = !errors.is_empty(), "instance is running");
                self.emit(Status::running(port, errors));
                cancel.cancelled().await;
            }
        };
        tokio::join!(dispatch, serve);

        info!("shutting down");
        if let Some(vm) = &self.vm {
            if let Err(e) = vm.request_stop().await {
                error!(error = %e, "failed to stop the VM");
            }
        }
        for hook in hooks.iter().rev() {
            self.close(*hook, &forwarder).await;
        }
        self.emit(Status::exiting(port));
        Ok(())
    }

    /// Runs the readiness phases, registering close hooks as resources
    /// come up. Returns every failure; stops early on a fatal one.
    async fn boot(
        &self,
        forwarder: &Arc<PortForwarder>,
        ready: watch::Sender<bool>,
        cancel: &CancellationToken,
        hooks: &mut Vec<CloseHook>,
    ) -> Vec<String> {
        let gate = Gate::new(
            Arc::clone(&self.ssh),
            self.config.requirement_retries,
            self.config.requirement_delay(),
        );
        let mut errors = Vec::new();

        let host = host_requirements(&self.config.mac_address);
        if !phase(&gate, Phase::Host, &host, &mut errors).await {
            return errors;
        }
        let ip = match ip_from_mac(&self.config.dhcp_leases, &self.config.mac_address) {
            Ok(ip) => ip,
            Err(e) => {
                errors.push(e.to_string());
                return errors;
            }
        };
        info!(%ip, "guest address");
        self.ssh.set_host(&ip.to_string());
        hooks.push(CloseHook::ExitMaster);
        if let Some(dns) = &self.dns {
            dns.set_instance_ip(&self.config.name, ip);
        }

        if !phase(&gate, Phase::Essential, &essential_requirements(), &mut errors).await {
            return errors;
        }
        ready.send_replace(true);
        // Socket forwards come up alongside the remaining phases.
        let sockets = Arc::clone(forwarder);
        let stop = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = sockets.forward_defined_sockets() => {}
                () = stop.cancelled() => {}
            }
        });
        hooks.push(CloseHook::CancelSockets);

        let optional = optional_requirements(&self.config.checks);
        if !phase(&gate, Phase::Optional, &optional, &mut errors).await {
            return errors;
        }
        phase(&gate, Phase::Final, &final_requirements(), &mut errors).await;
        errors
    }

    /// Runs one close hook, logging failures.
    async fn close(&self, hook: CloseHook, forwarder: &PortForwarder) {
        let result = match hook {
            CloseHook::CancelSockets => forwarder.cancel_defined_sockets().await,
            CloseHook::ExitMaster => self.ssh.exit_master().await,
        };
        if let Err(e) = result {
            warn!(?hook, error = %e, "close hook failed");
        }
    }

    /// Emits a status event, logging failures.
    fn emit(&self, status: Status) {
        if let Err(e) = self.events.emit(status) {
            warn!(error = %e, "failed to emit status event");
        }
    }
}

/// Waits for one phase, collecting its failures. Returns `false` after a
/// fatal failure.
async fn phase(gate: &Gate, phase: Phase, reqs: &[Requirement], errors: &mut Vec<String>) -> bool {
    match gate.wait(phase, reqs).await {
        Ok(failed) => {
            errors.extend(failed);
            true
        }
        Err(e) => {
            errors.push(e.to_string());
            false
        }
    }
}
