//! Host agent for tether VMs.
//!
//! Listens for the guest agent's connection, turns the guest's listening
//! TCP ports into SSH local forwards, answers the guest's DNS queries from
//! the host's resolver, and gates all of it on a staged boot readiness
//! check.
//!
//! ```no_run
//! use std::path::Path;
//!
//! use tether::{HostAgent, HostConfig, StatusEmitter};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> tether::Result<()> {
//! let config = HostConfig::load(Path::new("/vms/dev/tether.json"))?;
//! let agent = HostAgent::from_config(config, StatusEmitter::new(std::io::stdout()))?;
//! agent.run(CancellationToken::new()).await
//! # }
//! ```

mod agent;
mod config;
mod dispatch;
mod dns;
mod error;
mod events;
mod forward;
mod readiness;
mod ssh;

#[cfg(unix)]
pub use agent::PidController;
pub use agent::{HostAgent, VmController};
pub use config::{
    ForwardRule, GuestLinkConfig, HostConfig, HostResolver, Placeholders, Check, SshConfig,
    fill_rule_defaults,
};
#[cfg(unix)]
pub use dispatch::UnixSocketLink;
#[cfg(target_os = "linux")]
pub use dispatch::VsockLink;
pub use dispatch::{Dispatcher, GuestLink, open_link};
pub use dns::{DnsResponder, GATEWAY_NAME, SystemResolver, Upstream};
pub use error::{Error, Result};
pub use events::{Status, StatusEmitter, StatusEvent};
pub use forward::{PortForwarder, host_address, match_rule};
pub use readiness::{Gate, Lease, Phase, Requirement, ip_from_mac, parse_leases, trim_mac};
pub use ssh::{SshControl, SshMaster};
