//! `tether run`, `tether rules` and `tether guest-ip`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tether::{ForwardRule, HostAgent, HostConfig, StatusEmitter};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::OutputFormat;

/// Selects the instance configuration.
#[derive(clap::Args)]
pub struct ConfigArgs {
    /// Instance configuration file (JSON).
    #[arg(long, short = 'c', env = "TETHER_CONFIG")]
    config: PathBuf,
}

impl ConfigArgs {
    fn load(&self) -> Result<HostConfig> {
        HostConfig::load(&self.config)
            .with_context(|| format!("failed to load {}", self.config.display()))
    }
}

/// Runs the host agent until SIGINT or SIGTERM. Status events go to stdout.
pub async fn run(args: &ConfigArgs) -> Result<()> {
    let config = args.load()?;
    info!(name = %config.name, dir = %config.instance_dir.display(), "starting host agent");
    let agent = HostAgent::from_config(config, StatusEmitter::new(std::io::stdout()))
        .context("failed to set up the host agent")?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));
    agent.run(cancel).await?;
    Ok(())
}

/// Cancels `cancel` on the first SIGINT or SIGTERM.
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot watch SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = tokio::signal::ctrl_c().await;

    info!("received shutdown signal");
    cancel.cancel();
}

/// Prints the forward rules, user rules first.
pub fn rules(args: &ConfigArgs, format: OutputFormat) -> Result<()> {
    let rules = args.load()?.forward_rules();
    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&rules)?);
        return Ok(());
    }
    println!("{:<4} {:<32} {:<40} ACTION", "#", "GUEST", "HOST");
    for (i, rule) in rules.iter().enumerate() {
        println!(
            "{:<4} {:<32} {:<40} {}",
            i + 1,
            guest_side(rule),
            host_side(rule),
            if rule.ignore { "ignore" } else { "forward" }
        );
    }
    Ok(())
}

/// Prints the address the guest leased.
pub fn guest_ip(args: &ConfigArgs) -> Result<()> {
    let config = args.load()?;
    let ip = tether::ip_from_mac(&config.dhcp_leases, &config.mac_address)
        .with_context(|| format!("no lease for {}", config.mac_address))?;
    println!("{ip}");
    Ok(())
}

fn guest_side(rule: &ForwardRule) -> String {
    rule.guest_socket.clone().unwrap_or_else(|| {
        let zero = if rule.guest_ip_must_be_zero { " (exact)" } else { "" };
        format!("{}:{}{zero}", rule.guest_ip(), ports(rule.guest_port_range))
    })
}

fn host_side(rule: &ForwardRule) -> String {
    rule.host_socket
        .clone()
        .unwrap_or_else(|| format!("{}:{}", rule.host_ip(), ports(rule.host_port_range)))
}

fn ports([lo, hi]: [u16; 2]) -> String {
    if lo == hi {
        lo.to_string()
    } else {
        format!("{lo}-{hi}")
    }
}
