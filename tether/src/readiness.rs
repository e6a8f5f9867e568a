//! Boot readiness gate.
//!
//! Requirements are grouped into [`Phase`]s and checked strictly in order.
//! Each attempt runs a script, either on the host through `bash` or in the
//! guest over the SSH master. A fatal requirement ends the whole sequence
//! on its first failure; a non-fatal one is retried and, once out of
//! attempts, recorded without blocking what follows.

use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::Check;
use crate::error::{Error, Result};
use crate::ssh::SshControl;

/// DHCP lease database written by the host's vmnet DHCP server.
pub const DHCP_LEASES: &str = "/var/db/dhcpd_leases";

/// Readiness phase, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Phase {
    /// Host-side checks before the guest is reachable.
    Host,
    /// SSH reachability and session readiness.
    Essential,
    /// User checks.
    Optional,
    /// Boot scripts have finished.
    Final,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Host => "host",
            Self::Essential => "essential",
            Self::Optional => "optional",
            Self::Final => "final",
        })
    }
}

/// One readiness check.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Requirement {
    /// Shown while waiting.
    pub description: String,
    /// Script body, optionally starting with a shebang.
    pub script: String,
    /// Shown when the requirement is not satisfied.
    pub debug_hint: String,
    /// Stop every remaining check on the first failure.
    pub fatal: bool,
    /// Run with the host's `bash` instead of in the guest.
    pub runs_on_host: bool,
}

impl Requirement {
    /// A non-fatal requirement run in the guest.
    pub fn guest(
        description: impl Into<String>,
        script: impl Into<String>,
        debug_hint: impl Into<String>,
    ) -> Self {
        Self {
            description: description.into(),
            script: script.into(),
            debug_hint: debug_hint.into(),
            fatal: false,
            runs_on_host: false,
        }
    }

    /// A non-fatal requirement run on the host.
    pub fn host(
        description: impl Into<String>,
        script: impl Into<String>,
        debug_hint: impl Into<String>,
    ) -> Self {
        Self {
            runs_on_host: true,
            ..Self::guest(description, script, debug_hint)
        }
    }

    /// Marks the requirement fatal.
    #[must_use]
    pub const fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

/// Host requirement: the guest NIC has shown up in the host's ARP table.
pub fn host_requirements(mac: &str) -> Vec<Requirement> {
    let script = format!(
        "#!/bin/bash\n\
         if [[ $(arp -a | grep -w -i '{}' | awk '{{print $2}}') ]]; then\n  exit 0\nelse\n  exit 1\nfi\n",
        trim_mac(mac)
    );
    vec![Requirement::host(
        "host IP bound",
        script,
        "Failed to acquire host IP.",
    )]
}

/// Guest requirements for a usable SSH session.
pub fn essential_requirements() -> Vec<Requirement> {
    vec![
        Requirement::guest(
            "ssh",
            "#!/bin/bash\ntrue\n",
            "Failed to SSH into the guest.\n\
             If any private key under ~/.ssh is protected with a passphrase, \
             you need to have ssh-agent to be running.",
        ),
        Requirement::guest(
            "user session is ready for ssh",
            "#!/bin/bash\n\
             set -eux -o pipefail\n\
             if ! timeout 30s bash -c \"until sudo diff -q /run/tether-ssh-ready /mnt/cidata/meta-data 2>/dev/null; do sleep 3; done\"; then\n\
             \techo >&2 \"not ready to start persistent ssh session\"\n\
             \texit 1\n\
             fi\n",
            "The boot sequence terminates any existing user session after updating \
             /etc/environment. Terminating the session breaks the persistent SSH \
             tunnel, so it must not be created until the session reset is done.",
        ),
    ]
}

/// Guest requirements from the configured checks.
pub fn optional_requirements(checks: &[Check]) -> Vec<Requirement> {
    checks
        .iter()
        .map(|c| Requirement::guest(&c.description, &c.script, &c.hint))
        .collect()
}

/// Guest requirement: provisioning has completed.
pub fn final_requirements() -> Vec<Requirement> {
    vec![Requirement::guest(
        "boot scripts must have finished",
        "#!/bin/bash\n\
         set -eux -o pipefail\n\
         if ! timeout 30s bash -c \"until sudo diff -q /run/tether-boot-done /mnt/cidata/meta-data 2>/dev/null; do sleep 3; done\"; then\n\
         \techo >&2 \"boot scripts have not finished\"\n\
         \texit 1\n\
         fi\n",
        "All boot scripts, provisioning scripts, and readiness checks must finish \
         before the instance is considered \"ready\". Check \
         \"/var/log/cloud-init-output.log\" in the guest to see where the process is blocked!",
    )]
}

/// Runs readiness phases against an SSH control connection.
pub struct Gate {
    /// Runs the scripts.
    ssh: Arc<dyn SshControl>,
    /// Attempts per non-fatal requirement.
    retries: u32,
    /// Pause between attempts.
    delay: Duration,
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("retries", &self.retries)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl Gate {
    /// Creates a gate. `retries` below one is treated as one.
    pub fn new(ssh: Arc<dyn SshControl>, retries: u32, delay: Duration) -> Self {
        Self {
            ssh,
            retries: retries.max(1),
            delay,
        }
    }

    /// Checks every requirement of `phase` in order.
    ///
    /// Returns the failures of non-fatal requirements that ran out of
    /// attempts. A fatal failure is returned as the error and nothing
    /// further is checked.
    pub async fn wait(&self, phase: Phase, reqs: &[Requirement]) -> Result<Vec<String>> {
        let total = reqs.len();
        let mut errors = Vec::new();
        for (i, req) in reqs.iter().enumerate() {
            let n = i + 1;
            for attempt in 1..=self.retries {
                info!(
                    %phase,
                    requirement = n,
                    total,
                    description = %req.description,
                    "waiting for requirement"
                );
                let err = match self.check(req).await {
                    Ok(()) => {
                        info!(%phase, requirement = n, total, "requirement satisfied");
                        break;
                    }
                    Err(e) => e,
                };
                if req.fatal {
                    info!(%phase, "no further requirements will be checked");
                    return Err(Error::Requirements(vec![format!(
                        "failed to satisfy the {phase} requirement {n} of {total} {:?}: {}; skipping further checks: {err}",
                        req.description, req.debug_hint
                    )]));
                }
                if attempt == self.retries {
                    errors.push(format!(
                        "failed to satisfy the {phase} requirement {n} of {total} {:?}: {}: {err}",
                        req.description, req.debug_hint
                    ));
                    break;
                }
                debug!(%phase, requirement = n, attempt, error = %err, "requirement not satisfied yet");
                tokio::time::sleep(self.delay).await;
            }
        }
        Ok(errors)
    }

    /// Runs one attempt of `req`.
    async fn check(&self, req: &Requirement) -> Result<()> {
        debug!(description = %req.description, host = req.runs_on_host, "executing script");
        let out = if req.runs_on_host {
            self.ssh.execute_local_script(&req.script).await?
        } else {
            self.ssh
                .execute_remote_script(&req.script, &req.description)
                .await?
        };
        debug!(stdout = %out.trim_end(), "script succeeded");
        Ok(())
    }
}

/// One entry of the DHCP lease database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct Lease {
    /// Client host name.
    pub name: String,
    /// Leased address.
    pub ip_address: String,
    /// Client MAC, without the hardware type prefix.
    pub hw_address: String,
    /// Client identifier.
    pub identifier: String,
    /// Lease expiry, as written by the server.
    pub lease: String,
}

/// Parses a `dhcpd_leases` database.
pub fn parse_leases(text: &str) -> Result<Vec<Lease>> {
    let mut leases = Vec::new();
    let mut current = Lease::default();
    for line in text.lines().map(str::trim) {
        match line {
            "" => continue,
            "{" => {
                current = Lease::default();
                continue;
            }
            "}" => {
                leases.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(Error::Config(format!("invalid line in dhcp leases file: {line}")));
        };
        match key {
            "name" => current.name = value.to_owned(),
            "ip_address" => current.ip_address = value.to_owned(),
            // Hardware type prefix, e.g. "1,".
            "hw_address" => {
                current.hw_address = value.split_once(',').map_or(value, |(_, mac)| mac).to_owned();
            }
            "identifier" => current.identifier = value.to_owned(),
            "lease" => current.lease = value.to_owned(),
            _ => return Err(Error::Config(format!("unable to parse line: {line}"))),
        }
    }
    Ok(leases)
}

/// Drops the leading zero of every MAC octet (`0a` → `a`), the form the
/// lease database uses.
pub fn trim_mac(mac: &str) -> String {
    mac.split(':')
        .map(|octet| match octet.strip_prefix('0') {
            Some(rest) if rest.len() == 1 => rest,
            _ => octet,
        })
        .collect::<Vec<_>>()
        .join(":")
}

/// Looks up the address leased to `mac` in the lease database at `path`.
pub fn ip_from_mac(path: &Path, mac: &str) -> Result<IpAddr> {
    let mac = trim_mac(mac);
    debug!(%mac, path = %path.display(), "searching dhcp leases");
    let leases = parse_leases(&std::fs::read_to_string(path)?)?;
    leases
        .iter()
        .find(|l| l.hw_address.eq_ignore_ascii_case(&mac))
        .ok_or_else(|| Error::Config(format!("could not find an IP address for {mac}")))?
        .ip_address
        .parse()
        .map_err(|e| Error::Config(format!("bad lease address for {mac}: {e}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::forward::tests::MockSsh;

    const LEASES: &str = "{
\tname=tether-dev
\tip_address=192.168.105.2
\thw_address=1,52:55:55:2:a:b
\tidentifier=1,52:55:55:2:a:b
\tlease=0x65a1b2c3
}
{
\tname=other
\tip_address=192.168.105.3
\thw_address=1,52:55:55:12:34:56
\tidentifier=1,52:55:55:12:34:56
\tlease=0x65a1b2c4
}
";

    fn gate(ssh: &Arc<MockSsh>, retries: u32) -> Gate {
        Gate::new(Arc::clone(ssh) as Arc<dyn SshControl>, retries, Duration::from_secs(10))
    }

    fn failing(scripts: &[&str]) -> Arc<MockSsh> {
        Arc::new(MockSsh {
            fail_scripts: Mutex::new(scripts.iter().map(|s| (*s).to_owned()).collect()),
            ..MockSsh::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failure_skips_the_rest() {
        let ssh = failing(&["false"]);
        let reqs = [
            Requirement::guest("broken", "false", "fix it").fatal(),
            Requirement::guest("fine", "true", ""),
        ];
        let err = gate(&ssh, 60).wait(Phase::Essential, &reqs).await.unwrap_err();
        assert_eq!(ssh.calls(), ["remote false"]);
        let msg = err.to_string();
        assert!(msg.starts_with(
            "failed to satisfy the essential requirement 1 of 2 \"broken\": fix it; skipping further checks:"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn non_fatal_failure_is_retried_then_recorded() {
        let ssh = failing(&["false"]);
        let reqs = [
            Requirement::guest("flaky", "false", "hint"),
            Requirement::host("local", "true", ""),
        ];
        let start = tokio::time::Instant::now();
        let errors = gate(&ssh, 3).wait(Phase::Optional, &reqs).await.unwrap();
        assert_eq!(
            ssh.calls(),
            ["remote false", "remote false", "remote false", "local true"]
        );
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("failed to satisfy the optional requirement 1 of 2 \"flaky\": hint: "));
        assert!(start.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn satisfied_phase_has_no_errors() {
        let ssh = Arc::new(MockSsh::default());
        let errors = gate(&ssh, 60)
            .wait(Phase::Final, &final_requirements())
            .await
            .unwrap();
        assert!(errors.is_empty());
        assert_eq!(ssh.calls().len(), 1);
    }

    #[test]
    fn builtin_requirements() {
        let host = host_requirements("52:55:55:02:0a:0b");
        assert!(host[0].runs_on_host);
        assert!(host[0].script.contains("'52:55:55:2:a:b'"));
        let essential = essential_requirements();
        assert_eq!(essential[0].description, "ssh");
        assert!(essential.iter().all(|r| !r.fatal && !r.runs_on_host));

        let checks = [Check {
            description: "docker".into(),
            script: "docker info".into(),
            hint: "start docker".into(),
        }];
        let optional = optional_requirements(&checks);
        assert_eq!(optional[0].description, "docker");
        assert_eq!(optional[0].debug_hint, "start docker");
    }

    #[test]
    fn mac_octets_lose_leading_zero() {
        assert_eq!(trim_mac("52:55:55:02:0a:0b"), "52:55:55:2:a:b");
        assert_eq!(trim_mac("00:10:a0:00:01:ff"), "0:10:a0:0:1:ff");
    }

    #[test]
    fn leases_are_parsed() {
        let leases = parse_leases(LEASES).unwrap();
        assert_eq!(leases.len(), 2);
        assert_eq!(leases[0].name, "tether-dev");
        assert_eq!(leases[0].hw_address, "52:55:55:2:a:b");
        assert_eq!(leases[1].ip_address, "192.168.105.3");
        assert!(parse_leases("{\n\tbogus\n}\n").is_err());
    }

    #[test]
    fn ip_is_found_by_mac() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dhcpd_leases");
        std::fs::write(&path, LEASES).unwrap();
        assert_eq!(
            ip_from_mac(&path, "52:55:55:02:0A:0B").unwrap(),
            "192.168.105.2".parse::<IpAddr>().unwrap()
        );
        assert!(ip_from_mac(&path, "52:55:55:99:99:99").is_err());
    }
}
