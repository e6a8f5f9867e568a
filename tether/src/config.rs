//! Host agent configuration and forward rule defaulting.
//!
//! The configuration is a JSON document written by whatever provisions the
//! instance. [`HostConfig::load`] parses it, fills defaults, and validates
//! it; everything downstream can rely on the defaulted shape.

use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_proto::HOST_PORT;

use crate::error::{Error, Result};

/// Directory under the instance dir that holds relative host sockets.
pub const SOCKET_DIR: &str = "sock";
/// Default SSH control socket name under the instance dir.
const SSH_SOCK: &str = "ssh.sock";
/// Default guest link socket name under the instance dir.
const GUEST_SOCK: &str = "tether.sock";
/// Guest SSH port that is never forwarded.
pub const SSH_GUEST_PORT: u16 = 22;

/// Fully defaulted configuration consumed by the host agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct HostConfig {
    /// Instance name. Defaults to the instance directory's base name.
    #[serde(default)]
    pub name: String,
    /// Directory holding the instance's sockets and state.
    pub instance_dir: PathBuf,
    /// Guest NIC MAC address, used to find the guest's DHCP lease.
    #[serde(default)]
    pub mac_address: String,
    /// SSH master connection settings.
    #[serde(default)]
    pub ssh: SshConfig,
    /// User forward rules, evaluated before the built-in ones.
    #[serde(default)]
    pub port_forwards: Vec<ForwardRule>,
    /// Readiness checks run in the `optional` phase.
    #[serde(default)]
    pub checks: Vec<Check>,
    /// Host DNS responder settings.
    #[serde(default)]
    pub host_resolver: HostResolver,
    /// Where the guest agent's connection arrives.
    #[serde(default)]
    pub guest_link: Option<GuestLinkConfig>,
    /// DHCP lease database used to find the guest's address.
    #[serde(default = "default_leases")]
    pub dhcp_leases: PathBuf,
    /// PID of the VM process, signalled on shutdown.
    #[serde(default)]
    pub vm_pid: Option<u32>,
    /// Attempts per readiness requirement.
    #[serde(default = "default_retries")]
    pub requirement_retries: u32,
    /// Seconds between readiness attempts.
    #[serde(default = "default_delay")]
    pub requirement_delay: u64,
}

/// Default DHCP lease database.
fn default_leases() -> PathBuf {
    PathBuf::from(crate::readiness::DHCP_LEASES)
}

/// Default attempts per readiness requirement.
const fn default_retries() -> u32 {
    60
}

/// Default seconds between readiness attempts.
const fn default_delay() -> u64 {
    10
}

/// SSH master connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[non_exhaustive]
pub struct SshConfig {
    /// Guest SSH port (0 means 22).
    pub local_port: u16,
    /// Login user. Defaults to the current host user.
    pub user: Option<String>,
    /// Private key offered to the guest.
    pub identity_file: Option<PathBuf>,
    /// ControlMaster socket. Defaults to `<instanceDir>/ssh.sock`.
    pub control_path: Option<PathBuf>,
    /// Forward the local SSH agent.
    pub forward_agent: bool,
}

/// A user-supplied readiness check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct Check {
    /// Shown while waiting.
    pub description: String,
    /// Script run in the guest over SSH.
    pub script: String,
    /// Shown when the check never passes.
    pub hint: String,
}

/// Host DNS responder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[non_exhaustive]
pub struct HostResolver {
    /// Answer guest DNS queries at all.
    pub enabled: bool,
    /// Answer AAAA queries with IPv6 records.
    pub ipv6: bool,
    /// Static names: value is an IP address or a CNAME target.
    pub hosts: BTreeMap<String, String>,
}

impl Default for HostResolver {
    fn default() -> Self {
        Self {
            enabled: true,
            ipv6: false,
            hosts: BTreeMap::new(),
        }
    }
}

/// Where the guest agent's connection comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum GuestLinkConfig {
    /// A Unix socket the hypervisor bridges the guest's vsock port to.
    UnixSocket(PathBuf),
    /// A native vsock port (Linux hosts).
    VsockPort(u32),
}

/// One forwarding rule.
///
/// After [`fill_rule_defaults`] every optional address and range is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[non_exhaustive]
pub struct ForwardRule {
    /// Guest address condition.
    #[serde(rename = "guestIP", skip_serializing_if = "Option::is_none")]
    pub guest_ip: Option<IpAddr>,
    /// Only match guests listening on exactly `0.0.0.0`.
    #[serde(rename = "guestIPMustBeZero")]
    pub guest_ip_must_be_zero: bool,
    /// Single guest port (shorthand for a one-port range).
    pub guest_port: u16,
    /// Inclusive guest port range.
    pub guest_port_range: [u16; 2],
    /// Guest Unix socket to forward instead of a TCP port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_socket: Option<String>,
    /// Host bind address.
    #[serde(rename = "hostIP", skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<IpAddr>,
    /// Single host port (shorthand for a one-port range).
    pub host_port: u16,
    /// Inclusive host port range, aligned with the guest range.
    pub host_port_range: [u16; 2],
    /// Host Unix socket to expose the guest port or socket on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_socket: Option<String>,
    /// Transport protocol; only `tcp` is forwarded.
    pub proto: String,
    /// Matching endpoints are never forwarded.
    pub ignore: bool,
}

impl ForwardRule {
    /// Guest address condition (defaults to loopback).
    pub fn guest_ip(&self) -> IpAddr {
        self.guest_ip.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    /// Host bind address (defaults to loopback).
    pub fn host_ip(&self) -> IpAddr {
        self.host_ip.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    /// Built-in rule that keeps the guest's SSH port off the host.
    pub fn block_ssh(ctx: &Placeholders) -> Self {
        let mut rule = Self {
            guest_ip: Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            guest_port: SSH_GUEST_PORT,
            ignore: true,
            ..Self::default()
        };
        fill_rule_defaults(&mut rule, ctx);
        rule
    }

    /// Built-in catch-all: guest loopback ports to the same host port.
    pub fn loopback_catch_all(ctx: &Placeholders) -> Self {
        let mut rule = Self {
            guest_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            ..Self::default()
        };
        fill_rule_defaults(&mut rule, ctx);
        rule
    }
}

/// Values substituted for `{{.Key}}` in socket paths.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct Placeholders {
    /// Instance directory.
    pub dir: String,
    /// Instance name.
    pub name: String,
    /// Host home directory.
    pub home: String,
    /// Login user.
    pub user: String,
    /// Numeric user id.
    pub uid: String,
}

impl Placeholders {
    /// Values for host socket paths.
    fn host(&self) -> [(&str, &str); 5] {
        [
            ("Dir", self.dir.as_str()),
            ("Name", self.name.as_str()),
            ("Home", self.home.as_str()),
            ("User", self.user.as_str()),
            ("UID", self.uid.as_str()),
        ]
    }

    /// Values for guest socket paths, where home is the guest's.
    fn guest(&self) -> [(&str, String); 3] {
        [
            ("Home", format!("/home/{}.linux", self.user)),
            ("User", self.user.clone()),
            ("UID", self.uid.clone()),
        ]
    }
}

/// Replaces every `{{.Key}}` with its value.
fn expand<'a>(template: &str, vars: impl IntoIterator<Item = (&'a str, impl AsRef<str>)>) -> String {
    vars.into_iter().fold(template.to_owned(), |acc, (key, value)| {
        acc.replace(&format!("{{{{.{key}}}}}"), value.as_ref())
    })
}

/// Fills the defaults of one rule in place.
///
/// A missing guest address is `127.0.0.1` (or `0.0.0.0` when it must be
/// zero); a missing host address is `127.0.0.1`; an unset guest range
/// comes from `guestPort` or covers every port; an unset host range comes
/// from `hostPort` or mirrors the guest range. Relative host sockets are
/// placed under `<instanceDir>/sock/`.
pub fn fill_rule_defaults(rule: &mut ForwardRule, ctx: &Placeholders) {
    if rule.proto.is_empty() {
        rule.proto = "tcp".into();
    }
    if rule.guest_ip.is_none() {
        rule.guest_ip = Some(IpAddr::V4(if rule.guest_ip_must_be_zero {
            Ipv4Addr::UNSPECIFIED
        } else {
            Ipv4Addr::LOCALHOST
        }));
    }
    if rule.host_ip.is_none() {
        rule.host_ip = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    if rule.guest_port_range == [0, 0] {
        rule.guest_port_range = if rule.guest_port == 0 {
            [1, u16::MAX]
        } else {
            [rule.guest_port, rule.guest_port]
        };
    }
    if rule.host_port_range == [0, 0] {
        rule.host_port_range = if rule.host_port == 0 {
            rule.guest_port_range
        } else {
            [rule.host_port, rule.host_port]
        };
    }
    if let Some(sock) = &mut rule.guest_socket {
        *sock = expand(sock, ctx.guest());
    }
    if let Some(sock) = &mut rule.host_socket {
        let expanded = expand(sock, ctx.host());
        *sock = if Path::new(&expanded).is_absolute() {
            expanded
        } else {
            Path::new(&ctx.dir)
                .join(SOCKET_DIR)
                .join(expanded)
                .to_string_lossy()
                .into_owned()
        };
    }
}

impl HostConfig {
    /// Reads, defaults, and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&data)?;
        config.fill_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Fills every unset field with its default.
    pub fn fill_defaults(&mut self) {
        if self.name.is_empty() {
            self.name = self
                .instance_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        if self.ssh.local_port == 0 {
            self.ssh.local_port = SSH_GUEST_PORT;
        }
        if self.ssh.user.is_none() {
            self.ssh.user = Some(current_user().0);
        }
        if self.ssh.control_path.is_none() {
            self.ssh.control_path = Some(self.instance_dir.join(SSH_SOCK));
        }
        if self.guest_link.is_none() {
            self.guest_link = Some(GuestLinkConfig::UnixSocket(
                self.instance_dir.join(GUEST_SOCK),
            ));
        }
        let total = self.checks.len();
        for (i, check) in self.checks.iter_mut().enumerate() {
            if check.description.is_empty() {
                check.description = format!("user check {}/{total}", i + 1);
            }
        }
        let ctx = self.placeholders();
        for rule in &mut self.port_forwards {
            fill_rule_defaults(rule, &ctx);
        }
    }

    /// Rejects configurations the agent cannot act on.
    pub fn validate(&self) -> Result<()> {
        if self.mac_address.is_empty() {
            return Err(Error::Config("macAddress is required".into()));
        }
        for (i, rule) in self.port_forwards.iter().enumerate() {
            let [lo, hi] = rule.guest_port_range;
            if lo == 0 || lo > hi {
                return Err(Error::Config(format!(
                    "portForwards[{i}]: invalid guestPortRange [{lo}, {hi}]"
                )));
            }
            let [hlo, hhi] = rule.host_port_range;
            if hlo == 0 && rule.host_socket.is_none() {
                return Err(Error::Config(format!(
                    "portForwards[{i}]: invalid hostPortRange [{hlo}, {hhi}]"
                )));
            }
            if hhi.checked_sub(hlo) != Some(hi - lo) && rule.host_socket.is_none() {
                return Err(Error::Config(format!(
                    "portForwards[{i}]: hostPortRange [{hlo}, {hhi}] must be as wide as guestPortRange [{lo}, {hi}]"
                )));
            }
            if rule.proto != "tcp" {
                return Err(Error::Config(format!(
                    "portForwards[{i}]: unsupported proto {:?}",
                    rule.proto
                )));
            }
        }
        Ok(())
    }

    /// Placeholder values for this instance.
    pub fn placeholders(&self) -> Placeholders {
        let (user, uid) = current_user();
        Placeholders {
            dir: self.instance_dir.to_string_lossy().into_owned(),
            name: self.name.clone(),
            home: dirs::home_dir()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default(),
            user: self.ssh.user.clone().unwrap_or(user),
            uid: uid.to_string(),
        }
    }

    /// User rules followed by the built-in SSH block and loopback catch-all.
    pub fn forward_rules(&self) -> Vec<ForwardRule> {
        let ctx = self.placeholders();
        let mut rules = Vec::with_capacity(self.port_forwards.len() + 2);
        rules.extend(self.port_forwards.iter().cloned());
        rules.push(ForwardRule::block_ssh(&ctx));
        rules.push(ForwardRule::loopback_catch_all(&ctx));
        rules
    }

    /// Where the guest connection arrives.
    pub fn guest_link(&self) -> GuestLinkConfig {
        self.guest_link
            .clone()
            .unwrap_or_else(|| GuestLinkConfig::VsockPort(HOST_PORT))
    }

    /// Delay between readiness attempts.
    pub const fn requirement_delay(&self) -> Duration {
        Duration::from_secs(self.requirement_delay)
    }
}

/// Returns the current user's name and uid.
#[cfg(unix)]
fn current_user() -> (String, u32) {
    let uid = nix::unistd::Uid::current();
    let name = nix::unistd::User::from_uid(uid)
        .ok()
        .flatten()
        .map(|u| u.name)
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_default();
    (name, uid.as_raw())
}

/// Returns the current user's name and uid.
#[cfg(not(unix))]
fn current_user() -> (String, u32) {
    (std::env::var("USERNAME").unwrap_or_default(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Placeholders {
        Placeholders {
            dir: "/vms/dev".into(),
            name: "dev".into(),
            home: "/home/ada".into(),
            user: "ada".into(),
            uid: "501".into(),
        }
    }

    #[test]
    fn empty_rule_becomes_loopback_catch_all() {
        let mut rule = ForwardRule::default();
        fill_rule_defaults(&mut rule, &ctx());
        assert_eq!(rule.proto, "tcp");
        assert_eq!(rule.guest_ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(rule.host_ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(rule.guest_port_range, [1, 65535]);
        assert_eq!(rule.host_port_range, [1, 65535]);
    }

    #[test]
    fn single_ports_become_ranges() {
        let mut rule = ForwardRule {
            guest_port: 80,
            host_port: 8080,
            guest_ip_must_be_zero: true,
            ..ForwardRule::default()
        };
        fill_rule_defaults(&mut rule, &ctx());
        assert_eq!(rule.guest_ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(rule.guest_port_range, [80, 80]);
        assert_eq!(rule.host_port_range, [8080, 8080]);
    }

    #[test]
    fn socket_paths_are_expanded() {
        let mut rule = ForwardRule {
            guest_socket: Some("/run/user/{{.UID}}/docker.sock".into()),
            host_socket: Some("{{.Name}}-docker.sock".into()),
            ..ForwardRule::default()
        };
        fill_rule_defaults(&mut rule, &ctx());
        assert_eq!(rule.guest_socket.as_deref(), Some("/run/user/501/docker.sock"));
        assert_eq!(rule.host_socket.as_deref(), Some("/vms/dev/sock/dev-docker.sock"));

        let mut rule = ForwardRule {
            guest_socket: Some("{{.Home}}/agent.sock".into()),
            host_socket: Some("{{.Home}}/.tether/agent.sock".into()),
            ..ForwardRule::default()
        };
        fill_rule_defaults(&mut rule, &ctx());
        assert_eq!(rule.guest_socket.as_deref(), Some("/home/ada.linux/agent.sock"));
        assert_eq!(rule.host_socket.as_deref(), Some("/home/ada/.tether/agent.sock"));
    }

    #[test]
    fn loads_and_defaults_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.json");
        let inst = dir.path().join("dev");
        let doc = serde_json::json!({
            "instanceDir": inst,
            "macAddress": "52:55:55:12:34:56",
            "ssh": {"user": "ada"},
            "portForwards": [{"guestPort": 3000, "hostPort": 13000}],
            "checks": [{"script": "true"}],
            "hostResolver": {"hosts": {"db.local": "10.0.0.5"}}
        });
        fs::write(&path, doc.to_string()).unwrap();

        let config = HostConfig::load(&path).unwrap();
        assert_eq!(config.name, "dev");
        assert_eq!(config.ssh.local_port, 22);
        assert_eq!(config.ssh.control_path, Some(inst.join("ssh.sock")));
        assert_eq!(
            config.guest_link(),
            GuestLinkConfig::UnixSocket(inst.join("tether.sock"))
        );
        assert_eq!(config.checks[0].description, "user check 1/1");
        assert!(config.host_resolver.enabled);
        assert_eq!(config.requirement_retries, 60);
        assert_eq!(config.dhcp_leases, Path::new("/var/db/dhcpd_leases"));
        assert_eq!(config.requirement_delay(), Duration::from_secs(10));

        let rules = config.forward_rules();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].host_port_range, [13000, 13000]);
        assert!(rules[1].ignore);
        assert_eq!(rules[1].guest_port_range, [22, 22]);
        assert_eq!(rules[2].guest_port_range, [1, 65535]);
    }

    #[test]
    fn rejects_bad_configs() {
        let mut config: HostConfig =
            serde_json::from_value(serde_json::json!({"instanceDir": "/vms/x"})).unwrap();
        config.fill_defaults();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.mac_address = "52:55:55:12:34:56".into();
        config.port_forwards.push(ForwardRule {
            guest_port_range: [100, 200],
            host_port_range: [1000, 1001],
            proto: "tcp".into(),
            ..ForwardRule::default()
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("hostPortRange"));

        // Equal widths keep every shifted port inside the host range, so
        // only a range starting at port 0 is left to reject.
        config.port_forwards[0].host_port_range = [0, 100];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("invalid hostPortRange [0, 100]"));
        config.port_forwards[0].host_port_range = [65435, 65535];
        assert!(config.validate().is_ok());
    }
}
