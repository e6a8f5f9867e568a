//! SSH master connection control.
//!
//! Every guest-side operation goes through one OpenSSH ControlMaster
//! connection: readiness scripts, port and socket forwards, and the final
//! teardown. [`SshMaster`] drives it with `ssh -O <verb>`; tests substitute
//! their own [`SshControl`].

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::error::{Error, Result};

/// Interpreter used when a script has no shebang line.
const DEFAULT_INTERPRETER: &str = "/bin/bash";

/// Operations the host agent needs from the SSH control connection.
#[async_trait]
pub trait SshControl: Send + Sync {
    /// Records the guest address once it is known.
    fn set_host(&self, host: &str);

    /// Runs `script` in the guest and returns its stdout.
    async fn execute_remote_script(&self, script: &str, description: &str) -> Result<String>;

    /// Runs `script` with `bash` on the host and returns its stdout.
    async fn execute_local_script(&self, script: &str) -> Result<String>;

    /// Opens a local forward from `local` (host) to `remote` (guest).
    async fn forward(&self, local: &str, remote: &str) -> Result<()>;

    /// Cancels a local forward opened by [`forward`](Self::forward).
    async fn cancel(&self, local: &str, remote: &str) -> Result<()>;

    /// Shuts the master connection down.
    async fn exit_master(&self) -> Result<()>;
}

/// Forward verb passed to `ssh -O`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    /// `-O forward`.
    Forward,
    /// `-O cancel`.
    Cancel,
}

impl Verb {
    /// The `-O` argument.
    const fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Cancel => "cancel",
        }
    }
}

/// [`SshControl`] backed by the OpenSSH client binary.
#[derive(Debug)]
pub struct SshMaster {
    /// Client binary (`ssh`).
    binary: PathBuf,
    /// Common `-F`/`-o` arguments.
    args: Vec<String>,
    /// Guest SSH port.
    port: u16,
    /// Login user.
    user: String,
    /// Guest address, known once its DHCP lease appears.
    host: RwLock<Option<String>>,
}

impl SshMaster {
    /// Builds the control connection settings from the configuration.
    pub fn from_config(config: &HostConfig) -> Self {
        let user = config.ssh.user.clone().unwrap_or_default();
        let control = config
            .ssh
            .control_path
            .clone()
            .unwrap_or_else(|| config.instance_dir.join("ssh.sock"));
        let mut opts = Vec::new();
        if let Some(key) = &config.ssh.identity_file {
            opts.push(format!("IdentityFile=\"{}\"", key.display()));
        }
        opts.extend(
            [
                "StrictHostKeyChecking=no",
                "UserKnownHostsFile=/dev/null",
                "NoHostAuthenticationForLocalhost=yes",
                "GSSAPIAuthentication=no",
                "PreferredAuthentications=publickey",
                "Compression=no",
                "BatchMode=yes",
                "IdentitiesOnly=yes",
            ]
            .map(String::from),
        );
        opts.push(format!("User={user}"));
        opts.push("ControlMaster=auto".into());
        opts.push(format!("ControlPath=\"{}\"", control.display()));
        opts.push("ControlPersist=5m".into());
        if config.ssh.forward_agent {
            opts.push("ForwardAgent=yes".into());
        }

        let mut args = vec!["-F".to_owned(), "/dev/null".to_owned()];
        for o in opts {
            args.push("-o".into());
            args.push(o);
        }
        Self {
            binary: PathBuf::from("ssh"),
            args,
            port: config.ssh.local_port,
            user,
            host: RwLock::new(None),
        }
    }

    /// Overrides the client binary.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Returns `user@host`.
    fn remote(&self) -> Result<String> {
        self.host
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|h| format!("{}@{h}", self.user))
            .ok_or_else(|| Error::Config("guest address is not known yet".into()))
    }

    /// Arguments for `ssh -O forward|cancel`.
    fn forward_args(&self, verb: Verb, local: &str, remote: &str, target: &str) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend(
            [
                "-T",
                "-O",
                verb.as_str(),
                "-L",
                &format!("{local}:{remote}"),
                "-N",
                "-f",
                target,
                "--",
            ]
            .map(String::from),
        );
        args
    }

    /// Runs `ssh -O forward|cancel`, managing host Unix sockets around it.
    async fn forward_ssh(&self, verb: Verb, local: &str, remote: &str) -> Result<()> {
        let target = self.remote()?;
        let socket = local.starts_with('/').then(|| Path::new(local));
        if let Some(path) = socket {
            match verb {
                Verb::Forward => {
                    info!(guest = remote, host = local, "forwarding socket");
                    remove_path(path, "before setting up forwarding").await;
                    if let Some(dir) = path.parent() {
                        create_dir(dir).await?;
                    }
                }
                Verb::Cancel => info!(guest = remote, host = local, "stopping socket forward"),
            }
        }

        let args = self.forward_args(verb, local, remote, &target);
        let result = run(Command::new(&self.binary).args(&args), None).await;

        if let Some(path) = socket {
            match (verb, &result) {
                (Verb::Forward, Err(e)) => {
                    warn!(guest = remote, host = local, error = %e, "failed to set up socket forward");
                    remove_path(path, "after forwarding failed").await;
                }
                (Verb::Cancel, _) => remove_path(path, "after stopping forwarding").await,
                (Verb::Forward, Ok(_)) => {}
            }
        }
        result.map(drop)
    }
}

#[async_trait]
impl SshControl for SshMaster {
    fn set_host(&self, host: &str) {
        *self.host.write().unwrap_or_else(PoisonError::into_inner) = Some(host.to_owned());
    }

    async fn execute_remote_script(&self, script: &str, description: &str) -> Result<String> {
        let target = self.remote()?;
        let interpreter = interpreter(script);
        debug!(description, interpreter, "executing remote script");
        let port = self.port.to_string();
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args)
            .args(["-p", port.as_str(), target.as_str(), "--", interpreter]);
        run(&mut cmd, Some(script)).await
    }

    async fn execute_local_script(&self, script: &str) -> Result<String> {
        run(&mut Command::new("bash"), Some(script)).await
    }

    async fn forward(&self, local: &str, remote: &str) -> Result<()> {
        self.forward_ssh(Verb::Forward, local, remote).await
    }

    async fn cancel(&self, local: &str, remote: &str) -> Result<()> {
        self.forward_ssh(Verb::Cancel, local, remote).await
    }

    async fn exit_master(&self) -> Result<()> {
        let target = self.remote()?;
        let port = self.port.to_string();
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args)
            .args(["-O", "exit", "-p", port.as_str(), target.as_str()]);
        run(&mut cmd, None).await.map(drop)
    }
}

/// Returns the interpreter named by a script's shebang line.
fn interpreter(script: &str) -> &str {
    script
        .lines()
        .next()
        .and_then(|l| l.strip_prefix("#!"))
        .map(str::trim)
        .filter(|i| !i.is_empty())
        .unwrap_or(DEFAULT_INTERPRETER)
}

/// Runs a command, feeding `stdin`, and returns stdout on success.
async fn run(cmd: &mut Command, stdin: Option<&str>) -> Result<String> {
    let line = describe(cmd);
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| Error::Command {
        cmd: line.clone(),
        detail: e.to_string(),
    })?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes()).await?;
    }
    let out = child.wait_with_output().await?;
    let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&out.stderr);
    debug!(cmd = %line, status = %out.status, stdout = %stdout.trim(), stderr = %stderr.trim(), "command finished");
    if !out.status.success() {
        return Err(Error::Command {
            cmd: line,
            detail: format!("{}: stdout={stdout:?}, stderr={stderr:?}", out.status),
        });
    }
    Ok(stdout)
}

/// Renders a command line for messages.
fn describe(cmd: &Command) -> String {
    let inner = cmd.as_std();
    std::iter::once(inner.get_program())
        .chain(inner.get_args())
        .map(OsStr::to_string_lossy)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Removes a socket path, logging failures.
async fn remove_path(path: &Path, when: &str) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to clean up socket {when}"),
    }
}

/// Creates the directory that will hold a forwarded socket.
async fn create_dir(dir: &Path) -> Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o750);
    builder.create(dir).await.map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("can't create directory for local socket {}: {e}", dir.display()),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master(binary: &str) -> SshMaster {
        let config: HostConfig = serde_json::from_value(serde_json::json!({
            "instanceDir": "/vms/dev",
            "macAddress": "52:55:55:00:00:01",
            "ssh": {"localPort": 22, "user": "ada", "forwardAgent": true}
        }))
        .unwrap();
        let m = SshMaster::from_config(&config).with_binary(binary);
        m.set_host("192.168.64.3");
        m
    }

    #[test]
    fn forward_args_follow_control_master_layout() {
        let m = master("ssh");
        let args = m.forward_args(Verb::Forward, "127.0.0.1:8080", "127.0.0.1:8080", "ada@192.168.64.3");
        assert_eq!(&args[..2], ["-F", "/dev/null"]);
        assert!(args.contains(&"ControlMaster=auto".to_owned()));
        assert!(args.contains(&"ControlPath=\"/vms/dev/ssh.sock\"".to_owned()));
        assert!(args.contains(&"ForwardAgent=yes".to_owned()));
        let tail: Vec<&str> = args.iter().rev().take(9).rev().map(String::as_str).collect();
        assert_eq!(
            tail,
            [
                "-T",
                "-O",
                "forward",
                "-L",
                "127.0.0.1:8080:127.0.0.1:8080",
                "-N",
                "-f",
                "ada@192.168.64.3",
                "--"
            ]
        );
    }

    #[test]
    fn shebang_selects_interpreter() {
        assert_eq!(interpreter("#!/bin/sh\ntrue\n"), "/bin/sh");
        assert_eq!(interpreter("true\n"), DEFAULT_INTERPRETER);
        assert_eq!(interpreter(""), DEFAULT_INTERPRETER);
    }

    #[tokio::test]
    async fn remote_ops_need_guest_address() {
        let config: HostConfig =
            serde_json::from_value(serde_json::json!({"instanceDir": "/vms/dev"})).unwrap();
        let m = SshMaster::from_config(&config);
        assert!(matches!(m.forward("a", "b").await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn local_script_reports_output_and_failure() {
        let m = master("ssh");
        assert_eq!(m.execute_local_script("echo ready\n").await.unwrap(), "ready\n");
        let err = m.execute_local_script("echo nope >&2; exit 3\n").await.unwrap_err();
        assert!(matches!(err, Error::Command { ref detail, .. } if detail.contains("nope")));
    }

    #[tokio::test]
    async fn failed_socket_forward_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("sock").join("docker.sock");
        let local = sock.to_str().unwrap();

        let m = master("false");
        assert!(m.forward(local, "/run/docker.sock").await.is_err());
        assert!(sock.parent().unwrap().is_dir());
        assert!(!sock.exists());
    }

    #[tokio::test]
    async fn cancel_removes_host_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("docker.sock");
        std::fs::write(&sock, b"").unwrap();

        let m = master("true");
        m.cancel(sock.to_str().unwrap(), "/run/docker.sock").await.unwrap();
        assert!(!sock.exists());
    }
}
