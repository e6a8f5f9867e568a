//! Status events reported to whatever supervises the host agent.
//!
//! One JSON object per line, so a parent process can follow boot progress
//! by reading the agent's stdout.

use std::io::Write;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Host agent state at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct Status {
    /// Boot finished and forwarding is live.
    #[serde(default)]
    pub running: bool,
    /// Running, but some readiness requirements failed.
    #[serde(default)]
    pub degraded: bool,
    /// Shutting down.
    #[serde(default)]
    pub exiting: bool,
    /// Accumulated readiness failures.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Guest SSH port.
    #[serde(default)]
    pub ssh_local_port: u16,
}

impl Status {
    /// Status while requirements are still being checked.
    pub fn booting(ssh_local_port: u16) -> Self {
        Self {
            ssh_local_port,
            ..Self::default()
        }
    }

    /// Status once boot has finished; degraded if `errors` is non-empty.
    pub fn running(ssh_local_port: u16, errors: Vec<String>) -> Self {
        Self {
            running: true,
            degraded: !errors.is_empty(),
            errors,
            ssh_local_port,
            ..Self::default()
        }
    }

    /// Status during shutdown.
    pub fn exiting(ssh_local_port: u16) -> Self {
        Self {
            exiting: true,
            ssh_local_port,
            ..Self::default()
        }
    }
}

/// A timestamped [`Status`], as written to the event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct StatusEvent {
    /// When the status was emitted.
    pub time: DateTime<Utc>,
    /// The status itself.
    pub status: Status,
}

/// Writes status events as JSON lines.
pub struct StatusEmitter {
    /// Event sink, usually stdout.
    out: Mutex<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for StatusEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusEmitter").finish_non_exhaustive()
    }
}

impl StatusEmitter {
    /// Creates an emitter writing to `out`.
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
        }
    }

    /// Writes one event stamped with the current time.
    pub fn emit(&self, status: Status) -> Result<()> {
        let event = StatusEvent {
            time: Utc::now(),
            status,
        };
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        out.write_all(&line)?;
        out.flush()?;
        Ok(())
    }
}
