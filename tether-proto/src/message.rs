//! Event types exchanged between the host and guest agents.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Vsock port the host agent listens on for the guest's connection.
pub const HOST_PORT: u32 = 2222;

/// `kind` discriminants carried by every event.
pub mod kind {
    /// Guest→host handshake with the initial listener snapshot.
    pub const INFO: &str = "info-event";
    /// Guest→host listener delta.
    pub const PORT: &str = "port-event";
    /// Guest→host DNS query.
    pub const DNS: &str = "dns-event";
    /// Host→guest DNS answer.
    pub const DNS_RESPONSE: &str = "dns-event-response";
}

/// An IP address plus TCP port.
///
/// The canonical string form (`127.0.0.1:80`, `[::1]:80`) is the identity
/// used when comparing snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Endpoint {
    /// Listening address.
    pub ip: IpAddr,
    /// Listening port.
    pub port: u16,
}

impl Endpoint {
    /// Creates an endpoint.
    pub const fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        SocketAddr::new(self.ip, self.port).fmt(f)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

/// Sent once by the guest right after connecting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct InfoEvent {
    /// Every endpoint listening at startup.
    #[serde(default)]
    pub local_ports: Vec<Endpoint>,
    /// Gateway address the guest sees, when known.
    #[serde(
        default,
        rename = "gatewayIP",
        skip_serializing_if = "Option::is_none"
    )]
    pub gateway_ip: Option<IpAddr>,
}

impl InfoEvent {
    /// Creates an info event.
    pub const fn new(local_ports: Vec<Endpoint>, gateway_ip: Option<IpAddr>) -> Self {
        Self {
            local_ports,
            gateway_ip,
        }
    }
}

/// Listener changes observed between two guest polls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct PortEvent {
    /// When the guest computed the delta (RFC 3339 on the wire).
    pub time: DateTime<Utc>,
    /// Endpoints that started listening.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub local_ports_added: Vec<Endpoint>,
    /// Endpoints that stopped listening.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub local_ports_removed: Vec<Endpoint>,
    /// Non-fatal errors hit while polling.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl PortEvent {
    /// Creates a port event stamped with the current time.
    pub fn new(added: Vec<Endpoint>, removed: Vec<Endpoint>, errors: Vec<String>) -> Self {
        Self {
            time: Utc::now(),
            local_ports_added: added,
            local_ports_removed: removed,
            errors,
        }
    }

    /// Returns `true` if the event carries nothing worth sending.
    pub fn is_empty(&self) -> bool {
        self.local_ports_added.is_empty()
            && self.local_ports_removed.is_empty()
            && self.errors.is_empty()
    }
}

/// A packed DNS query relayed from the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct DnsEvent {
    /// Gateway address the guest sees (may be empty).
    #[serde(default, rename = "gatewayIP")]
    pub gateway_ip: String,
    /// Wire-format query.
    pub msg: Vec<u8>,
}

impl DnsEvent {
    /// Creates a DNS query event.
    pub fn new(gateway_ip: impl Into<String>, msg: Vec<u8>) -> Self {
        Self {
            gateway_ip: gateway_ip.into(),
            msg,
        }
    }
}

/// A packed DNS response returned to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct DnsResponse {
    /// Wire-format response.
    pub msg: Vec<u8>,
}

impl DnsResponse {
    /// Creates a DNS response event.
    pub const fn new(msg: Vec<u8>) -> Self {
        Self { msg }
    }
}

/// Every event that can travel over a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind")]
#[non_exhaustive]
pub enum Event {
    /// Startup handshake.
    #[serde(rename = "info-event")]
    Info(InfoEvent),
    /// Listener delta.
    #[serde(rename = "port-event")]
    Port(PortEvent),
    /// DNS query.
    #[serde(rename = "dns-event")]
    Dns(DnsEvent),
    /// DNS answer.
    #[serde(rename = "dns-event-response")]
    DnsResponse(DnsResponse),
}

impl Event {
    /// Returns the wire discriminant of this event.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Info(_) => kind::INFO,
            Self::Port(_) => kind::PORT,
            Self::Dns(_) => kind::DNS,
            Self::DnsResponse(_) => kind::DNS_RESPONSE,
        }
    }

    /// Reads the `kind` discriminant of an undecoded payload.
    pub fn kind_of(value: &Value) -> Result<&str> {
        value
            .get("kind")
            .and_then(Value::as_str)
            .ok_or(Error::MissingKind)
    }

    /// Decodes a generic payload in two steps: discriminant first, then the
    /// concrete variant.
    pub fn from_value(value: Value) -> Result<Self> {
        let kind = Self::kind_of(&value)?.to_owned();
        let ev = match kind.as_str() {
            kind::INFO => Self::Info(serde_json::from_value(value)?),
            kind::PORT => Self::Port(serde_json::from_value(value)?),
            kind::DNS => Self::Dns(serde_json::from_value(value)?),
            kind::DNS_RESPONSE => Self::DnsResponse(serde_json::from_value(value)?),
            _ => return Err(Error::UnknownKind(kind)),
        };
        Ok(ev)
    }
}
