//! Host DNS responder for queries relayed from the guest.
//!
//! A/AAAA/CNAME questions are answered from a static table first, then
//! from the host resolver. TXT, NS, MX and SRV go straight to the host
//! resolver. Anything left unanswered is relayed verbatim to the host's
//! nameservers, UDP first, then TCP.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, CNAME};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use crate::error::Result;

/// TTL of every synthesized answer, in seconds.
const ANSWER_TTL: u32 = 5;
/// Largest response sent back, as for plain UDP DNS.
const MAX_RESPONSE: usize = 512;
/// Per-server relay timeout.
const RELAY_TIMEOUT: Duration = Duration::from_secs(2);
/// Well-known name of the host as seen from the guest.
pub const GATEWAY_NAME: &str = "host.tether.internal.";

/// Lowercased, fully qualified form of `name`.
pub fn fqdn(name: &str) -> String {
    let mut s = name.to_ascii_lowercase();
    if !s.ends_with('.') {
        s.push('.');
    }
    s
}

/// Synthetic name of the instance itself.
pub fn instance_name(name: &str) -> String {
    fqdn(&format!("tether-{name}.internal"))
}

/// Host-side name resolution used by [`DnsResponder`].
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Canonical (fully qualified) name of `name`.
    async fn lookup_cname(&self, name: &str) -> Result<String>;

    /// Addresses of `name`.
    async fn lookup_ip(&self, name: &str) -> Result<Vec<IpAddr>>;

    /// Records of type `rtype` for `name`.
    async fn lookup(&self, name: &str, rtype: RecordType) -> Result<Vec<RData>>;

    /// Sends `query` to the configured nameservers and returns the first
    /// answer, or `None` if every server failed.
    async fn relay(&self, query: &[u8]) -> Option<Vec<u8>>;
}

/// [`Upstream`] backed by the host's resolver configuration.
pub struct SystemResolver {
    /// Resolver for handled record types.
    resolver: TokioAsyncResolver,
    /// Nameservers used for verbatim relay.
    servers: Vec<SocketAddr>,
}

impl std::fmt::Debug for SystemResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemResolver")
            .field("servers", &self.servers)
            .finish_non_exhaustive()
    }
}

impl SystemResolver {
    /// Reads the host's resolver configuration, falling back to public
    /// resolvers when it is unreadable.
    pub fn from_system() -> Self {
        let (config, opts) = hickory_resolver::system_conf::read_system_conf()
            .unwrap_or_else(|e| {
                debug!(error = %e, "no system resolver config, using defaults");
                (ResolverConfig::default(), ResolverOpts::default())
            });
        let mut servers: Vec<SocketAddr> = Vec::new();
        for ns in config.name_servers() {
            if !servers.contains(&ns.socket_addr) {
                servers.push(ns.socket_addr);
            }
        }
        if servers.is_empty() {
            servers = vec![
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53),
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53),
            ];
        }
        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
            servers,
        }
    }
}

#[async_trait]
impl Upstream for SystemResolver {
    async fn lookup_cname(&self, name: &str) -> Result<String> {
        let lookup = self.resolver.lookup_ip(name).await?;
        let lookup = lookup.as_lookup();
        let canonical = lookup
            .records()
            .iter()
            .find(|r| matches!(r.record_type(), RecordType::A | RecordType::AAAA))
            .map_or_else(|| lookup.query().name(), Record::name);
        Ok(fqdn(&canonical.to_string()))
    }

    async fn lookup_ip(&self, name: &str) -> Result<Vec<IpAddr>> {
        Ok(self.resolver.lookup_ip(name).await?.iter().collect())
    }

    async fn lookup(&self, name: &str, rtype: RecordType) -> Result<Vec<RData>> {
        Ok(self.resolver.lookup(name, rtype).await?.iter().cloned().collect())
    }

    async fn relay(&self, query: &[u8]) -> Option<Vec<u8>> {
        for tcp in [false, true] {
            for &server in &self.servers {
                let exchange = async {
                    if tcp {
                        exchange_tcp(server, query).await
                    } else {
                        exchange_udp(server, query).await
                    }
                };
                match tokio::time::timeout(RELAY_TIMEOUT, exchange).await {
                    Ok(Ok(reply)) => return Some(reply),
                    Ok(Err(e)) => debug!(%server, tcp, error = %e, "relay failed"),
                    Err(_) => debug!(%server, tcp, "relay timed out"),
                }
            }
        }
        None
    }
}

/// One query over UDP.
async fn exchange_udp(server: SocketAddr, query: &[u8]) -> std::io::Result<Vec<u8>> {
    let bind: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let sock = UdpSocket::bind(bind).await?;
    sock.connect(server).await?;
    sock.send(query).await?;
    let mut buf = vec![0; 4096];
    loop {
        let n = sock.recv(&mut buf).await?;
        // Drop stray datagrams that are not answers to this query.
        if n >= 2 && query.len() >= 2 && buf[..2] == query[..2] {
            buf.truncate(n);
            return Ok(buf);
        }
    }
}

/// One query over TCP with the two-byte length prefix.
async fn exchange_tcp(server: SocketAddr, query: &[u8]) -> std::io::Result<Vec<u8>> {
    let len = u16::try_from(query.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "query too large"))?;
    let mut conn = TcpStream::connect(server).await?;
    conn.write_all(&len.to_be_bytes()).await?;
    conn.write_all(query).await?;
    let n = conn.read_u16().await?;
    let mut buf = vec![0; usize::from(n)];
    conn.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Static names known to the responder.
#[derive(Debug, Default)]
struct Table {
    /// Name to address.
    ips: HashMap<String, IpAddr>,
    /// Name to canonical name.
    cnames: HashMap<String, String>,
}

impl Table {
    /// Follows static CNAMEs from `name`, stopping at a cycle.
    fn resolve_chain(&self, name: &str) -> String {
        let mut current = fqdn(name);
        let mut seen = HashSet::new();
        while let Some(next) = self.cnames.get(&current) {
            if !seen.insert(current.clone()) {
                break;
            }
            current.clone_from(next);
        }
        current
    }
}

/// Answers DNS queries relayed from the guest.
pub struct DnsResponder {
    /// Host resolver and relay.
    upstream: Box<dyn Upstream>,
    /// Answer AAAA queries natively instead of as A.
    ipv6: bool,
    /// Static overrides.
    table: RwLock<Table>,
}

impl std::fmt::Debug for DnsResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsResponder")
            .field("ipv6", &self.ipv6)
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl DnsResponder {
    /// Creates a responder with an empty static table.
    pub fn new(upstream: Box<dyn Upstream>, ipv6: bool) -> Self {
        Self {
            upstream,
            ipv6,
            table: RwLock::new(Table::default()),
        }
    }

    /// Adds static names. A value that parses as an IP address becomes an
    /// address entry; anything else is a CNAME target.
    pub fn update_hosts(&self, hosts: &BTreeMap<String, String>) {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        for (name, value) in hosts {
            let key = fqdn(name);
            match value.parse::<IpAddr>() {
                Ok(ip) => {
                    table.cnames.remove(&key);
                    table.ips.insert(key, ip);
                }
                Err(_) => {
                    table.ips.remove(&key);
                    table.cnames.insert(key, fqdn(value));
                }
            }
        }
    }

    /// Points the gateway's well-known name at `ip`.
    pub fn set_gateway(&self, ip: IpAddr) {
        self.set_ip(GATEWAY_NAME, ip);
    }

    /// Points the instance's synthetic name at `ip`.
    pub fn set_instance_ip(&self, name: &str, ip: IpAddr) {
        self.set_ip(&instance_name(name), ip);
    }

    /// Sets one address entry.
    fn set_ip(&self, name: &str, ip: IpAddr) {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let key = fqdn(name);
        table.cnames.remove(&key);
        table.ips.insert(key, ip);
    }

    /// Static address of an already resolved name.
    fn static_ip(&self, name: &str) -> Option<IpAddr> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table.ips.get(&fqdn(name)).copied()
    }

    /// Answers one packed query with a packed response.
    pub async fn handle(&self, query: &[u8]) -> Result<Vec<u8>> {
        let req = Message::from_vec(query)?;
        if req.op_code() != OpCode::Query {
            return self.relay(&req, query).await;
        }

        let mut reply = reply_to(&req);
        let mut handled = false;
        for q in req.queries() {
            let qname = q.name().clone();
            let answers = match q.query_type() {
                RecordType::A | RecordType::AAAA | RecordType::CNAME => {
                    self.address_answers(&qname, q.query_type()).await
                }
                rtype @ (RecordType::TXT | RecordType::NS | RecordType::MX | RecordType::SRV) => {
                    self.record_answers(&qname, rtype).await
                }
                _ => Vec::new(),
            };
            if !answers.is_empty() {
                handled = true;
                reply.add_answers(answers);
            }
        }

        if handled {
            return truncate(reply);
        }
        self.relay(&req, query).await
    }

    /// Answers for an A, AAAA or CNAME question.
    async fn address_answers(&self, qname: &Name, qtype: RecordType) -> Vec<Record> {
        let qtype = if qtype == RecordType::AAAA && !self.ipv6 {
            RecordType::A
        } else {
            qtype
        };
        let question = fqdn(&qname.to_string());
        let mut canonical = {
            let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
            table.resolve_chain(&question)
        };
        let mut static_ip = self.static_ip(&canonical);
        if static_ip.is_none() {
            match self.upstream.lookup_cname(&canonical).await {
                Ok(name) => canonical = fqdn(&name),
                Err(e) => {
                    debug!(name = %canonical, error = %e, "cname lookup failed");
                    return Vec::new();
                }
            }
            static_ip = self.static_ip(&canonical);
        }

        let mut answers = Vec::new();
        // Address records are owned by the end of the chain, not the question.
        let mut owner = qname.clone();
        if canonical != question {
            if let Ok(target) = Name::from_ascii(&canonical) {
                answers.push(Record::from_rdata(
                    qname.clone(),
                    ANSWER_TTL,
                    RData::CNAME(CNAME(target.clone())),
                ));
                owner = target;
            }
        }
        if qtype == RecordType::CNAME {
            return answers;
        }

        let addrs = match static_ip {
            Some(ip) => vec![ip],
            None => self.upstream.lookup_ip(&canonical).await.unwrap_or_default(),
        };
        answers.extend(
            addrs
                .into_iter()
                .filter_map(|ip| address_rdata(qtype, ip))
                .map(|rdata| Record::from_rdata(owner.clone(), ANSWER_TTL, rdata)),
        );
        answers
    }

    /// Answers for a TXT, NS, MX or SRV question.
    async fn record_answers(&self, qname: &Name, rtype: RecordType) -> Vec<Record> {
        match self.upstream.lookup(&qname.to_string(), rtype).await {
            Ok(data) => data
                .into_iter()
                .map(|rdata| Record::from_rdata(qname.clone(), ANSWER_TTL, rdata))
                .collect(),
            Err(e) => {
                debug!(name = %qname, ?rtype, error = %e, "lookup failed");
                Vec::new()
            }
        }
    }

    /// Relays `query` upstream, or replies with no answers.
    async fn relay(&self, req: &Message, query: &[u8]) -> Result<Vec<u8>> {
        if let Some(raw) = self.upstream.relay(query).await {
            match Message::from_vec(&raw) {
                Ok(msg) => return truncate(msg),
                Err(e) => debug!(error = %e, "undecodable upstream reply"),
            }
        }
        Ok(reply_to(req).to_vec()?)
    }
}

/// Address record for `ip` if it fits `qtype`.
fn address_rdata(qtype: RecordType, ip: IpAddr) -> Option<RData> {
    match (qtype, ip) {
        (RecordType::A, IpAddr::V4(v4)) => Some(RData::A(A::from(v4))),
        (RecordType::AAAA, IpAddr::V6(v6)) => Some(RData::AAAA(AAAA::from(v6))),
        _ => None,
    }
}

/// Empty response echoing the request's id, opcode, flags and questions.
fn reply_to(req: &Message) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(req.id())
        .set_message_type(MessageType::Response)
        .set_op_code(req.op_code())
        .set_recursion_desired(req.recursion_desired())
        .set_recursion_available(true)
        .set_checking_disabled(req.checking_disabled())
        .set_response_code(ResponseCode::NoError);
    reply.add_queries(req.queries().to_vec());
    reply
}

/// Encodes `msg`, dropping trailing records until it fits in
/// [`MAX_RESPONSE`] bytes.
fn truncate(mut msg: Message) -> Result<Vec<u8>> {
    let bytes = msg.to_vec()?;
    if bytes.len() <= MAX_RESPONSE {
        return Ok(bytes);
    }
    msg.set_truncated(true);
    msg.take_additionals();
    msg.take_name_servers();
    let mut answers = msg.take_answers();
    loop {
        msg.insert_answers(answers.clone());
        let bytes = msg.to_vec()?;
        if bytes.len() <= MAX_RESPONSE || answers.is_empty() {
            return Ok(bytes);
        }
        answers.pop();
        msg.take_answers();
    }
}
