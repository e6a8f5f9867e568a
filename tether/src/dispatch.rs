//! Host side of the guest link: accepts the guest agent's session and
//! routes every incoming stream to its handler.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tether_proto::{DnsEvent, DnsResponse, Event, InfoEvent, PortEvent, Session, Stream};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GuestLinkConfig;
use crate::dns::DnsResponder;
use crate::error::{Error, Result};
use crate::forward::PortForwarder;

/// Delay before waiting for a new guest connection.
pub const RETRY_DELAY: Duration = Duration::from_secs(10);

/// Source of guest agent connections.
#[async_trait]
pub trait GuestLink: Send + Sync {
    /// Waits for the guest agent to connect.
    async fn accept(&self) -> Result<Session>;
}

/// Opens the configured guest link.
#[allow(unreachable_patterns)]
pub fn open_link(config: &GuestLinkConfig) -> Result<Box<dyn GuestLink>> {
    match config {
        #[cfg(unix)]
        GuestLinkConfig::UnixSocket(path) => Ok(Box::new(UnixSocketLink::bind(path)?)),
        #[cfg(target_os = "linux")]
        GuestLinkConfig::VsockPort(port) => Ok(Box::new(VsockLink::bind(*port)?)),
        other => Err(Error::Config(format!(
            "guest link {other:?} is not supported on this host"
        ))),
    }
}

/// Guest link through a Unix socket the hypervisor bridges a vsock port to.
#[cfg(unix)]
#[derive(Debug)]
pub struct UnixSocketLink {
    /// Bound listener.
    listener: tokio::net::UnixListener,
    /// Socket path, removed on drop.
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl UnixSocketLink {
    /// Binds `path`, replacing a stale socket.
    pub fn bind(path: &std::path::Path) -> Result<Self> {
        match std::fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            listener: tokio::net::UnixListener::bind(path)?,
            path: path.to_owned(),
        })
    }
}

#[cfg(unix)]
impl Drop for UnixSocketLink {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
#[async_trait]
impl GuestLink for UnixSocketLink {
    async fn accept(&self) -> Result<Session> {
        let (conn, _) = self.listener.accept().await?;
        Ok(Session::server(conn))
    }
}

/// Guest link over a native vsock listener.
#[cfg(target_os = "linux")]
#[derive(Debug)]
pub struct VsockLink {
    /// Bound listener.
    listener: tokio_vsock::VsockListener,
}

#[cfg(target_os = "linux")]
impl VsockLink {
    /// Listens on `port` for any CID.
    pub fn bind(port: u32) -> Result<Self> {
        let addr = tokio_vsock::VsockAddr::new(libc::VMADDR_CID_ANY, port);
        Ok(Self {
            listener: tokio_vsock::VsockListener::bind(addr)?,
        })
    }
}

#[cfg(target_os = "linux")]
#[async_trait]
impl GuestLink for VsockLink {
    async fn accept(&self) -> Result<Session> {
        let (conn, addr) = self.listener.accept().await?;
        debug!(cid = addr.cid(), "vsock connection");
        Ok(Session::server(conn))
    }
}

/// Reads and decodes the single event a guest stream carries.
async fn read_event(stream: &mut Stream) -> Result<Event> {
    let value = stream.recv_value().await?;
    Ok(Event::from_value(value)?)
}

/// Routes guest events to the port forwarder and DNS responder.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    /// Receives port deltas.
    forwarder: Arc<PortForwarder>,
    /// Answers DNS events; `None` when the host resolver is disabled.
    dns: Option<Arc<DnsResponder>>,
    /// Delay between connection attempts.
    retry: Duration,
    /// Port events wait until this turns `true`; dropped if the sender
    /// goes away first.
    ready: watch::Receiver<bool>,
}

impl Dispatcher {
    /// Creates a dispatcher that forwards ports right away.
    pub fn new(forwarder: Arc<PortForwarder>, dns: Option<Arc<DnsResponder>>) -> Self {
        Self {
            forwarder,
            dns,
            retry: RETRY_DELAY,
            ready: watch::channel(true).1,
        }
    }

    /// Holds port events until `ready` turns `true`.
    #[must_use]
    pub fn with_ready(mut self, ready: watch::Receiver<bool>) -> Self {
        self.ready = ready;
        self
    }

    /// Overrides the delay between connection attempts.
    #[must_use]
    pub fn with_retry(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    /// Serves guest connections until `cancel` fires, waiting the retry
    /// delay after each one ends.
    pub async fn run(&self, link: &dyn GuestLink, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                res = self.serve_next(link) => match res {
                    Ok(()) => info!("guest agent disconnected"),
                    Err(e) => warn!(error = %e, "guest agent connection failed"),
                },
            }
            info!(delay = ?self.retry, "waiting for the guest agent to reconnect");
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(self.retry) => {}
            }
        }
    }

    /// Accepts one connection and serves it.
    async fn serve_next(&self, link: &dyn GuestLink) -> Result<()> {
        let session = link.accept().await?;
        info!("guest agent connected");
        self.serve(&session).await;
        Ok(())
    }

    /// Dispatches every stream the guest opens until the session ends.
    ///
    /// Port events are applied one at a time in the order their streams
    /// arrived; every other event gets its own task.
    pub async fn serve(&self, session: &Session) {
        let (ports_tx, ports_rx) = mpsc::unbounded_channel();
        let ports = tokio::spawn(self.clone().apply_ports(ports_rx));
        while let Some(mut stream) = session.accept().await {
            // The stream was created by its first data frame, so the event
            // is already buffered and this does not wait on the guest.
            let event = match read_event(&mut stream).await {
                Ok(event) => event,
                Err(e) => {
                    warn!(stream = stream.id(), error = %e, "dropping guest stream");
                    continue;
                }
            };
            debug!(stream = stream.id(), kind = event.kind(), "guest event");
            match event {
                Event::Port(ev) => {
                    let _ = ports_tx.send(ev);
                }
                Event::Info(ev) => self.on_info(&ev),
                Event::Dns(ev) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        let id = stream.id();
                        if let Err(e) = this.on_dns(stream, ev).await {
                            warn!(stream = id, error = %e, "failed to answer dns event");
                        }
                    });
                }
                other => warn!(kind = other.kind(), "unexpected event from guest"),
            }
        }
        drop(ports_tx);
        let _ = ports.await;
    }

    /// Applies port events in order once forwarding is ready.
    async fn apply_ports(self, mut events: mpsc::UnboundedReceiver<PortEvent>) {
        let mut ready = self.ready.clone();
        while let Some(ev) = events.recv().await {
            if ready.wait_for(|r| *r).await.is_err() {
                debug!("forwarding never became ready, dropping port event");
                continue;
            }
            self.forwarder.on_event(&ev).await;
        }
    }

    /// Answers one DNS query on the stream it came from.
    async fn on_dns(&self, stream: Stream, ev: DnsEvent) -> Result<()> {
        let Some(dns) = &self.dns else {
            debug!("host resolver disabled, ignoring dns event");
            return Ok(());
        };
        if let Ok(ip) = ev.gateway_ip.parse::<IpAddr>() {
            dns.set_gateway(ip);
        }
        let msg = dns.handle(&ev.msg).await?;
        stream.send(&Event::DnsResponse(DnsResponse::new(msg)))?;
        Ok(())
    }

    /// Records what the guest reported at startup.
    fn on_info(&self, ev: &InfoEvent) {
        info!(
            ports = ev.local_ports.len(),
            gateway = ?ev.gateway_ip,
            "guest agent info"
        );
        if let (Some(dns), Some(ip)) = (&self.dns, ev.gateway_ip) {
            dns.set_gateway(ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use hickory_proto::op::{Message, MessageType, OpCode, Query};
    use hickory_proto::rr::{Name, RData, RecordType};
    use tether_proto::{DnsEvent, Endpoint, PortEvent};

    use super::*;
    use crate::config::{ForwardRule, Placeholders};
    use crate::dns::{GATEWAY_NAME, Upstream};
    use crate::error::Error;
    use crate::forward::tests::MockSsh;
    use crate::ssh::SshControl;

    /// Upstream that never answers.
    struct Offline;

    #[async_trait]
    impl Upstream for Offline {
        async fn lookup_cname(&self, name: &str) -> Result<String> {
            Err(Error::Config(format!("offline: {name}")))
        }

        async fn lookup_ip(&self, name: &str) -> Result<Vec<IpAddr>> {
            Err(Error::Config(format!("offline: {name}")))
        }

        async fn lookup(&self, name: &str, _: RecordType) -> Result<Vec<RData>> {
            Err(Error::Config(format!("offline: {name}")))
        }

        async fn relay(&self, _: &[u8]) -> Option<Vec<u8>> {
            None
        }
    }

    fn dispatcher(ssh: &Arc<MockSsh>) -> (Dispatcher, Arc<DnsResponder>) {
        let ctx = Placeholders::default();
        let rules = vec![
            ForwardRule::block_ssh(&ctx),
            ForwardRule::loopback_catch_all(&ctx),
        ];
        let forwarder = Arc::new(PortForwarder::new(
            rules,
            Arc::clone(ssh) as Arc<dyn SshControl>,
        ));
        let dns = Arc::new(DnsResponder::new(Box::new(Offline), false));
        (Dispatcher::new(forwarder, Some(Arc::clone(&dns))), dns)
    }

    /// Connects a guest session to a dispatcher serving in the background.
    fn connect(d: &Dispatcher) -> Session {
        let (guest, host) = tokio::io::duplex(64 * 1024);
        let d = d.clone();
        tokio::spawn(async move { d.serve(&Session::server(host)).await });
        Session::client(guest)
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn lo(port: u16) -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[tokio::test]
    async fn port_events_drive_the_forwarder() {
        let ssh = Arc::new(MockSsh::default());
        let (d, _) = dispatcher(&ssh);
        let guest = connect(&d);

        let s = guest.open().unwrap();
        s.send(&Event::Port(PortEvent::new(vec![lo(8080)], Vec::new(), Vec::new())))
            .unwrap();
        wait_for(|| ssh.calls().len() == 1).await;
        assert_eq!(ssh.calls(), ["forward 127.0.0.1:8080 127.0.0.1:8080"]);

        let s = guest.open().unwrap();
        s.send(&Event::Port(PortEvent::new(Vec::new(), vec![lo(8080)], Vec::new())))
            .unwrap();
        wait_for(|| ssh.calls().len() == 2).await;
        assert_eq!(ssh.calls()[1], "cancel 127.0.0.1:8080 127.0.0.1:8080");
    }

    #[tokio::test]
    async fn dns_event_is_answered_on_the_same_stream() {
        let ssh = Arc::new(MockSsh::default());
        let (d, dns) = dispatcher(&ssh);
        dns.update_hosts(&BTreeMap::from([("host.internal.".into(), "1.2.3.4".into())]));
        let guest = connect(&d);

        let mut q = Message::new();
        q.set_id(42)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query);
        q.add_query(Query::query(Name::from_str("host.internal.").unwrap(), RecordType::A));

        let mut s = guest.open().unwrap();
        s.send(&Event::Dns(DnsEvent::new("", q.to_vec().unwrap())))
            .unwrap();
        let Event::DnsResponse(resp) = s.recv().await.unwrap() else {
            panic!("expected a dns response");
        };
        let msg = Message::from_vec(&resp.msg).unwrap();
        assert_eq!(msg.id(), 42);
        assert_eq!(msg.answers().len(), 1);
        assert_eq!(msg.answers()[0].data().unwrap().to_string(), "1.2.3.4");
    }

    #[tokio::test]
    async fn info_event_sets_gateway_name() {
        let ssh = Arc::new(MockSsh::default());
        let (d, dns) = dispatcher(&ssh);
        let guest = connect(&d);

        let gw = IpAddr::V4(Ipv4Addr::new(192, 168, 5, 2));
        let s = guest.open().unwrap();
        s.send(&Event::Info(InfoEvent::new(Vec::new(), Some(gw))))
            .unwrap();

        let mut q = Message::new();
        q.set_id(1)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query);
        q.add_query(Query::query(Name::from_str(GATEWAY_NAME).unwrap(), RecordType::A));
        let query = q.to_vec().unwrap();
        for _ in 0..200 {
            let resp = Message::from_vec(&dns.handle(&query).await.unwrap()).unwrap();
            if !resp.answers().is_empty() {
                assert_eq!(resp.answers()[0].data().unwrap().to_string(), "192.168.5.2");
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("gateway name never resolved");
    }

    #[tokio::test]
    async fn bad_stream_does_not_stop_the_session() {
        let ssh = Arc::new(MockSsh::default());
        let (d, _) = dispatcher(&ssh);
        let guest = connect(&d);

        // A response event is not something the guest may send.
        let s = guest.open().unwrap();
        s.send(&Event::DnsResponse(DnsResponse::new(Vec::new())))
            .unwrap();
        drop(s);

        let s = guest.open().unwrap();
        s.send(&Event::Port(PortEvent::new(vec![lo(3000)], Vec::new(), Vec::new())))
            .unwrap();
        wait_for(|| ssh.calls().len() == 1).await;
    }

    #[tokio::test]
    async fn port_events_apply_in_arrival_order() {
        let ssh = Arc::new(MockSsh::default());
        let (d, _) = dispatcher(&ssh);
        let guest = connect(&d);

        for i in 0..20 {
            let ev = if i % 2 == 0 {
                PortEvent::new(vec![lo(8080)], Vec::new(), Vec::new())
            } else {
                PortEvent::new(Vec::new(), vec![lo(8080)], Vec::new())
            };
            guest.open().unwrap().send(&Event::Port(ev)).unwrap();
        }
        wait_for(|| ssh.calls().len() == 20).await;
        for (i, call) in ssh.calls().iter().enumerate() {
            let verb = if i % 2 == 0 { "forward" } else { "cancel" };
            assert_eq!(*call, format!("{verb} 127.0.0.1:8080 127.0.0.1:8080"));
        }
    }

    #[tokio::test]
    async fn port_events_wait_for_readiness() {
        let ssh = Arc::new(MockSsh::default());
        let (tx, rx) = watch::channel(false);
        let (d, _) = dispatcher(&ssh);
        let d = d.with_ready(rx);
        let guest = connect(&d);

        let s = guest.open().unwrap();
        s.send(&Event::Port(PortEvent::new(vec![lo(8080)], Vec::new(), Vec::new())))
            .unwrap();
        let s = guest.open().unwrap();
        s.send(&Event::Port(PortEvent::new(Vec::new(), vec![lo(8080)], Vec::new())))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ssh.calls().is_empty());

        tx.send_replace(true);
        wait_for(|| ssh.calls().len() == 2).await;
        assert_eq!(
            ssh.calls(),
            [
                "forward 127.0.0.1:8080 127.0.0.1:8080",
                "cancel 127.0.0.1:8080 127.0.0.1:8080"
            ]
        );
    }

    /// Link that always fails and cancels after a few attempts.
    struct Flaky {
        attempts: AtomicUsize,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl GuestLink for Flaky {
        async fn accept(&self) -> Result<Session> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 2 {
                self.cancel.cancel();
            }
            Err(Error::Io(std::io::ErrorKind::ConnectionRefused.into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connections_are_retried_until_cancelled() {
        let ssh = Arc::new(MockSsh::default());
        let (d, _) = dispatcher(&ssh);
        let cancel = CancellationToken::new();
        let link = Flaky {
            attempts: AtomicUsize::new(0),
            cancel: cancel.clone(),
        };
        let start = tokio::time::Instant::now();
        d.run(&link, cancel).await;
        assert_eq!(link.attempts.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= RETRY_DELAY * 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_socket_link_accepts_a_guest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guest.sock");
        let link = UnixSocketLink::bind(&path).unwrap();

        let client = tokio::net::UnixStream::connect(&path).await.unwrap();
        let guest = Session::client(client);
        let host = link.accept().await.unwrap();

        guest
            .open()
            .unwrap()
            .send(&Event::Info(InfoEvent::default()))
            .unwrap();
        let mut s = host.accept().await.unwrap();
        assert!(matches!(s.recv().await.unwrap(), Event::Info(_)));

        drop(link);
        assert!(!path.exists());
    }
}
