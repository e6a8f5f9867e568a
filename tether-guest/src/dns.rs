//! DNS relay: answers the guest's queries by asking the host agent.
//!
//! Every query travels on its own stream as a `dns-event` and waits for
//! exactly one `dns-event-response`. Failed round trips are dropped so the
//! requester times out on its own.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use tether_proto::{DnsEvent, Event, Session};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info, trace, warn};

/// Largest UDP datagram accepted from a requester.
const UDP_BUFFER: usize = 4096;

/// Forwards packed queries to the host over the session.
#[derive(Debug)]
pub struct Relay {
    /// Connection to the host agent.
    session: Arc<Session>,
    /// Gateway address reported with each query (may be empty).
    gateway: String,
    /// Bound on one round trip.
    timeout: Duration,
}

impl Relay {
    /// Creates a relay.
    pub fn new(session: Arc<Session>, gateway: impl Into<String>, timeout: Duration) -> Self {
        Self {
            session,
            gateway: gateway.into(),
            timeout,
        }
    }

    /// Sends one packed query to the host and returns the packed response.
    pub async fn exchange(&self, query: &[u8]) -> io::Result<Vec<u8>> {
        let request = Message::from_vec(query).map_err(invalid)?;
        let mut stream = self.session.open()?;
        stream.send(&Event::Dns(DnsEvent::new(self.gateway.clone(), query.to_vec())))?;

        let reply = tokio::time::timeout(self.timeout, stream.recv())
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no DNS response from host within {:?}", self.timeout),
                )
            })??;
        let Event::DnsResponse(reply) = reply else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected dns-event-response, got {}", reply.kind()),
            ));
        };
        let response = Message::from_vec(&reply.msg).map_err(invalid)?;
        if response.id() != request.id() {
            warn!(
                query = request.id(),
                response = response.id(),
                "DNS response id does not match query"
            );
        }
        response.to_vec().map_err(invalid)
    }
}

/// Maps a DNS wire error to `InvalidData`.
fn invalid(e: hickory_proto::error::ProtoError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Answers UDP queries arriving on `socket`. Never returns on success.
pub async fn serve_udp(relay: Arc<Relay>, socket: UdpSocket) -> io::Result<()> {
    info!(addr = %socket.local_addr()?, "DNS relay listening on UDP");
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; UDP_BUFFER];
    loop {
        let (n, peer) = socket.recv_from(&mut buf).await?;
        let query = buf[..n].to_vec();
        let relay = Arc::clone(&relay);
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            match relay.exchange(&query).await {
                Ok(response) => {
                    if let Err(e) = socket.send_to(&response, peer).await {
                        debug!(%peer, error = %e, "failed to write DNS response");
                    }
                }
                Err(e) => debug!(%peer, error = %e, "DNS round trip failed"),
            }
        });
    }
}

/// Answers length-prefixed TCP queries on `listener`. Never returns on
/// success.
pub async fn serve_tcp(relay: Arc<Relay>, listener: TcpListener) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "DNS relay listening on TCP");
    loop {
        let (conn, peer) = listener.accept().await?;
        let relay = Arc::clone(&relay);
        tokio::spawn(async move {
            if let Err(e) = tcp_conn(&relay, conn, peer).await {
                debug!(%peer, error = %e, "DNS TCP connection ended");
            }
        });
    }
}

/// Serves queries on one TCP connection until the requester hangs up.
async fn tcp_conn(relay: &Relay, mut conn: TcpStream, peer: SocketAddr) -> io::Result<()> {
    loop {
        let len = match conn.read_u16().await {
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut query = vec![0u8; usize::from(len)];
        conn.read_exact(&mut query).await?;
        trace!(%peer, bytes = len, "DNS query over TCP");
        let response = relay.exchange(&query).await?;
        let len = u16::try_from(response.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "DNS response too large"))?;
        conn.write_u16(len).await?;
        conn.write_all(&response).await?;
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use hickory_proto::op::{MessageType, OpCode, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use tether_proto::DnsResponse;

    use super::*;

    const ANSWER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    fn query(id: u16) -> Vec<u8> {
        let mut q = Message::new();
        q.set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(
                Name::from_ascii("example.com.").unwrap(),
                RecordType::A,
            ));
        q.to_vec().unwrap()
    }

    /// Answers every query with `ANSWER`, or never answers when `silent`.
    fn fake_host(host: Session, silent: bool) {
        tokio::spawn(async move {
            let mut unanswered = Vec::new();
            while let Some(mut s) = host.accept().await {
                let Ok(Event::Dns(ev)) = s.recv().await else {
                    continue;
                };
                if silent {
                    unanswered.push(s);
                    continue;
                }
                let req = Message::from_vec(&ev.msg).unwrap();
                let mut resp = Message::new();
                resp.set_id(req.id())
                    .set_message_type(MessageType::Response)
                    .set_op_code(OpCode::Query)
                    .add_queries(req.queries().to_vec())
                    .add_answer(Record::from_rdata(
                        req.queries()[0].name().clone(),
                        5,
                        RData::A(A::from(ANSWER)),
                    ));
                s.send(&Event::DnsResponse(DnsResponse::new(resp.to_vec().unwrap())))
                    .unwrap();
            }
        });
    }

    fn relay(silent: bool, timeout: Duration) -> Arc<Relay> {
        let (guest, host) = tokio::io::duplex(64 * 1024);
        fake_host(Session::server(host), silent);
        Arc::new(Relay::new(
            Arc::new(Session::client(guest)),
            "192.168.5.2",
            timeout,
        ))
    }

    fn first_answer(bytes: &[u8]) -> Option<RData> {
        let msg = Message::from_vec(bytes).unwrap();
        msg.answers().first().and_then(|r| r.data().cloned())
    }

    #[tokio::test]
    async fn round_trip_returns_host_answer() {
        let r = relay(false, Duration::from_secs(5));
        let resp = r.exchange(&query(0x1234)).await.unwrap();
        assert_eq!(Message::from_vec(&resp).unwrap().id(), 0x1234);
        assert_eq!(first_answer(&resp), Some(RData::A(A::from(ANSWER))));
    }

    #[tokio::test]
    async fn silent_host_times_out() {
        let r = relay(true, Duration::from_millis(100));
        let err = r.exchange(&query(1)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn malformed_query_is_rejected() {
        let r = relay(false, Duration::from_secs(5));
        let err = r.exchange(&[0xde, 0xad]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn udp_requester_gets_answer() {
        let r = relay(false, Duration::from_secs(5));
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(serve_udp(r, server));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&query(77), addr).await.unwrap();
        let mut buf = vec![0u8; UDP_BUFFER];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first_answer(&buf[..n]), Some(RData::A(A::from(ANSWER))));
    }

    #[tokio::test]
    async fn tcp_requester_gets_answer() {
        let r = relay(false, Duration::from_secs(5));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_tcp(r, listener));

        let mut conn = TcpStream::connect(addr).await.unwrap();
        let q = query(78);
        conn.write_u16(u16::try_from(q.len()).unwrap()).await.unwrap();
        conn.write_all(&q).await.unwrap();
        let len = conn.read_u16().await.unwrap();
        let mut resp = vec![0u8; usize::from(len)];
        conn.read_exact(&mut resp).await.unwrap();
        assert_eq!(Message::from_vec(&resp).unwrap().id(), 78);
    }
}
