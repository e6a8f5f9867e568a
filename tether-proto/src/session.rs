//! Stream multiplexing over a single vsock connection.
//!
//! A [`Session`] owns one byte stream and runs a reader task and a writer
//! task on it. Either side may [`open`](Session::open) a stream at any
//! time; the peer sees it through [`accept`](Session::accept) when the
//! first data frame arrives. The client side allocates odd stream ids and
//! the server side even ones, so ids never collide.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::codec::{self, FrameHeader, FrameKind};
use crate::error::{Error, Result};
use crate::message::Event;

/// Inbound payloads buffered per stream.
const STREAM_BUFFER: usize = 16;
/// Inbound streams waiting for `accept`.
const ACCEPT_BACKLOG: usize = 64;

/// One frame queued for the writer task.
type Outgoing = (FrameHeader, Vec<u8>);

/// State shared between the session, its tasks, and its streams.
#[derive(Debug)]
struct Shared {
    /// Queue drained by the writer task.
    frames: mpsc::UnboundedSender<Outgoing>,
    /// Inbound payload senders, keyed by stream id.
    streams: Mutex<HashMap<u32, mpsc::Sender<Vec<u8>>>>,
    /// Set once the connection is gone.
    closed: AtomicBool,
}

impl Shared {
    /// Runs `f` with the stream table locked.
    fn with_streams<T>(&self, f: impl FnOnce(&mut HashMap<u32, mpsc::Sender<Vec<u8>>>) -> T) -> T {
        let mut guard = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Adds a stream unless the connection is already gone.
    ///
    /// `closed` is checked under the table lock, so a concurrent
    /// [`shut`](Self::shut) either refuses the stream or clears it.
    fn register(&self, id: u32, tx: mpsc::Sender<Vec<u8>>) -> bool {
        self.with_streams(|s| {
            if self.is_closed() {
                return false;
            }
            s.insert(id, tx);
            true
        })
    }

    /// Marks the connection closed and wakes every pending `recv`.
    fn shut(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.with_streams(HashMap::clear);
    }

    /// Returns `true` once the connection is gone.
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A multiplexed connection between the host and guest agents.
#[derive(Debug)]
pub struct Session {
    /// State shared with streams and tasks.
    shared: Arc<Shared>,
    /// Streams opened by the peer.
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Stream>>,
    /// Next locally allocated stream id.
    next_id: AtomicU32,
    /// Reader and writer tasks.
    tasks: [JoinHandle<()>; 2],
}

impl Session {
    /// Wraps the guest side of a connection (odd stream ids).
    pub fn client<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, 1)
    }

    /// Wraps the host side of a connection (even stream ids).
    pub fn server<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, 2)
    }

    /// Spawns the reader and writer tasks.
    fn new<T>(io: T, first_id: u32) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);

        let shared = Arc::new(Shared {
            frames: frames_tx,
            streams: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let writer_task = tokio::spawn(write_loop(
            BufWriter::new(writer),
            frames_rx,
            Arc::clone(&shared),
        ));
        let reader_task = tokio::spawn(read_loop(
            BufReader::new(reader),
            accept_tx,
            Arc::clone(&shared),
            first_id % 2,
        ));

        Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            next_id: AtomicU32::new(first_id),
            tasks: [reader_task, writer_task],
        }
    }

    /// Opens a new outbound stream.
    pub fn open(&self) -> Result<Stream> {
        let id = self.next_id.fetch_add(2, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        if !self.shared.register(id, tx) {
            return Err(Error::ConnectionClosed);
        }
        trace!(stream = id, "opened stream");
        Ok(Stream::new(id, rx, Arc::clone(&self.shared)))
    }

    /// Waits for the peer to open a stream.
    ///
    /// Returns `None` once the connection has ended; end-of-stream from
    /// the peer is not an error.
    pub async fn accept(&self) -> Option<Stream> {
        self.accept_rx.lock().await.recv().await
    }

    /// Returns `true` once the underlying connection is gone.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.shared.shut();
    }
}

/// Drains queued frames onto the connection.
async fn write_loop<W>(
    mut w: BufWriter<W>,
    mut frames: mpsc::UnboundedReceiver<Outgoing>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some((header, payload)) = frames.recv().await {
        if let Err(e) = codec::write_frame(&mut w, header, &payload).await {
            debug!(error = %e, "session writer stopped");
            break;
        }
    }
    shared.shut();
}

/// Routes inbound frames to their streams and announces new ones.
async fn read_loop<R>(
    mut r: BufReader<R>,
    accept_tx: mpsc::Sender<Stream>,
    shared: Arc<Shared>,
    local_parity: u32,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let (header, payload) = match codec::read_frame(&mut r).await {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("peer closed the connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "session reader stopped");
                break;
            }
        };
        let id = header.stream;
        match header.kind {
            FrameKind::Close => {
                shared.with_streams(|s| s.remove(&id));
            }
            FrameKind::Data => {
                let existing = shared.with_streams(|s| s.get(&id).cloned());
                if let Some(tx) = existing {
                    if tx.send(payload).await.is_err() {
                        trace!(stream = id, "stream dropped before payload arrived");
                    }
                    continue;
                }
                if id % 2 == local_parity {
                    // A late reply to a stream this side already dropped.
                    trace!(stream = id, "discarding frame for closed stream");
                    continue;
                }
                let (tx, rx) = mpsc::channel(STREAM_BUFFER);
                // Capacity is fresh, so this cannot fail with Full.
                let _ = tx.try_send(payload);
                if !shared.register(id, tx) {
                    break;
                }
                let stream = Stream::new(id, rx, Arc::clone(&shared));
                if accept_tx.send(stream).await.is_err() {
                    debug!(stream = id, "no acceptor, dropping inbound stream");
                }
            }
        }
    }
    shared.shut();
}

/// One logical request/response exchange inside a [`Session`].
///
/// Dropping the stream tells the peer it is closed.
#[derive(Debug)]
pub struct Stream {
    /// Stream id.
    id: u32,
    /// Inbound payloads.
    rx: mpsc::Receiver<Vec<u8>>,
    /// Session state.
    shared: Arc<Shared>,
}

impl Stream {
    /// Wraps a registered stream id.
    const fn new(id: u32, rx: mpsc::Receiver<Vec<u8>>, shared: Arc<Shared>) -> Self {
        Self { id, rx, shared }
    }

    /// Returns the stream id.
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Encodes and sends one event.
    pub fn send(&self, event: &Event) -> Result<()> {
        if self.shared.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let payload = serde_json::to_vec(event)?;
        self.shared
            .frames
            .send((FrameHeader::new(self.id, FrameKind::Data), payload))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Receives the next payload without committing to an event type.
    pub async fn recv_value(&mut self) -> Result<Value> {
        match self.rx.recv().await {
            Some(payload) => Ok(serde_json::from_slice(&payload)?),
            None if self.shared.is_closed() => Err(Error::ConnectionClosed),
            None => Err(Error::StreamClosed),
        }
    }

    /// Receives and decodes the next event.
    pub async fn recv(&mut self) -> Result<Event> {
        Event::from_value(self.recv_value().await?)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.shared.with_streams(|s| s.remove(&self.id));
        if !self.shared.is_closed() {
            let _ = self
                .shared
                .frames
                .send((FrameHeader::new(self.id, FrameKind::Close), Vec::new()));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use super::*;
    use crate::message::{DnsEvent, DnsResponse, Endpoint, InfoEvent, PortEvent};

    fn pair() -> (Session, Session) {
        let (guest, host) = tokio::io::duplex(64 * 1024);
        (Session::client(guest), Session::server(host))
    }

    #[test]
    fn shut_table_refuses_new_streams() {
        let (frames, _rx) = mpsc::unbounded_channel();
        let shared = Shared {
            frames,
            streams: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        };
        let (tx, _) = mpsc::channel(1);
        assert!(shared.register(1, tx.clone()));
        shared.shut();
        assert!(!shared.register(3, tx));
        assert_eq!(shared.with_streams(|s| s.len()), 0);
    }

    #[tokio::test]
    async fn guest_event_reaches_host_acceptor() {
        let (guest, host) = pair();
        let ep = Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080);
        let ev = Event::Port(PortEvent::new(vec![ep], Vec::new(), Vec::new()));

        let out = guest.open().unwrap();
        out.send(&ev).unwrap();

        let mut inbound = host.accept().await.unwrap();
        assert_eq!(inbound.id(), out.id());
        let value = inbound.recv_value().await.unwrap();
        assert_eq!(Event::kind_of(&value).unwrap(), "port-event");
        assert_eq!(Event::from_value(value).unwrap(), ev);
    }

    #[tokio::test]
    async fn request_and_reply_share_a_stream() {
        let (guest, host) = pair();

        let host_task = tokio::spawn(async move {
            let mut s = host.accept().await.unwrap();
            let Event::Dns(q) = s.recv().await.unwrap() else {
                panic!("expected dns event");
            };
            s.send(&Event::DnsResponse(DnsResponse::new(q.msg))).unwrap();
            host
        });

        let mut s = guest.open().unwrap();
        s.send(&Event::Dns(DnsEvent::new("", vec![9, 9]))).unwrap();
        let Event::DnsResponse(r) = s.recv().await.unwrap() else {
            panic!("expected dns response");
        };
        assert_eq!(r.msg, vec![9, 9]);
        drop(host_task.await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_streams_stay_independent() {
        let (guest, host) = pair();
        let a = guest.open().unwrap();
        let b = guest.open().unwrap();
        assert_ne!(a.id(), b.id());
        b.send(&Event::Info(InfoEvent::default())).unwrap();
        a.send(&Event::DnsResponse(DnsResponse::new(vec![1]))).unwrap();

        let mut first = host.accept().await.unwrap();
        let mut second = host.accept().await.unwrap();
        assert_eq!(first.id(), b.id());
        assert!(matches!(first.recv().await.unwrap(), Event::Info(_)));
        assert!(matches!(second.recv().await.unwrap(), Event::DnsResponse(_)));
    }

    #[tokio::test]
    async fn peer_close_ends_stream() {
        let (guest, host) = pair();
        let s = guest.open().unwrap();
        s.send(&Event::Info(InfoEvent::default())).unwrap();
        drop(s);

        let mut inbound = host.accept().await.unwrap();
        assert!(inbound.recv().await.is_ok());
        assert!(matches!(inbound.recv().await, Err(Error::StreamClosed)));
    }

    #[tokio::test]
    async fn connection_drop_fails_open_streams() {
        let (guest, host) = pair();
        let mut s = guest.open().unwrap();
        s.send(&Event::Dns(DnsEvent::new("", vec![1]))).unwrap();
        let _inbound = host.accept().await.unwrap();

        drop(host);
        let err = tokio::time::timeout(Duration::from_secs(5), s.recv())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert!(guest.is_closed());
        assert!(matches!(guest.open(), Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn accept_returns_none_on_end_of_stream() {
        let (guest, host) = pair();
        drop(guest);
        let next = tokio::time::timeout(Duration::from_secs(5), host.accept())
            .await
            .unwrap();
        assert!(next.is_none());
    }
}
