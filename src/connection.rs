//! One established client session.
//!
//! A [`Connection`] owns the dedicated endpoint a client reconnected to
//! after the handshake. Its data plane is async: a read-loop task turns
//! inbound chunks into framed messages, a writer task drains the bounded
//! outbound queue fed by [`Connection::enqueue`]. Both run on the runtime
//! handle the broker's worker captured, so nothing here ever executes on the
//! accept-loop thread.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{BrokerError, Result};
use crate::protocol::{write_message_async, MessageBuffer};
use crate::transport::PipeStream;

/// Read chunk size for the inbound loop.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Internal per-connection events, rebound to public broker events by the
/// broker's dispatch task.
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    /// A complete inbound message arrived.
    Message { id: u64, payload: Bytes },
    /// The peer closed its end of the pipe.
    Disconnected { id: u64 },
    /// The read loop hit an I/O or protocol error.
    Faulted { id: u64, error: Arc<BrokerError> },
}

/// A post-handshake client session.
///
/// Identified by an integer id unique for the broker's lifetime, plus an
/// optional display name (not unique) that the name-targeted push variants
/// match by exact equality.
pub struct Connection {
    id: u64,
    endpoint_name: String,
    name: Mutex<Option<String>>,
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
    pub(crate) fn new(id: u64, endpoint_name: String) -> Self {
        Self {
            id,
            endpoint_name,
            name: Mutex::new(None),
            outbound: Mutex::new(None),
            reader: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Integer id assigned at registration. Never reused by the broker.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name of the dedicated endpoint this connection came in on.
    pub fn endpoint_name(&self) -> &str {
        &self.endpoint_name
    }

    /// The logical display name, if one was assigned.
    pub fn name(&self) -> Option<String> {
        lock(&self.name).clone()
    }

    /// Assign a logical display name. Names are not required to be unique.
    pub fn set_name(&self, name: impl Into<String>) {
        *lock(&self.name) = Some(name.into());
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Start the data plane over an established stream.
    pub(crate) fn open(
        self: &Arc<Self>,
        stream: PipeStream,
        events: mpsc::Sender<ConnectionEvent>,
        handle: &Handle,
        queue_capacity: usize,
    ) -> Result<()> {
        let _guard = handle.enter();
        let stream = stream.into_async()?;
        let (read_half, write_half) = stream.into_split();

        let (tx, rx) = mpsc::channel(queue_capacity);
        *lock(&self.outbound) = Some(tx);

        let reader = handle.spawn(read_loop(self.id, read_half, events));
        *lock(&self.reader) = Some(reader);
        handle.spawn(write_loop(rx, write_half));
        Ok(())
    }

    /// Enqueue one outbound message without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::QueueFull`] if the bounded queue is at
    /// capacity and [`BrokerError::ConnectionClosed`] if the connection was
    /// never opened or has closed. Either failure affects this connection
    /// only.
    pub fn enqueue(&self, payload: Bytes) -> Result<()> {
        let guard = lock(&self.outbound);
        let tx = guard.as_ref().ok_or(BrokerError::ConnectionClosed)?;
        tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BrokerError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => BrokerError::ConnectionClosed,
        })
    }

    /// Close the connection. Idempotent, best-effort.
    ///
    /// Dropping the outbound sender lets the writer task drain what is
    /// already queued and shut the stream down; the read task is aborted to
    /// release its pending read.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.outbound).take();
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint_name", &self.endpoint_name)
            .field("name", &self.name())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_loop(id: u64, mut reader: OwnedReadHalf, events: mpsc::Sender<ConnectionEvent>) {
    let mut messages = MessageBuffer::new();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = events.send(ConnectionEvent::Disconnected { id }).await;
                return;
            }
            Ok(n) => match messages.push(&buf[..n]) {
                Ok(complete) => {
                    for payload in complete {
                        let event = ConnectionEvent::Message { id, payload };
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let event = ConnectionEvent::Faulted {
                        id,
                        error: Arc::new(e),
                    };
                    let _ = events.send(event).await;
                    return;
                }
            },
            Err(e) => {
                let event = ConnectionEvent::Faulted {
                    id,
                    error: Arc::new(e.into()),
                };
                let _ = events.send(event).await;
                return;
            }
        }
    }
}

async fn write_loop(mut rx: mpsc::Receiver<Bytes>, mut writer: OwnedWriteHalf) {
    while let Some(payload) = rx.recv().await {
        if let Err(e) = write_message_async(&mut writer, &payload).await {
            tracing::warn!(error = %e, "connection write failed, stopping writer");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{read_message, write_message};
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    fn pair() -> (PipeStream, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        (PipeStream::from_std(ours), theirs)
    }

    #[test]
    fn name_assignment() {
        let conn = Connection::new(1, "hub.sock_1".into());
        assert_eq!(conn.name(), None);
        conn.set_name("alpha");
        assert_eq!(conn.name(), Some("alpha".to_string()));
        assert_eq!(conn.endpoint_name(), "hub.sock_1");
    }

    #[test]
    fn enqueue_before_open_is_an_error() {
        let conn = Connection::new(1, "hub.sock_1".into());
        let result = conn.enqueue(Bytes::from_static(b"ping"));
        assert!(matches!(result, Err(BrokerError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn enqueue_delivers_framed_message() {
        let (ours, theirs) = pair();
        let conn = Arc::new(Connection::new(1, "hub.sock_1".into()));
        let (events_tx, _events_rx) = mpsc::channel(8);
        conn.open(ours, events_tx, &Handle::current(), 8).unwrap();

        conn.enqueue(Bytes::from_static(b"ping")).unwrap();

        let payload = tokio::task::spawn_blocking(move || {
            let mut theirs = theirs;
            read_message(&mut theirs).unwrap()
        })
        .await
        .unwrap();
        assert_eq!(payload, b"ping");
    }

    #[tokio::test]
    async fn inbound_message_surfaces_event() {
        let (ours, theirs) = pair();
        let conn = Arc::new(Connection::new(7, "hub.sock_7".into()));
        let (events_tx, mut events_rx) = mpsc::channel(8);
        conn.open(ours, events_tx, &Handle::current(), 8).unwrap();

        tokio::task::spawn_blocking(move || {
            let mut theirs = theirs;
            write_message(&mut theirs, b"from client").unwrap();
            theirs
        });

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ConnectionEvent::Message { id, payload } => {
                assert_eq!(id, 7);
                assert_eq!(payload, Bytes::from_static(b"from client"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn peer_close_surfaces_disconnect() {
        let (ours, theirs) = pair();
        let conn = Arc::new(Connection::new(3, "hub.sock_3".into()));
        let (events_tx, mut events_rx) = mpsc::channel(8);
        conn.open(ours, events_tx, &Handle::current(), 8).unwrap();

        drop(theirs);

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, ConnectionEvent::Disconnected { id: 3 }));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_enqueue() {
        let (ours, _theirs) = pair();
        let conn = Arc::new(Connection::new(2, "hub.sock_2".into()));
        let (events_tx, _events_rx) = mpsc::channel(8);
        conn.open(ours, events_tx, &Handle::current(), 8).unwrap();

        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert!(matches!(
            conn.enqueue(Bytes::from_static(b"late")),
            Err(BrokerError::ConnectionClosed)
        ));
    }
}
