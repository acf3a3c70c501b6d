//! Connection broker: accept loop, registry wiring, and the push API.
//!
//! The pipe primitive accepts only one pending connection per endpoint, so
//! the broker never carries traffic on the well-known base name. Instead the
//! accept loop runs a two-phase handshake per client: accept on the
//! rendezvous endpoint, hand the client the name of a freshly bound
//! dedicated endpoint, then accept the reconnect there. The shared name acts
//! purely as a beacon; every session lives on its own endpoint.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use crate::codec::MsgPackCodec;
use crate::config::BrokerConfig;
use crate::connection::{Connection, ConnectionEvent};
use crate::error::{BrokerError, Result};
use crate::events::BrokerEvent;
use crate::protocol::write_message;
use crate::registry::ConnectionRegistry;
use crate::transport::{self, PipeListener, PipeStream};
use crate::worker::Worker;

/// Capacity of the public event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Capacity of the internal connection-event channel.
const CONN_EVENT_CAPACITY: usize = 1024;

/// How long `stop` waits for the accept loop to wind down after the
/// shutdown dial released it.
const STOP_DRAIN_WAIT: Duration = Duration::from_secs(2);

/// Pause after a failed handshake attempt so a persistent accept error
/// (e.g. fd exhaustion) cannot spin the loop hot.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Per-start run state. Each `start` gets a fresh generation so a loop from
/// an earlier generation can never mistake a restart for its own run.
struct RunState {
    running: AtomicBool,
    loop_active: AtomicBool,
}

/// Multi-client message broker over a single well-known pipe name.
///
/// # Example
///
/// ```no_run
/// use pipehub::{BrokerConfig, PipeBroker};
///
/// #[tokio::main]
/// async fn main() -> pipehub::Result<()> {
///     let broker = PipeBroker::new(BrokerConfig::new("/tmp/hub.sock"))?;
///     let mut events = broker.subscribe();
///     broker.start()?;
///
///     while let Ok(event) = events.recv().await {
///         println!("{event:?}");
///     }
///
///     broker.stop()
/// }
/// ```
pub struct PipeBroker {
    config: BrokerConfig,
    registry: Arc<ConnectionRegistry>,
    state: Mutex<Option<Arc<RunState>>>,
    next_connection_id: Arc<AtomicU64>,
    next_endpoint_seq: Arc<AtomicU64>,
    events_tx: broadcast::Sender<BrokerEvent>,
    worker: Worker,
}

/// Everything the accept loop needs, owned so the loop thread is `'static`.
struct AcceptContext {
    config: BrokerConfig,
    registry: Arc<ConnectionRegistry>,
    state: Arc<RunState>,
    next_connection_id: Arc<AtomicU64>,
    next_endpoint_seq: Arc<AtomicU64>,
    events_tx: broadcast::Sender<BrokerEvent>,
    conn_events_tx: mpsc::Sender<ConnectionEvent>,
    handle: Handle,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PipeBroker {
    /// Create a broker with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Config`] for an invalid configuration; see
    /// [`BrokerConfig::validate`].
    pub fn new(config: BrokerConfig) -> Result<Self> {
        config.validate()?;
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            state: Mutex::new(None),
            next_connection_id: Arc::new(AtomicU64::new(1)),
            next_endpoint_seq: Arc::new(AtomicU64::new(1)),
            events_tx,
            worker: Worker::new()?,
        })
    }

    /// Subscribe to broker events.
    ///
    /// Every subscriber sees every event raised after it subscribed.
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events_tx.subscribe()
    }

    /// Number of currently registered connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Start accepting clients.
    ///
    /// Launches exactly one background accept loop and returns immediately;
    /// the first bind happens asynchronously, so a client connecting right
    /// after `start` returns may need to retry.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::AlreadyRunning`] if called again without an
    /// intervening [`stop`](Self::stop).
    pub fn start(&self) -> Result<()> {
        let mut guard = lock(&self.state);
        if let Some(state) = guard.as_ref() {
            if state.running.load(Ordering::SeqCst) {
                return Err(BrokerError::AlreadyRunning);
            }
        }
        let state = Arc::new(RunState {
            running: AtomicBool::new(true),
            loop_active: AtomicBool::new(true),
        });
        *guard = Some(Arc::clone(&state));
        drop(guard);

        let (conn_events_tx, conn_events_rx) = mpsc::channel(CONN_EVENT_CAPACITY);
        self.worker.handle().spawn(dispatch_loop(
            conn_events_rx,
            Arc::clone(&self.registry),
            self.events_tx.clone(),
        ));

        let ctx = AcceptContext {
            config: self.config.clone(),
            registry: Arc::clone(&self.registry),
            state: Arc::clone(&state),
            next_connection_id: Arc::clone(&self.next_connection_id),
            next_endpoint_seq: Arc::clone(&self.next_endpoint_seq),
            events_tx: self.events_tx.clone(),
            conn_events_tx,
            handle: self.worker.handle().clone(),
        };

        let events_tx = self.events_tx.clone();
        self.worker.run(
            move || {
                let result = accept_loop(&ctx);
                ctx.state.loop_active.store(false, Ordering::SeqCst);
                result
            },
            move |result| match result {
                Ok(()) => debug!("accept loop exited"),
                Err(e) => {
                    error!(error = %e, "accept loop terminated");
                    state.running.store(false, Ordering::SeqCst);
                    let _ = events_tx.send(BrokerEvent::Error(Arc::new(e)));
                }
            },
        );
        Ok(())
    }

    /// Stop the broker.
    ///
    /// Clears the running flag, releases a possibly blocked rendezvous
    /// accept by dialing the base name from the client side (the accept call
    /// has no cancellation primitive, so the broker must satisfy it to let
    /// the loop observe the cleared flag), then closes every registered
    /// connection, continuing past individual failures.
    ///
    /// Safe to call on a never-started broker and safe to call repeatedly.
    /// Can block for the dummy connection's own connect/disconnect waits.
    pub fn stop(&self) -> Result<()> {
        let state = lock(&self.state).take();

        if let Some(state) = state {
            let was_running = state.running.swap(false, Ordering::SeqCst);
            if was_running {
                self.release_accept_loop(&state);
            }
        }

        // Drained only after the loop wound down, so a handshake that was in
        // flight when the flag cleared cannot register behind the drain.
        for connection in self.registry.drain() {
            connection.close();
        }
        Ok(())
    }

    /// Dial the rendezvous name until the accept loop winds down, so its
    /// listener is gone before any restart rebinds the same name. The dial
    /// retries because it can land before the loop's initial bind. A loop
    /// wedged on a dedicated accept (client took the name and never
    /// reconnected) will not exit; give up on it after the drain window.
    fn release_accept_loop(&self, state: &RunState) {
        let deadline = Instant::now() + STOP_DRAIN_WAIT;
        while state.loop_active.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                warn!("accept loop still blocked after stop; abandoning it");
                return;
            }
            match transport::connect(&self.config.base_name) {
                Ok(stream) => drop(stream),
                Err(e) => debug!(error = %e, "shutdown dial found no pending accept"),
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Broadcast a message to every currently registered connection.
    ///
    /// Delivery iterates a stable snapshot; one failing enqueue does not
    /// abort delivery to the remaining connections.
    pub fn push_message(&self, payload: Bytes) {
        for connection in self.registry.snapshot() {
            deliver(&connection, payload.clone());
        }
    }

    /// Push a message to the connection with the given id.
    ///
    /// An unknown id is a silent no-op.
    pub fn push_message_to(&self, payload: Bytes, target_id: u64) {
        if let Some(connection) = self.registry.get(target_id) {
            deliver(&connection, payload);
        }
    }

    /// Push a message to every connection whose id is in `target_ids`.
    pub fn push_message_to_ids(&self, payload: Bytes, target_ids: &[u64]) {
        for connection in self.registry.snapshot() {
            if target_ids.contains(&connection.id()) {
                deliver(&connection, payload.clone());
            }
        }
    }

    /// Push a message to every connection named `target_name`.
    ///
    /// Names are matched by exact equality, no normalization. No match is a
    /// silent no-op.
    pub fn push_message_to_name(&self, payload: Bytes, target_name: &str) {
        for connection in self.registry.snapshot() {
            if connection.name().as_deref() == Some(target_name) {
                deliver(&connection, payload.clone());
            }
        }
    }

    /// Push a message to every connection whose name is in `target_names`.
    ///
    /// Each connection receives at most one copy per call.
    pub fn push_message_to_names(&self, payload: Bytes, target_names: &[&str]) {
        for connection in self.registry.snapshot() {
            if let Some(name) = connection.name() {
                if target_names.contains(&name.as_str()) {
                    deliver(&connection, payload.clone());
                }
            }
        }
    }
}

impl Drop for PipeBroker {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn deliver(connection: &Arc<Connection>, payload: Bytes) {
    if let Err(e) = connection.enqueue(payload) {
        warn!(id = connection.id(), error = %e, "dropping message for connection");
    }
}

/// Rebinds internal connection events to public broker events.
///
/// Ends when the accept loop and every connection read task have dropped
/// their senders.
async fn dispatch_loop(
    mut rx: mpsc::Receiver<ConnectionEvent>,
    registry: Arc<ConnectionRegistry>,
    events_tx: broadcast::Sender<BrokerEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            ConnectionEvent::Message { id, payload } => {
                if let Some(connection) = registry.get(id) {
                    let _ = events_tx.send(BrokerEvent::MessageReceived(connection, payload));
                }
            }
            ConnectionEvent::Disconnected { id } => {
                remove_and_report(&registry, &events_tx, id);
            }
            ConnectionEvent::Faulted { id, error } => {
                warn!(id, error = %error, "connection faulted");
                remove_and_report(&registry, &events_tx, id);
            }
        }
    }
}

fn remove_and_report(
    registry: &ConnectionRegistry,
    events_tx: &broadcast::Sender<BrokerEvent>,
    id: u64,
) {
    // Absent means the connection was already drained by `stop`; reporting
    // it again would be a spurious loss event.
    if let Some(connection) = registry.remove(id) {
        connection.close();
        let _ = events_tx.send(BrokerEvent::ConnectionLost(Some(connection)));
    }
}

/// The accept loop. Runs on a dedicated worker thread until the running
/// flag clears.
///
/// The rendezvous endpoint is bound once per run; clients arriving while a
/// handshake is in flight queue on its backlog and are served one at a time.
fn accept_loop(ctx: &AcceptContext) -> Result<()> {
    let rendezvous = PipeListener::bind(&ctx.config.base_name, &ctx.config.endpoint_options())?;

    while ctx.state.running.load(Ordering::SeqCst) {
        // An accept failure is a per-client failure like any other broken
        // handshake; only the bind above is fatal to the server.
        let result = rendezvous.accept().and_then(|stream| {
            if !ctx.state.running.load(Ordering::SeqCst) {
                // The connection was `stop` releasing the accept call.
                return Err(BrokerError::Handshake("broker stopping".into()));
            }
            serve_one(ctx, stream)
        });

        if let Err(e) = result {
            if !ctx.state.running.load(Ordering::SeqCst) {
                break;
            }
            warn!(error = %e, "handshake attempt failed");
            let _ = ctx.events_tx.send(BrokerEvent::ConnectionLost(None));
            std::thread::sleep(ACCEPT_RETRY_DELAY);
        }
    }
    Ok(())
}

/// One full handshake over an accepted rendezvous stream: name handoff,
/// dedicated accept, registration.
fn serve_one(ctx: &AcceptContext, mut stream: PipeStream) -> Result<()> {
    if stream.peer_hung_up()? {
        return Err(BrokerError::Handshake(
            "client disconnected before handshake".into(),
        ));
    }

    // One number per client served, unique for the broker's lifetime and
    // never reset; only the single live loop thread increments it.
    let sequence = ctx.next_endpoint_seq.fetch_add(1, Ordering::SeqCst);
    let endpoint_name = format!("{}_{}", ctx.config.base_name, sequence);

    // Bind the dedicated endpoint before handing out its name, so the
    // client's reconnect can never race the bind.
    let dedicated = PipeListener::bind(&endpoint_name, &ctx.config.endpoint_options())?;

    // One message, one direction, no acknowledgement: the name, flushed
    // before the rendezvous stream closes.
    let payload = MsgPackCodec::encode(&endpoint_name)?;
    write_message(&mut stream, &payload)?;
    drop(stream);

    // Blocks until the same client reconnects. A client that takes the name
    // and never comes back leaves this accept pending; no timeout is imposed
    // at this layer.
    let client = dedicated.accept()?;

    // The reconnect may arrive long after `stop` abandoned this accept;
    // registering now would put a live connection behind the shutdown drain.
    if !ctx.state.running.load(Ordering::SeqCst) {
        return Err(BrokerError::Handshake(
            "broker stopped during handshake".into(),
        ));
    }

    let id = ctx.next_connection_id.fetch_add(1, Ordering::SeqCst);
    let connection = Arc::new(Connection::new(id, endpoint_name));
    connection.open(
        client,
        ctx.conn_events_tx.clone(),
        &ctx.handle,
        ctx.config.queue_capacity(),
    )?;
    ctx.registry.add(Arc::clone(&connection));
    let _ = ctx
        .events_tx
        .send(BrokerEvent::ConnectionEstablished(connection));
    Ok(())
}
