//! Public broker events.

use std::sync::Arc;

use bytes::Bytes;

use crate::connection::Connection;
use crate::error::BrokerError;

/// Events raised by a [`PipeBroker`](crate::PipeBroker).
///
/// Delivered through a broadcast channel: every subscriber sees every event,
/// on its own task, never on the accept-loop thread.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// A client completed the handshake and was registered.
    ConnectionEstablished(Arc<Connection>),
    /// A connection went away. `None` marks a failed handshake attempt that
    /// never produced a connection; `Some` is a genuine disconnect of a
    /// registered connection, which has already been removed from the
    /// registry.
    ConnectionLost(Option<Arc<Connection>>),
    /// A registered connection delivered an inbound message.
    MessageReceived(Arc<Connection>, Bytes),
    /// The accept loop itself terminated with an error. No further clients
    /// are accepted until `start` is called again.
    Error(Arc<BrokerError>),
}
