//! # pipehub
//!
//! Multi-client message broker over named pipe endpoints.
//!
//! The underlying pipe primitive accepts only one pending connection per
//! endpoint. pipehub turns a single well-known pipe name into an unbounded
//! set of per-client sessions with a two-phase handshake: clients dial the
//! rendezvous endpoint, receive the name of a freshly bound dedicated
//! endpoint as a single framed message, and reconnect there for all
//! application traffic.
//!
//! ## Architecture
//!
//! - **Rendezvous plane** (blocking): the accept loop runs on a dedicated
//!   worker thread, serving one handshake at a time.
//! - **Data plane** (async): each established [`Connection`] runs read/write
//!   tasks on the tokio runtime captured at broker construction, delivering
//!   [`BrokerEvent`]s through a broadcast channel.
//!
//! ## Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use pipehub::{BrokerConfig, BrokerEvent, PipeBroker};
//!
//! #[tokio::main]
//! async fn main() -> pipehub::Result<()> {
//!     let broker = PipeBroker::new(BrokerConfig::new("/tmp/hub.sock"))?;
//!     let mut events = broker.subscribe();
//!     broker.start()?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let BrokerEvent::MessageReceived(conn, payload) = event {
//!             // Echo back to the sender only.
//!             broker.push_message_to(payload, conn.id());
//!         }
//!     }
//!
//!     broker.stop()
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod transport;

mod broker;
mod connection;
mod registry;
mod worker;

pub use broker::PipeBroker;
pub use config::BrokerConfig;
pub use connection::Connection;
pub use error::{BrokerError, Result};
pub use events::BrokerEvent;
pub use registry::ConnectionRegistry;
pub use worker::Worker;
