//! Named pipe transport primitive.
//!
//! The broker treats the transport as a factory for named, bidirectional
//! endpoints: [`PipeListener::bind`] creates one under a filesystem name,
//! [`PipeListener::accept`] blocks until a peer connects, and [`connect`] is
//! the minimal client capability (connect, disconnect) the broker's own
//! shutdown path needs against its rendezvous name.
//!
//! Accept and connect are deliberately blocking calls with no cancellation
//! primitive; the handshake plane runs them on dedicated worker threads. An
//! established [`PipeStream`] can be handed to the async data plane via
//! [`PipeStream::into_async`].
//!
//! Unix domain sockets back the implementation; the module is split per
//! platform so another backend can slot in behind `cfg`.

mod pipe;

pub use pipe::{connect, EndpointOptions, PipeListener, PipeStream};
