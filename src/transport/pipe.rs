//! Unix domain socket implementation of the pipe primitive.

use std::io::{self, Read, Write};
use std::path::Path;

use crate::error::Result;

/// Options applied to endpoints at bind time.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointOptions {
    /// File mode set on the socket file (e.g. `0o600`). `None` keeps the
    /// process umask default.
    pub mode: Option<u32>,
}

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::net::Shutdown;
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::net::{UnixListener, UnixStream};

    /// A bound, named endpoint accepting one connection at a time.
    pub struct PipeListener {
        listener: UnixListener,
        path: String,
    }

    impl PipeListener {
        /// Bind an endpoint under the given name.
        ///
        /// Removes any stale socket file at the path before binding and
        /// applies the endpoint options.
        pub fn bind(path: &str, options: &EndpointOptions) -> Result<Self> {
            if Path::new(path).exists() {
                std::fs::remove_file(path)?;
            }

            let listener = UnixListener::bind(path)?;

            if let Some(mode) = options.mode {
                let permissions = std::fs::Permissions::from_mode(mode);
                std::fs::set_permissions(path, permissions)?;
            }

            Ok(Self {
                listener,
                path: path.to_string(),
            })
        }

        /// Block until a peer connects.
        ///
        /// There is no cancellation primitive; the only way to release a
        /// blocked accept from the outside is to connect to the endpoint.
        pub fn accept(&self) -> Result<PipeStream> {
            let (stream, _addr) = self.listener.accept()?;
            Ok(PipeStream { stream })
        }

        /// Get the endpoint name.
        pub fn path(&self) -> &str {
            &self.path
        }
    }

    impl Drop for PipeListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    /// One established, bidirectional pipe stream.
    pub struct PipeStream {
        stream: UnixStream,
    }

    impl PipeStream {
        pub(crate) fn from_std(stream: UnixStream) -> Self {
            Self { stream }
        }

        /// Convert into a tokio stream for the async data plane.
        ///
        /// Must be called with a tokio runtime context entered.
        pub fn into_async(self) -> Result<tokio::net::UnixStream> {
            self.stream.set_nonblocking(true)?;
            Ok(tokio::net::UnixStream::from_std(self.stream)?)
        }

        /// Check whether the peer has already hung up.
        ///
        /// Performs a non-blocking one-byte read: end-of-stream means the
        /// peer closed; `WouldBlock` means it is still there. Only valid on
        /// streams the peer is not expected to write on (the rendezvous
        /// stream carries no client data).
        pub fn peer_hung_up(&self) -> Result<bool> {
            self.stream.set_nonblocking(true)?;
            let mut probe = [0u8; 1];
            let result = (&self.stream).read(&mut probe);
            self.stream.set_nonblocking(false)?;

            match result {
                Ok(0) => Ok(true),
                Ok(_) => Ok(false),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
                Err(e) => Err(e.into()),
            }
        }

        /// Set a timeout for blocking reads. `None` blocks indefinitely.
        pub fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> Result<()> {
            Ok(self.stream.set_read_timeout(timeout)?)
        }

        /// Shut down both directions of the stream.
        pub fn shutdown(&self) -> Result<()> {
            Ok(self.stream.shutdown(Shutdown::Both)?)
        }
    }

    impl Read for PipeStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.stream.read(buf)
        }
    }

    impl Write for PipeStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.stream.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.stream.flush()
        }
    }

    /// Connect to a named endpoint.
    ///
    /// This is the narrow client capability the broker's shutdown path uses
    /// to self-dial its rendezvous name; tests use it as the client side of
    /// the handshake.
    pub fn connect(path: &str) -> Result<PipeStream> {
        let stream = UnixStream::connect(path)?;
        Ok(PipeStream { stream })
    }
}

#[cfg(unix)]
pub use unix_impl::{connect, PipeListener, PipeStream};
