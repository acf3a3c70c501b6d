//! Broker configuration.

use crate::error::{BrokerError, Result};
use crate::transport::EndpointOptions;

/// Default per-connection outbound queue capacity.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Configuration for a [`PipeBroker`](crate::PipeBroker).
///
/// `base_name` is the filesystem path of the rendezvous endpoint, fixed for
/// the broker's lifetime. Dedicated endpoints are derived from it as
/// `<base_name>_<N>`.
///
/// The transport options are a pair: either both `buffer_size` and
/// `socket_mode` are set, or neither. [`validate`](Self::validate) rejects a
/// partial pair.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Base pipe name (socket path). Required.
    pub base_name: String,
    /// Per-connection outbound queue capacity. Must be set together with `socket_mode`.
    pub buffer_size: Option<usize>,
    /// Unix file mode applied to endpoints the broker creates (e.g. `0o600`).
    /// Must be set together with `buffer_size`.
    pub socket_mode: Option<u32>,
}

impl BrokerConfig {
    /// Create a configuration with the given base pipe name and default transport options.
    pub fn new(base_name: impl Into<String>) -> Self {
        Self {
            base_name: base_name.into(),
            buffer_size: None,
            socket_mode: None,
        }
    }

    /// Set the transport option pair.
    pub fn with_transport(mut self, buffer_size: usize, socket_mode: u32) -> Self {
        self.buffer_size = Some(buffer_size);
        self.socket_mode = Some(socket_mode);
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Config`] if the base name is empty, the buffer
    /// size is zero, or only one of the transport options is set.
    pub fn validate(&self) -> Result<()> {
        if self.base_name.is_empty() {
            return Err(BrokerError::Config(
                "base pipe name must not be empty".into(),
            ));
        }

        match (self.buffer_size, self.socket_mode) {
            (Some(0), _) => Err(BrokerError::Config("buffer size must be positive".into())),
            (Some(_), None) | (None, Some(_)) => Err(BrokerError::Config(
                "buffer size and socket mode must be supplied together".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Outbound queue capacity for each connection.
    pub(crate) fn queue_capacity(&self) -> usize {
        self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE)
    }

    /// Options applied to every endpoint the broker binds.
    pub(crate) fn endpoint_options(&self) -> EndpointOptions {
        EndpointOptions {
            mode: self.socket_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_base_name_only() {
        let config = BrokerConfig::new("/tmp/hub.sock");
        assert!(config.validate().is_ok());
        assert_eq!(config.queue_capacity(), DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn accepts_full_transport_pair() {
        let config = BrokerConfig::new("/tmp/hub.sock").with_transport(256, 0o600);
        assert!(config.validate().is_ok());
        assert_eq!(config.queue_capacity(), 256);
        assert_eq!(config.endpoint_options().mode, Some(0o600));
    }

    #[test]
    fn rejects_empty_base_name() {
        let config = BrokerConfig::new("");
        assert!(matches!(config.validate(), Err(BrokerError::Config(_))));
    }

    #[test]
    fn rejects_partial_transport_pair() {
        let mut config = BrokerConfig::new("/tmp/hub.sock");
        config.buffer_size = Some(256);
        assert!(matches!(config.validate(), Err(BrokerError::Config(_))));

        let mut config = BrokerConfig::new("/tmp/hub.sock");
        config.socket_mode = Some(0o600);
        assert!(matches!(config.validate(), Err(BrokerError::Config(_))));
    }

    #[test]
    fn rejects_zero_buffer_size() {
        let config = BrokerConfig::new("/tmp/hub.sock").with_transport(0, 0o600);
        assert!(matches!(config.validate(), Err(BrokerError::Config(_))));
    }
}
