use crate::net::support::{ErrorType, NetError, NetResult};
use serde_derive::{Deserialize, Serialize};
use std::sync::Arc;

/// Immutable configuration snapshot. Built once through `ConfigBuilder` (or
/// loaded from TOML) and shared read-only; the runtime never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Route incoming packets through the single handler worker thread.
    pub use_handler_thread: bool,
    /// Capacity of the bounded handler queue.
    pub handler_queue_capacity: usize,
    /// Initial size for growable packet buffers; accumulator storage grows
    /// in multiples of this.
    pub packet_buffer_initial_size: usize,
    /// Liveness check deadline in milliseconds; -1 disables the deadline.
    pub connection_check_timeout: i32,
    /// Run a periodic ticker that calls `update` on every connection.
    pub global_connection_check: bool,
    /// Minimum payload size in bytes at which compression is applied; -1
    /// disables compression entirely.
    pub compression_size: i32,
    /// Offload encode work to a worker thread.
    pub use_encoder_thread_pool: bool,
    /// Offload decode work to a worker thread.
    pub use_decoder_thread_pool: bool,
    /// Receive buffer size for datagram sockets.
    pub datagram_packet_size: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            use_handler_thread: true,
            handler_queue_capacity: 256,
            packet_buffer_initial_size: 4096,
            connection_check_timeout: 5000,
            global_connection_check: false,
            compression_size: -1,
            use_encoder_thread_pool: false,
            use_decoder_thread_pool: false,
            datagram_packet_size: 4096,
        }
    }
}

impl Config {
    #[inline]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    /// Load a snapshot from TOML text. Unspecified keys keep their
    /// defaults.
    pub fn from_toml_str(text: &str) -> NetResult<Config> {
        let config: Config =
            serdeconv::from_toml_str(text).map_err(|_| NetError::Fatal(ErrorType::InvalidArgument))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> NetResult<()> {
        if self.packet_buffer_initial_size == 0
            || self.datagram_packet_size == 0
            || self.handler_queue_capacity == 0
        {
            return Err(NetError::Fatal(ErrorType::InvalidArgument));
        }

        Ok(())
    }
}

/// Builder-style setters over a pending snapshot; `build` is the one-way
/// transition into the immutable configuration.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    #[inline]
    pub fn use_handler_thread(mut self, value: bool) -> Self {
        self.config.use_handler_thread = value;
        self
    }

    #[inline]
    pub fn handler_queue_capacity(mut self, value: usize) -> Self {
        self.config.handler_queue_capacity = value;
        self
    }

    #[inline]
    pub fn packet_buffer_initial_size(mut self, value: usize) -> Self {
        self.config.packet_buffer_initial_size = value;
        self
    }

    #[inline]
    pub fn connection_check_timeout(mut self, value: i32) -> Self {
        self.config.connection_check_timeout = value;
        self
    }

    #[inline]
    pub fn global_connection_check(mut self, value: bool) -> Self {
        self.config.global_connection_check = value;
        self
    }

    #[inline]
    pub fn compression_size(mut self, value: i32) -> Self {
        self.config.compression_size = value;
        self
    }

    #[inline]
    pub fn use_encoder_thread_pool(mut self, value: bool) -> Self {
        self.config.use_encoder_thread_pool = value;
        self
    }

    #[inline]
    pub fn use_decoder_thread_pool(mut self, value: bool) -> Self {
        self.config.use_decoder_thread_pool = value;
        self
    }

    #[inline]
    pub fn datagram_packet_size(mut self, value: usize) -> Self {
        self.config.datagram_packet_size = value;
        self
    }

    pub fn build(self) -> NetResult<Arc<Config>> {
        self.config.validate()?;
        Ok(Arc::new(self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert!(config.use_handler_thread);
        assert_eq!(config.packet_buffer_initial_size, 4096);
        assert_eq!(config.compression_size, -1);
        assert!(!config.global_connection_check);
    }

    #[test]
    fn test_builder_snapshot() {
        let config = Config::builder()
            .use_handler_thread(false)
            .compression_size(1024)
            .connection_check_timeout(-1)
            .datagram_packet_size(9000)
            .build()
            .unwrap();

        assert!(!config.use_handler_thread);
        assert_eq!(config.compression_size, 1024);
        assert_eq!(config.connection_check_timeout, -1);
        assert_eq!(config.datagram_packet_size, 9000);
        // Untouched keys keep their defaults.
        assert_eq!(config.packet_buffer_initial_size, 4096);
    }

    #[test]
    fn test_invalid_sizes_rejected() {
        let result = Config::builder().packet_buffer_initial_size(0).build();

        assert_eq!(
            result.unwrap_err(),
            NetError::Fatal(ErrorType::InvalidArgument)
        );
    }

    #[test]
    fn test_from_toml() {
        let config = Config::from_toml_str(
            r#"
use_handler_thread = false
compression_size = 512
"#,
        )
        .unwrap();

        assert!(!config.use_handler_thread);
        assert_eq!(config.compression_size, 512);
        assert_eq!(config.datagram_packet_size, 4096);
    }

    #[test]
    fn test_malformed_toml_rejected() {
        assert!(Config::from_toml_str("compression_size = \"lots\"").is_err());
    }
}
