//! Server configuration types.

use std::fmt;
use std::sync::Arc;

use tokio_rustls::TlsAcceptor;

use crate::connection::StartTls;

/// Default line limit, including CRLF (RFC 5321 Section 4.5.3.1.6).
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1000;

/// SMTP server configuration.
///
/// Immutable once built; shared read-only by every session.
#[derive(Clone)]
pub struct Config {
    /// Hostname announced in the greeting, HELO/EHLO and CRAM-MD5 challenges.
    pub hostname: String,
    /// STARTTLS upgrader. `None` disables STARTTLS.
    pub starttls: Option<Arc<dyn StartTls>>,
    /// Advertise PIPELINING in the EHLO reply.
    pub pipelining: bool,
    /// Maximum command line length, including CRLF.
    pub max_line_length: usize,
    /// Log every protocol line at debug level.
    pub trace_protocol: bool,
}

impl Config {
    /// Creates a configuration with defaults: no STARTTLS, no PIPELINING.
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        ConfigBuilder::new(hostname).build()
    }

    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(hostname: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(hostname)
    }

    /// Returns true if STARTTLS is configured.
    #[must_use]
    pub const fn tls_available(&self) -> bool {
        self.starttls.is_some()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("hostname", &self.hostname)
            .field("starttls", &self.starttls.is_some())
            .field("pipelining", &self.pipelining)
            .field("max_line_length", &self.max_line_length)
            .field("trace_protocol", &self.trace_protocol)
            .finish()
    }
}

/// Builder for server configuration.
#[derive(Clone)]
pub struct ConfigBuilder {
    hostname: String,
    starttls: Option<Arc<dyn StartTls>>,
    pipelining: bool,
    max_line_length: usize,
    trace_protocol: bool,
}

impl ConfigBuilder {
    /// Creates a new builder with the given hostname.
    ///
    /// An empty hostname is replaced by the machine's hostname when the
    /// configuration is built.
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            starttls: None,
            pipelining: false,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            trace_protocol: false,
        }
    }

    /// Enables STARTTLS with the given upgrader.
    #[must_use]
    pub fn starttls(mut self, upgrader: impl StartTls + 'static) -> Self {
        self.starttls = Some(Arc::new(upgrader));
        self
    }

    /// Enables STARTTLS with a rustls server configuration.
    #[must_use]
    pub fn tls_config(self, tls: Arc<rustls::ServerConfig>) -> Self {
        self.starttls(TlsAcceptor::from(tls))
    }

    /// Sets whether PIPELINING is advertised.
    #[must_use]
    pub const fn pipelining(mut self, enabled: bool) -> Self {
        self.pipelining = enabled;
        self
    }

    /// Sets the maximum command line length, including CRLF.
    #[must_use]
    pub const fn max_line_length(mut self, limit: usize) -> Self {
        self.max_line_length = limit;
        self
    }

    /// Sets whether every protocol line is logged at debug level.
    #[must_use]
    pub const fn trace_protocol(mut self, enabled: bool) -> Self {
        self.trace_protocol = enabled;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> Config {
        let hostname = if self.hostname.is_empty() {
            local_hostname()
        } else {
            self.hostname
        };

        Config {
            hostname,
            starttls: self.starttls,
            pipelining: self.pipelining,
            max_line_length: self.max_line_length,
            trace_protocol: self.trace_protocol,
        }
    }
}

impl fmt::Debug for ConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigBuilder")
            .field("hostname", &self.hostname)
            .field("starttls", &self.starttls.is_some())
            .field("pipelining", &self.pipelining)
            .field("max_line_length", &self.max_line_length)
            .field("trace_protocol", &self.trace_protocol)
            .finish()
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use crate::connection::{BoxedTransport, HandshakeError};
    use async_trait::async_trait;

    struct Passthrough;

    #[async_trait]
    impl StartTls for Passthrough {
        async fn handshake(
            &self,
            stream: BoxedTransport,
        ) -> std::result::Result<BoxedTransport, HandshakeError> {
            Ok(stream)
        }
    }

    #[test]
    fn test_config_new() {
        let config = Config::new("mx.example.com");
        assert_eq!(config.hostname, "mx.example.com");
        assert!(!config.tls_available());
        assert!(!config.pipelining);
        assert_eq!(config.max_line_length, DEFAULT_MAX_LINE_LENGTH);
        assert!(!config.trace_protocol);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::builder("mx.example.com")
            .starttls(Passthrough)
            .pipelining(true)
            .max_line_length(512)
            .trace_protocol(true)
            .build();

        assert!(config.tls_available());
        assert!(config.pipelining);
        assert_eq!(config.max_line_length, 512);
        assert!(config.trace_protocol);
    }

    #[test]
    fn test_empty_hostname_falls_back() {
        let config = Config::new("");
        assert!(!config.hostname.is_empty());
    }

    #[test]
    fn test_debug_hides_upgrader() {
        let config = Config::builder("mx.example.com").starttls(Passthrough).build();
        let debug = format!("{config:?}");
        assert!(debug.contains("starttls: true"));
    }
}
