//! Entry point for serving accepted connections.

use std::sync::Arc;

use tracing::Instrument;

use crate::config::Config;
use crate::connection::{SmtpStream, Transport};
use crate::error::Result;
use crate::handler::Handler;
use crate::session::Session;

/// SMTP server.
///
/// Holds the shared configuration. Accepting connections is left to the
/// application; hand each accepted stream to [`Server::serve`], typically
/// from its own task.
///
/// ```no_run
/// use mailledger_smtpd::{Config, NoopHandler, Server};
/// use tokio::net::TcpListener;
///
/// # async fn run() -> std::io::Result<()> {
/// let server = Server::new(Config::new("mx.example.com"));
/// let listener = TcpListener::bind("0.0.0.0:2525").await?;
///
/// loop {
///     let (stream, peer) = listener.accept().await?;
///     let server = server.clone();
///     tokio::spawn(async move {
///         if let Err(err) = server.serve(stream, peer.to_string(), NoopHandler).await {
///             tracing::debug!(error = %err, "session ended");
///         }
///     });
/// }
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Server {
    config: Arc<Config>,
}

impl Server {
    /// Creates a server with the given configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Returns the server configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs one SMTP session over an accepted stream.
    ///
    /// `remote` identifies the peer (usually its socket address) and is
    /// passed to [`Handler::connect`]. The session runs inside an
    /// `smtp_session` tracing span carrying it.
    ///
    /// # Errors
    ///
    /// See [`Session::run`]. A client that disconnects without QUIT yields
    /// an error for which [`Error::is_disconnect`](crate::Error::is_disconnect)
    /// is true.
    pub async fn serve<S, H>(&self, stream: S, remote: impl Into<String>, handler: H) -> Result<()>
    where
        S: Transport + 'static,
        H: Handler,
    {
        let remote = remote.into();
        let span = tracing::info_span!("smtp_session", remote = %remote);

        async move {
            tracing::debug!("Session started");
            let mut session = Session::new(
                Arc::clone(&self.config),
                SmtpStream::plain(stream),
                remote,
                handler,
            );
            let result = session.run().await;
            match &result {
                Ok(()) => tracing::debug!("Session finished"),
                Err(err) if err.is_disconnect() => tracing::debug!("Client disconnected"),
                Err(err) => tracing::info!(error = %err, "Session ended with error"),
            }
            result
        }
        .instrument(span)
        .await
    }
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
    use crate::handler::NoopHandler;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn test_serve_greets_and_quits() {
        let (client, server_end) = tokio::io::duplex(1024);
        let server = Server::new(Config::new("mx.example.com"));

        let task = tokio::spawn(async move {
            server.serve(server_end, "198.51.100.7:25", NoopHandler).await
        });

        let mut client = BufReader::new(client);
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("220 mx.example.com ESMTP "));
        assert!(line.ends_with("\r\n"));

        client.get_mut().write_all(b"QUIT\r\n").await.unwrap();
        line.clear();
        client.read_line(&mut line).await.unwrap();
        assert_eq!(line, "221 mx.example.com closing connection\r\n");

        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_config_is_shared() {
        let server = Server::new(Config::builder("mx.example.com").pipelining(true).build());
        let clone = server.clone();
        assert!(clone.config().pipelining);
        assert!(Arc::ptr_eq(&server.config, &clone.config));
    }
}
