//! Transport types for SMTP server connections.

#![allow(clippy::missing_errors_doc)]

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::TlsAcceptor;

use crate::error::Error;

/// A duplex byte stream the server can talk SMTP over.
///
/// Implemented for every `AsyncRead + AsyncWrite + Unpin + Send` type, so a
/// `TcpStream`, a `UnixStream` or an in-memory duplex all qualify.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type-erased transport, so plaintext and TLS share one session type.
pub type BoxedTransport = Box<dyn Transport>;

/// Performs the server side of a TLS handshake for STARTTLS.
///
/// [`TlsAcceptor`] implements this. Other implementations can wrap a
/// different TLS stack.
#[async_trait]
pub trait StartTls: Send + Sync {
    /// Runs the handshake over `stream` and returns the encrypted transport.
    async fn handshake(
        &self,
        stream: BoxedTransport,
    ) -> std::result::Result<BoxedTransport, HandshakeError>;
}

#[async_trait]
impl StartTls for TlsAcceptor {
    async fn handshake(
        &self,
        stream: BoxedTransport,
    ) -> std::result::Result<BoxedTransport, HandshakeError> {
        match self.accept(stream).into_fallible().await {
            Ok(tls) => Ok(Box::new(tls)),
            Err((source, stream)) => Err(HandshakeError::new(source, Some(stream))),
        }
    }
}

/// A failed TLS handshake.
///
/// Carries the original transport back when the TLS stack can return it,
/// so the server can still say goodbye on it.
#[derive(thiserror::Error)]
#[error("TLS handshake failed: {source}")]
pub struct HandshakeError {
    #[source]
    source: io::Error,
    stream: Option<BoxedTransport>,
}

impl HandshakeError {
    /// Creates a handshake error, optionally returning the transport.
    #[must_use]
    pub fn new(source: io::Error, stream: Option<BoxedTransport>) -> Self {
        Self { source, stream }
    }

    /// Splits the error into the I/O error and the returned transport.
    #[must_use]
    pub fn into_parts(self) -> (io::Error, Option<BoxedTransport>) {
        (self.source, self.stream)
    }
}

impl fmt::Debug for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeError")
            .field("source", &self.source)
            .field("stream_returned", &self.stream.is_some())
            .finish()
    }
}

/// A server-side stream that can be either plaintext or TLS.
pub enum SmtpStream {
    /// Plaintext transport.
    Plain(BoxedTransport),
    /// TLS-encrypted transport.
    Tls(BoxedTransport),
    /// No transport; only seen while a handshake is in flight or after it
    /// failed without returning the stream. All I/O fails.
    Detached,
}

impl SmtpStream {
    /// Creates a new plaintext stream.
    pub fn plain(stream: impl Transport + 'static) -> Self {
        Self::Plain(Box::new(stream))
    }

    /// Returns true if the stream is TLS-encrypted.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// Upgrades a plaintext stream to TLS.
    ///
    /// On failure the error is returned together with whatever stream is
    /// left: the plaintext one if the TLS stack handed it back, otherwise
    /// [`SmtpStream::Detached`].
    pub async fn upgrade_to_tls(
        self,
        upgrader: &dyn StartTls,
    ) -> std::result::Result<Self, (Error, Self)> {
        match self {
            Self::Plain(stream) => match upgrader.handshake(stream).await {
                Ok(tls) => Ok(Self::Tls(tls)),
                Err(err) => {
                    let (source, stream) = err.into_parts();
                    let rest = stream.map_or(Self::Detached, Self::Plain);
                    Err((Error::Tls(source), rest))
                }
            },
            Self::Tls(_) => Err((
                Error::InvalidState("Stream is already TLS".to_string()),
                self,
            )),
            Self::Detached => Err((
                Error::InvalidState("Stream is detached".to_string()),
                self,
            )),
        }
    }
}

impl fmt::Debug for SmtpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(_) => f.write_str("SmtpStream::Plain"),
            Self::Tls(_) => f.write_str("SmtpStream::Tls"),
            Self::Detached => f.write_str("SmtpStream::Detached"),
        }
    }
}

fn detached() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream is detached")
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) | Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Detached => Poll::Ready(Err(detached())),
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) | Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Detached => Poll::Ready(Err(detached())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) | Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
            Self::Detached => Poll::Ready(Err(detached())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) | Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Detached => Poll::Ready(Ok(())),
        }
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
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Pretends to encrypt by handing the stream back unchanged.
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

    /// Fails every handshake and returns the stream.
    struct Refuse;

    #[async_trait]
    impl StartTls for Refuse {
        async fn handshake(
            &self,
            stream: BoxedTransport,
        ) -> std::result::Result<BoxedTransport, HandshakeError> {
            Err(HandshakeError::new(
                io::Error::new(io::ErrorKind::InvalidData, "bad record"),
                Some(stream),
            ))
        }
    }

    #[tokio::test]
    async fn test_plain_round_trip() {
        let (client, server) = tokio::io::duplex(64);
        let mut server = SmtpStream::plain(server);
        let mut client = client;

        server.write_all(b"220 ready\r\n").await.unwrap();
        let mut buf = [0u8; 11];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"220 ready\r\n");
        assert!(!server.is_tls());
    }

    #[tokio::test]
    async fn test_upgrade_marks_tls() {
        let (_client, server) = tokio::io::duplex(64);
        let stream = SmtpStream::plain(server);

        let stream = stream.upgrade_to_tls(&Passthrough).await.unwrap();
        assert!(stream.is_tls());
    }

    #[tokio::test]
    async fn test_upgrade_twice_is_rejected() {
        let (_client, server) = tokio::io::duplex(64);
        let stream = SmtpStream::plain(server)
            .upgrade_to_tls(&Passthrough)
            .await
            .unwrap();

        let (err, rest) = stream.upgrade_to_tls(&Passthrough).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(rest.is_tls());
    }

    #[tokio::test]
    async fn test_failed_handshake_returns_plain_stream() {
        let (_client, server) = tokio::io::duplex(64);
        let (err, rest) = SmtpStream::plain(server)
            .upgrade_to_tls(&Refuse)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Tls(_)));
        assert!(matches!(rest, SmtpStream::Plain(_)));
    }

    #[tokio::test]
    async fn test_detached_io_fails() {
        let mut stream = SmtpStream::Detached;
        let err = stream.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
