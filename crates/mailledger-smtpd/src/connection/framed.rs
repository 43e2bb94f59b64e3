//! Framed I/O for the server side of SMTP.
//!
//! SMTP commands are CRLF-terminated lines; replies are one or more
//! CRLF-terminated lines. This module provides buffered line reading with a
//! length limit, reply writing, and the in-place re-framing needed for
//! STARTTLS.

#![allow(clippy::missing_errors_doc)]

use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use super::stream::{SmtpStream, StartTls};
use crate::data::DotReader;
use crate::error::{Error, Result};
use crate::types::Reply;

/// Default buffer size for reading.
const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Framed connection for the SMTP server.
pub struct FramedStream {
    reader: BufReader<SmtpStream>,
    write_buffer: BytesMut,
    max_line_length: usize,
    trace: bool,
}

impl FramedStream {
    /// Creates a new framed stream.
    ///
    /// `max_line_length` bounds every line read by [`read_line`](Self::read_line),
    /// including its line ending. With `trace` set, every line read and
    /// written is logged at debug level.
    #[must_use]
    pub fn new(stream: SmtpStream, max_line_length: usize, trace: bool) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, stream),
            write_buffer: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            max_line_length,
            trace,
        }
    }

    /// Returns true if the underlying stream is TLS-encrypted.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.reader.get_ref().is_tls()
    }

    /// Reads a single line, without the final `\n` or `\r\n`.
    ///
    /// Fails with [`Error::ConnectionClosed`] if the peer closes the
    /// connection at a line boundary, with an I/O error if it closes
    /// mid-line, and with [`Error::LineTooLong`] if the line does not fit
    /// the configured limit.
    pub async fn read_line(&mut self) -> Result<String> {
        let mut line = Vec::new();

        loop {
            let buf = self.reader.fill_buf().await?;
            if buf.is_empty() {
                if line.is_empty() {
                    return Err(Error::ConnectionClosed);
                }
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-line",
                )));
            }

            let (chunk, done) = match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => (&buf[..=pos], true),
                None => (buf, false),
            };

            if line.len() + chunk.len() > self.max_line_length {
                return Err(Error::LineTooLong {
                    limit: self.max_line_length,
                });
            }

            line.extend_from_slice(chunk);
            let consumed = chunk.len();
            self.reader.consume(consumed);

            if done {
                break;
            }
        }

        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        let line = String::from_utf8_lossy(&line).into_owned();
        if self.trace {
            tracing::debug!("-> {line}");
        }
        Ok(line)
    }

    /// Writes a reply and flushes it.
    pub async fn reply(&mut self, reply: &Reply) -> Result<()> {
        let wire = reply.to_wire();
        if self.trace {
            for line in wire.lines() {
                tracing::debug!("<- {line}");
            }
        }

        self.write_buffer.clear();
        self.write_buffer.extend_from_slice(wire.as_bytes());

        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buffer).await?;
        stream.flush().await?;

        Ok(())
    }

    /// Returns a transparency-decoding reader over the message body.
    ///
    /// The reader shares this stream's read buffer, so bytes already
    /// buffered after the DATA command are part of the body.
    pub fn body_reader(&mut self) -> DotReader<'_, BufReader<SmtpStream>> {
        DotReader::new(&mut self.reader)
    }

    /// Upgrades the connection to TLS in place.
    ///
    /// The old read buffer is dropped, not replayed: anything the client
    /// pipelined after STARTTLS in plaintext never reaches the command loop.
    /// On failure the stream is left plaintext if the TLS stack returned it,
    /// detached otherwise.
    pub async fn upgrade_to_tls(&mut self, upgrader: &dyn StartTls) -> Result<()> {
        let old = std::mem::replace(
            &mut self.reader,
            BufReader::with_capacity(DEFAULT_BUFFER_SIZE, SmtpStream::Detached),
        );

        let discarded = old.buffer().len();
        if discarded > 0 {
            tracing::warn!(discarded, "Discarding plaintext bytes buffered before TLS handshake");
        }

        match old.into_inner().upgrade_to_tls(upgrader).await {
            Ok(stream) => {
                self.reader = BufReader::with_capacity(DEFAULT_BUFFER_SIZE, stream);
                Ok(())
            }
            Err((err, rest)) => {
                self.reader = BufReader::with_capacity(DEFAULT_BUFFER_SIZE, rest);
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for FramedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedStream")
            .field("stream", self.reader.get_ref())
            .field("buffered", &self.reader.buffer().len())
            .field("max_line_length", &self.max_line_length)
            .field("trace", &self.trace)
            .finish()
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
    use crate::connection::stream::{BoxedTransport, HandshakeError};
    use crate::types::ReplyCode;
    use async_trait::async_trait;
    use tokio::io::AsyncReadExt;
    use tokio_test::io::Builder;

    fn framed(mock: tokio_test::io::Mock) -> FramedStream {
        FramedStream::new(SmtpStream::plain(mock), 1000, false)
    }

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

    #[tokio::test]
    async fn test_read_crlf_line() {
        let mock = Builder::new().read(b"EHLO client.example.com\r\n").build();
        let mut framed = framed(mock);

        let line = framed.read_line().await.unwrap();
        assert_eq!(line, "EHLO client.example.com");
    }

    #[tokio::test]
    async fn test_read_bare_lf_line() {
        let mock = Builder::new().read(b"QUIT\n").build();
        let mut framed = framed(mock);

        assert_eq!(framed.read_line().await.unwrap(), "QUIT");
    }

    #[tokio::test]
    async fn test_read_line_split_across_reads() {
        let mock = Builder::new()
            .read(b"MAIL FROM:")
            .read(b"<a@x>\r")
            .read(b"\nRSET\r\n")
            .build();
        let mut framed = framed(mock);

        assert_eq!(framed.read_line().await.unwrap(), "MAIL FROM:<a@x>");
        assert_eq!(framed.read_line().await.unwrap(), "RSET");
    }

    #[tokio::test]
    async fn test_closed_at_line_boundary() {
        let mock = Builder::new().build();
        let mut framed = framed(mock);

        let err = framed.read_line().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_closed_mid_line() {
        let mock = Builder::new().read(b"HELO x").build();
        let mut framed = framed(mock);

        let err = framed.read_line().await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_line_length_limit() {
        let long_line = format!("HELO {}\r\n", "a".repeat(600));
        let mock = Builder::new().read(long_line.as_bytes()).build();
        let mut framed = FramedStream::new(SmtpStream::plain(mock), 512, false);

        let err = framed.read_line().await.unwrap_err();
        assert!(matches!(err, Error::LineTooLong { limit: 512 }));
    }

    #[tokio::test]
    async fn test_line_at_limit_is_accepted() {
        let line = format!("{}\r\n", "a".repeat(510));
        let mock = Builder::new().read(line.as_bytes()).build();
        let mut framed = FramedStream::new(SmtpStream::plain(mock), 512, false);

        assert_eq!(framed.read_line().await.unwrap().len(), 510);
    }

    #[tokio::test]
    async fn test_write_single_reply() {
        let mock = Builder::new().write(b"250 OK\r\n").build();
        let mut framed = framed(mock);

        framed
            .reply(&Reply::single(ReplyCode::OK, "OK"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_write_multiline_reply() {
        let mock = Builder::new()
            .write(b"250-mx.example.com\r\n250 AUTH CRAM-MD5\r\n")
            .build();
        let mut framed = framed(mock);

        let reply = Reply::new(
            ReplyCode::OK,
            vec!["mx.example.com".to_string(), "AUTH CRAM-MD5".to_string()],
        );
        framed.reply(&reply).await.unwrap();
    }

    #[tokio::test]
    async fn test_upgrade_discards_buffered_plaintext() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut framed = FramedStream::new(SmtpStream::plain(server), 1000, false);

        // STARTTLS with a command injected right behind it in the same packet.
        tokio::io::AsyncWriteExt::write_all(&mut client, b"STARTTLS\r\nRSET\r\n")
            .await
            .unwrap();
        assert_eq!(framed.read_line().await.unwrap(), "STARTTLS");

        framed.upgrade_to_tls(&Passthrough).await.unwrap();
        assert!(framed.is_tls());

        tokio::io::AsyncWriteExt::write_all(&mut client, b"EHLO after\r\n")
            .await
            .unwrap();
        assert_eq!(framed.read_line().await.unwrap(), "EHLO after");

        drop(framed);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
