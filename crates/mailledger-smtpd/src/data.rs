//! Message body decoding.
//!
//! During DATA the client escapes every body line that starts with `.` by
//! doubling the dot, and ends the body with a line holding a single `.`
//! (RFC 5321 Section 4.5.2). [`DotReader`] undoes the escaping and stops at
//! the end marker, leaving the underlying reader positioned on the next
//! command.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf,
};

/// Upper bound on a single read in the line-wise path.
const CHUNK_SIZE: usize = 8192;

/// Decoder position relative to the current body line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// At the start of a line.
    BeginLine,
    /// Saw a leading `.`, withheld.
    Dot,
    /// Saw `.\r` at the start of a line, withheld.
    DotCr,
    /// Inside a line.
    Data,
    /// End marker consumed.
    Eof,
}

/// Transparency-decoding reader over a message body.
///
/// Reading yields the body as the client intended it and reports
/// end-of-stream right after the terminating `.` line. Nothing past the
/// marker is consumed from the inner reader. If the inner reader ends before
/// the marker, reads fail with [`io::ErrorKind::UnexpectedEof`].
///
/// The [`AsyncRead`] implementation works byte by byte. For bulk transfer
/// use [`copy_to`](Self::copy_to), which works a line at a time.
pub struct DotReader<'a, R> {
    inner: &'a mut R,
    state: State,
}

impl<'a, R> DotReader<'a, R>
where
    R: AsyncBufRead + Unpin,
{
    /// Creates a reader positioned at the start of the body.
    pub const fn new(inner: &'a mut R) -> Self {
        Self {
            inner,
            state: State::BeginLine,
        }
    }

    /// Returns true once the end-of-body marker has been consumed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state == State::Eof
    }

    /// Copies the rest of the decoded body into `writer`.
    ///
    /// Returns the number of decoded bytes written. May be called after a
    /// partial read through [`AsyncRead`]; decoding resumes where it left
    /// off.
    ///
    /// # Errors
    ///
    /// Fails if reading or writing fails, or if the input ends before the
    /// end-of-body marker.
    pub async fn copy_to<W>(&mut self, writer: &mut W) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut total = 0u64;
        let mut line = Vec::with_capacity(CHUNK_SIZE);

        loop {
            match self.state {
                State::Eof => return Ok(total),
                State::Dot | State::DotCr => {
                    // Resume a partially decoded line start through the
                    // byte-wise path.
                    let mut byte = [0u8; 1];
                    let n = self.read(&mut byte).await?;
                    writer.write_all(&byte[..n]).await?;
                    total += n as u64;
                }
                State::BeginLine | State::Data => {
                    line.clear();
                    let n = (&mut *self.inner)
                        .take(CHUNK_SIZE as u64)
                        .read_until(b'\n', &mut line)
                        .await?;
                    if n == 0 {
                        return Err(unexpected_eof());
                    }

                    let complete = line.last() == Some(&b'\n');
                    let mut content = line.as_slice();
                    if self.state == State::BeginLine && content.first() == Some(&b'.') {
                        if content == b".\r\n" || content == b".\n" {
                            self.state = State::Eof;
                            return Ok(total);
                        }
                        content = &content[1..];
                    }

                    writer.write_all(content).await?;
                    total += content.len() as u64;
                    self.state = if complete { State::BeginLine } else { State::Data };
                }
            }
        }
    }

    /// Reads and discards the rest of the body.
    ///
    /// # Errors
    ///
    /// Fails if the input ends before the end-of-body marker.
    pub async fn drain(&mut self) -> io::Result<u64> {
        self.copy_to(&mut tokio::io::sink()).await
    }
}

impl<R> AsyncRead for DotReader<'_, R>
where
    R: AsyncBufRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let start = buf.filled().len();

        while this.state != State::Eof && buf.remaining() > 0 {
            let input = match Pin::new(&mut *this.inner).poll_fill_buf(cx) {
                Poll::Ready(Ok(input)) => input,
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending if buf.filled().len() > start => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            };
            if input.is_empty() {
                if buf.filled().len() > start {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(unexpected_eof()));
            }

            let mut consumed = 0;
            while consumed < input.len() && buf.remaining() > 0 {
                let byte = input[consumed];
                match this.state {
                    State::BeginLine => {
                        consumed += 1;
                        match byte {
                            b'.' => this.state = State::Dot,
                            b'\n' => buf.put_slice(&[byte]),
                            _ => {
                                this.state = State::Data;
                                buf.put_slice(&[byte]);
                            }
                        }
                    }
                    State::Dot => {
                        consumed += 1;
                        match byte {
                            b'\r' => this.state = State::DotCr,
                            b'\n' => this.state = State::Eof,
                            _ => {
                                // The dot was an escape; drop it.
                                this.state = State::Data;
                                buf.put_slice(&[byte]);
                            }
                        }
                    }
                    State::DotCr => {
                        if byte == b'\n' {
                            consumed += 1;
                            this.state = State::Eof;
                        } else {
                            // Stray CR after an escape dot. Emit it and
                            // reprocess this byte as line content.
                            this.state = State::Data;
                            buf.put_slice(b"\r");
                        }
                    }
                    State::Data => {
                        consumed += 1;
                        buf.put_slice(&[byte]);
                        if byte == b'\n' {
                            this.state = State::BeginLine;
                        }
                    }
                    State::Eof => break,
                }
            }

            Pin::new(&mut *this.inner).consume(consumed);
        }

        Poll::Ready(Ok(()))
    }
}

impl<R> std::fmt::Debug for DotReader<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DotReader")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn unexpected_eof() -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "connection closed before end of message data",
    )
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
    use std::time::Duration;
    use tokio::io::BufReader;
    use tokio_test::io::Builder;

    async fn decode_bytewise(input: &[u8]) -> io::Result<Vec<u8>> {
        let mut input = input;
        let mut reader = DotReader::new(&mut input);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await?;
        Ok(out)
    }

    async fn decode_linewise(input: &[u8]) -> io::Result<Vec<u8>> {
        let mut input = input;
        let mut reader = DotReader::new(&mut input);
        let mut out = Vec::new();
        reader.copy_to(&mut out).await?;
        Ok(out)
    }

    mod bytewise_tests {
        use super::*;

        #[tokio::test]
        async fn test_plain_body() {
            let out = decode_bytewise(b"Subject: hi\r\n\r\nbody\r\n.\r\n")
                .await
                .unwrap();
            assert_eq!(out, b"Subject: hi\r\n\r\nbody\r\n");
        }

        #[tokio::test]
        async fn test_doubled_dot_is_unstuffed() {
            let out = decode_bytewise(b"..hello\r\n.\r\n").await.unwrap();
            assert_eq!(out, b".hello\r\n");
        }

        #[tokio::test]
        async fn test_dot_inside_line_is_kept() {
            let out = decode_bytewise(b"a.b\r\n..\r\n.\r\n").await.unwrap();
            assert_eq!(out, b"a.b\r\n.\r\n");
        }

        #[tokio::test]
        async fn test_bare_lf_terminator() {
            let out = decode_bytewise(b"line\n.\n").await.unwrap();
            assert_eq!(out, b"line\n");
        }

        #[tokio::test]
        async fn test_empty_body() {
            let out = decode_bytewise(b".\r\n").await.unwrap();
            assert!(out.is_empty());
        }

        #[tokio::test]
        async fn test_dot_cr_without_lf() {
            let out = decode_bytewise(b".\rx\r\n.\r\n").await.unwrap();
            assert_eq!(out, b"\rx\r\n");
        }

        #[tokio::test]
        async fn test_stops_at_marker() {
            let mut input: &[u8] = b"a\r\n.\r\nQUIT\r\n";
            let mut reader = DotReader::new(&mut input);
            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.unwrap();

            assert_eq!(out, b"a\r\n");
            assert!(reader.is_finished());
            assert_eq!(input, b"QUIT\r\n");
        }

        #[tokio::test]
        async fn test_truncated_body() {
            let err = decode_bytewise(b"partial\r\n").await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

            let err = decode_bytewise(b"partial\r\n.\r").await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        }

        #[tokio::test]
        async fn test_small_output_buffer() {
            let mut input: &[u8] = b"..ab\r\n.\r\n";
            let mut reader = DotReader::new(&mut input);
            let mut out = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                let n = reader.read(&mut byte).await.unwrap();
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&byte[..n]);
            }
            assert_eq!(out, b".ab\r\n");
        }

        #[tokio::test]
        async fn test_marker_split_across_reads() {
            let mock = Builder::new()
                .read(b"..he")
                .read(b"llo\r\n.")
                .read(b"\r")
                .read(b"\n")
                .build();
            let mut inner = BufReader::new(mock);
            let mut reader = DotReader::new(&mut inner);
            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.unwrap();
            assert_eq!(out, b".hello\r\n");
        }
    }

    mod linewise_tests {
        use super::*;

        #[tokio::test]
        async fn test_doubled_dot_is_unstuffed() {
            let out = decode_linewise(b"..hello\r\n.\r\n").await.unwrap();
            assert_eq!(out, b".hello\r\n");
        }

        #[tokio::test]
        async fn test_matches_bytewise() {
            let inputs: [&[u8]; 6] = [
                b"Subject: x\r\n\r\nbody\r\n.\r\n",
                b"..\r\n...\r\n.\r\n",
                b".\rx\r\n.\r\n",
                b"\n\n.\n",
                b"a\r\n.b\r\n.\r\n",
                b".\r\r\n.\r\n",
            ];
            for input in inputs {
                assert_eq!(
                    decode_linewise(input).await.unwrap(),
                    decode_bytewise(input).await.unwrap(),
                    "input {:?}",
                    String::from_utf8_lossy(input)
                );
            }
        }

        #[tokio::test]
        async fn test_long_line_crosses_chunks() {
            let mut input = vec![b'x'; CHUNK_SIZE * 2 + 17];
            input.extend_from_slice(b"\r\n");
            let expected = input.clone();
            // A dot right after a chunk boundary is not a line start.
            input.truncate(CHUNK_SIZE);
            input.push(b'.');
            input.extend_from_slice(&expected[CHUNK_SIZE + 1..]);
            input.extend_from_slice(b".\r\n");

            let out = decode_linewise(&input).await.unwrap();
            assert_eq!(out.len(), expected.len());
            assert_eq!(out[CHUNK_SIZE], b'.');
        }

        #[tokio::test]
        async fn test_resumes_after_partial_read() {
            let mut input: &[u8] = b"..x\r\n..y\r\n.\r\nNEXT";
            let mut reader = DotReader::new(&mut input);

            let mut first = [0u8; 1];
            reader.read_exact(&mut first).await.unwrap();
            assert_eq!(&first, b".");

            let mut rest = Vec::new();
            reader.copy_to(&mut rest).await.unwrap();
            assert_eq!(rest, b"x\r\n.y\r\n");
            assert_eq!(input, b"NEXT");
        }

        #[tokio::test]
        async fn test_resumes_from_withheld_dot() {
            let mock = Builder::new()
                .read(b"ab\r\n.")
                .wait(Duration::from_millis(1))
                .read(b".c\r\n.\r\n")
                .build();
            let mut inner = BufReader::new(mock);
            let mut reader = DotReader::new(&mut inner);

            // The read returns at the pause with the leading dot withheld.
            let mut head = [0u8; 16];
            let n = reader.read(&mut head).await.unwrap();
            assert_eq!(&head[..n], b"ab\r\n");
            assert!(!reader.is_finished());

            let mut rest = Vec::new();
            reader.copy_to(&mut rest).await.unwrap();
            assert_eq!(rest, b".c\r\n");
        }

        #[tokio::test]
        async fn test_drain_positions_inner_reader() {
            let mut input: &[u8] = b"ignored\r\n..\r\n.\r\nRSET\r\n";
            let drained = DotReader::new(&mut input).drain().await.unwrap();
            assert_eq!(drained, 12);
            assert_eq!(input, b"RSET\r\n");
        }

        #[tokio::test]
        async fn test_truncated_body() {
            let err = decode_linewise(b"partial").await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        }

        #[tokio::test]
        async fn test_finished_reader_copies_nothing() {
            let mut input: &[u8] = b".\r\nMORE";
            let mut reader = DotReader::new(&mut input);
            assert_eq!(reader.drain().await.unwrap(), 0);
            assert_eq!(reader.drain().await.unwrap(), 0);
            assert_eq!(input, b"MORE");
        }
    }
}
