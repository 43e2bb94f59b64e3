//! Integration tests for the SMTP server engine.
//!
//! Scripted sessions feed every client line up front through a mock stream,
//! which also exercises pipelining. Dialogs that depend on the server's
//! replies (STARTTLS, CRAM-MD5) run a client over an in-memory duplex pipe.

#![allow(clippy::unwrap_used, clippy::similar_names)]

use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream,
    ReadBuf,
};

use mailledger_smtpd::connection::{BoxedTransport, HandshakeError};
use mailledger_smtpd::sasl::cram_md5_digest;
use mailledger_smtpd::{Config, Error, Handler, HandlerError, Server, StartTls};

/// Mock stream that plays back a client script and captures the replies.
struct MockStream {
    /// Client input (in order).
    script: Cursor<Vec<u8>>,
    /// Replies written by the server.
    sent: Arc<Mutex<Vec<u8>>>,
}

impl MockStream {
    fn new(script: &str) -> (Self, Arc<Mutex<Vec<u8>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let stream = Self {
            script: Cursor::new(script.as_bytes().to_vec()),
            sent: Arc::clone(&sent),
        };
        (stream, sent)
    }
}

impl AsyncRead for MockStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let data = self.script.get_ref();
        let pos = self.script.position() as usize;

        if pos >= data.len() {
            return Poll::Ready(Ok(()));
        }

        let remaining = &data[pos..];
        let to_read = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..to_read]);
        self.script.set_position((pos + to_read) as u64);

        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.sent.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Hook calls observed by the recording handler.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Connect(String),
    Hello(String),
    Sender(String),
    Recipient(String),
    Message(Vec<u8>),
}

/// Handler that records every hook call.
///
/// Rejects `blocked@x` as a sender and `nobody@x` as a recipient, knows the
/// account `alice` / `wonderland`, and fails messages containing `VIRUS`
/// after reading only their first line.
#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl Handler for Recorder {
    async fn connect(&mut self, remote: &str) -> Result<(), HandlerError> {
        self.push(Event::Connect(remote.to_string()));
        Ok(())
    }

    async fn hello(&mut self, domain: &str) -> Result<(), HandlerError> {
        self.push(Event::Hello(domain.to_string()));
        Ok(())
    }

    async fn auth_user(&mut self, _identity: &str, username: &str) -> Result<String, HandlerError> {
        if username == "alice" {
            Ok("wonderland".to_string())
        } else {
            Err(HandlerError::from("535 5.7.8 Unknown user"))
        }
    }

    async fn sender(&mut self, address: &str) -> Result<(), HandlerError> {
        if address == "blocked@x" {
            return Err(HandlerError::permanent("5.7.1 Sender refused"));
        }
        self.push(Event::Sender(address.to_string()));
        Ok(())
    }

    async fn recipient(&mut self, address: &str) -> Result<(), HandlerError> {
        if address == "nobody@x" {
            return Err(HandlerError::from("550 5.1.1 No such user"));
        }
        self.push(Event::Recipient(address.to_string()));
        Ok(())
    }

    async fn message(
        &mut self,
        body: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<(), HandlerError> {
        let mut reader = BufReader::new(body);
        let mut first = String::new();
        reader
            .read_line(&mut first)
            .await
            .map_err(|e| HandlerError::temporary(e.to_string()))?;
        if first.contains("VIRUS") {
            return Err(HandlerError::new("content rejected"));
        }

        let mut data = first.into_bytes();
        reader
            .read_to_end(&mut data)
            .await
            .map_err(|e| HandlerError::temporary(e.to_string()))?;
        self.push(Event::Message(data));
        Ok(())
    }
}

/// Pretends to encrypt by handing the stream back unchanged.
struct Passthrough;

#[async_trait]
impl StartTls for Passthrough {
    async fn handshake(&self, stream: BoxedTransport) -> Result<BoxedTransport, HandshakeError> {
        Ok(stream)
    }
}

/// Fails every handshake but returns the stream.
struct Refuse;

#[async_trait]
impl StartTls for Refuse {
    async fn handshake(&self, stream: BoxedTransport) -> Result<BoxedTransport, HandshakeError> {
        Err(HandshakeError::new(
            io::Error::new(io::ErrorKind::InvalidData, "unexpected message"),
            Some(stream),
        ))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Outcome of a scripted session.
struct Transcript {
    result: mailledger_smtpd::Result<()>,
    replies: Vec<String>,
    events: Vec<Event>,
}

async fn run_script(config: Config, script: &str) -> Transcript {
    init_tracing();
    let (stream, sent) = MockStream::new(script);
    let handler = Recorder::default();
    let server = Server::new(config);

    let result = server.serve(stream, "192.0.2.10:40000", handler.clone()).await;

    let sent = sent.lock().unwrap().clone();
    let replies = String::from_utf8(sent)
        .unwrap()
        .split_terminator("\r\n")
        .map(str::to_string)
        .collect();

    Transcript {
        result,
        replies,
        events: handler.events(),
    }
}

fn config() -> Config {
    Config::builder("mx.example.com").trace_protocol(true).build()
}

mod transaction_tests {
    use super::*;

    #[tokio::test]
    async fn test_full_transaction() {
        let t = run_script(
            config(),
            "EHLO client.example.com\r\n\
             MAIL FROM:<alice@example.com> SIZE=120\r\n\
             RCPT TO:<bob@example.com>\r\n\
             RCPT TO:carol@example.com\r\n\
             DATA\r\n\
             Subject: test\r\n\
             \r\n\
             ..hello\r\n\
             .\r\n\
             QUIT\r\n",
        )
        .await;

        t.result.unwrap();
        assert!(t.replies[0].starts_with("220 mx.example.com ESMTP "));
        assert_eq!(
            &t.replies[1..],
            [
                "250-mx.example.com",
                "250 AUTH CRAM-MD5",
                "250 OK",
                "250 OK",
                "250 OK",
                "354 End data with <CR><LF>.<CR><LF>",
                "250 OK",
                "221 mx.example.com closing connection",
            ]
        );
        assert_eq!(
            t.events,
            [
                Event::Connect("192.0.2.10:40000".to_string()),
                Event::Hello("client.example.com".to_string()),
                Event::Sender("alice@example.com".to_string()),
                Event::Recipient("bob@example.com".to_string()),
                Event::Recipient("carol@example.com".to_string()),
                Event::Message(b"Subject: test\r\n\r\n.hello\r\n".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn test_second_mail_rejected_until_reset() {
        let t = run_script(
            config(),
            "HELO c\r\n\
             MAIL FROM:<a@x>\r\n\
             MAIL FROM:<b@x>\r\n\
             RSET\r\n\
             MAIL FROM:<b@x>\r\n\
             QUIT\r\n",
        )
        .await;

        t.result.unwrap();
        assert_eq!(
            &t.replies[1..],
            [
                "250 mx.example.com",
                "250 OK",
                "503 Sender already given",
                "250 OK",
                "250 OK",
                "221 mx.example.com closing connection",
            ]
        );
    }

    #[tokio::test]
    async fn test_second_mail_after_data_is_accepted() {
        let t = run_script(
            config(),
            "MAIL FROM:<a@x>\r\n\
             RCPT TO:<b@y>\r\n\
             DATA\r\n\
             one\r\n\
             .\r\n\
             MAIL FROM:<c@x>\r\n\
             QUIT\r\n",
        )
        .await;

        assert_eq!(t.replies[5], "250 OK");
        assert_eq!(
            t.events.last(),
            Some(&Event::Sender("c@x".to_string()))
        );
    }

    #[tokio::test]
    async fn test_ordering_violations() {
        let t = run_script(
            config(),
            "RCPT TO:<b@y>\r\n\
             DATA\r\n\
             MAIL FROM:<a@x>\r\n\
             DATA\r\n\
             QUIT\r\n",
        )
        .await;

        assert_eq!(
            &t.replies[1..],
            [
                "503 RCPT TO without MAIL FROM",
                "503 DATA without RCPT TO",
                "250 OK",
                "503 DATA without RCPT TO",
                "221 mx.example.com closing connection",
            ]
        );
    }

    #[tokio::test]
    async fn test_malformed_recipient_is_recovered() {
        let t = run_script(config(), "MAIL FROM:<a@x>\r\nRCPT TO: <bad\r\nQUIT\r\n").await;

        assert_eq!(t.replies[2], "250 OK");
        assert!(t.events.contains(&Event::Recipient("bad".to_string())));
    }

    #[tokio::test]
    async fn test_handler_rejections_are_mapped() {
        let t = run_script(
            config(),
            "MAIL FROM:<blocked@x>\r\n\
             MAIL FROM:<a@x>\r\n\
             RCPT TO:<nobody@x>\r\n\
             DATA\r\n\
             QUIT\r\n",
        )
        .await;

        assert_eq!(
            &t.replies[1..],
            [
                "550 5.7.1 Sender refused",
                "250 OK",
                "550 5.1.1 No such user",
                "503 DATA without RCPT TO",
                "221 mx.example.com closing connection",
            ]
        );
    }

    #[tokio::test]
    async fn test_rejected_message_is_drained() {
        let t = run_script(
            config(),
            "MAIL FROM:<a@x>\r\n\
             RCPT TO:<b@y>\r\n\
             DATA\r\n\
             VIRUS inside\r\n\
             QUIT\r\n\
             .\r\n\
             RSET\r\n\
             QUIT\r\n",
        )
        .await;

        t.result.unwrap();
        assert_eq!(
            &t.replies[3..],
            [
                "354 End data with <CR><LF>.<CR><LF>",
                "451 Requested action aborted: content rejected",
                "250 OK",
                "221 mx.example.com closing connection",
            ]
        );
    }
}

mod protocol_tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_command() {
        let t = run_script(config(), "VRFY postmaster\r\nnoop\r\nQUIT\r\n").await;

        assert_eq!(t.replies[1], "500 unrecognized command: \"VRFY\"");
        assert_eq!(t.replies[2], "500 unrecognized command: \"noop\"");
    }

    #[tokio::test]
    async fn test_verbs_are_case_insensitive() {
        let t = run_script(config(), "helo c\r\nmail from:<a@x>\r\nquit\r\n").await;

        t.result.unwrap();
        assert_eq!(t.replies[1], "250 mx.example.com");
        assert_eq!(t.replies[2], "250 OK");
    }

    #[tokio::test]
    async fn test_ehlo_advertises_configured_extensions() {
        let config = Config::builder("mx.example.com")
            .starttls(Passthrough)
            .pipelining(true)
            .build();
        let t = run_script(config, "EHLO c\r\nQUIT\r\n").await;

        assert_eq!(
            &t.replies[1..5],
            [
                "250-mx.example.com",
                "250-STARTTLS",
                "250-AUTH CRAM-MD5",
                "250 PIPELINING",
            ]
        );
    }

    #[tokio::test]
    async fn test_plain_and_login_refused_without_tls() {
        let t = run_script(
            config(),
            "AUTH PLAIN AGFsaWNlAHdvbmRlcmxhbmQ=\r\nAUTH LOGIN\r\nQUIT\r\n",
        )
        .await;

        assert_eq!(t.replies[1], "502 AUTH PLAIN not allowed, use STARTTLS first");
        assert_eq!(t.replies[2], "502 AUTH LOGIN not allowed, use STARTTLS first");
    }

    #[tokio::test]
    async fn test_line_too_long_ends_session_silently() {
        let config = Config::builder("mx.example.com").max_line_length(64).build();
        let script = format!("HELO {}\r\nQUIT\r\n", "a".repeat(100));
        let t = run_script(config, &script).await;

        assert!(matches!(t.result, Err(Error::LineTooLong { limit: 64 })));
        assert_eq!(t.replies.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_without_quit() {
        let t = run_script(config(), "HELO c\r\n").await;

        let err = t.result.unwrap_err();
        assert!(err.is_disconnect());
        assert_eq!(t.replies.len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_mid_body() {
        let t = run_script(
            config(),
            "MAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\nDATA\r\nhalf a message\r\n",
        )
        .await;

        assert!(t.result.unwrap_err().is_disconnect());
        assert!(!t.events.iter().any(|e| matches!(e, Event::Message(_))));
    }
}

mod starttls_tests {
    use super::*;

    /// Client end of a duplex pipe.
    struct Client {
        stream: BufReader<DuplexStream>,
    }

    impl Client {
        async fn line(&mut self) -> String {
            let mut line = String::new();
            self.stream.read_line(&mut line).await.unwrap();
            line.trim_end().to_string()
        }

        /// Reads one possibly multi-line reply.
        async fn reply(&mut self) -> Vec<String> {
            let mut lines = Vec::new();
            loop {
                let line = self.line().await;
                let last = line.as_bytes().get(3) != Some(&b'-');
                lines.push(line);
                if last {
                    return lines;
                }
            }
        }

        async fn send(&mut self, line: &str) {
            self.stream
                .get_mut()
                .write_all(format!("{line}\r\n").as_bytes())
                .await
                .unwrap();
        }
    }

    fn start(config: Config) -> (Client, tokio::task::JoinHandle<mailledger_smtpd::Result<()>>) {
        init_tracing();
        let (client, server_end) = tokio::io::duplex(8192);
        let server = Server::new(config);
        let task = tokio::spawn(async move {
            server.serve(server_end, "198.51.100.1:587", Recorder::default()).await
        });
        (
            Client {
                stream: BufReader::new(client),
            },
            task,
        )
    }

    #[tokio::test]
    async fn test_upgrade_changes_advertised_mechanisms() {
        let (mut client, task) = start(
            Config::builder("mx.example.com")
                .starttls(Passthrough)
                .trace_protocol(true)
                .build(),
        );
        assert!(client.line().await.starts_with("220 "));

        client.send("EHLO c").await;
        assert_eq!(
            client.reply().await,
            ["250-mx.example.com", "250-STARTTLS", "250 AUTH CRAM-MD5"]
        );

        client.send("STARTTLS").await;
        assert_eq!(client.line().await, "220 2.0.0 ready to start TLS");

        client.send("EHLO c").await;
        assert_eq!(client.reply().await, ["250-mx.example.com", "250 AUTH PLAIN LOGIN"]);

        client.send("STARTTLS").await;
        assert_eq!(client.line().await, "500 TLS already in use");

        let credentials = STANDARD.encode(b"\0alice\0wonderland");
        client.send(&format!("AUTH PLAIN {credentials}")).await;
        assert_eq!(client.line().await, "235 2.7.0 Authentication successful");

        client.send("AUTH LOGIN").await;
        assert_eq!(client.line().await, "334 VXNlcm5hbWU6");
        client.send("YWxpY2U=").await;
        assert_eq!(client.line().await, "334 UGFzc3dvcmQ6");
        client.send("d3Jvbmc=").await;
        assert_eq!(client.line().await, "535 5.7.8 Authentication credentials invalid");

        client.send("QUIT").await;
        assert_eq!(client.line().await, "221 mx.example.com closing connection");
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_plaintext_injection_is_discarded() {
        let config = Config::builder("mx.example.com").starttls(Passthrough).build();
        let t = run_script(config, "EHLO c\r\nSTARTTLS\r\nMAIL FROM:<evil@x>\r\nQUIT\r\n").await;

        assert_eq!(t.replies.last().map(String::as_str), Some("220 2.0.0 ready to start TLS"));
        assert!(t.result.unwrap_err().is_disconnect());
        assert!(!t.events.iter().any(|e| matches!(e, Event::Sender(_))));
    }

    #[tokio::test]
    async fn test_starttls_forgets_envelope() {
        let (mut client, task) = start(Config::builder("mx.example.com").starttls(Passthrough).build());
        client.line().await;

        client.send("MAIL FROM:<a@x>").await;
        assert_eq!(client.line().await, "250 OK");
        client.send("STARTTLS").await;
        assert_eq!(client.line().await, "220 2.0.0 ready to start TLS");
        client.send("RCPT TO:<b@y>").await;
        assert_eq!(client.line().await, "503 RCPT TO without MAIL FROM");

        client.send("QUIT").await;
        client.line().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_handshake_ends_session() {
        let config = Config::builder("mx.example.com").starttls(Refuse).build();
        let t = run_script(config, "STARTTLS\r\nQUIT\r\n").await;

        assert_eq!(
            &t.replies[1..],
            ["220 2.0.0 ready to start TLS", "454 4.7.0 TLS handshake failed"]
        );
        assert!(matches!(t.result, Err(Error::Tls(_))));
    }

    #[tokio::test]
    async fn test_not_configured() {
        let t = run_script(config(), "STARTTLS\r\nQUIT\r\n").await;
        assert_eq!(t.replies[1], "500 STARTTLS not supported");
    }

    #[tokio::test]
    async fn test_cram_md5_over_plaintext() {
        let (mut client, task) = start(config());
        client.line().await;

        client.send("AUTH CRAM-MD5").await;
        let reply = client.line().await;
        let challenge = STANDARD.decode(reply.strip_prefix("334 ").unwrap()).unwrap();
        let challenge = String::from_utf8(challenge).unwrap();
        assert!(challenge.starts_with('<') && challenge.ends_with("@mx.example.com>"));

        let digest = cram_md5_digest("wonderland", &challenge);
        client.send(&STANDARD.encode(format!("alice {digest}"))).await;
        assert_eq!(client.line().await, "235 2.7.0 Authentication successful");

        client.send("AUTH CRAM-MD5").await;
        client.line().await;
        client.send("*").await;
        assert_eq!(client.line().await, "501 Authentication cancelled");

        client.send("QUIT").await;
        client.line().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_client_hangup_is_disconnect() {
        let (mut client, task) = start(config());
        client.line().await;
        drop(client);

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_partial_body_read_then_next_command() {
        let (mut client, task) = start(config());
        client.line().await;

        for line in ["MAIL FROM:<a@x>", "RCPT TO:<b@y>"] {
            client.send(line).await;
            assert_eq!(client.line().await, "250 OK");
        }
        client.send("DATA").await;
        assert_eq!(client.line().await, "354 End data with <CR><LF>.<CR><LF>");
        client.send("VIRUS\r\nmore\r\n..\r\n.").await;
        assert_eq!(client.line().await, "451 Requested action aborted: content rejected");

        client.send("RSET").await;
        assert_eq!(client.line().await, "250 OK");
        client.send("QUIT").await;
        client.line().await;
        task.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_message_reader_sees_only_body() {
    let mut body = Vec::new();
    let mut input: &[u8] = b"line\r\n.\r\nQUIT\r\n";
    let mut reader = mailledger_smtpd::data::DotReader::new(&mut input);
    reader.read_to_end(&mut body).await.unwrap();

    assert_eq!(body, b"line\r\n");
    assert_eq!(input, b"QUIT\r\n");
}
