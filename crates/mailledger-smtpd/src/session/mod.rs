//! Per-connection SMTP session.
//!
//! A [`Session`] reads one command line at a time, enforces command
//! ordering and calls the application's [`Handler`] at each step. Commands
//! are processed strictly in order, even when the client pipelines them.
//!
//! ```text
//! connect ─→ 220 greeting
//!              │
//!              ├─ HELO/EHLO ─→ hello()
//!              ├─ STARTTLS  ─→ handshake, re-frame, forget HELO and envelope
//!              ├─ AUTH      ─→ auth_user()
//!              │
//!              └─ MAIL ─→ sender() ─→ RCPT ─→ recipient() ─┬─→ DATA ─→ message()
//!                                      ▲                    │
//!                                      └────────────────────┘
//! ```

mod auth;

use std::sync::Arc;

use crate::command::Command;
use crate::config::Config;
use crate::connection::{FramedStream, SmtpStream};
use crate::error::{HandlerError, Result};
use crate::handler::Handler;
use crate::types::{
    AuthMechanism, Extension, Reply, ReplyCode, parse_forward_path, parse_reverse_path,
};

/// Whether the command loop keeps going after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// State of one SMTP connection.
pub struct Session<H> {
    config: Arc<Config>,
    framed: FramedStream,
    handler: H,
    remote: String,
    client_domain: Option<String>,
    has_sender: bool,
    has_recipient: bool,
    authenticated_user: Option<String>,
}

impl<H: Handler> Session<H> {
    /// Creates a session over an accepted stream.
    pub fn new(config: Arc<Config>, stream: SmtpStream, remote: impl Into<String>, handler: H) -> Self {
        let framed = FramedStream::new(stream, config.max_line_length, config.trace_protocol);
        Self {
            config,
            framed,
            handler,
            remote: remote.into(),
            client_domain: None,
            has_sender: false,
            has_recipient: false,
            authenticated_user: None,
        }
    }

    /// Returns the server hostname.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.config.hostname
    }

    /// Returns the remote endpoint identifier.
    #[must_use]
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Returns the domain the client gave in HELO/EHLO, if any.
    #[must_use]
    pub fn client_domain(&self) -> Option<&str> {
        self.client_domain.as_deref()
    }

    /// Returns true if the transport is encrypted.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.framed.is_tls()
    }

    /// Returns true if MAIL FROM has been accepted for the current transaction.
    #[must_use]
    pub const fn has_sender(&self) -> bool {
        self.has_sender
    }

    /// Returns true if at least one RCPT TO has been accepted.
    #[must_use]
    pub const fn has_recipient(&self) -> bool {
        self.has_recipient
    }

    /// Returns the user authenticated with AUTH, if any.
    #[must_use]
    pub fn authenticated_user(&self) -> Option<&str> {
        self.authenticated_user.as_deref()
    }

    /// Returns the application handler.
    #[must_use]
    pub const fn handler(&self) -> &H {
        &self.handler
    }

    /// Consumes the session and returns the application handler.
    #[must_use]
    pub fn into_handler(self) -> H {
        self.handler
    }

    /// Runs the session until QUIT or until the connection fails.
    ///
    /// Returns `Ok` after QUIT, and after a rejected connect (the rejection
    /// is sent in place of the greeting).
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails or closes, if a line is too
    /// long, or if the STARTTLS handshake fails. No reply is sent in these
    /// cases, except a best-effort `454` after a failed handshake.
    pub async fn run(&mut self) -> Result<()> {
        if let Err(err) = self.handler.connect(&self.remote).await {
            tracing::info!(error = %err, "Connection rejected");
            return self.reply_error(&err).await;
        }
        self.greet().await?;

        loop {
            let line = self.framed.read_line().await?;
            let command = Command::parse(&line);
            if self.dispatch(command).await? == Flow::Quit {
                return Ok(());
            }
        }
    }

    async fn greet(&mut self) -> Result<()> {
        let date = chrono::Local::now()
            .format("%a, %d %b %Y %H:%M:%S %z")
            .to_string();
        let greeting = format!("{} ESMTP {date}", self.config.hostname);
        self.reply(ReplyCode::SERVICE_READY, greeting).await
    }

    async fn dispatch(&mut self, command: Command) -> Result<Flow> {
        match command {
            Command::Helo { domain } => self.hello(domain, false).await?,
            Command::Ehlo { domain } => self.hello(domain, true).await?,
            Command::StartTls => self.starttls().await?,
            Command::Auth {
                mechanism,
                initial_response,
            } => self.auth(&mechanism, initial_response).await?,
            Command::Mail { params } => self.mail(&params).await?,
            Command::Rcpt { params } => self.rcpt(&params).await?,
            Command::Data => self.data().await?,
            Command::Rset => self.rset().await?,
            Command::Quit => {
                let text = format!("{} closing connection", self.config.hostname);
                self.reply(ReplyCode::CLOSING, text).await?;
                return Ok(Flow::Quit);
            }
            Command::Unknown { verb } => {
                self.reply(
                    ReplyCode::SYNTAX_ERROR,
                    format!("unrecognized command: {verb:?}"),
                )
                .await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn hello(&mut self, domain: String, extended: bool) -> Result<()> {
        if domain.is_empty() {
            let verb = if extended { "EHLO" } else { "HELO" };
            return self
                .reply(ReplyCode::PARAMETER_ERROR, format!("Syntax: {verb} hostname"))
                .await;
        }

        if let Err(err) = self.handler.hello(&domain).await {
            tracing::info!(domain = %domain, error = %err, "Greeting rejected");
            return self.reply_error(&err).await;
        }
        tracing::debug!(domain = %domain, extended, "Client greeted");
        self.client_domain = Some(domain);

        if extended {
            let reply = Reply::new(ReplyCode::OK, self.ehlo_lines());
            self.framed.reply(&reply).await
        } else {
            let hostname = self.config.hostname.clone();
            self.reply(ReplyCode::OK, hostname).await
        }
    }

    /// Builds the EHLO reply: hostname, then STARTTLS, AUTH, PIPELINING.
    fn ehlo_lines(&self) -> Vec<String> {
        let encrypted = self.framed.is_tls();
        let mut lines = vec![self.config.hostname.clone()];

        if self.config.tls_available() && !encrypted {
            lines.push(Extension::StartTls.to_string());
        }
        lines.push(Extension::Auth(AuthMechanism::offered(encrypted)).to_string());
        if self.config.pipelining {
            lines.push(Extension::Pipelining.to_string());
        }

        lines
    }

    async fn starttls(&mut self) -> Result<()> {
        let Some(upgrader) = self.config.starttls.clone() else {
            return self
                .reply(ReplyCode::SYNTAX_ERROR, "STARTTLS not supported")
                .await;
        };
        if self.framed.is_tls() {
            return self.reply(ReplyCode::SYNTAX_ERROR, "TLS already in use").await;
        }

        self.reply(ReplyCode::SERVICE_READY, "2.0.0 ready to start TLS")
            .await?;

        if let Err(err) = self.framed.upgrade_to_tls(upgrader.as_ref()).await {
            tracing::warn!(error = %err, "STARTTLS handshake failed");
            if let Err(reply_err) = self
                .reply(ReplyCode::TLS_UNAVAILABLE, "4.7.0 TLS handshake failed")
                .await
            {
                tracing::debug!(error = %reply_err, "Could not report handshake failure");
            }
            return Err(err);
        }

        // The client starts over after the handshake (RFC 3207 Section 4.2).
        self.client_domain = None;
        self.authenticated_user = None;
        self.reset_transaction();
        tracing::info!("STARTTLS completed");
        Ok(())
    }

    async fn mail(&mut self, params: &str) -> Result<()> {
        if self.has_sender {
            return self
                .reply(ReplyCode::BAD_SEQUENCE, "Sender already given")
                .await;
        }
        let Some(address) = parse_reverse_path(params) else {
            return self
                .reply(ReplyCode::PARAMETER_ERROR, "Syntax: MAIL FROM:<address>")
                .await;
        };

        if let Err(err) = self.handler.sender(&address).await {
            tracing::info!(sender = %address, error = %err, "Sender rejected");
            return self.reply_error(&err).await;
        }

        self.has_sender = true;
        tracing::debug!(sender = %address, "Sender accepted");
        self.reply(ReplyCode::OK, "OK").await
    }

    async fn rcpt(&mut self, params: &str) -> Result<()> {
        if !self.has_sender {
            return self
                .reply(ReplyCode::BAD_SEQUENCE, "RCPT TO without MAIL FROM")
                .await;
        }
        let Some(address) = parse_forward_path(params) else {
            return self
                .reply(ReplyCode::PARAMETER_ERROR, "5.5.4 Syntax: RCPT TO:<address>")
                .await;
        };

        if let Err(err) = self.handler.recipient(&address).await {
            tracing::info!(recipient = %address, error = %err, "Recipient rejected");
            return self.reply_error(&err).await;
        }

        self.has_recipient = true;
        tracing::debug!(recipient = %address, "Recipient accepted");
        self.reply(ReplyCode::OK, "OK").await
    }

    async fn data(&mut self) -> Result<()> {
        if !self.has_recipient {
            return self
                .reply(ReplyCode::BAD_SEQUENCE, "DATA without RCPT TO")
                .await;
        }

        self.reply(ReplyCode::START_DATA, "End data with <CR><LF>.<CR><LF>")
            .await?;

        let mut body = self.framed.body_reader();
        let outcome = self.handler.message(&mut body).await;
        // Resynchronize on the next command no matter how much was read.
        let discarded = body.drain().await?;
        if discarded > 0 {
            tracing::debug!(discarded, "Discarded unread message data");
        }

        self.reset_transaction();
        match outcome {
            Ok(()) => {
                tracing::info!("Message accepted");
                self.reply(ReplyCode::OK, "OK").await
            }
            Err(err) => {
                tracing::info!(error = %err, "Message rejected");
                self.reply_error(&err).await
            }
        }
    }

    async fn rset(&mut self) -> Result<()> {
        self.reset_transaction();
        self.reply(ReplyCode::OK, "OK").await
    }

    const fn reset_transaction(&mut self) {
        self.has_sender = false;
        self.has_recipient = false;
    }

    async fn reply(&mut self, code: ReplyCode, text: impl Into<String>) -> Result<()> {
        self.framed.reply(&Reply::single(code, text)).await
    }

    async fn reply_error(&mut self, err: &HandlerError) -> Result<()> {
        self.framed.reply(&Reply::from_handler_error(err)).await
    }
}

impl<H> std::fmt::Debug for Session<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("hostname", &self.config.hostname)
            .field("remote", &self.remote)
            .field("client_domain", &self.client_domain)
            .field("tls", &self.framed.is_tls())
            .field("has_sender", &self.has_sender)
            .field("has_recipient", &self.has_recipient)
            .field("authenticated_user", &self.authenticated_user)
            .finish_non_exhaustive()
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
    use crate::error::Error;
    use async_trait::async_trait;
    use tokio::io::{AsyncRead, AsyncReadExt};
    use tokio_test::io::Builder;

    /// Records what the session reports and rejects selected addresses.
    #[derive(Default)]
    struct Recorder {
        senders: Vec<String>,
        recipients: Vec<String>,
        bodies: Vec<Vec<u8>>,
        reject_connect: bool,
        partial_read: Option<usize>,
    }

    #[async_trait]
    impl Handler for Recorder {
        async fn connect(&mut self, _remote: &str) -> std::result::Result<(), HandlerError> {
            if self.reject_connect {
                return Err(HandlerError::from("554 5.7.1 Go away"));
            }
            Ok(())
        }

        async fn sender(&mut self, address: &str) -> std::result::Result<(), HandlerError> {
            if address == "spam@x" {
                return Err(HandlerError::permanent("5.7.1 Sender blocked"));
            }
            self.senders.push(address.to_string());
            Ok(())
        }

        async fn recipient(&mut self, address: &str) -> std::result::Result<(), HandlerError> {
            if address == "full@x" {
                return Err(HandlerError::temporary("4.2.2 Mailbox full"));
            }
            self.recipients.push(address.to_string());
            Ok(())
        }

        async fn message(
            &mut self,
            body: &mut (dyn AsyncRead + Unpin + Send),
        ) -> std::result::Result<(), HandlerError> {
            let mut data = Vec::new();
            match self.partial_read {
                Some(limit) => {
                    let mut buf = vec![0u8; limit];
                    body.read_exact(&mut buf).await.unwrap();
                    data.extend_from_slice(&buf);
                }
                None => {
                    body.read_to_end(&mut data).await.unwrap();
                }
            }
            self.bodies.push(data);
            Ok(())
        }
    }

    fn session(mock: tokio_test::io::Mock, handler: Recorder) -> Session<Recorder> {
        let config = Arc::new(Config::new("mx.example.com"));
        Session::new(config, SmtpStream::plain(mock), "192.0.2.1:4321", handler)
    }

    async fn send(session: &mut Session<Recorder>, line: &str) -> Flow {
        session.dispatch(Command::parse(line)).await.unwrap()
    }

    #[tokio::test]
    async fn test_connect_rejected() {
        let mock = Builder::new().write(b"554 5.7.1 Go away\r\n").build();
        let handler = Recorder {
            reject_connect: true,
            ..Recorder::default()
        };
        let mut session = session(mock, handler);

        session.run().await.unwrap();
    }

    mod hello_tests {
        use super::*;

        #[tokio::test]
        async fn test_helo() {
            let mock = Builder::new().write(b"250 mx.example.com\r\n").build();
            let mut session = session(mock, Recorder::default());

            send(&mut session, "HELO client.example.com").await;
            assert_eq!(session.client_domain(), Some("client.example.com"));
        }

        #[tokio::test]
        async fn test_helo_requires_domain() {
            let mock = Builder::new()
                .write(b"501 Syntax: HELO hostname\r\n")
                .write(b"501 Syntax: EHLO hostname\r\n")
                .build();
            let mut session = session(mock, Recorder::default());

            send(&mut session, "HELO").await;
            send(&mut session, "EHLO   ").await;
            assert_eq!(session.client_domain(), None);
        }

        #[tokio::test]
        async fn test_ehlo_plaintext() {
            let mock = Builder::new()
                .write(b"250-mx.example.com\r\n250 AUTH CRAM-MD5\r\n")
                .build();
            let mut session = session(mock, Recorder::default());

            send(&mut session, "EHLO client.example.com").await;
        }
    }

    mod transaction_tests {
        use super::*;

        #[tokio::test]
        async fn test_second_mail_rejected() {
            let mock = Builder::new()
                .write(b"250 OK\r\n")
                .write(b"503 Sender already given\r\n")
                .build();
            let mut session = session(mock, Recorder::default());

            send(&mut session, "MAIL FROM:<a@x>").await;
            send(&mut session, "MAIL FROM:<b@x>").await;
            assert!(session.has_sender());
            assert_eq!(session.handler().senders, vec!["a@x".to_string()]);
        }

        #[tokio::test]
        async fn test_mail_syntax() {
            let mock = Builder::new()
                .write(b"501 Syntax: MAIL FROM:<address>\r\n")
                .build();
            let mut session = session(mock, Recorder::default());

            send(&mut session, "MAIL <a@x>").await;
            assert!(!session.has_sender());
        }

        #[tokio::test]
        async fn test_null_sender() {
            let mock = Builder::new().write(b"250 OK\r\n").build();
            let mut session = session(mock, Recorder::default());

            send(&mut session, "mail from:<>").await;
            assert!(session.has_sender());
            assert_eq!(session.handler().senders, vec![String::new()]);
        }

        #[tokio::test]
        async fn test_sender_rejected_by_handler() {
            let mock = Builder::new()
                .write(b"550 5.7.1 Sender blocked\r\n")
                .build();
            let mut session = session(mock, Recorder::default());

            send(&mut session, "MAIL FROM:<spam@x>").await;
            assert!(!session.has_sender());
        }

        #[tokio::test]
        async fn test_rcpt_before_mail() {
            let mock = Builder::new()
                .write(b"503 RCPT TO without MAIL FROM\r\n")
                .build();
            let mut session = session(mock, Recorder::default());

            send(&mut session, "RCPT TO:<b@y>").await;
            assert!(!session.has_recipient());
        }

        #[tokio::test]
        async fn test_rcpt_syntax_and_rejection() {
            let mock = Builder::new()
                .write(b"250 OK\r\n")
                .write(b"501 5.5.4 Syntax: RCPT TO:<address>\r\n")
                .write(b"450 4.2.2 Mailbox full\r\n")
                .write(b"250 OK\r\n")
                .build();
            let mut session = session(mock, Recorder::default());

            send(&mut session, "MAIL FROM:<a@x>").await;
            send(&mut session, "RCPT <b@y>").await;
            send(&mut session, "RCPT TO:<full@x>").await;
            assert!(!session.has_recipient());
            send(&mut session, "RCPT TO: <bad").await;
            assert!(session.has_recipient());
            assert_eq!(session.handler().recipients, vec!["bad".to_string()]);
        }

        #[tokio::test]
        async fn test_data_before_rcpt() {
            let mock = Builder::new()
                .write(b"503 DATA without RCPT TO\r\n")
                .build();
            let mut session = session(mock, Recorder::default());

            send(&mut session, "DATA").await;
        }

        #[tokio::test]
        async fn test_rset_clears_transaction() {
            let mock = Builder::new()
                .write(b"250 OK\r\n")
                .write(b"250 OK\r\n")
                .write(b"250 OK\r\n")
                .write(b"250 OK\r\n")
                .build();
            let mut session = session(mock, Recorder::default());

            send(&mut session, "MAIL FROM:<a@x>").await;
            send(&mut session, "RCPT TO:<b@y>").await;
            send(&mut session, "RSET").await;
            assert!(!session.has_sender());
            assert!(!session.has_recipient());
            send(&mut session, "MAIL FROM:<c@x>").await;
        }

        #[tokio::test]
        async fn test_data_reads_body_and_resets() {
            let mock = Builder::new()
                .write(b"250 OK\r\n")
                .write(b"250 OK\r\n")
                .write(b"354 End data with <CR><LF>.<CR><LF>\r\n")
                .read(b"Subject: hi\r\n\r\n..hello\r\n.\r\n")
                .write(b"250 OK\r\n")
                .build();
            let mut session = session(mock, Recorder::default());

            send(&mut session, "MAIL FROM:<a@x>").await;
            send(&mut session, "RCPT TO:<b@y>").await;
            send(&mut session, "DATA").await;

            assert!(!session.has_sender());
            assert!(!session.has_recipient());
            assert_eq!(
                session.handler().bodies,
                vec![b"Subject: hi\r\n\r\n.hello\r\n".to_vec()]
            );
        }

        #[tokio::test]
        async fn test_partial_read_is_drained() {
            let mock = Builder::new()
                .write(b"250 OK\r\n")
                .write(b"250 OK\r\n")
                .write(b"354 End data with <CR><LF>.<CR><LF>\r\n")
                .read(b"line one\r\nline two\r\n.\r\nQUIT\r\n")
                .write(b"250 OK\r\n")
                .write(b"221 mx.example.com closing connection\r\n")
                .build();
            let handler = Recorder {
                partial_read: Some(4),
                ..Recorder::default()
            };
            let mut session = session(mock, handler);

            send(&mut session, "MAIL FROM:<a@x>").await;
            send(&mut session, "RCPT TO:<b@y>").await;
            send(&mut session, "DATA").await;
            assert_eq!(session.handler().bodies, vec![b"line".to_vec()]);

            let line = session.framed.read_line().await.unwrap();
            assert_eq!(send(&mut session, &line).await, Flow::Quit);
        }

        #[tokio::test]
        async fn test_body_truncated_ends_session() {
            let mock = Builder::new()
                .write(b"250 OK\r\n")
                .write(b"250 OK\r\n")
                .write(b"354 End data with <CR><LF>.<CR><LF>\r\n")
                .read(b"no terminator\r\n")
                .build();
            let handler = Recorder {
                partial_read: Some(2),
                ..Recorder::default()
            };
            let mut session = session(mock, handler);

            send(&mut session, "MAIL FROM:<a@x>").await;
            send(&mut session, "RCPT TO:<b@y>").await;
            let err = session.dispatch(Command::Data).await.unwrap_err();
            assert!(err.is_disconnect());
        }
    }

    mod misc_tests {
        use super::*;

        #[tokio::test]
        async fn test_unknown_verb() {
            let mock = Builder::new()
                .write(b"500 unrecognized command: \"VRFY\"\r\n")
                .build();
            let mut session = session(mock, Recorder::default());

            assert_eq!(send(&mut session, "VRFY postmaster").await, Flow::Continue);
        }

        #[tokio::test]
        async fn test_starttls_not_configured() {
            let mock = Builder::new()
                .write(b"500 STARTTLS not supported\r\n")
                .build();
            let mut session = session(mock, Recorder::default());

            send(&mut session, "STARTTLS").await;
            assert!(!session.is_tls());
        }

        #[tokio::test]
        async fn test_quit() {
            let mock = Builder::new()
                .write(b"221 mx.example.com closing connection\r\n")
                .build();
            let mut session = session(mock, Recorder::default());

            assert_eq!(send(&mut session, "quit").await, Flow::Quit);
        }

        #[tokio::test]
        async fn test_eof_after_greeting_is_disconnect() {
            let (mut client, server) = tokio::io::duplex(1024);
            let config = Arc::new(Config::new("mx.example.com"));
            let mut session = Session::new(
                config,
                SmtpStream::plain(server),
                "peer",
                Recorder::default(),
            );

            let task = tokio::spawn(async move {
                let mut buf = [0u8; 256];
                let n = client.read(&mut buf).await.unwrap();
                assert!(buf[..n].starts_with(b"220 mx.example.com ESMTP "));
            });

            let err = session.run().await.unwrap_err();
            assert!(matches!(err, Error::ConnectionClosed));
            task.await.unwrap();
        }
    }
}
