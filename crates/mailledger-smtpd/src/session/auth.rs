//! AUTH command dialogs.

use super::Session;
use crate::error::{Error, HandlerError, Result};
use crate::handler::Handler;
use crate::sasl::{self, AuthError};
use crate::types::{AuthMechanism, Reply, ReplyCode};

/// Why an AUTH dialog stopped early.
enum Abort {
    /// Rejected; reported to the client, the session goes on.
    Rejected(AuthError),
    /// Transport failure; ends the session.
    Fatal(Error),
}

impl From<AuthError> for Abort {
    fn from(err: AuthError) -> Self {
        Self::Rejected(err)
    }
}

impl From<HandlerError> for Abort {
    fn from(err: HandlerError) -> Self {
        Self::Rejected(AuthError::Handler(err))
    }
}

impl From<Error> for Abort {
    fn from(err: Error) -> Self {
        Self::Fatal(err)
    }
}

type Outcome = std::result::Result<String, Abort>;

impl<H: Handler> Session<H> {
    pub(super) async fn auth(
        &mut self,
        mechanism: &str,
        initial_response: Option<String>,
    ) -> Result<()> {
        let Some(mechanism) = AuthMechanism::parse(mechanism) else {
            return self
                .reply(ReplyCode::NOT_IMPLEMENTED, "Unknown authentication mechanism")
                .await;
        };
        if mechanism.requires_tls() && !self.framed.is_tls() {
            return self
                .reply(
                    ReplyCode::NOT_IMPLEMENTED,
                    format!("AUTH {mechanism} not allowed, use STARTTLS first"),
                )
                .await;
        }

        let outcome = match mechanism {
            AuthMechanism::Plain => self.auth_plain(initial_response).await,
            AuthMechanism::Login => self.auth_login(initial_response).await,
            AuthMechanism::CramMd5 => self.auth_cram_md5(initial_response).await,
        };

        match outcome {
            Ok(username) => {
                tracing::info!(user = %username, %mechanism, "Authentication succeeded");
                self.authenticated_user = Some(username);
                self.reply(ReplyCode::AUTH_SUCCESS, "2.7.0 Authentication successful")
                    .await
            }
            Err(Abort::Rejected(err)) => {
                tracing::info!(%mechanism, error = %err, "Authentication failed");
                self.framed.reply(&err.reply()).await
            }
            Err(Abort::Fatal(err)) => Err(err),
        }
    }

    /// PLAIN: one response holding `identity NUL username NUL password`.
    async fn auth_plain(&mut self, initial_response: Option<String>) -> Outcome {
        let data = match initial_response {
            // An undecodable inline payload counts as malformed credentials.
            Some(response) => sasl::decode_initial_response(&response)
                .map_err(|_| AuthError::Malformed)?,
            None => {
                self.framed
                    .reply(&Reply::single(ReplyCode::AUTH_CONTINUE, ""))
                    .await?;
                self.read_response().await?
            }
        };

        let credentials = sasl::decode_plain(&data)?;
        self.check_password(
            &credentials.identity,
            &credentials.username,
            &credentials.password,
        )
        .await
    }

    /// LOGIN: prompt for the username, then for the password.
    ///
    /// Always two-step; a value sent on the AUTH line is ignored.
    async fn auth_login(&mut self, initial_response: Option<String>) -> Outcome {
        if initial_response.is_some() {
            tracing::debug!("Ignoring initial response for AUTH LOGIN");
        }

        self.reply(ReplyCode::AUTH_CONTINUE, sasl::LOGIN_USERNAME_PROMPT)
            .await?;
        let username = sasl::decode_login_field(self.read_response().await?)?;

        self.reply(ReplyCode::AUTH_CONTINUE, sasl::LOGIN_PASSWORD_PROMPT)
            .await?;
        let password = sasl::decode_login_field(self.read_response().await?)?;

        self.check_password("", &username, &password).await
    }

    /// CRAM-MD5: send a fresh challenge, verify the keyed digest.
    async fn auth_cram_md5(&mut self, initial_response: Option<String>) -> Outcome {
        // The server speaks first in CRAM-MD5.
        if initial_response.is_some() {
            return Err(AuthError::Malformed.into());
        }

        let challenge = sasl::cram_md5_challenge(&self.config.hostname);
        self.reply(ReplyCode::AUTH_CONTINUE, sasl::encode_challenge(&challenge))
            .await?;

        let data = self.read_response().await?;
        let (username, digest) = sasl::decode_cram_md5(&data)?;

        let password = self.handler.auth_user("", &username).await?;
        if !sasl::verify_cram_md5(&password, &challenge, &digest) {
            return Err(AuthError::InvalidCredentials.into());
        }
        Ok(username)
    }

    async fn read_response(&mut self) -> std::result::Result<Vec<u8>, Abort> {
        let line = self.framed.read_line().await?;
        Ok(sasl::decode_response(&line)?)
    }

    async fn check_password(&mut self, identity: &str, username: &str, password: &str) -> Outcome {
        let expected = self.handler.auth_user(identity, username).await?;
        if !sasl::passwords_match(&expected, password) {
            return Err(AuthError::InvalidCredentials.into());
        }
        Ok(username.to_string())
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
    use std::sync::Arc;

    use async_trait::async_trait;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;
    use crate::command::Command;
    use crate::config::Config;
    use crate::connection::{BoxedTransport, HandshakeError, SmtpStream, StartTls};

    struct Accounts;

    #[async_trait]
    impl Handler for Accounts {
        async fn auth_user(
            &mut self,
            _identity: &str,
            username: &str,
        ) -> std::result::Result<String, HandlerError> {
            match username {
                "alice" => Ok("wonderland".to_string()),
                "down" => Err(HandlerError::temporary("4.7.0 Directory unavailable")),
                _ => Err(HandlerError::from("535 5.7.8 No such user")),
            }
        }
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

    /// Session on one end of a duplex pipe, client on the other.
    fn pair(tls: bool) -> (Session<Accounts>, BufReader<tokio::io::DuplexStream>) {
        let (client, server) = tokio::io::duplex(4096);
        let config = Arc::new(Config::new("mx.example.com"));
        let stream = if tls {
            SmtpStream::Tls(Box::new(server))
        } else {
            SmtpStream::plain(server)
        };
        let session = Session::new(config, stream, "peer", Accounts);
        (session, BufReader::new(client))
    }

    async fn read_reply(client: &mut BufReader<tokio::io::DuplexStream>) -> String {
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    async fn auth(session: &mut Session<Accounts>, line: &str) {
        let Command::Auth {
            mechanism,
            initial_response,
        } = Command::parse(line)
        else {
            panic!("not an AUTH command: {line}");
        };
        session.auth(&mechanism, initial_response).await.unwrap();
    }

    mod plain_tests {
        use super::*;

        #[tokio::test]
        async fn test_refused_without_tls() {
            let (mut session, mut client) = pair(false);
            auth(&mut session, "AUTH PLAIN AGFsaWNlAHdvbmRlcmxhbmQ=").await;
            assert_eq!(
                read_reply(&mut client).await,
                "502 AUTH PLAIN not allowed, use STARTTLS first"
            );
            assert_eq!(session.authenticated_user(), None);
        }

        #[tokio::test]
        async fn test_inline_credentials() {
            let (mut session, mut client) = pair(true);
            let response = STANDARD.encode(b"\0alice\0wonderland");
            auth(&mut session, &format!("AUTH PLAIN {response}")).await;
            assert_eq!(
                read_reply(&mut client).await,
                "235 2.7.0 Authentication successful"
            );
            assert_eq!(session.authenticated_user(), Some("alice"));
        }

        #[tokio::test]
        async fn test_out_of_line_credentials() {
            let (mut session, mut client) = pair(true);
            let response = STANDARD.encode(b"\0alice\0wonderland");
            client
                .get_mut()
                .write_all(format!("{response}\r\n").as_bytes())
                .await
                .unwrap();

            auth(&mut session, "AUTH PLAIN").await;
            assert_eq!(read_reply(&mut client).await, "334");
            assert_eq!(
                read_reply(&mut client).await,
                "235 2.7.0 Authentication successful"
            );
        }

        #[tokio::test]
        async fn test_wrong_password() {
            let (mut session, mut client) = pair(true);
            let response = STANDARD.encode(b"\0alice\0looking-glass");
            auth(&mut session, &format!("AUTH PLAIN {response}")).await;
            assert_eq!(
                read_reply(&mut client).await,
                "535 5.7.8 Authentication credentials invalid"
            );
            assert_eq!(session.authenticated_user(), None);
        }

        #[tokio::test]
        async fn test_malformed_payload() {
            let (mut session, mut client) = pair(true);
            let response = STANDARD.encode(b"alice\0wonderland");
            auth(&mut session, &format!("AUTH PLAIN {response}")).await;
            assert_eq!(
                read_reply(&mut client).await,
                "502 Couldn't decode your credentials"
            );
        }

        #[tokio::test]
        async fn test_inline_bad_encoding_is_malformed() {
            let (mut session, mut client) = pair(true);
            auth(&mut session, "AUTH PLAIN %%%notbase64").await;
            assert_eq!(
                read_reply(&mut client).await,
                "502 Couldn't decode your credentials"
            );
            assert_eq!(session.authenticated_user(), None);
        }

        #[tokio::test]
        async fn test_cancelled() {
            let (mut session, mut client) = pair(true);
            client.get_mut().write_all(b"*\r\n").await.unwrap();

            auth(&mut session, "AUTH PLAIN").await;
            assert_eq!(read_reply(&mut client).await, "334");
            assert_eq!(read_reply(&mut client).await, "501 Authentication cancelled");
        }

        #[tokio::test]
        async fn test_handler_error_is_mapped() {
            let (mut session, mut client) = pair(true);
            let response = STANDARD.encode(b"\0down\0x");
            auth(&mut session, &format!("AUTH PLAIN {response}")).await;
            assert_eq!(
                read_reply(&mut client).await,
                "450 4.7.0 Directory unavailable"
            );
        }
    }

    mod login_tests {
        use super::*;

        #[tokio::test]
        async fn test_refused_without_tls() {
            let (mut session, mut client) = pair(false);
            auth(&mut session, "AUTH LOGIN").await;
            assert_eq!(
                read_reply(&mut client).await,
                "502 AUTH LOGIN not allowed, use STARTTLS first"
            );
        }

        #[tokio::test]
        async fn test_two_step_dialog() {
            let (mut session, mut client) = pair(true);
            client
                .get_mut()
                .write_all(b"YWxpY2U=\r\nd29uZGVybGFuZA==\r\n")
                .await
                .unwrap();

            auth(&mut session, "AUTH LOGIN").await;
            assert_eq!(read_reply(&mut client).await, "334 VXNlcm5hbWU6");
            assert_eq!(read_reply(&mut client).await, "334 UGFzc3dvcmQ6");
            assert_eq!(
                read_reply(&mut client).await,
                "235 2.7.0 Authentication successful"
            );
            assert_eq!(session.authenticated_user(), Some("alice"));
        }

        #[tokio::test]
        async fn test_initial_response_still_prompts_for_username() {
            let (mut session, mut client) = pair(true);
            client
                .get_mut()
                .write_all(b"YWxpY2U=\r\nd29uZGVybGFuZA==\r\n")
                .await
                .unwrap();

            auth(&mut session, "AUTH LOGIN dXNlcg==").await;
            assert_eq!(read_reply(&mut client).await, "334 VXNlcm5hbWU6");
            assert_eq!(read_reply(&mut client).await, "334 UGFzc3dvcmQ6");
            assert_eq!(
                read_reply(&mut client).await,
                "235 2.7.0 Authentication successful"
            );
            assert_eq!(session.authenticated_user(), Some("alice"));
        }

        #[tokio::test]
        async fn test_bad_encoding() {
            let (mut session, mut client) = pair(true);
            client.get_mut().write_all(b"%%%\r\n").await.unwrap();

            auth(&mut session, "AUTH LOGIN").await;
            assert_eq!(read_reply(&mut client).await, "334 VXNlcm5hbWU6");
            assert_eq!(read_reply(&mut client).await, "501 Invalid base64 encoding");
        }

        #[tokio::test]
        async fn test_disconnect_mid_dialog_is_fatal() {
            let (mut session, client) = pair(true);
            drop(client);

            let err = session.auth("LOGIN", None).await.unwrap_err();
            assert!(err.is_disconnect() || matches!(err, Error::Io(_)));
        }
    }

    mod cram_md5_tests {
        use super::*;

        async fn challenge(client: &mut BufReader<tokio::io::DuplexStream>) -> String {
            let reply = read_reply(client).await;
            let encoded = reply.strip_prefix("334 ").unwrap();
            String::from_utf8(STANDARD.decode(encoded).unwrap()).unwrap()
        }

        #[tokio::test]
        async fn test_allowed_without_tls() {
            let (mut session, mut client) = pair(false);
            let task = tokio::spawn(async move {
                let challenge = challenge(&mut client).await;
                assert!(challenge.ends_with("@mx.example.com>"));
                let digest = sasl::cram_md5_digest("wonderland", &challenge);
                let response = STANDARD.encode(format!("alice {digest}"));
                client
                    .get_mut()
                    .write_all(format!("{response}\r\n").as_bytes())
                    .await
                    .unwrap();
                read_reply(&mut client).await
            });

            session.auth("CRAM-MD5", None).await.unwrap();
            assert_eq!(task.await.unwrap(), "235 2.7.0 Authentication successful");
            assert_eq!(session.authenticated_user(), Some("alice"));
        }

        #[tokio::test]
        async fn test_wrong_digest() {
            let (mut session, mut client) = pair(false);
            let task = tokio::spawn(async move {
                let challenge = challenge(&mut client).await;
                let digest = sasl::cram_md5_digest("wonderlanD", &challenge);
                let response = STANDARD.encode(format!("alice {digest}"));
                client
                    .get_mut()
                    .write_all(format!("{response}\r\n").as_bytes())
                    .await
                    .unwrap();
                read_reply(&mut client).await
            });

            session.auth("cram-md5", None).await.unwrap();
            assert_eq!(
                task.await.unwrap(),
                "535 5.7.8 Authentication credentials invalid"
            );
            assert_eq!(session.authenticated_user(), None);
        }

        #[tokio::test]
        async fn test_initial_response_rejected() {
            let (mut session, mut client) = pair(false);
            auth(&mut session, "AUTH CRAM-MD5 YWxpY2U=").await;
            assert_eq!(
                read_reply(&mut client).await,
                "502 Couldn't decode your credentials"
            );
        }
    }

    #[tokio::test]
    async fn test_unknown_mechanism() {
        let (mut session, mut client) = pair(true);
        auth(&mut session, "AUTH GSSAPI").await;
        assert_eq!(
            read_reply(&mut client).await,
            "502 Unknown authentication mechanism"
        );
    }

    #[tokio::test]
    async fn test_starttls_enables_plain() {
        let (client, server) = tokio::io::duplex(4096);
        let config = Arc::new(Config::builder("mx.example.com").starttls(Passthrough).build());
        let mut session = Session::new(config, SmtpStream::plain(server), "peer", Accounts);
        let mut client = BufReader::new(client);

        session.dispatch(Command::StartTls).await.unwrap();
        assert_eq!(read_reply(&mut client).await, "220 2.0.0 ready to start TLS");
        assert!(session.is_tls());

        let response = STANDARD.encode(b"\0alice\0wonderland");
        auth(&mut session, &format!("AUTH PLAIN {response}")).await;
        assert_eq!(
            read_reply(&mut client).await,
            "235 2.7.0 Authentication successful"
        );
    }
}
