//! Application hooks for SMTP sessions.
//!
//! The session engine owns the protocol; the application decides who may
//! connect, which addresses are accepted and what happens to a message.
//! Each accepted connection gets its own [`Handler`] value, so per-session
//! state (the current envelope, for example) can live in the handler itself.
//!
//! # Example
//!
//! ```
//! use async_trait::async_trait;
//! use mailledger_smtpd::{Handler, HandlerError};
//! use tokio::io::{AsyncRead, AsyncReadExt};
//!
//! #[derive(Default)]
//! struct Inbox {
//!     from: String,
//!     to: Vec<String>,
//! }
//!
//! #[async_trait]
//! impl Handler for Inbox {
//!     async fn sender(&mut self, address: &str) -> Result<(), HandlerError> {
//!         self.from = address.to_string();
//!         Ok(())
//!     }
//!
//!     async fn recipient(&mut self, address: &str) -> Result<(), HandlerError> {
//!         if !address.ends_with("@example.com") {
//!             return Err(HandlerError::from("550 5.7.1 Relaying denied"));
//!         }
//!         self.to.push(address.to_string());
//!         Ok(())
//!     }
//!
//!     async fn message(
//!         &mut self,
//!         body: &mut (dyn AsyncRead + Unpin + Send),
//!     ) -> Result<(), HandlerError> {
//!         let mut data = Vec::new();
//!         body.read_to_end(&mut data)
//!             .await
//!             .map_err(|e| HandlerError::temporary(e.to_string()))?;
//!         self.to.clear();
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::HandlerError;

/// Callbacks invoked by a session, in protocol order.
///
/// Every hook has a default. The defaults accept everything except
/// authentication, which is refused because there is no credential store.
/// A hook error is rendered into the reply for that command; it never ends
/// the session, except from [`connect`](Self::connect).
#[async_trait]
pub trait Handler: Send {
    /// Called once after the connection is accepted, before the greeting.
    ///
    /// An error is sent to the client in place of the greeting and the
    /// session ends.
    async fn connect(&mut self, remote: &str) -> Result<(), HandlerError> {
        let _ = remote;
        Ok(())
    }

    /// Called after a syntactically valid HELO or EHLO.
    async fn hello(&mut self, domain: &str) -> Result<(), HandlerError> {
        let _ = domain;
        Ok(())
    }

    /// Returns the plaintext password for `username`.
    ///
    /// Called by every AUTH mechanism. `identity` is the authorization
    /// identity from PLAIN and is empty for the other mechanisms. CRAM-MD5
    /// needs the password itself to verify the client's digest, so a store
    /// holding only one-way hashes cannot support it.
    async fn auth_user(&mut self, identity: &str, username: &str) -> Result<String, HandlerError> {
        let _ = (identity, username);
        Err(HandlerError::from("535 5.7.8 Authentication not available"))
    }

    /// Called for MAIL FROM. The address is empty for a null reverse-path.
    async fn sender(&mut self, address: &str) -> Result<(), HandlerError> {
        let _ = address;
        Ok(())
    }

    /// Called for each RCPT TO.
    async fn recipient(&mut self, address: &str) -> Result<(), HandlerError> {
        let _ = address;
        Ok(())
    }

    /// Called for DATA with the decoded message body.
    ///
    /// The reader ends at the end-of-data marker. The hook may stop reading
    /// at any point; the session discards whatever is left before replying.
    async fn message(
        &mut self,
        body: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<(), HandlerError> {
        let _ = body;
        Ok(())
    }
}

/// Handler that accepts every envelope and discards every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl Handler for NoopHandler {}

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

    #[tokio::test]
    async fn test_noop_handler_accepts_envelope() {
        let mut handler = NoopHandler;
        assert!(handler.connect("192.0.2.1:25").await.is_ok());
        assert!(handler.hello("client.example.com").await.is_ok());
        assert!(handler.sender("").await.is_ok());
        assert!(handler.recipient("user@example.com").await.is_ok());

        let mut body: &[u8] = b"ignored";
        assert!(handler.message(&mut body).await.is_ok());
    }

    #[tokio::test]
    async fn test_default_auth_is_refused() {
        let mut handler = NoopHandler;
        let err = handler.auth_user("", "user").await.unwrap_err();
        assert_eq!(err.status(), Some(535));
    }
}
