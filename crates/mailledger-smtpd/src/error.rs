//! Error types for SMTP server sessions.
//!
//! Two families of errors exist:
//!
//! - [`Error`] is fatal for the session. It is returned by I/O on the
//!   transport and always ends the connection, usually without a reply.
//! - [`HandlerError`] is returned by application hooks. It never ends the
//!   session; it is rendered into a protocol reply instead.

use std::io;

/// Result type alias for SMTP server operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Fatal session errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error on the transport.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the connection.
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// A command line exceeded the configured limit.
    #[error("Line exceeds maximum length of {limit} bytes")]
    LineTooLong {
        /// Configured line limit, including CRLF.
        limit: usize,
    },

    /// TLS handshake failed during STARTTLS.
    #[error("TLS handshake failed: {0}")]
    Tls(#[source] io::Error),

    /// Operation attempted on a transport in the wrong state.
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),
}

impl Error {
    /// Returns true if the error means the peer went away.
    ///
    /// This covers orderly closes as well as resets and truncated input.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// How an application failure should be reported when it carries no status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Severity {
    /// No classification; reported as `451 Requested action aborted`.
    #[default]
    Unspecified,
    /// Transient failure; the client may retry later (4xx).
    Temporary,
    /// Permanent failure; the client should not retry (5xx).
    Permanent,
}

/// Error returned by [`Handler`](crate::Handler) hooks.
///
/// If the message starts with a three digit status code it is sent to the
/// client as-is, giving the application full control over the reply:
///
/// ```
/// use mailledger_smtpd::HandlerError;
///
/// let err = HandlerError::from("550 5.1.1 No such user");
/// assert_eq!(err.status(), Some(550));
/// ```
///
/// Otherwise the [`Severity`] decides how the message is wrapped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    severity: Severity,
}

impl HandlerError {
    /// Creates an unclassified error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Unspecified,
        }
    }

    /// Creates an error the client may retry later.
    #[must_use]
    pub fn temporary(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Temporary,
        }
    }

    /// Creates an error the client should not retry.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Permanent,
        }
    }

    /// Returns the error text.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the severity.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        self.severity
    }

    /// Returns true if the error was marked temporary.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.severity == Severity::Temporary
    }

    /// Returns the status code the message starts with, if any.
    ///
    /// A status is exactly three ASCII digits followed by a non-digit.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        leading_status(&self.message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// Parses a leading three digit status code.
pub(crate) fn leading_status(text: &str) -> Option<u16> {
    let bytes = text.as_bytes();
    let (code, rest) = bytes.split_at_checked(3)?;
    if !code.iter().all(u8::is_ascii_digit) {
        return None;
    }
    match rest.first() {
        Some(next) if !next.is_ascii_digit() => {}
        _ => return None,
    }
    std::str::from_utf8(code).ok()?.parse().ok()
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

    #[test]
    fn test_leading_status() {
        assert_eq!(leading_status("550 Unauthorized"), Some(550));
        assert_eq!(leading_status("421-busy"), Some(421));
        assert_eq!(leading_status("250"), None);
        assert_eq!(leading_status("5501 too many digits"), None);
        assert_eq!(leading_status("55 short"), None);
        assert_eq!(leading_status("mailbox full"), None);
        assert_eq!(leading_status(""), None);
    }

    #[test]
    fn test_handler_error_constructors() {
        assert_eq!(HandlerError::new("x").severity(), Severity::Unspecified);
        assert!(HandlerError::temporary("x").is_temporary());
        assert_eq!(HandlerError::permanent("x").severity(), Severity::Permanent);
        assert_eq!(HandlerError::from("boom").to_string(), "boom");
    }

    #[test]
    fn test_is_disconnect() {
        assert!(Error::ConnectionClosed.is_disconnect());
        assert!(Error::Io(io::Error::from(io::ErrorKind::UnexpectedEof)).is_disconnect());
        assert!(!Error::LineTooLong { limit: 1000 }.is_disconnect());
        assert!(!Error::Tls(io::Error::other("bad record")).is_disconnect());
    }

    #[test]
    fn test_error_display() {
        let err = Error::LineTooLong { limit: 512 };
        assert_eq!(err.to_string(), "Line exceeds maximum length of 512 bytes");
    }
}
