//! SMTP reply types.

use std::fmt;

use crate::error::{HandlerError, Severity};

/// SMTP reply sent to the client.
///
/// Renders as a single `250 OK` line or, when it has more than one message
/// line, as a multi-line reply (`250-first`, ..., `250 last`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Reply code (e.g., 250).
    pub code: ReplyCode,
    /// Reply message lines.
    pub message: Vec<String>,
}

impl Reply {
    /// Creates a new reply.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec is not const-compatible
    pub fn new(code: ReplyCode, message: Vec<String>) -> Self {
        Self { code, message }
    }

    /// Creates a single-line reply.
    #[must_use]
    pub fn single(code: ReplyCode, text: impl Into<String>) -> Self {
        Self {
            code,
            message: vec![text.into()],
        }
    }

    /// Maps an application error to a reply.
    ///
    /// Errors whose text starts with a status code are sent verbatim.
    /// The rest are wrapped according to their [`Severity`]. Line breaks in
    /// the text become spaces, so the reply is always a single line.
    #[must_use]
    pub fn from_handler_error(err: &HandlerError) -> Self {
        let text = single_line(err.message());
        let text = text.as_str();
        if let Some(code) = err.status() {
            let rest = &text[3..];
            let rest = rest
                .strip_prefix(' ')
                .or_else(|| rest.strip_prefix('-'))
                .unwrap_or(rest);
            return Self::single(ReplyCode::new(code), rest);
        }

        match err.severity() {
            Severity::Unspecified => Self::single(
                ReplyCode::LOCAL_ERROR,
                format!("Requested action aborted: {text}"),
            ),
            Severity::Temporary => Self::single(ReplyCode::MAILBOX_BUSY, text),
            Severity::Permanent => Self::single(ReplyCode::MAILBOX_UNAVAILABLE, text),
        }
    }

    /// Returns true if this is a success reply (2xx).
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code.is_success()
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub const fn is_transient_error(&self) -> bool {
        self.code.is_transient()
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code.is_permanent()
    }

    /// Serializes the reply to wire format, including the final CRLF.
    #[must_use]
    pub fn to_wire(&self) -> String {
        if self.message.is_empty() {
            return format!("{} \r\n", self.code);
        }
        let last = self.message.len() - 1;
        self.message
            .iter()
            .enumerate()
            .map(|(i, line)| {
                let sep = if i == last { ' ' } else { '-' };
                format!("{}{sep}{line}\r\n", self.code)
            })
            .collect()
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_wire().trim_end_matches("\r\n"))
    }
}

/// Replaces CR and LF so application text cannot start a new reply line.
fn single_line(text: &str) -> String {
    text.replace("\r\n", " ").replace(['\r', '\n'], " ")
}

impl From<&HandlerError> for Reply {
    fn from(err: &HandlerError) -> Self {
        Self::from_handler_error(err)
    }
}

/// SMTP reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplyCode(u16);

impl ReplyCode {
    /// Creates a new reply code.
    #[must_use]
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// Returns true if this is a success code (2xx).
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 >= 200 && self.0 < 300
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub const fn is_transient(self) -> bool {
        self.0 >= 400 && self.0 < 500
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent(self) -> bool {
        self.0 >= 500 && self.0 < 600
    }

    /// Returns true if this is an intermediate reply (3xx).
    #[must_use]
    pub const fn is_intermediate(self) -> bool {
        self.0 >= 300 && self.0 < 400
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Reply codes used by the server
impl ReplyCode {
    /// 220 Service ready
    pub const SERVICE_READY: Self = Self(220);
    /// 221 Service closing transmission channel
    pub const CLOSING: Self = Self(221);
    /// 235 Authentication succeeded
    pub const AUTH_SUCCESS: Self = Self(235);
    /// 250 Requested mail action okay, completed
    pub const OK: Self = Self(250);
    /// 334 Continue with authentication
    pub const AUTH_CONTINUE: Self = Self(334);
    /// 354 Start mail input
    pub const START_DATA: Self = Self(354);
    /// 450 Mailbox unavailable (busy)
    pub const MAILBOX_BUSY: Self = Self(450);
    /// 451 Local error in processing
    pub const LOCAL_ERROR: Self = Self(451);
    /// 454 TLS not available due to temporary reason
    pub const TLS_UNAVAILABLE: Self = Self(454);
    /// 500 Syntax error, command unrecognized
    pub const SYNTAX_ERROR: Self = Self(500);
    /// 501 Syntax error in parameters or arguments
    pub const PARAMETER_ERROR: Self = Self(501);
    /// 502 Command not implemented
    pub const NOT_IMPLEMENTED: Self = Self(502);
    /// 503 Bad sequence of commands
    pub const BAD_SEQUENCE: Self = Self(503);
    /// 535 Authentication credentials invalid
    pub const AUTH_FAILED: Self = Self(535);
    /// 550 Mailbox unavailable (not found, access denied)
    pub const MAILBOX_UNAVAILABLE: Self = Self(550);
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

    mod reply_code_tests {
        use super::*;

        #[test]
        fn classes() {
            assert!(ReplyCode::OK.is_success());
            assert!(ReplyCode::AUTH_SUCCESS.is_success());
            assert!(ReplyCode::AUTH_CONTINUE.is_intermediate());
            assert!(ReplyCode::START_DATA.is_intermediate());
            assert!(ReplyCode::LOCAL_ERROR.is_transient());
            assert!(ReplyCode::TLS_UNAVAILABLE.is_transient());
            assert!(ReplyCode::BAD_SEQUENCE.is_permanent());
            assert!(ReplyCode::AUTH_FAILED.is_permanent());
        }

        #[test]
        fn display() {
            assert_eq!(format!("{}", ReplyCode::OK), "250");
            assert_eq!(format!("{}", ReplyCode::SYNTAX_ERROR), "500");
        }
    }

    mod wire_tests {
        use super::*;

        #[test]
        fn single_line() {
            let reply = Reply::single(ReplyCode::OK, "OK");
            assert_eq!(reply.to_wire(), "250 OK\r\n");
            assert_eq!(reply.to_string(), "250 OK");
        }

        #[test]
        fn multi_line() {
            let reply = Reply::new(
                ReplyCode::OK,
                vec![
                    "mx.example.com".to_string(),
                    "STARTTLS".to_string(),
                    "PIPELINING".to_string(),
                ],
            );
            assert_eq!(
                reply.to_wire(),
                "250-mx.example.com\r\n250-STARTTLS\r\n250 PIPELINING\r\n"
            );
        }

        #[test]
        fn empty_text() {
            let reply = Reply::single(ReplyCode::AUTH_CONTINUE, "");
            assert_eq!(reply.to_wire(), "334 \r\n");
            assert_eq!(Reply::new(ReplyCode::OK, vec![]).to_wire(), "250 \r\n");
        }
    }

    mod handler_error_tests {
        use super::*;

        #[test]
        fn verbatim_status() {
            let reply = Reply::from_handler_error(&HandlerError::new("550 Unauthorized"));
            assert_eq!(reply.to_wire(), "550 Unauthorized\r\n");
        }

        #[test]
        fn verbatim_status_wins_over_severity() {
            let err = HandlerError::temporary("554 5.7.1 Rejected");
            assert_eq!(Reply::from(&err).to_string(), "554 5.7.1 Rejected");
        }

        #[test]
        fn unspecified_is_aborted() {
            let reply = Reply::from_handler_error(&HandlerError::new("disk full"));
            assert_eq!(reply.to_string(), "451 Requested action aborted: disk full");
        }

        #[test]
        fn temporary_and_permanent() {
            let reply = Reply::from_handler_error(&HandlerError::temporary("try later"));
            assert_eq!(reply.to_string(), "450 try later");
            assert!(reply.is_transient_error());

            let reply = Reply::from_handler_error(&HandlerError::permanent("go away"));
            assert_eq!(reply.to_string(), "550 go away");
            assert!(reply.is_permanent_error());
        }

        #[test]
        fn line_breaks_cannot_forge_replies() {
            let reply = Reply::from_handler_error(&HandlerError::new("db error\r\n250 OK"));
            assert_eq!(
                reply.to_wire(),
                "451 Requested action aborted: db error 250 OK\r\n"
            );

            let reply = Reply::from_handler_error(&HandlerError::from("550 no\n250 OK\r"));
            assert_eq!(reply.to_wire(), "550 no 250 OK \r\n");

            let reply = Reply::from_handler_error(&HandlerError::temporary("a\rb"));
            assert_eq!(reply.to_wire(), "450 a b\r\n");
        }

        #[test]
        fn digits_without_separator_are_not_a_status() {
            let reply = Reply::from_handler_error(&HandlerError::new("5501 oops"));
            assert_eq!(reply.code, ReplyCode::LOCAL_ERROR);
        }
    }
}
