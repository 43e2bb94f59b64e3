//! SMTP command parser.

/// SMTP command received from a client.
///
/// Only the verb is interpreted here. Argument syntax is checked by the
/// session, because ordering errors take precedence over syntax errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// HELO - Simple greeting
    Helo {
        /// Client-declared domain (may be empty)
        domain: String,
    },
    /// EHLO - Extended greeting
    Ehlo {
        /// Client-declared domain (may be empty)
        domain: String,
    },
    /// STARTTLS - Upgrade to TLS
    StartTls,
    /// AUTH - Begin authentication
    Auth {
        /// Mechanism name as sent by the client
        mechanism: String,
        /// Initial response (optional, for SASL-IR)
        initial_response: Option<String>,
    },
    /// MAIL - Start mail transaction
    Mail {
        /// Raw parameters, starting with `FROM:`
        params: String,
    },
    /// RCPT - Add recipient
    Rcpt {
        /// Raw parameters, starting with `TO:`
        params: String,
    },
    /// DATA - Begin message data
    Data,
    /// RSET - Reset transaction
    Rset,
    /// QUIT - Close connection
    Quit,
    /// Any other verb
    Unknown {
        /// Verb as sent by the client
        verb: String,
    },
}

impl Command {
    /// Parses a command line (without CRLF).
    ///
    /// The line is trimmed, split at the first space, and the verb is
    /// matched case-insensitively.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let (verb, params) = split_first_space(line.trim());

        match verb.to_ascii_uppercase().as_str() {
            "HELO" => Self::Helo {
                domain: params.to_string(),
            },
            "EHLO" => Self::Ehlo {
                domain: params.to_string(),
            },
            "STARTTLS" => Self::StartTls,
            "AUTH" => {
                let (mechanism, credentials) = split_first_space(params);
                Self::Auth {
                    mechanism: mechanism.to_string(),
                    initial_response: (!credentials.is_empty()).then(|| credentials.to_string()),
                }
            }
            "MAIL" => Self::Mail {
                params: params.to_string(),
            },
            "RCPT" => Self::Rcpt {
                params: params.to_string(),
            },
            "DATA" => Self::Data,
            "RSET" => Self::Rset,
            "QUIT" => Self::Quit,
            _ => Self::Unknown {
                verb: verb.to_string(),
            },
        }
    }
}

/// Splits at the first space. The remainder is empty if there is no space.
pub(crate) fn split_first_space(s: &str) -> (&str, &str) {
    s.split_once(' ').unwrap_or((s, ""))
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
    fn test_helo_command() {
        assert_eq!(
            Command::parse("HELO client.example.com"),
            Command::Helo {
                domain: "client.example.com".to_string()
            }
        );
    }

    #[test]
    fn test_ehlo_lowercase_verb() {
        assert_eq!(
            Command::parse("ehlo client.example.com"),
            Command::Ehlo {
                domain: "client.example.com".to_string()
            }
        );
    }

    #[test]
    fn test_ehlo_without_domain() {
        assert_eq!(
            Command::parse("EHLO"),
            Command::Ehlo {
                domain: String::new()
            }
        );
    }

    #[test]
    fn test_line_is_trimmed() {
        assert_eq!(Command::parse("  QUIT  "), Command::Quit);
        assert_eq!(Command::parse("data\t"), Command::Data);
    }

    #[test]
    fn test_starttls_command() {
        assert_eq!(Command::parse("STARTTLS"), Command::StartTls);
    }

    #[test]
    fn test_auth_with_initial_response() {
        assert_eq!(
            Command::parse("AUTH PLAIN AHVzZXIAcGFzcw=="),
            Command::Auth {
                mechanism: "PLAIN".to_string(),
                initial_response: Some("AHVzZXIAcGFzcw==".to_string()),
            }
        );
    }

    #[test]
    fn test_auth_without_initial_response() {
        assert_eq!(
            Command::parse("AUTH LOGIN"),
            Command::Auth {
                mechanism: "LOGIN".to_string(),
                initial_response: None,
            }
        );
    }

    #[test]
    fn test_mail_keeps_raw_params() {
        assert_eq!(
            Command::parse("MAIL FROM:<sender@example.com> SIZE=12345"),
            Command::Mail {
                params: "FROM:<sender@example.com> SIZE=12345".to_string()
            }
        );
    }

    #[test]
    fn test_rcpt_keeps_inner_space() {
        assert_eq!(
            Command::parse("RCPT TO: <bad"),
            Command::Rcpt {
                params: "TO: <bad".to_string()
            }
        );
    }

    #[test]
    fn test_simple_verbs() {
        assert_eq!(Command::parse("DATA"), Command::Data);
        assert_eq!(Command::parse("RSET"), Command::Rset);
        assert_eq!(Command::parse("quit"), Command::Quit);
    }

    #[test]
    fn test_unknown_keeps_original_case() {
        let cmd = Command::parse("Vrfy postmaster");
        assert_eq!(
            cmd,
            Command::Unknown {
                verb: "Vrfy".to_string()
            }
        );
    }

    #[test]
    fn test_empty_line() {
        assert_eq!(
            Command::parse(""),
            Command::Unknown {
                verb: String::new()
            }
        );
    }
}
