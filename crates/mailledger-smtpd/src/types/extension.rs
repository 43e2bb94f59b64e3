//! SMTP extension types advertised in the EHLO reply.

use std::fmt;

/// SMTP service extensions the server can advertise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Extension {
    /// STARTTLS - TLS upgrade (RFC 3207)
    StartTls,
    /// AUTH - Authentication (RFC 4954)
    Auth(Vec<AuthMechanism>),
    /// PIPELINING - Command pipelining (RFC 2920)
    Pipelining,
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartTls => f.write_str("STARTTLS"),
            Self::Auth(mechanisms) => {
                f.write_str("AUTH")?;
                for mechanism in mechanisms {
                    write!(f, " {}", mechanism.as_str())?;
                }
                Ok(())
            }
            Self::Pipelining => f.write_str("PIPELINING"),
        }
    }
}

/// SASL authentication mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMechanism {
    /// PLAIN - plaintext authentication
    Plain,
    /// LOGIN - legacy plaintext
    Login,
    /// CRAM-MD5 - challenge-response
    CramMd5,
}

impl AuthMechanism {
    /// Parses an authentication mechanism name (case-insensitive).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            "CRAM-MD5" => Some(Self::CramMd5),
            _ => None,
        }
    }

    /// Returns the mechanism name as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
            Self::CramMd5 => "CRAM-MD5",
        }
    }

    /// Returns true if the mechanism sends the secret in recoverable form.
    ///
    /// Such mechanisms are only offered and accepted over TLS.
    #[must_use]
    pub const fn requires_tls(self) -> bool {
        matches!(self, Self::Plain | Self::Login)
    }

    /// Returns the mechanisms offered for the given transport state.
    #[must_use]
    pub fn offered(encrypted: bool) -> Vec<Self> {
        if encrypted {
            vec![Self::Plain, Self::Login]
        } else {
            vec![Self::CramMd5]
        }
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
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

    mod extension_display_tests {
        use super::*;

        #[test]
        fn starttls() {
            assert_eq!(Extension::StartTls.to_string(), "STARTTLS");
        }

        #[test]
        fn pipelining() {
            assert_eq!(Extension::Pipelining.to_string(), "PIPELINING");
        }

        #[test]
        fn auth_lists_mechanisms_in_order() {
            let ext = Extension::Auth(vec![AuthMechanism::Plain, AuthMechanism::Login]);
            assert_eq!(ext.to_string(), "AUTH PLAIN LOGIN");
            let ext = Extension::Auth(vec![AuthMechanism::CramMd5]);
            assert_eq!(ext.to_string(), "AUTH CRAM-MD5");
        }
    }

    mod auth_mechanism_tests {
        use super::*;

        #[test]
        fn parse() {
            assert_eq!(AuthMechanism::parse("PLAIN"), Some(AuthMechanism::Plain));
            assert_eq!(AuthMechanism::parse("plain"), Some(AuthMechanism::Plain));
            assert_eq!(AuthMechanism::parse("Login"), Some(AuthMechanism::Login));
            assert_eq!(
                AuthMechanism::parse("cram-md5"),
                Some(AuthMechanism::CramMd5)
            );
            assert_eq!(AuthMechanism::parse("XOAUTH2"), None);
            assert_eq!(AuthMechanism::parse(""), None);
        }

        #[test]
        fn tls_requirement() {
            assert!(AuthMechanism::Plain.requires_tls());
            assert!(AuthMechanism::Login.requires_tls());
            assert!(!AuthMechanism::CramMd5.requires_tls());
        }

        #[test]
        fn offered() {
            assert_eq!(AuthMechanism::offered(false), vec![AuthMechanism::CramMd5]);
            assert_eq!(
                AuthMechanism::offered(true),
                vec![AuthMechanism::Plain, AuthMechanism::Login]
            );
        }
    }
}
