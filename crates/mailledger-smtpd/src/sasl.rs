//! SASL helpers for the AUTH command.
//!
//! Encoding, decoding and verification for the PLAIN (RFC 4616), LOGIN and
//! CRAM-MD5 (RFC 2195) mechanisms. The challenge/response dialog itself is
//! driven by the session; everything here is free of I/O.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::Rng;

use crate::error::HandlerError;
use crate::types::{Reply, ReplyCode};

type HmacMd5 = Hmac<Md5>;

/// LOGIN prompt for the username (`Username:` in base64).
pub const LOGIN_USERNAME_PROMPT: &str = "VXNlcm5hbWU6";

/// LOGIN prompt for the password (`Password:` in base64).
pub const LOGIN_PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6";

/// Reasons an AUTH exchange fails.
///
/// None of these end the session; each renders to a reply with
/// [`AuthError::reply`].
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The client sent `*` to abort the exchange.
    #[error("Authentication cancelled")]
    Cancelled,

    /// A response was not valid base64.
    #[error("Invalid base64 encoding: {0}")]
    BadEncoding(#[from] base64::DecodeError),

    /// A decoded response did not have the mechanism's shape.
    #[error("Couldn't decode your credentials")]
    Malformed,

    /// The credentials did not match.
    #[error("Authentication credentials invalid")]
    InvalidCredentials,

    /// The credential lookup failed.
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl AuthError {
    /// Renders the error as a protocol reply.
    #[must_use]
    pub fn reply(&self) -> Reply {
        match self {
            Self::Cancelled => Reply::single(ReplyCode::PARAMETER_ERROR, "Authentication cancelled"),
            Self::BadEncoding(_) => {
                Reply::single(ReplyCode::PARAMETER_ERROR, "Invalid base64 encoding")
            }
            Self::Malformed => Reply::single(
                ReplyCode::NOT_IMPLEMENTED,
                "Couldn't decode your credentials",
            ),
            Self::InvalidCredentials => Reply::single(
                ReplyCode::AUTH_FAILED,
                "5.7.8 Authentication credentials invalid",
            ),
            Self::Handler(err) => Reply::from_handler_error(err),
        }
    }
}

/// Decodes a client response line sent after a `334` challenge.
///
/// A line holding a single `*` cancels the exchange.
///
/// # Errors
///
/// Returns [`AuthError::Cancelled`] for `*` and [`AuthError::BadEncoding`]
/// for anything that is not base64.
pub fn decode_response(line: &str) -> Result<Vec<u8>, AuthError> {
    if line == "*" {
        return Err(AuthError::Cancelled);
    }
    Ok(STANDARD.decode(line.trim_end())?)
}

/// Decodes an initial response sent on the AUTH line itself.
///
/// A single `=` stands for an empty response (RFC 4954 Section 4).
///
/// # Errors
///
/// Returns [`AuthError::BadEncoding`] if the response is not base64.
pub fn decode_initial_response(response: &str) -> Result<Vec<u8>, AuthError> {
    if response == "=" {
        return Ok(Vec::new());
    }
    Ok(STANDARD.decode(response)?)
}

/// Credentials carried by a PLAIN response.
#[derive(Clone, PartialEq, Eq)]
pub struct PlainCredentials {
    /// Authorization identity (may be empty).
    pub identity: String,
    /// Authentication identity.
    pub username: String,
    /// Clear-text password.
    pub password: String,
}

impl std::fmt::Debug for PlainCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainCredentials")
            .field("identity", &self.identity)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Splits a decoded PLAIN response into its three NUL-separated fields.
///
/// # Errors
///
/// Returns [`AuthError::Malformed`] unless there are exactly three fields of
/// valid UTF-8.
pub fn decode_plain(data: &[u8]) -> Result<PlainCredentials, AuthError> {
    let fields: Vec<&[u8]> = data.split(|&b| b == 0).collect();
    let [identity, username, password] = fields.as_slice() else {
        return Err(AuthError::Malformed);
    };

    let text = |field: &[u8]| String::from_utf8(field.to_vec()).map_err(|_| AuthError::Malformed);
    Ok(PlainCredentials {
        identity: text(*identity)?,
        username: text(*username)?,
        password: text(*password)?,
    })
}

/// Decodes a LOGIN username or password response into text.
///
/// # Errors
///
/// Returns [`AuthError::Malformed`] if the value is not valid UTF-8.
pub fn decode_login_field(data: Vec<u8>) -> Result<String, AuthError> {
    String::from_utf8(data).map_err(|_| AuthError::Malformed)
}

/// Generates a fresh CRAM-MD5 challenge, e.g. `<8312-1700000000@mx.example.com>`.
///
/// The challenge combines a random number, the current time and the server
/// hostname, so every AUTH attempt gets its own.
#[must_use]
pub fn cram_md5_challenge(hostname: &str) -> String {
    let nonce = rand::thread_rng().r#gen::<u32>();
    let now = chrono::Utc::now().timestamp();
    format!("<{nonce}-{now}@{hostname}>")
}

/// Base64-encodes a challenge for a `334` reply.
#[must_use]
pub fn encode_challenge(challenge: &str) -> String {
    STANDARD.encode(challenge)
}

/// Computes the CRAM-MD5 digest: lower-case hex HMAC-MD5 of the challenge,
/// keyed by the password.
///
/// ```
/// use mailledger_smtpd::sasl::cram_md5_digest;
///
/// let digest = cram_md5_digest("tanstaaftanstaaf", "<1896.697170952@postoffice.reston.mci.net>");
/// assert_eq!(digest, "b913a602c7eda7a495b4e6e7334d3890");
/// ```
#[must_use]
pub fn cram_md5_digest(password: &str, challenge: &str) -> String {
    #[allow(clippy::expect_used, reason = "HMAC accepts keys of any length")]
    let mut mac = HmacMd5::new_from_slice(password.as_bytes()).expect("HMAC key of any length");
    mac.update(challenge.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Splits a decoded CRAM-MD5 response into username and hex digest.
///
/// # Errors
///
/// Returns [`AuthError::Malformed`] if the response is not valid UTF-8 or
/// has no space separating the two parts.
pub fn decode_cram_md5(data: &[u8]) -> Result<(String, String), AuthError> {
    let text = std::str::from_utf8(data).map_err(|_| AuthError::Malformed)?;
    let (username, digest) = text.split_once(' ').ok_or(AuthError::Malformed)?;
    Ok((username.to_string(), digest.trim().to_string()))
}

/// Checks a CRAM-MD5 digest against the expected password.
///
/// The digest must be 32 lower-case hex digits. The comparison runs in
/// constant time.
#[must_use]
pub fn verify_cram_md5(password: &str, challenge: &str, digest: &str) -> bool {
    if digest.len() != 32 || !digest.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return false;
    }
    let Ok(expected) = hex::decode(digest) else {
        return false;
    };
    let Ok(mut mac) = HmacMd5::new_from_slice(password.as_bytes()) else {
        return false;
    };
    mac.update(challenge.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// Compares a supplied password with the expected one.
///
/// Runs in time independent of where the two differ; only the length of
/// the supplied password can leak.
#[must_use]
pub fn passwords_match(expected: &str, supplied: &str) -> bool {
    let (expected, supplied) = (expected.as_bytes(), supplied.as_bytes());
    let diff = expected
        .iter()
        .zip(supplied)
        .fold(u8::from(expected.len() != supplied.len()), |acc, (a, b)| {
            acc | (a ^ b)
        });
    diff == 0
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

    mod response_tests {
        use super::*;

        #[test]
        fn test_cancel() {
            assert!(matches!(decode_response("*"), Err(AuthError::Cancelled)));
        }

        #[test]
        fn test_bad_encoding() {
            let err = decode_response("not base64!").unwrap_err();
            assert!(matches!(err, AuthError::BadEncoding(_)));
            assert_eq!(err.reply().code, ReplyCode::PARAMETER_ERROR);
        }

        #[test]
        fn test_valid_response() {
            assert_eq!(decode_response("dXNlcg==").unwrap(), b"user");
        }

        #[test]
        fn test_initial_response_equals_is_empty() {
            assert!(decode_initial_response("=").unwrap().is_empty());
        }

        #[test]
        fn test_login_prompts() {
            assert_eq!(STANDARD.decode(LOGIN_USERNAME_PROMPT).unwrap(), b"Username:");
            assert_eq!(STANDARD.decode(LOGIN_PASSWORD_PROMPT).unwrap(), b"Password:");
        }
    }

    mod plain_tests {
        use super::*;

        #[test]
        fn test_three_fields() {
            let creds = decode_plain(b"\0user@example.com\0password").unwrap();
            assert_eq!(creds.identity, "");
            assert_eq!(creds.username, "user@example.com");
            assert_eq!(creds.password, "password");
        }

        #[test]
        fn test_with_identity() {
            let creds = decode_plain(b"admin\0user\0secret").unwrap();
            assert_eq!(creds.identity, "admin");
            assert_eq!(creds.username, "user");
        }

        #[test]
        fn test_wrong_field_count() {
            assert!(matches!(decode_plain(b"user\0pass"), Err(AuthError::Malformed)));
            assert!(matches!(decode_plain(b"a\0b\0c\0d"), Err(AuthError::Malformed)));
            assert!(matches!(decode_plain(b""), Err(AuthError::Malformed)));
        }

        #[test]
        fn test_debug_redacts_password() {
            let creds = decode_plain(b"\0user\0hunter2").unwrap();
            assert!(!format!("{creds:?}").contains("hunter2"));
        }
    }

    mod cram_md5_tests {
        use super::*;

        #[test]
        fn test_rfc2195_vector() {
            let digest = cram_md5_digest(
                "tanstaaftanstaaf",
                "<1896.697170952@postoffice.reston.mci.net>",
            );
            assert_eq!(digest, "b913a602c7eda7a495b4e6e7334d3890");
        }

        #[test]
        fn test_known_client_response() {
            let challenge = "<17893.1320679123@tesseract.susam.in>";
            let response = STANDARD
                .decode("YWxpY2UgNjRiMmE0M2MxZjZlZDY4MDZhOTgwOTE0ZTIzZTc1ZjA=")
                .unwrap();

            let (username, digest) = decode_cram_md5(&response).unwrap();
            assert_eq!(username, "alice");
            assert_eq!(digest, "64b2a43c1f6ed6806a980914e23e75f0");
            assert!(verify_cram_md5("wonderland", challenge, &digest));
        }

        #[test]
        fn test_flipped_bit_fails() {
            let challenge = "<17893.1320679123@tesseract.susam.in>";
            // Last hex digit 0 -> 1 flips one bit of the digest.
            assert!(!verify_cram_md5(
                "wonderland",
                challenge,
                "64b2a43c1f6ed6806a980914e23e75f1"
            ));
            assert!(!verify_cram_md5(
                "wonderlane",
                challenge,
                "64b2a43c1f6ed6806a980914e23e75f0"
            ));
        }

        #[test]
        fn test_digest_must_be_lower_case_hex() {
            let challenge = "<17893.1320679123@tesseract.susam.in>";
            assert!(!verify_cram_md5(
                "wonderland",
                challenge,
                "64B2A43C1F6ED6806A980914E23E75F0"
            ));
            assert!(!verify_cram_md5("wonderland", challenge, "64b2a43c"));
            assert!(!verify_cram_md5("wonderland", challenge, ""));
        }

        #[test]
        fn test_passwords_match() {
            assert!(passwords_match("wonderland", "wonderland"));
            assert!(!passwords_match("wonderland", "wonderlanD"));
            assert!(!passwords_match("wonderland", "wonder"));
            assert!(!passwords_match("wonder", "wonderland"));
            assert!(!passwords_match("", "x"));
            assert!(passwords_match("", ""));
        }

        #[test]
        fn test_challenge_shape() {
            let challenge = cram_md5_challenge("mx.example.com");
            assert!(challenge.starts_with('<'));
            assert!(challenge.ends_with("@mx.example.com>"));
            assert!(challenge.contains('-'));
        }

        #[test]
        fn test_challenges_differ() {
            let a = cram_md5_challenge("mx.example.com");
            let b = cram_md5_challenge("mx.example.com");
            assert_ne!(a, b);
        }

        #[test]
        fn test_response_without_space() {
            assert!(matches!(decode_cram_md5(b"alice"), Err(AuthError::Malformed)));
        }
    }

    #[test]
    fn test_reply_mapping() {
        assert_eq!(
            AuthError::Cancelled.reply().to_string(),
            "501 Authentication cancelled"
        );
        assert_eq!(
            AuthError::Malformed.reply().to_string(),
            "502 Couldn't decode your credentials"
        );
        assert_eq!(
            AuthError::InvalidCredentials.reply().to_string(),
            "535 5.7.8 Authentication credentials invalid"
        );
        assert_eq!(
            AuthError::Handler(HandlerError::from("454 4.7.0 Lookup unavailable"))
                .reply()
                .to_string(),
            "454 4.7.0 Lookup unavailable"
        );
    }
}
