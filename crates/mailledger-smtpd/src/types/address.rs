//! Mailbox extraction from MAIL and RCPT parameters.

/// Extracts the `FROM:` path of a MAIL command.
///
/// Returns `None` if the parameters do not start with `FROM:`
/// (case-insensitive). The returned address may be empty (`<>`), which is
/// used for bounce notifications.
#[must_use]
pub fn parse_reverse_path(params: &str) -> Option<String> {
    strip_keyword(params, "FROM:").map(extract_mailbox)
}

/// Extracts the `TO:` path of a RCPT command.
///
/// Returns `None` if the parameters do not start with `TO:`
/// (case-insensitive).
#[must_use]
pub fn parse_forward_path(params: &str) -> Option<String> {
    strip_keyword(params, "TO:").map(extract_mailbox)
}

fn strip_keyword<'a>(params: &'a str, keyword: &str) -> Option<&'a str> {
    let head = params.get(..keyword.len())?;
    head.eq_ignore_ascii_case(keyword)
        .then(|| &params[keyword.len()..])
}

/// Extracts the bare mailbox from the remainder of a path argument.
///
/// The first `<...>` token wins if the argument is bracketed, otherwise the
/// first whitespace-delimited token. Leading whitespace is skipped, an
/// unterminated bracket still yields its content, and anything after the
/// mailbox (ESMTP parameters such as `SIZE=`) is ignored.
///
/// ```
/// use mailledger_smtpd::types::extract_mailbox;
///
/// assert_eq!(extract_mailbox("<user@example.com> SIZE=100"), "user@example.com");
/// assert_eq!(extract_mailbox(" user@example.com"), "user@example.com");
/// assert_eq!(extract_mailbox("<>"), "");
/// assert_eq!(extract_mailbox(" <bad"), "bad");
/// ```
#[must_use]
pub fn extract_mailbox(arg: &str) -> String {
    let arg = arg.trim_start();
    let token = arg.strip_prefix('<').unwrap_or(arg);
    token
        .split(|c: char| c == '>' || c.is_whitespace())
        .next()
        .unwrap_or_default()
        .to_string()
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
    fn test_bracketed() {
        assert_eq!(extract_mailbox("<user@example.com>"), "user@example.com");
        assert_eq!(extract_mailbox(" <user@example.com>"), "user@example.com");
    }

    #[test]
    fn test_bare() {
        assert_eq!(extract_mailbox("user@example.com"), "user@example.com");
        assert_eq!(
            extract_mailbox("user@example.com BODY=8BITMIME"),
            "user@example.com"
        );
    }

    #[test]
    fn test_null_path() {
        assert_eq!(extract_mailbox("<>"), "");
        assert_eq!(extract_mailbox("<> SIZE=1024"), "");
    }

    #[test]
    fn test_empty() {
        assert_eq!(extract_mailbox(""), "");
        assert_eq!(extract_mailbox("   "), "");
    }

    #[test]
    fn test_unterminated_bracket() {
        assert_eq!(extract_mailbox(" <bad"), "bad");
    }

    #[test]
    fn test_reverse_path() {
        assert_eq!(
            parse_reverse_path("FROM:<a@x>"),
            Some("a@x".to_string())
        );
        assert_eq!(
            parse_reverse_path("from: <a@x>"),
            Some("a@x".to_string())
        );
        assert_eq!(parse_reverse_path("FROM:<>"), Some(String::new()));
        assert_eq!(parse_reverse_path("FROM:"), Some(String::new()));
        assert_eq!(parse_reverse_path("TO:<a@x>"), None);
        assert_eq!(parse_reverse_path("FRO"), None);
        assert_eq!(parse_reverse_path(""), None);
    }

    #[test]
    fn test_forward_path() {
        assert_eq!(parse_forward_path("TO:<b@y>"), Some("b@y".to_string()));
        assert_eq!(parse_forward_path("To: <bad"), Some("bad".to_string()));
        assert_eq!(parse_forward_path("FROM:<b@y>"), None);
    }

    #[test]
    fn test_non_ascii_prefix_does_not_panic() {
        assert_eq!(parse_reverse_path("FRÖM:<a@x>"), None);
        assert_eq!(parse_forward_path("T\u{e9}"), None);
    }
}
