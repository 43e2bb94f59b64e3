//! Property-based tests for DATA body decoding.
//!
//! A body dot-stuffed the way a client sends it must decode back to the
//! original bytes, and the reader must stop exactly at the end marker.

#![allow(clippy::unwrap_used, clippy::expect_used, reason = "test code")]

use mailledger_smtpd::data::DotReader;
use proptest::prelude::*;
use tokio::io::AsyncReadExt;

/// Lines that favour the interesting cases: leading dots and lone dots.
fn body_line() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        Just(".".to_string()),
        Just("..".to_string()),
        "\\.[a-zA-Z0-9 ]{0,20}",
        "[a-zA-Z0-9 .:<>@-]{0,60}",
    ]
}

/// Builds a CRLF-terminated body from lines.
fn body() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(body_line(), 0..20).prop_map(|lines| {
        lines
            .iter()
            .flat_map(|line| format!("{line}\r\n").into_bytes())
            .collect()
    })
}

/// Dot-stuffs a body and appends the end marker.
fn stuff(body: &[u8]) -> Vec<u8> {
    let mut wire = Vec::with_capacity(body.len() + 8);
    let mut line_start = true;
    for &byte in body {
        if line_start && byte == b'.' {
            wire.push(b'.');
        }
        wire.push(byte);
        line_start = byte == b'\n';
    }
    wire.extend_from_slice(b".\r\n");
    wire
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime")
}

proptest! {
    #[test]
    fn stuffed_body_decodes_to_original(body in body()) {
        let wire = stuff(&body);
        let mut input: &[u8] = &wire;

        let decoded = runtime().block_on(async {
            let mut reader = DotReader::new(&mut input);
            let mut decoded = Vec::new();
            reader.read_to_end(&mut decoded).await.unwrap();
            decoded
        });

        prop_assert_eq!(decoded, body);
    }

    #[test]
    fn line_copy_matches_byte_reads(body in body(), trailer in "[A-Z]{4}\r\n") {
        let mut wire = stuff(&body);
        wire.extend_from_slice(trailer.as_bytes());
        let mut input: &[u8] = &wire;

        let copied = runtime().block_on(async {
            let mut reader = DotReader::new(&mut input);
            let mut copied = Vec::new();
            reader.copy_to(&mut copied).await.unwrap();
            copied
        });

        prop_assert_eq!(copied, body);
        prop_assert_eq!(input, trailer.as_bytes());
    }

    #[test]
    fn truncated_body_is_an_error(body in body(), cut in 0usize..3) {
        let wire = stuff(&body);
        let truncated = &wire[..wire.len() - 1 - cut];
        let mut input: &[u8] = truncated;

        let result = runtime().block_on(async {
            let mut reader = DotReader::new(&mut input);
            reader.drain().await
        });

        prop_assert!(result.is_err());
    }
}
