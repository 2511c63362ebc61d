//! Topic key escaping for JetStream key-value buckets
//!
//! Bucket keys only allow `[-/_=.a-zA-Z0-9]`. Any other byte of the
//! UTF-8 key (and `=` itself) is written as `=XX` in uppercase hex, so
//! opaque user ids survive the round trip. Escaping is per byte, which
//! keeps `encode(prefix)` a prefix of `encode(key)`.

use crate::error::{EventError, Result};

const ESCAPE: u8 = b'=';

fn is_plain(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'/' | b'_' | b'.')
}

/// Escape a topic key into the bucket key alphabet
pub fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for &byte in key.as_bytes() {
        if is_plain(byte) {
            out.push(byte as char);
        } else {
            out.push(ESCAPE as char);
            out.push_str(&format!("{:02X}", byte));
        }
    }
    out
}

/// Reverse [`encode_key`]
pub fn decode_key(key: &str) -> Result<String> {
    let invalid = |reason: &str| EventError::Decode {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    let bytes = key.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == ESCAPE {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .ok_or_else(|| invalid("truncated escape"))?;
            let byte = u8::from_str_radix(hex, 16).map_err(|_| invalid("bad escape"))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| invalid("escaped bytes are not UTF-8"))
}
