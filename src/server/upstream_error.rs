use std::error::Error as StdError;
use std::io::Read;

use serde_json::Value;

/// Extracts a terse human-readable message from the error shapes upstreams
/// actually return. Never fails.
pub fn parse_upstream_error(body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        // {"error": {"message": "..."}}
        if let Some(msg) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
        {
            if !msg.is_empty() {
                return msg.to_string();
            }
        }
        // {"error": "..."}
        if let Some(msg) = value.get("error").and_then(Value::as_str) {
            if !msg.is_empty() {
                return msg.to_string();
            }
        }
        // {"message": "..."}
        if let Some(msg) = value.get("message").and_then(Value::as_str) {
            if !msg.is_empty() {
                return msg.to_string();
            }
        }
    }

    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        "unknown upstream error".to_string()
    } else {
        trimmed.to_string()
    }
}

/// True for transport errors caused by the client going away; those abort
/// the request without a retry and without blaming the key.
pub fn is_ignorable_error(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
            if is_ignorable_io_kind(io_err.kind()) {
                return true;
            }
        }
        source = cause.source();
    }
    is_ignorable_message(&err.to_string())
}

fn is_ignorable_io_kind(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
    )
}

fn is_ignorable_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("broken pipe") || message.contains("connection reset by peer")
}

/// Error bodies arrive gzip-compressed when the client negotiated it; the
/// parser needs plaintext. Returns the input untouched on any failure.
pub fn decompress_if_gzip(content_encoding: Option<&str>, body: Vec<u8>) -> Vec<u8> {
    let is_gzip = content_encoding.is_some_and(|v| v.to_ascii_lowercase().contains("gzip"));
    if !is_gzip {
        return body;
    }

    let mut decoder = flate2::read::GzDecoder::new(body.as_slice());
    let mut out = Vec::new();
    match decoder.read_to_end(&mut out) {
        Ok(_) => out,
        Err(e) => {
            tracing::warn!("Failed to decompress gzip error body: {}", e);
            body
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_nested_error_message() {
        let body = br#"{"error":{"message":"rate limit","type":"requests"}}"#;
        assert_eq!(parse_upstream_error(body), "rate limit");
    }

    #[test]
    fn parses_string_error_and_flat_message() {
        assert_eq!(parse_upstream_error(br#"{"error":"quota gone"}"#), "quota gone");
        assert_eq!(parse_upstream_error(br#"{"message":"bad key"}"#), "bad key");
    }

    #[test]
    fn falls_back_to_raw_text() {
        assert_eq!(parse_upstream_error(b"  502 Bad Gateway  "), "502 Bad Gateway");
        assert_eq!(parse_upstream_error(b""), "unknown upstream error");
        assert_eq!(parse_upstream_error(b"{}"), "{}");
    }

    #[test]
    fn ignorable_io_kinds() {
        assert!(is_ignorable_io_kind(std::io::ErrorKind::BrokenPipe));
        assert!(is_ignorable_io_kind(std::io::ErrorKind::ConnectionReset));
        assert!(!is_ignorable_io_kind(std::io::ErrorKind::TimedOut));
    }

    #[test]
    fn ignorable_message_matching() {
        assert!(is_ignorable_message("error writing a body: Broken pipe (os error 32)"));
        assert!(is_ignorable_message("Connection reset by peer"));
        assert!(!is_ignorable_message("dns error: not found"));
    }

    #[test]
    fn gzip_bodies_are_decompressed() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(br#"{"error":{"message":"hidden"}}"#).unwrap();
        let compressed = encoder.finish().unwrap();

        let plain = decompress_if_gzip(Some("gzip"), compressed.clone());
        assert_eq!(parse_upstream_error(&plain), "hidden");

        // Without the header the bytes pass through untouched.
        assert_eq!(decompress_if_gzip(None, compressed.clone()), compressed);
    }

    #[test]
    fn corrupt_gzip_passes_through() {
        let garbage = vec![0x1f, 0x8b, 0xff, 0x00];
        assert_eq!(decompress_if_gzip(Some("gzip"), garbage.clone()), garbage);
    }
}
