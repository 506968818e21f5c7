use chrono::{DateTime, Utc};

/// Attempt that will be retried.
pub const REQ_TYPE_RETRY: &str = "retry";
/// Terminal attempt of a request; exactly one per request.
pub const REQ_TYPE_FINAL: &str = "final";

pub const MAX_PATH_LEN: usize = 500;
pub const MAX_UPSTREAM_ADDR_LEN: usize = 500;
pub const MAX_BODY_LEN: usize = 65_000;

/// Sentinel stored when encrypting the key value for a log entry fails.
pub const KEY_ENCRYPTION_FAILED: &str = "failed-to-encryption";

/// One per-attempt audit record of the proxy pipeline.
#[derive(Debug, Clone)]
pub struct RequestLog {
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub group_id: i64,
    pub group_name: String,
    /// Set only when an aggregate group delegated to a different sub-group.
    pub parent_group_id: Option<i64>,
    pub parent_group_name: Option<String>,
    pub is_success: bool,
    pub source_ip: String,
    pub status_code: u16,
    pub request_path: String,
    pub duration_ms: i64,
    pub user_agent: String,
    pub request_type: String,
    pub is_stream: bool,
    pub upstream_addr: String,
    pub request_body: String,
    pub model: String,
    /// Encrypted at rest; never the plaintext key.
    pub key_value: String,
    pub key_hash: String,
    pub error_message: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
}

/// Char-boundary-safe truncation for oversize log fields.
pub fn truncate_string(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_short_string_is_identity() {
        assert_eq!(truncate_string("abc", 500), "abc");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "ab测试";
        // Cutting inside the multi-byte char backs off to a boundary.
        assert_eq!(truncate_string(s, 3), "ab");
        assert_eq!(truncate_string(s, 5), "ab测");
    }
}
