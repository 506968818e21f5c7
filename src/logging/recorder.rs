use std::sync::Arc;

use tokio::sync::mpsc;

use crate::crypto::Encryptor;
use crate::logging::storage_traits::RequestLogStore;
use crate::logging::types::{
    truncate_string, RequestLog, KEY_ENCRYPTION_FAILED, MAX_BODY_LEN, MAX_PATH_LEN,
    MAX_UPSTREAM_ADDR_LEN,
};

/// Non-blocking request-log pipeline: producers hand entries to a bounded
/// queue, a background worker drains them into the store. The data path
/// never awaits persistence.
#[derive(Clone)]
pub struct RequestLogRecorder {
    tx: mpsc::Sender<RequestLog>,
    crypto: Arc<Encryptor>,
}

impl RequestLogRecorder {
    pub fn new(store: Arc<dyn RequestLogStore>, crypto: Arc<Encryptor>, queue_size: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<RequestLog>(queue_size.max(1));

        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(e) = store.insert_request_log(&entry).await {
                    tracing::error!("Failed to persist request log: {}", e);
                }
            }
        });

        Self {
            tx,
            crypto,
        }
    }

    /// Seals and enqueues one log entry. `key_plain` is the in-memory key
    /// value used for the attempt, if any; it is encrypted (or replaced by
    /// the failure sentinel) before the entry leaves this call.
    pub fn record(&self, mut entry: RequestLog, key_plain: Option<&str>) {
        seal_entry(&mut entry, key_plain, &self.crypto);

        if let Err(e) = self.tx.try_send(entry) {
            tracing::warn!("Request log queue full, dropping entry: {}", e);
        }
    }
}

fn seal_entry(entry: &mut RequestLog, key_plain: Option<&str>, crypto: &Encryptor) {
    if let Some(plain) = key_plain {
        match crypto.encrypt(plain) {
            Ok(cipher) => entry.key_value = cipher,
            Err(e) => {
                tracing::error!("Failed to encrypt key value for logging: {}", e);
                entry.key_value = KEY_ENCRYPTION_FAILED.to_string();
            }
        }
        entry.key_hash = crypto.hash(plain);
    }

    entry.request_path = truncate_string(&entry.request_path, MAX_PATH_LEN);
    entry.upstream_addr = truncate_string(&entry.upstream_addr, MAX_UPSTREAM_ADDR_LEN);
    entry.request_body = truncate_string(&entry.request_body, MAX_BODY_LEN);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::types::REQ_TYPE_FINAL;
    use chrono::Utc;

    fn entry() -> RequestLog {
        RequestLog {
            id: None,
            timestamp: Utc::now(),
            group_id: 1,
            group_name: "g1".into(),
            parent_group_id: None,
            parent_group_name: None,
            is_success: true,
            source_ip: "127.0.0.1".into(),
            status_code: 200,
            request_path: "p".repeat(600),
            duration_ms: 1,
            user_agent: String::new(),
            request_type: REQ_TYPE_FINAL.into(),
            is_stream: false,
            upstream_addr: "u".repeat(600),
            request_body: "b".repeat(70_000),
            model: String::new(),
            key_value: String::new(),
            key_hash: String::new(),
            error_message: None,
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
        }
    }

    #[test]
    fn seal_encrypts_key_and_truncates() {
        let crypto = Encryptor::new("secret");
        let mut e = entry();
        seal_entry(&mut e, Some("sk-plain"), &crypto);

        assert_ne!(e.key_value, "sk-plain");
        assert_eq!(crypto.decrypt(&e.key_value).unwrap(), "sk-plain");
        assert_eq!(e.key_hash, crypto.hash("sk-plain"));
        assert_eq!(e.request_path.len(), MAX_PATH_LEN);
        assert_eq!(e.upstream_addr.len(), MAX_UPSTREAM_ADDR_LEN);
        assert_eq!(e.request_body.len(), MAX_BODY_LEN);
    }

    #[test]
    fn seal_without_key_leaves_key_fields_empty() {
        let crypto = Encryptor::new("secret");
        let mut e = entry();
        seal_entry(&mut e, None, &crypto);
        assert!(e.key_value.is_empty());
        assert!(e.key_hash.is_empty());
    }
}
