use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::error::{ProxyError, Result as AppResult};
use crate::logging::storage_traits::KeyStore;

/// One upstream credential. The organization flag is monotonic: it only ever
/// transitions false → true, so readers take no lock.
#[derive(Debug)]
pub struct ApiKey {
    pub id: i64,
    pub key_value: String,
    is_organization_key: AtomicBool,
    pub organization_id: Option<String>,
}

impl ApiKey {
    pub fn new(id: i64, key_value: String, is_organization_key: bool, organization_id: Option<String>) -> Self {
        Self {
            id,
            key_value,
            is_organization_key: AtomicBool::new(is_organization_key),
            organization_id,
        }
    }

    pub fn is_organization(&self) -> bool {
        self.is_organization_key.load(Ordering::Relaxed)
    }

    /// Returns true when this call performed the false→true transition.
    fn promote(&self) -> bool {
        !self.is_organization_key.swap(true, Ordering::Relaxed)
    }
}

struct KeySlot {
    key: Arc<ApiKey>,
    consecutive_failures: u32,
}

struct GroupKeys {
    slots: Vec<KeySlot>,
    cursor: usize,
    blacklist_threshold: u32,
}

impl GroupKeys {
    fn eligible(&self, slot: &KeySlot) -> bool {
        slot.consecutive_failures < self.blacklist_threshold
    }
}

/// Rotating credential provider. Selection and eligibility are evaluated
/// under one per-group lock so two concurrent requests cannot both receive a
/// key that just got quarantined.
pub struct KeyProvider {
    groups: Mutex<HashMap<i64, Arc<Mutex<GroupKeys>>>>,
    org_tx: mpsc::Sender<i64>,
}

const ORG_QUEUE_SIZE: usize = 256;

impl KeyProvider {
    /// The store only receives the asynchronous organization promotions; the
    /// data path never waits on it.
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        let (org_tx, mut org_rx) = mpsc::channel::<i64>(ORG_QUEUE_SIZE);

        tokio::spawn(async move {
            while let Some(key_id) = org_rx.recv().await {
                if let Err(e) = store.update_organization_status(key_id, true).await {
                    tracing::error!(key_id, "Failed to persist organization status: {}", e);
                }
            }
        });

        Self {
            groups: Mutex::new(HashMap::new()),
            org_tx,
        }
    }

    pub fn register_group(&self, group_id: i64, keys: Vec<Arc<ApiKey>>, blacklist_threshold: u32) {
        let state = GroupKeys {
            slots: keys
                .into_iter()
                .map(|key| KeySlot {
                    key,
                    consecutive_failures: 0,
                })
                .collect(),
            cursor: 0,
            // 阈值为 0 时视为 1，否则所有密钥永远不可用
            blacklist_threshold: blacklist_threshold.max(1),
        };
        self.groups
            .lock()
            .expect("key provider lock poisoned")
            .insert(group_id, Arc::new(Mutex::new(state)));
    }

    fn group_state(&self, group_id: i64) -> AppResult<Arc<Mutex<GroupKeys>>> {
        self.groups
            .lock()
            .expect("key provider lock poisoned")
            .get(&group_id)
            .cloned()
            .ok_or_else(|| ProxyError::NoKeysAvailable(format!("no key pool for group {}", group_id)))
    }

    /// Returns the next eligible key for the group, rotating fairly.
    pub fn select_key(&self, group_id: i64) -> AppResult<Arc<ApiKey>> {
        let state = self.group_state(group_id)?;
        let mut state = state.lock().expect("group key lock poisoned");

        let len = state.slots.len();
        for offset in 0..len {
            let idx = (state.cursor + offset) % len;
            if state.eligible(&state.slots[idx]) {
                state.cursor = (idx + 1) % len;
                return Ok(state.slots[idx].key.clone());
            }
        }

        Err(ProxyError::NoKeysAvailable(
            "all keys are quarantined or the group has no keys".into(),
        ))
    }

    /// True when `select_key` would currently succeed.
    pub fn has_available_keys(&self, group_id: i64) -> bool {
        let Ok(state) = self.group_state(group_id) else {
            return false;
        };
        let state = state.lock().expect("group key lock poisoned");
        state.slots.iter().any(|slot| state.eligible(slot))
    }

    /// Records the outcome of one upstream attempt. Failures accumulate until
    /// the key is quarantined; any success clears the counter.
    pub fn update_status(&self, group_id: i64, key_id: i64, success: bool, parsed_error: Option<&str>) {
        let Ok(state) = self.group_state(group_id) else {
            return;
        };
        let mut state = state.lock().expect("group key lock poisoned");
        let threshold = state.blacklist_threshold;
        let Some(slot) = state.slots.iter_mut().find(|slot| slot.key.id == key_id) else {
            return;
        };

        if success {
            slot.consecutive_failures = 0;
            return;
        }

        slot.consecutive_failures = slot.consecutive_failures.saturating_add(1);
        if slot.consecutive_failures == threshold {
            tracing::warn!(
                group_id,
                key_id,
                error = parsed_error.unwrap_or(""),
                "Key quarantined after consecutive failures"
            );
        }
    }

    /// Keys currently excluded from selection, for the revalidation sweep.
    pub fn quarantined_keys(&self, group_id: i64) -> Vec<Arc<ApiKey>> {
        let Ok(state) = self.group_state(group_id) else {
            return Vec::new();
        };
        let state = state.lock().expect("group key lock poisoned");
        state
            .slots
            .iter()
            .filter(|slot| !state.eligible(slot))
            .map(|slot| slot.key.clone())
            .collect()
    }

    /// Puts a quarantined key back into rotation.
    pub fn mark_recovered(&self, group_id: i64, key_id: i64) {
        self.update_status(group_id, key_id, true, None);
    }

    /// Promotes a key to organization-verified: the in-memory flag flips
    /// immediately, persistence is queued fire-and-forget.
    pub fn mark_organization_verified(&self, key: &ApiKey) {
        if !key.promote() {
            return;
        }
        tracing::info!(key_id = key.id, "Key marked as organization-verified");
        if let Err(e) = self.org_tx.try_send(key.id) {
            tracing::warn!(key_id = key.id, "Organization status queue full: {}", e);
        }
    }
}
