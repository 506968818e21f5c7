pub(crate) mod model_list;
pub(crate) mod proxy;
pub(crate) mod relay;
pub(crate) mod upstream_error;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{any, get};
use axum::Router;
use tokio::time::MissedTickBehavior;

use crate::channel::{ChannelFactory, KeyCheck};
use crate::config::{GroupType, Settings};
use crate::crypto::Encryptor;
use crate::error::Result as AppResult;
use crate::groups::{Group, GroupManager, SubGroupSelector};
use crate::keypool::{ApiKey, KeyProvider};
use crate::logging::{DatabaseLogger, RequestLogRecorder};

pub struct AppState {
    pub group_manager: GroupManager,
    pub sub_groups: SubGroupSelector,
    pub channels: ChannelFactory,
    pub key_provider: Arc<KeyProvider>,
    pub recorder: RequestLogRecorder,
}

pub async fn create_app(settings: Settings) -> AppResult<Router> {
    let db = Arc::new(DatabaseLogger::new(&settings.logging.database_path).await?);
    let crypto = Arc::new(Encryptor::new(&settings.encryption.secret));

    let key_provider = Arc::new(KeyProvider::new(db.clone()));

    // Groups and key identities are registered in the database up front so
    // ids are stable and earlier organization promotions survive restarts.
    let mut groups: Vec<Arc<Group>> = Vec::new();
    for group_config in &settings.groups {
        let group_type = match group_config.group_type {
            GroupType::Standard => "standard",
            GroupType::Aggregate => "aggregate",
        };
        let id = db
            .upsert_group(
                &group_config.name,
                group_config.display_name.as_deref().unwrap_or(""),
                group_type,
                &group_config.channel_type,
            )
            .await?;
        let group = Arc::new(Group::from_config(id, group_config));

        if group_config.group_type == GroupType::Standard {
            let mut keys = Vec::new();
            for raw_key in &group_config.api_keys {
                let hash = crypto.hash(raw_key);
                let encrypted = crypto.encrypt(raw_key)?;
                let (key_id, is_org, org_id) = db.upsert_api_key(id, &hash, &encrypted).await?;
                keys.push(Arc::new(ApiKey::new(key_id, raw_key.clone(), is_org, org_id)));
            }
            key_provider.register_group(id, keys, group_config.config.blacklist_threshold);
        }

        groups.push(group);
    }

    let state = Arc::new(AppState {
        group_manager: GroupManager::new(groups),
        sub_groups: SubGroupSelector::new(),
        channels: ChannelFactory::new(),
        key_provider,
        recorder: RequestLogRecorder::new(db, crypto, settings.logging.queue_size),
    });

    spawn_key_recovery(state.clone());

    let app = Router::new()
        .route("/health", get(health))
        .route("/proxy/{group_name}", any(proxy::handle_proxy))
        .route("/proxy/{group_name}/{*path}", any(proxy::handle_proxy))
        .with_state(state);

    Ok(app)
}

async fn health() -> &'static str {
    "ok"
}

/// Periodically re-probes quarantined keys with the channel's validation
/// endpoint; a passing key goes back into rotation.
fn spawn_key_recovery(state: Arc<AppState>) {
    let groups: Vec<Arc<Group>> = state.group_manager.groups().cloned().collect();

    for group in groups {
        if group.group_type != GroupType::Standard {
            continue;
        }
        let interval_secs = group.config.key_recovery_interval_secs;
        if interval_secs == 0 {
            continue;
        }

        let state = state.clone();
        tokio::spawn(async move {
            let channel = match state.channels.get_channel(&group) {
                Ok(found) => found,
                Err(e) => {
                    tracing::error!(group = %group.name, "Key recovery sweep disabled: {}", e);
                    return;
                }
            };

            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                for key in state.key_provider.quarantined_keys(group.id) {
                    match channel.validate_key(&key, &group).await {
                        Ok(KeyCheck::Valid) => {
                            tracing::info!(
                                group = %group.name,
                                key_id = key.id,
                                "Quarantined key validated, back in rotation"
                            );
                            state.key_provider.mark_recovered(group.id, key.id);
                        }
                        Ok(KeyCheck::Invalid { status, reason }) => {
                            tracing::debug!(
                                group = %group.name,
                                key_id = key.id,
                                status,
                                "Key still invalid: {}",
                                reason
                            );
                        }
                        Err(e) => {
                            tracing::debug!(
                                group = %group.name,
                                key_id = key.id,
                                "Key validation attempt failed: {}",
                                e
                            );
                        }
                    }
                }
            }
        });
    }
}
