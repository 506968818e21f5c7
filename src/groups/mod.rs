use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;

use crate::config::{EffectiveConfig, GroupConfig, GroupType, SubGroupRef};
use crate::error::{ProxyError, Result as AppResult};
use crate::headers::HeaderRule;
use crate::keypool::KeyProvider;

/// Runtime view of a configured group; id assigned by the database upsert.
#[derive(Debug, Clone)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    pub group_type: GroupType,
    pub channel_type: String,
    pub upstream_url: String,
    pub test_model: String,
    pub validation_endpoint: String,
    pub sub_groups: Vec<SubGroupRef>,
    pub header_rules: Vec<HeaderRule>,
    pub config: EffectiveConfig,
}

impl Group {
    pub fn from_config(id: i64, cfg: &GroupConfig) -> Self {
        Self {
            id,
            name: cfg.name.clone(),
            display_name: cfg.display_name.clone().unwrap_or_default(),
            group_type: cfg.group_type,
            channel_type: cfg.channel_type.clone(),
            upstream_url: cfg.upstream_url.clone(),
            test_model: cfg.test_model.clone(),
            validation_endpoint: cfg.validation_endpoint.clone(),
            sub_groups: cfg.sub_groups.clone(),
            header_rules: cfg.header_rules.clone(),
            config: cfg.config.clone(),
        }
    }

    /// Title presented to upstreams that want one (e.g. OpenRouter X-Title).
    pub fn title(&self) -> &str {
        if self.display_name.is_empty() {
            &self.name
        } else {
            &self.display_name
        }
    }
}

/// Name-indexed group table, fixed after startup.
pub struct GroupManager {
    by_name: HashMap<String, Arc<Group>>,
}

impl GroupManager {
    pub fn new(groups: Vec<Arc<Group>>) -> Self {
        Self {
            by_name: groups
                .into_iter()
                .map(|g| (g.name.clone(), g))
                .collect(),
        }
    }

    pub fn get_group_by_name(&self, name: &str) -> AppResult<Arc<Group>> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| ProxyError::NotFound(format!("group '{}' not found", name)))
    }

    pub fn groups(&self) -> impl Iterator<Item = &Arc<Group>> {
        self.by_name.values()
    }
}

/// Picks one concrete sub-group per request for aggregate groups.
#[derive(Default)]
pub struct SubGroupSelector;

impl SubGroupSelector {
    pub fn new() -> Self {
        Self
    }

    /// Standard groups resolve to themselves (`None`). For aggregates, one
    /// sub-group is chosen by weighted random among those that currently
    /// have a selectable key; none eligible is a hard error.
    pub fn select(
        &self,
        group: &Group,
        manager: &GroupManager,
        keys: &KeyProvider,
    ) -> AppResult<Option<String>> {
        if group.group_type != GroupType::Aggregate {
            return Ok(None);
        }

        let mut eligible: Vec<(&SubGroupRef, u64)> = Vec::new();
        let mut total_weight: u64 = 0;
        for sub in &group.sub_groups {
            if sub.weight == 0 {
                continue;
            }
            let Ok(resolved) = manager.get_group_by_name(&sub.name) else {
                tracing::warn!(
                    aggregate = %group.name,
                    sub_group = %sub.name,
                    "aggregate references unknown sub-group"
                );
                continue;
            };
            if !keys.has_available_keys(resolved.id) {
                continue;
            }
            total_weight += u64::from(sub.weight);
            eligible.push((sub, total_weight));
        }

        if eligible.is_empty() {
            return Err(ProxyError::NoKeysAvailable(format!(
                "aggregate group '{}' has no eligible sub-groups",
                group.name
            )));
        }

        let roll = rand::rng().random_range(0..total_weight);
        let chosen = eligible
            .iter()
            .find(|(_, cumulative)| roll < *cumulative)
            .map(|(sub, _)| sub.name.clone())
            .expect("roll is below the cumulative total");

        Ok(Some(chosen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::storage_traits::{BoxFuture, KeyStore};
    use crate::keypool::ApiKey;

    struct NullStore;

    impl KeyStore for NullStore {
        fn update_organization_status<'a>(
            &'a self,
            _key_id: i64,
            _is_organization: bool,
        ) -> BoxFuture<'a, rusqlite::Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn standard(id: i64, name: &str) -> Arc<Group> {
        let cfg = GroupConfig {
            name: name.to_string(),
            display_name: None,
            group_type: GroupType::Standard,
            channel_type: "openai".into(),
            upstream_url: "https://api.openai.com".into(),
            test_model: "gpt-4o-mini".into(),
            validation_endpoint: "/v1/chat/completions".into(),
            api_keys: vec![],
            sub_groups: vec![],
            header_rules: vec![],
            config: EffectiveConfig::default(),
        };
        Arc::new(Group::from_config(id, &cfg))
    }

    fn aggregate(id: i64, name: &str, subs: Vec<SubGroupRef>) -> Arc<Group> {
        let mut group = Group::from_config(
            id,
            &GroupConfig {
                name: name.to_string(),
                display_name: None,
                group_type: GroupType::Aggregate,
                channel_type: "openai".into(),
                upstream_url: String::new(),
                test_model: "gpt-4o-mini".into(),
                validation_endpoint: "/v1/chat/completions".into(),
                api_keys: vec![],
                sub_groups: vec![],
                header_rules: vec![],
                config: EffectiveConfig::default(),
            },
        );
        group.sub_groups = subs;
        Arc::new(group)
    }

    #[tokio::test]
    async fn standard_group_selects_itself() {
        let g1 = standard(1, "g1");
        let manager = GroupManager::new(vec![g1.clone()]);
        let keys = KeyProvider::new(Arc::new(NullStore));

        let selector = SubGroupSelector::new();
        assert_eq!(selector.select(&g1, &manager, &keys).unwrap(), None);
    }

    #[tokio::test]
    async fn aggregate_skips_sub_groups_without_keys() {
        let a = standard(1, "sub-a");
        let b = standard(2, "sub-b");
        let agg = aggregate(
            3,
            "agg1",
            vec![
                SubGroupRef { name: "sub-a".into(), weight: 5 },
                SubGroupRef { name: "sub-b".into(), weight: 1 },
            ],
        );
        let manager = GroupManager::new(vec![a, b, agg.clone()]);

        let keys = KeyProvider::new(Arc::new(NullStore));
        // Only sub-b has a usable key.
        keys.register_group(2, vec![Arc::new(ApiKey::new(1, "sk".into(), false, None))], 3);

        let selector = SubGroupSelector::new();
        for _ in 0..10 {
            let picked = selector.select(&agg, &manager, &keys).unwrap();
            assert_eq!(picked.as_deref(), Some("sub-b"));
        }
    }

    #[tokio::test]
    async fn aggregate_with_no_eligible_sub_group_errors() {
        let a = standard(1, "sub-a");
        let agg = aggregate(2, "agg1", vec![SubGroupRef { name: "sub-a".into(), weight: 1 }]);
        let manager = GroupManager::new(vec![a, agg.clone()]);
        let keys = KeyProvider::new(Arc::new(NullStore));

        let selector = SubGroupSelector::new();
        assert!(matches!(
            selector.select(&agg, &manager, &keys),
            Err(ProxyError::NoKeysAvailable(_))
        ));
    }

    #[test]
    fn unknown_group_is_not_found() {
        let manager = GroupManager::new(vec![standard(1, "g1")]);
        assert!(matches!(
            manager.get_group_by_name("missing"),
            Err(ProxyError::NotFound(_))
        ));
    }
}
