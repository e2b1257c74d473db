//! Builds compiler input from store rows.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use rampart_compiler::{BoundAccessStrategy, BoundPlugin, ReleaseInput, ReleaseMarker};
use uuid::Uuid;

use super::error::ReleaseError;
use crate::db::{Gateway, ReleaseStore, ResourceVersion, ScopeType, Stage};

/// Collect the bindings that apply to `stage` and `version`, in binding order.
pub(crate) async fn assemble_input(
    store: &dyn ReleaseStore,
    gateway: &Gateway,
    stage: &Stage,
    version: &ResourceVersion,
    marker: ReleaseMarker,
) -> Result<ReleaseInput, ReleaseError> {
    let configs: HashMap<Uuid, _> = store
        .list_plugin_configs(gateway.id)
        .await?
        .into_iter()
        .map(|c| (c.id, c))
        .collect();
    let strategies: HashMap<Uuid, _> = store
        .list_access_strategies(gateway.id)
        .await?
        .into_iter()
        .map(|s| (s.id, s))
        .collect();

    let bound_plugin = |config_id: Uuid| {
        configs
            .get(&config_id)
            .map(|c| BoundPlugin {
                plugin_type: c.plugin_type.clone(),
                config: c.config.clone(),
            })
            .ok_or(ReleaseError::not_found("plugin config", config_id))
    };
    let bound_strategy = |strategy_id: Uuid| {
        strategies
            .get(&strategy_id)
            .map(|s| BoundAccessStrategy {
                strategy_type: s.strategy_type.clone(),
                config: s.config.clone(),
            })
            .ok_or(ReleaseError::not_found("access strategy", strategy_id))
    };

    let mut stage_plugins = Vec::new();
    for binding in store.list_plugin_bindings(gateway.id, ScopeType::Stage).await? {
        if binding.scope_id == stage.id {
            stage_plugins.push(bound_plugin(binding.config_id)?);
        }
    }

    let mut stage_strategies = Vec::new();
    for binding in store.list_strategy_bindings(gateway.id, ScopeType::Stage).await? {
        if binding.scope_id == stage.id {
            stage_strategies.push(bound_strategy(binding.access_strategy_id)?);
        }
    }

    let backend_ids: BTreeSet<Uuid> = stage.backends.iter().map(|b| b.id).collect();
    let mut backend_plugins: BTreeMap<Uuid, Vec<BoundPlugin>> = BTreeMap::new();
    for binding in store
        .list_plugin_bindings(gateway.id, ScopeType::BackendService)
        .await?
    {
        if backend_ids.contains(&binding.scope_id) {
            backend_plugins
                .entry(binding.scope_id)
                .or_default()
                .push(bound_plugin(binding.config_id)?);
        }
    }

    let resource_ids: BTreeSet<Uuid> = version.resources.iter().map(|r| r.id).collect();
    let mut resource_strategies: BTreeMap<Uuid, Vec<BoundAccessStrategy>> = BTreeMap::new();
    for binding in store
        .list_strategy_bindings(gateway.id, ScopeType::Resource)
        .await?
    {
        if resource_ids.contains(&binding.scope_id) {
            resource_strategies
                .entry(binding.scope_id)
                .or_default()
                .push(bound_strategy(binding.access_strategy_id)?);
        }
    }

    let ip_groups = store
        .list_ip_groups(gateway.id)
        .await?
        .iter()
        .map(|g| (g.id, g.to_compiler()))
        .collect();

    Ok(ReleaseInput {
        gateway: gateway.name.clone(),
        stage: stage.to_config(),
        resource_version: version.to_data(),
        stage_plugins,
        stage_strategies,
        backend_plugins,
        resource_strategies,
        ip_groups,
        marker,
    })
}
