//! Batch binding of plugin configs and access strategies to scopes.
//!
//! A bind request names one source and the full set of scopes it should
//! be bound to. The planner diffs that set against the current bindings
//! of the same type, refuses scopes where a plugin config and an access
//! strategy would produce the same plugin, and applies the result in one
//! store transaction.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use rampart_compiler::{AccessStrategyType, PluginType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{BindingChanges, BindingWrite, ReleaseStore, ScopeType};
use crate::release::{ReleaseError, ReleaseOrchestrator, TriggerRequest, TriggerSource};

/// What is being bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingSource {
    PluginConfig { id: Uuid, plugin_type: PluginType },
    AccessStrategy { id: Uuid, strategy_type: AccessStrategyType },
}

impl BindingSource {
    pub fn id(&self) -> Uuid {
        match self {
            BindingSource::PluginConfig { id, .. } | BindingSource::AccessStrategy { id, .. } => *id,
        }
    }

    /// Type code stored on the binding row.
    pub fn code(&self) -> &'static str {
        match self {
            BindingSource::PluginConfig { plugin_type, .. } => plugin_type.code(),
            BindingSource::AccessStrategy { strategy_type, .. } => strategy_type.code(),
        }
    }

    /// The plugin the source ends up as on the data plane.
    pub fn plugin_type(&self) -> PluginType {
        match self {
            BindingSource::PluginConfig { plugin_type, .. } => *plugin_type,
            BindingSource::AccessStrategy { strategy_type, .. } => strategy_type.plugin_type(),
        }
    }

    /// Type codes of the other source kind that produce the same plugin.
    pub fn conflicting_codes(&self) -> Vec<&'static str> {
        match self {
            BindingSource::PluginConfig { plugin_type, .. } => AccessStrategyType::ALL
                .iter()
                .filter(|t| t.plugin_type() == *plugin_type)
                .map(|t| t.code())
                .collect(),
            BindingSource::AccessStrategy { strategy_type, .. } => {
                vec![strategy_type.plugin_type().code()]
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            BindingSource::PluginConfig { .. } => "plugin config",
            BindingSource::AccessStrategy { .. } => "access strategy",
        }
    }

    fn conflict(&self, scope_type: ScopeType, scope_id: Uuid) -> ReleaseError {
        ReleaseError::BindingConflict {
            scope_type,
            scope_id,
            plugin_type: self.plugin_type().code().to_string(),
            existing: match self {
                BindingSource::PluginConfig { .. } => "access strategy",
                BindingSource::AccessStrategy { .. } => "plugin config",
            },
        }
    }
}

/// The diff between requested and current bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BindPlan {
    /// Scopes with no binding of this type, or already bound to the source.
    pub normal_bind: Vec<Uuid>,
    /// Scopes bound to another source of the same type.
    pub overwrite_bind: Vec<Uuid>,
    /// Scopes bound to the source but no longer requested.
    pub unbind: Vec<Uuid>,
}

impl BindPlan {
    /// `normal_bind` then `overwrite_bind`.
    pub fn bind_ids(&self) -> Vec<Uuid> {
        self.normal_bind
            .iter()
            .chain(&self.overwrite_bind)
            .copied()
            .collect()
    }

    pub fn is_noop(&self) -> bool {
        self.normal_bind.is_empty() && self.overwrite_bind.is_empty() && self.unbind.is_empty()
    }
}

/// Diff `requested` against `current` `(scope_id, source_id)` pairs of one type.
///
/// Duplicate requested ids collapse; request order is kept.
pub fn plan(source_id: Uuid, requested: &[Uuid], current: &[(Uuid, Uuid)]) -> BindPlan {
    let bound: HashMap<Uuid, Uuid> = current.iter().copied().collect();
    let mut seen = BTreeSet::new();
    let mut plan = BindPlan::default();

    for scope_id in requested {
        if !seen.insert(*scope_id) {
            continue;
        }
        match bound.get(scope_id) {
            Some(owner) if *owner != source_id => plan.overwrite_bind.push(*scope_id),
            _ => plan.normal_bind.push(*scope_id),
        }
    }
    for (scope_id, owner) in current {
        if *owner == source_id && !seen.contains(scope_id) && !plan.unbind.contains(scope_id) {
            plan.unbind.push(*scope_id);
        }
    }
    plan
}

/// Which kind of source a request binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    PluginConfig,
    AccessStrategy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BindRequest {
    pub source_id: Uuid,
    pub scope_type: ScopeType,
    pub scope_ids: Vec<Uuid>,
    #[serde(default)]
    pub operator: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BindOutcome {
    pub source_id: Uuid,
    pub scope_type: ScopeType,
    pub dry_run: bool,
    #[serde(flatten)]
    pub plan: BindPlan,
    /// Stages re-released because their bindings changed.
    pub released_stages: Vec<Uuid>,
}

pub struct BindingPlanner {
    store: Arc<dyn ReleaseStore>,
    orchestrator: Option<Arc<ReleaseOrchestrator>>,
}

impl BindingPlanner {
    pub fn new(store: Arc<dyn ReleaseStore>, orchestrator: Option<Arc<ReleaseOrchestrator>>) -> Self {
        Self {
            store,
            orchestrator,
        }
    }

    pub async fn bind(
        &self,
        gateway_id: Uuid,
        kind: SourceKind,
        request: BindRequest,
        dry_run: bool,
    ) -> Result<BindOutcome, ReleaseError> {
        let source = self.resolve_source(gateway_id, kind, request.source_id).await?;
        let scope_type = request.scope_type;
        if scope_type == ScopeType::Stage {
            for stage_id in &request.scope_ids {
                match self.store.get_stage(*stage_id).await? {
                    Some(stage) if stage.gateway_id == gateway_id => {}
                    _ => return Err(ReleaseError::not_found("stage", *stage_id)),
                }
            }
        }

        let current = self.current_bindings(gateway_id, &source, scope_type).await?;
        let plan = plan(source.id(), &request.scope_ids, &current);
        self.check_conflicts(gateway_id, &source, scope_type, &plan.bind_ids())
            .await?;

        let mut outcome = BindOutcome {
            source_id: source.id(),
            scope_type,
            dry_run,
            plan,
            released_stages: Vec::new(),
        };
        if dry_run || outcome.plan.is_noop() {
            return Ok(outcome);
        }

        let write = self
            .store
            .apply_bindings(&BindingChanges {
                gateway_id,
                source,
                scope_type,
                upsert: outcome.plan.bind_ids(),
                delete: outcome.plan.unbind.clone(),
                conflicting_codes: source.conflicting_codes(),
            })
            .await?;
        if let BindingWrite::Conflict { scope_id } = write {
            return Err(source.conflict(scope_type, scope_id));
        }
        rampart_telemetry::log_bindings_applied!(
            gateway_id = %gateway_id,
            source = source.kind(),
            source_id = %source.id(),
            scope_type = scope_type.as_str(),
            bound = outcome.plan.normal_bind.len() + outcome.plan.overwrite_bind.len(),
            overwritten = outcome.plan.overwrite_bind.len(),
            unbound = outcome.plan.unbind.len(),
        );

        if scope_type == ScopeType::Stage {
            outcome.released_stages = self
                .release_stages(gateway_id, &outcome.plan, &request.operator)
                .await;
        }
        Ok(outcome)
    }

    async fn resolve_source(
        &self,
        gateway_id: Uuid,
        kind: SourceKind,
        id: Uuid,
    ) -> Result<BindingSource, ReleaseError> {
        match kind {
            SourceKind::PluginConfig => {
                let config = match self.store.get_plugin_config(id).await? {
                    Some(config) if config.gateway_id == gateway_id => config,
                    _ => return Err(ReleaseError::not_found("plugin config", id)),
                };
                let plugin_type = PluginType::parse(&config.plugin_type)
                    .map_err(|e| ReleaseError::Validation(e.to_string()))?;
                Ok(BindingSource::PluginConfig { id, plugin_type })
            }
            SourceKind::AccessStrategy => {
                let strategy = match self.store.get_access_strategy(id).await? {
                    Some(strategy) if strategy.gateway_id == gateway_id => strategy,
                    _ => return Err(ReleaseError::not_found("access strategy", id)),
                };
                let strategy_type = AccessStrategyType::parse(&strategy.strategy_type)
                    .map_err(|e| ReleaseError::Validation(e.to_string()))?;
                Ok(BindingSource::AccessStrategy { id, strategy_type })
            }
        }
    }

    /// `(scope_id, source_id)` of every binding of the source's type.
    async fn current_bindings(
        &self,
        gateway_id: Uuid,
        source: &BindingSource,
        scope_type: ScopeType,
    ) -> Result<Vec<(Uuid, Uuid)>, ReleaseError> {
        let code = source.code();
        Ok(match source {
            BindingSource::PluginConfig { .. } => self
                .store
                .list_plugin_bindings(gateway_id, scope_type)
                .await?
                .into_iter()
                .filter(|b| b.plugin_type == code)
                .map(|b| (b.scope_id, b.config_id))
                .collect(),
            BindingSource::AccessStrategy { .. } => self
                .store
                .list_strategy_bindings(gateway_id, scope_type)
                .await?
                .into_iter()
                .filter(|b| b.strategy_type == code)
                .map(|b| (b.scope_id, b.access_strategy_id))
                .collect(),
        })
    }

    /// Refuse scopes already holding the same plugin from the other source kind.
    ///
    /// Advisory only; `apply_bindings` repeats the check inside its transaction.
    async fn check_conflicts(
        &self,
        gateway_id: Uuid,
        source: &BindingSource,
        scope_type: ScopeType,
        scope_ids: &[Uuid],
    ) -> Result<(), ReleaseError> {
        let codes = source.conflicting_codes();
        let occupied: BTreeSet<Uuid> = match source {
            BindingSource::PluginConfig { .. } => self
                .store
                .list_strategy_bindings(gateway_id, scope_type)
                .await?
                .into_iter()
                .filter(|b| codes.iter().any(|code| *code == b.strategy_type))
                .map(|b| b.scope_id)
                .collect(),
            BindingSource::AccessStrategy { .. } => self
                .store
                .list_plugin_bindings(gateway_id, scope_type)
                .await?
                .into_iter()
                .filter(|b| codes.iter().any(|code| *code == b.plugin_type))
                .map(|b| b.scope_id)
                .collect(),
        };
        match scope_ids.iter().find(|id| occupied.contains(id)) {
            Some(scope_id) => Err(source.conflict(scope_type, *scope_id)),
            None => Ok(()),
        }
    }

    /// Roll every touched stage. Failures are logged; the bindings stay applied.
    async fn release_stages(&self, gateway_id: Uuid, plan: &BindPlan, operator: &str) -> Vec<Uuid> {
        let Some(orchestrator) = &self.orchestrator else {
            return Vec::new();
        };
        let bound = plan.bind_ids().into_iter().map(|id| (id, TriggerSource::PluginBind));
        let unbound = plan.unbind.iter().map(|id| (*id, TriggerSource::PluginUnbind));

        let mut released = Vec::new();
        for (stage_id, source) in bound.chain(unbound) {
            let result = orchestrator
                .trigger(TriggerRequest {
                    gateway_id,
                    stage_id: Some(stage_id),
                    source,
                    operator: operator.to_string(),
                })
                .await;
            match result {
                Ok(outcome) if !outcome.tickets.is_empty() => released.push(stage_id),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        gateway_id = %gateway_id,
                        stage_id = %stage_id,
                        error = %e,
                        "failed to release stage after binding change"
                    );
                }
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::db::{AccessStrategy, HistoryStatus, PluginConfig};
    use crate::testing::Fixture;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn plan_partitions_the_request() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let s = ids(5);
        let current = vec![(s[1], me), (s[2], other), (s[3], me), (s[4], other)];

        let plan = plan(me, &[s[0], s[1], s[2], s[0]], &current);

        assert_eq!(plan.normal_bind, vec![s[0], s[1]]);
        assert_eq!(plan.overwrite_bind, vec![s[2]]);
        assert_eq!(plan.unbind, vec![s[3]]);
    }

    #[test]
    fn unbind_never_contains_requested_ids() {
        let me = Uuid::new_v4();
        let s = ids(3);
        let current: Vec<_> = s.iter().map(|id| (*id, me)).collect();

        let plan = plan(me, &s[..2], &current);
        let requested: BTreeSet<Uuid> = s[..2].iter().copied().collect();

        assert!(plan.unbind.iter().all(|id| !requested.contains(id)));
        let bound: BTreeSet<Uuid> = plan.bind_ids().into_iter().collect();
        assert_eq!(bound, requested);
        assert_eq!(plan.unbind, vec![s[2]]);
    }

    #[test]
    fn empty_request_unbinds_everything_of_the_source() {
        let me = Uuid::new_v4();
        let s = ids(2);
        let current = vec![(s[0], me), (s[1], Uuid::new_v4())];
        let plan = plan(me, &[], &current);
        assert!(plan.normal_bind.is_empty());
        assert_eq!(plan.unbind, vec![s[0]]);
    }

    fn plugin_config(fx: &Fixture, plugin_type: &str, config: &str) -> PluginConfig {
        let config = PluginConfig {
            id: Uuid::new_v4(),
            gateway_id: fx.gateway.id,
            name: format!("{plugin_type}-config"),
            plugin_type: plugin_type.into(),
            config: config.into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        fx.store.insert_plugin_config(config.clone());
        config
    }

    fn strategy(fx: &Fixture, strategy_type: &str, config: serde_json::Value) -> AccessStrategy {
        let strategy = AccessStrategy {
            id: Uuid::new_v4(),
            gateway_id: fx.gateway.id,
            name: format!("{strategy_type}-strategy"),
            strategy_type: strategy_type.into(),
            config,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        fx.store.insert_access_strategy(strategy.clone());
        strategy
    }

    fn request(source_id: Uuid, scope_type: ScopeType, scope_ids: Vec<Uuid>) -> BindRequest {
        BindRequest {
            source_id,
            scope_type,
            scope_ids,
            operator: "admin".into(),
        }
    }

    const CORS_YAML: &str = "allow_origins: http://a.example.com\nallow_methods: GET\nallow_headers: '*'\n";

    #[tokio::test]
    async fn dry_run_does_not_write() {
        let fx = Fixture::new(&["dp-a"]);
        let config = plugin_config(&fx, "bk-cors", CORS_YAML);
        let resources = ids(2);

        let outcome = fx
            .planner
            .bind(
                fx.gateway.id,
                SourceKind::PluginConfig,
                request(config.id, ScopeType::Resource, resources.clone()),
                true,
            )
            .await
            .unwrap();
        assert!(outcome.dry_run);
        assert_eq!(outcome.plan.normal_bind, resources);
        assert!(fx
            .store
            .list_plugin_bindings(fx.gateway.id, ScopeType::Resource)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn execute_overwrites_and_unbinds() {
        let fx = Fixture::new(&["dp-a"]);
        let first = plugin_config(&fx, "bk-cors", CORS_YAML);
        let second = plugin_config(&fx, "bk-cors", CORS_YAML);
        let s = ids(3);

        fx.planner
            .bind(
                fx.gateway.id,
                SourceKind::PluginConfig,
                request(first.id, ScopeType::Resource, vec![s[0], s[1]]),
                false,
            )
            .await
            .unwrap();
        let outcome = fx
            .planner
            .bind(
                fx.gateway.id,
                SourceKind::PluginConfig,
                request(second.id, ScopeType::Resource, vec![s[1], s[2]]),
                false,
            )
            .await
            .unwrap();
        assert_eq!(outcome.plan.normal_bind, vec![s[2]]);
        assert_eq!(outcome.plan.overwrite_bind, vec![s[1]]);

        let bindings = fx
            .store
            .list_plugin_bindings(fx.gateway.id, ScopeType::Resource)
            .await
            .unwrap();
        assert_eq!(bindings.len(), 3);
        let owner = |scope: Uuid| bindings.iter().find(|b| b.scope_id == scope).unwrap().config_id;
        assert_eq!(owner(s[0]), first.id);
        assert_eq!(owner(s[1]), second.id);
        assert_eq!(owner(s[2]), second.id);

        let outcome = fx
            .planner
            .bind(
                fx.gateway.id,
                SourceKind::PluginConfig,
                request(first.id, ScopeType::Resource, vec![]),
                false,
            )
            .await
            .unwrap();
        assert_eq!(outcome.plan.unbind, vec![s[0]]);
        assert_eq!(
            fx.store
                .list_plugin_bindings(fx.gateway.id, ScopeType::Resource)
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn strategy_and_plugin_of_same_type_conflict() {
        let fx = Fixture::new(&["dp-a"]);
        let cors_strategy = strategy(
            &fx,
            "cors",
            serde_json::json!({
                "allow_origins": ["http://a.example.com"],
                "allow_methods": ["GET"],
                "allow_headers": ["*"],
            }),
        );
        let config = plugin_config(&fx, "bk-cors", CORS_YAML);
        let scope = Uuid::new_v4();

        fx.planner
            .bind(
                fx.gateway.id,
                SourceKind::AccessStrategy,
                request(cors_strategy.id, ScopeType::Resource, vec![scope]),
                false,
            )
            .await
            .unwrap();

        let err = fx
            .planner
            .bind(
                fx.gateway.id,
                SourceKind::PluginConfig,
                request(config.id, ScopeType::Resource, vec![scope]),
                true,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReleaseError::BindingConflict { scope_id, scope_type: ScopeType::Resource, .. }
                if scope_id == scope
        ));
    }

    #[test]
    fn conflicting_codes_cross_source_kinds() {
        let id = Uuid::new_v4();
        let cors_config = BindingSource::PluginConfig {
            id,
            plugin_type: PluginType::parse("bk-cors").unwrap(),
        };
        assert_eq!(cors_config.conflicting_codes(), vec!["cors"]);

        let cors_strategy = BindingSource::AccessStrategy {
            id,
            strategy_type: AccessStrategyType::parse("cors").unwrap(),
        };
        assert_eq!(cors_strategy.conflicting_codes(), vec!["bk-cors"]);
    }

    #[tokio::test]
    async fn store_refuses_conflicting_write_without_precheck() {
        let fx = Fixture::new(&["dp-a"]);
        let cors_strategy = strategy(
            &fx,
            "cors",
            serde_json::json!({
                "allow_origins": ["http://a.example.com"],
                "allow_methods": ["GET"],
                "allow_headers": ["*"],
            }),
        );
        let config = plugin_config(&fx, "bk-cors", CORS_YAML);
        let free = Uuid::new_v4();
        let taken = Uuid::new_v4();

        fx.planner
            .bind(
                fx.gateway.id,
                SourceKind::AccessStrategy,
                request(cors_strategy.id, ScopeType::Resource, vec![taken]),
                false,
            )
            .await
            .unwrap();

        // A bind that passed its pre-check before the strategy was bound.
        let source = BindingSource::PluginConfig {
            id: config.id,
            plugin_type: PluginType::parse("bk-cors").unwrap(),
        };
        let write = fx
            .store
            .apply_bindings(&BindingChanges {
                gateway_id: fx.gateway.id,
                source,
                scope_type: ScopeType::Resource,
                upsert: vec![free, taken],
                delete: vec![],
                conflicting_codes: source.conflicting_codes(),
            })
            .await
            .unwrap();

        assert_eq!(write, BindingWrite::Conflict { scope_id: taken });
        assert!(fx
            .store
            .list_plugin_bindings(fx.gateway.id, ScopeType::Resource)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn concurrent_cross_kind_binds_leave_one_binding() {
        let fx = Fixture::new(&["dp-a"]);
        let cors_strategy = strategy(
            &fx,
            "cors",
            serde_json::json!({
                "allow_origins": ["http://a.example.com"],
                "allow_methods": ["GET"],
                "allow_headers": ["*"],
            }),
        );
        let config = plugin_config(&fx, "bk-cors", CORS_YAML);
        let scope = Uuid::new_v4();

        let (by_strategy, by_config) = tokio::join!(
            fx.planner.bind(
                fx.gateway.id,
                SourceKind::AccessStrategy,
                request(cors_strategy.id, ScopeType::Resource, vec![scope]),
                false,
            ),
            fx.planner.bind(
                fx.gateway.id,
                SourceKind::PluginConfig,
                request(config.id, ScopeType::Resource, vec![scope]),
                false,
            ),
        );
        assert_eq!(
            usize::from(by_strategy.is_ok()) + usize::from(by_config.is_ok()),
            1
        );
        let plugins = fx
            .store
            .list_plugin_bindings(fx.gateway.id, ScopeType::Resource)
            .await
            .unwrap();
        let strategies = fx
            .store
            .list_strategy_bindings(fx.gateway.id, ScopeType::Resource)
            .await
            .unwrap();
        assert_eq!(plugins.len() + strategies.len(), 1);
    }

    #[tokio::test]
    async fn different_plugin_types_do_not_conflict() {
        let fx = Fixture::new(&["dp-a"]);
        let rate = strategy(
            &fx,
            "rate_limit",
            serde_json::json!({ "rates": { "__default": { "tokens": 10, "period": 60 } } }),
        );
        let config = plugin_config(&fx, "bk-cors", CORS_YAML);
        let scope = Uuid::new_v4();

        for (kind, id) in [
            (SourceKind::AccessStrategy, rate.id),
            (SourceKind::PluginConfig, config.id),
        ] {
            fx.planner
                .bind(
                    fx.gateway.id,
                    kind,
                    request(id, ScopeType::Resource, vec![scope]),
                    false,
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn unknown_source_is_not_found() {
        let fx = Fixture::new(&["dp-a"]);
        let err = fx
            .planner
            .bind(
                fx.gateway.id,
                SourceKind::PluginConfig,
                request(Uuid::new_v4(), ScopeType::Resource, ids(1)),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::NotFound { kind: "plugin config", .. }));
    }

    #[tokio::test]
    async fn stage_binding_rolls_the_stage() {
        let fx = Fixture::new(&["dp-a"]);
        fx.orchestrator.release(fx.release_request()).await.unwrap();
        fx.dispatcher.drain().await.unwrap();
        let config = plugin_config(&fx, "bk-cors", CORS_YAML);

        let outcome = fx
            .planner
            .bind(
                fx.gateway.id,
                SourceKind::PluginConfig,
                request(config.id, ScopeType::Stage, vec![fx.stage.id]),
                false,
            )
            .await
            .unwrap();
        assert_eq!(outcome.released_stages, vec![fx.stage.id]);
        fx.dispatcher.drain().await.unwrap();

        let histories = fx.store.list_histories(fx.gateway.id, None).await.unwrap();
        assert_eq!(histories.len(), 2);
        assert_eq!(histories[0].source, TriggerSource::PluginBind);
        assert_eq!(histories[0].status, HistoryStatus::Success);
    }

    #[tokio::test]
    async fn unknown_stage_scope_is_rejected() {
        let fx = Fixture::new(&["dp-a"]);
        let config = plugin_config(&fx, "bk-cors", CORS_YAML);
        let err = fx
            .planner
            .bind(
                fx.gateway.id,
                SourceKind::PluginConfig,
                request(config.id, ScopeType::Stage, ids(1)),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::NotFound { kind: "stage", .. }));
    }
}
