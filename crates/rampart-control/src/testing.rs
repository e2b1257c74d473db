//! Seeded in-memory control plane for tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use rampart_compiler::{
    BackendHost, CompileOptions, LoadBalance, ProxySnapshot, ProxyType, ResourceAuth,
    ResourceSnapshot, StageBackend, CURRENT_SCHEMA_VERSION,
};
use rampart_registry::{MemoryBackend, RetryPolicy};
use rampart_telemetry::MetricsRegistry;
use serde_json::json;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::binding::BindingPlanner;
use crate::db::{
    DataPlane, Gateway, MemoryStore, RegistryBackendConfig, ReleaseStore, ResourceVersion, Stage,
    Status,
};
use crate::release::{
    DefaultRegistryProvider, Dispatcher, DispatcherConfig, RecordingReporter, ReleaseOrchestrator,
    ReleaseRequest, TriggerSource,
};

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub registries: Arc<DefaultRegistryProvider>,
    pub reporter: Arc<RecordingReporter>,
    pub metrics: Arc<MetricsRegistry>,
    pub orchestrator: Arc<ReleaseOrchestrator>,
    pub dispatcher: Arc<Dispatcher>,
    pub planner: Arc<BindingPlanner>,
    pub gateway: Gateway,
    pub stage: Stage,
    pub version: ResourceVersion,
    pub data_planes: Vec<DataPlane>,
}

impl Fixture {
    /// Gateway `petstore`, stage `prod` and one resource version, bound to
    /// one memory data plane per name.
    pub fn new(data_plane_names: &[&str]) -> Self {
        Self::with_retry(data_plane_names, RetryPolicy::no_retry())
    }

    pub fn with_retry(data_plane_names: &[&str], retry: RetryPolicy) -> Self {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();

        let gateway = Gateway {
            id: Uuid::new_v4(),
            name: "petstore".into(),
            status: Status::Active,
            created_at: now,
        };
        store.insert_gateway(gateway.clone());

        let backend_id = Uuid::new_v4();
        let stage = Stage {
            id: Uuid::new_v4(),
            gateway_id: gateway.id,
            name: "prod".into(),
            status: Status::Active,
            vars: BTreeMap::from([("prefix".to_string(), "v1".to_string())]),
            backends: vec![StageBackend {
                id: backend_id,
                name: "default".into(),
                load_balance: LoadBalance::Roundrobin,
                timeout: 30,
                hosts: vec![BackendHost {
                    scheme: "http".into(),
                    host: "10.0.0.1:8080".into(),
                    weight: 100,
                }],
            }],
            created_at: now,
        };
        store.insert_stage(stage.clone());

        let version = ResourceVersion {
            id: Uuid::new_v4(),
            gateway_id: gateway.id,
            version: "1.0.0".into(),
            schema_version: CURRENT_SCHEMA_VERSION.into(),
            resources: vec![resource("list_pets", "/pets", backend_id, "/{env.prefix}/pets")],
            created_at: now,
        };
        store.insert_resource_version(version.clone());

        let data_planes: Vec<DataPlane> = data_plane_names
            .iter()
            .map(|name| DataPlane {
                id: Uuid::new_v4(),
                name: name.to_string(),
                status: Status::Active,
                is_recommend: false,
                key_prefix: "/rampart".into(),
                registry: RegistryBackendConfig::Memory,
                created_at: now,
            })
            .collect();
        for dp in &data_planes {
            store.insert_data_plane(dp.clone());
            store.bind_data_plane(gateway.id, dp.id);
        }

        let metrics = Arc::new(MetricsRegistry::new());
        let reporter = Arc::new(RecordingReporter::default());
        let registries = Arc::new(DefaultRegistryProvider::new("/rampart", retry));
        let wake = Arc::new(Notify::new());
        let store_dyn: Arc<dyn ReleaseStore> = store.clone();

        let orchestrator = Arc::new(ReleaseOrchestrator::new(
            Arc::clone(&store_dyn),
            reporter.clone(),
            Arc::clone(&wake),
            CompileOptions::default(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store_dyn),
            registries.clone(),
            reporter.clone(),
            Arc::clone(&metrics),
            wake,
            CompileOptions::default(),
            DispatcherConfig {
                retry: RetryPolicy {
                    base_delay_ms: 0,
                    max_delay_ms: 0,
                    ..retry
                },
                ..DispatcherConfig::default()
            },
        ));
        let planner = Arc::new(BindingPlanner::new(
            Arc::clone(&store_dyn),
            Some(Arc::clone(&orchestrator)),
        ));

        Self {
            store,
            registries,
            reporter,
            metrics,
            orchestrator,
            dispatcher,
            planner,
            gateway,
            stage,
            version,
            data_planes,
        }
    }

    pub fn release_request(&self) -> ReleaseRequest {
        ReleaseRequest {
            gateway_id: self.gateway.id,
            stage_id: self.stage.id,
            resource_version_id: self.version.id,
            comment: "first release".into(),
            operator: "admin".into(),
            source: TriggerSource::VersionPublish,
        }
    }

    /// Registry storage of the n-th data plane.
    pub fn backend(&self, index: usize) -> Arc<MemoryBackend> {
        self.registries.memory_backend(self.data_planes[index].id)
    }

    /// Store a second resource version on the same gateway.
    pub fn add_version(&self, resources: Vec<ResourceSnapshot>) -> ResourceVersion {
        let version = ResourceVersion {
            id: Uuid::new_v4(),
            gateway_id: self.gateway.id,
            version: "2.0.0".into(),
            schema_version: CURRENT_SCHEMA_VERSION.into(),
            resources,
            created_at: Utc::now(),
        };
        self.store.insert_resource_version(version.clone());
        version
    }

    pub fn backend_id(&self) -> Uuid {
        self.stage.backends[0].id
    }

    /// A dispatcher sharing the store and registries but none of the
    /// in-process locks, as a second control plane process would.
    pub fn peer_dispatcher(&self, batch_size: usize) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            self.store.clone(),
            self.registries.clone(),
            self.reporter.clone(),
            Arc::clone(&self.metrics),
            Arc::new(Notify::new()),
            CompileOptions::default(),
            DispatcherConfig {
                batch_size,
                retry: RetryPolicy::no_retry(),
                ..DispatcherConfig::default()
            },
        ))
    }

    /// Registry keys of the n-th data plane that end with `resource_id`.
    pub fn keys_of(&self, index: usize, resource_id: Uuid) -> Vec<String> {
        let suffix = resource_id.to_string();
        self.backend(index)
            .keys()
            .into_iter()
            .filter(|k| k.ends_with(&suffix))
            .collect()
    }
}

pub fn resource(name: &str, path: &str, backend_id: Uuid, upstream_path: &str) -> ResourceSnapshot {
    ResourceSnapshot {
        id: Uuid::new_v4(),
        name: name.into(),
        method: "GET".into(),
        path: path.into(),
        match_subpath: false,
        enable_websocket: false,
        disabled_stages: Vec::new(),
        proxy: ProxySnapshot {
            proxy_type: ProxyType::Http,
            config: json!({
                "backend_id": backend_id,
                "method": "GET",
                "path": upstream_path,
            }),
        },
        auth: ResourceAuth::default(),
        plugins: Vec::new(),
    }
}
