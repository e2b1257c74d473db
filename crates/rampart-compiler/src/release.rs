//! Compile one stage of a gateway into registry objects.
//!
//! Produces one service per stage backend, one route per enabled HTTP
//! resource, a version probe route and the gateway-wide plugin metadata.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use rampart_registry::{
    PluginEntry, PluginMetadata, ResourceObject, Route, RouteTimeout, Service, TypedResource,
    Upstream, UpstreamNode,
};
use regex_lite::Regex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::access_strategy::AccessStrategyType;
use crate::error::CompileError;
use crate::model::{
    BoundAccessStrategy, HttpProxyConfig, ReleaseInput, ResourceSnapshot, StageBackend,
    StageConfig,
};
use crate::plugin::{
    ConvertedPlugin, PluginType, PROXY_REWRITE_PLUGIN, RESOURCE_CONTEXT_PLUGIN,
    STAGE_CONTEXT_PLUGIN,
};

/// Path segment of the version probe route.
pub const VERSION_PROBE_PATH: &str = "__rampart_version";
/// Methods an `ANY` resource expands to.
pub const ALL_METHODS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];
/// Subpath routes lose to exact routes on the same prefix.
pub const SUBPATH_ROUTE_PRIORITY: i32 = -1000;

pub const LABEL_GATEWAY: &str = "rampart.io/gateway";
pub const LABEL_STAGE: &str = "rampart.io/stage";
pub const LABEL_PUBLISH_ID: &str = "rampart.io/publish-id";

/// Options that do not come from the release rows.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Gateway-wide plugin metadata, keyed by plugin name.
    pub plugin_metadata: BTreeMap<String, Value>,
}

/// The full set of objects for one gateway+stage prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRelease {
    pub services: Vec<Service>,
    pub routes: Vec<Route>,
    pub plugin_metadatas: Vec<PluginMetadata>,
}

impl CompiledRelease {
    /// Wire objects sorted by kind then id.
    pub fn into_resources(self) -> Result<Vec<ResourceObject>, CompileError> {
        let mut out = Vec::with_capacity(
            self.services.len() + self.routes.len() + self.plugin_metadatas.len(),
        );
        for s in &self.services {
            out.push(s.to_object()?);
        }
        for r in &self.routes {
            out.push(r.to_object()?);
        }
        for m in &self.plugin_metadatas {
            out.push(m.to_object()?);
        }
        out.sort_by(|a, b| (a.kind.as_str(), &a.id).cmp(&(b.kind.as_str(), &b.id)));
        Ok(out)
    }
}

/// SHA-256 over wire objects in the order given, hex encoded.
///
/// Feed it the output of [`CompiledRelease::into_resources`] so equal
/// releases hash equal.
pub fn resources_checksum(objects: &[ResourceObject]) -> String {
    let mut hasher = Sha256::new();
    for object in objects {
        hasher.update(object.kind.as_str().as_bytes());
        hasher.update(object.id.as_bytes());
        hasher.update(object.body.to_string().as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{env\.([A-Za-z0-9_]+)\}").expect("valid pattern"))
}

/// Replace `{env.NAME}` with stage variables.
pub fn substitute_stage_vars(
    resource: &str,
    path: &str,
    vars: &BTreeMap<String, String>,
) -> Result<String, CompileError> {
    let mut out = String::with_capacity(path.len());
    let mut last = 0;
    for caps in env_var_pattern().captures_iter(path) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = vars
            .get(name.as_str())
            .ok_or_else(|| CompileError::UndefinedStageVar {
                resource: resource.to_string(),
                var: name.as_str().to_string(),
            })?;
        out.push_str(&path[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&path[last..]);
    Ok(out)
}

/// Domain checks that must hold before anything is written.
///
/// Legacy schemas, backends missing from the stage and undefined stage
/// variables are all rejected here.
pub fn validate_release(input: &ReleaseInput) -> Result<(), CompileError> {
    let version = &input.resource_version;
    if !version.is_current_schema() {
        return Err(CompileError::LegacySchema(version.schema_version.clone()));
    }
    for resource in enabled_http_resources(input) {
        let (resource, proxy) = resource?;
        if input.stage.backend(proxy.backend_id).is_none() {
            return Err(CompileError::MissingBackend {
                resource: resource.name.clone(),
                backend_id: proxy.backend_id,
            });
        }
        substitute_stage_vars(&resource.name, &proxy.path, &input.stage.vars)?;
    }
    Ok(())
}

fn enabled_http_resources(
    input: &ReleaseInput,
) -> impl Iterator<Item = Result<(&ResourceSnapshot, HttpProxyConfig), CompileError>> {
    let stage = input.stage.name.as_str();
    input
        .resource_version
        .resources
        .iter()
        .filter(move |r| !r.is_disabled_on(stage))
        .filter_map(|r| match r.http_proxy() {
            Ok(Some(proxy)) => Some(Ok((r, proxy))),
            Ok(None) => None,
            Err(e) => Some(Err(CompileError::invalid(
                format!("proxy of '{}'", r.name),
                e.to_string(),
            ))),
        })
}

/// Compile a release into services, routes and plugin metadata.
pub fn compile_release(
    input: &ReleaseInput,
    options: &CompileOptions,
) -> Result<CompiledRelease, CompileError> {
    validate_release(input)?;

    let labels = base_labels(input);
    let stage_plugins = stage_plugin_entries(input)?;

    let mut services = Vec::with_capacity(input.stage.backends.len());
    for backend in &input.stage.backends {
        services.push(compile_service(input, backend, &labels, &stage_plugins)?);
    }

    let mut routes = Vec::new();
    for resource in enabled_http_resources(input) {
        let (resource, proxy) = resource?;
        routes.push(compile_route(input, resource, &proxy, &labels)?);
    }
    routes.push(version_probe_route(input, &labels));
    routes.sort_by(|a, b| a.id.cmp(&b.id));

    let plugin_metadatas = options
        .plugin_metadata
        .iter()
        .map(|(name, config)| PluginMetadata {
            id: name.clone(),
            config: config.clone(),
        })
        .collect();

    tracing::debug!(
        gateway = %input.gateway,
        stage = %input.stage.name,
        services = services.len(),
        routes = routes.len(),
        "release compiled"
    );

    Ok(CompiledRelease {
        services,
        routes,
        plugin_metadatas,
    })
}

fn base_labels(input: &ReleaseInput) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_GATEWAY.to_string(), input.gateway.clone()),
        (LABEL_STAGE.to_string(), input.stage.name.clone()),
        (
            LABEL_PUBLISH_ID.to_string(),
            input.marker.publish_id.to_string(),
        ),
    ])
}

pub fn service_id(gateway: &str, stage: &str, backend: &str) -> String {
    format!("{gateway}.{stage}.{backend}")
}

fn route_id(gateway: &str, stage: &str, suffix: &str) -> String {
    format!("{gateway}.{stage}.{suffix}")
}

/// Attach converted plugins, rejecting a second plugin of the same type.
fn push_unique(
    scope: &str,
    entries: &mut Vec<PluginEntry>,
    seen: &mut BTreeSet<PluginType>,
    plugin: ConvertedPlugin,
) -> Result<(), CompileError> {
    if !seen.insert(plugin.plugin_type) {
        return Err(CompileError::DuplicatePlugin {
            scope: scope.to_string(),
            plugin: plugin.type_code().to_string(),
        });
    }
    entries.push(plugin.into_entry());
    Ok(())
}

fn convert_strategy(
    input: &ReleaseInput,
    strategy: &BoundAccessStrategy,
) -> Result<ConvertedPlugin, CompileError> {
    AccessStrategyType::parse(&strategy.strategy_type)?.convert(&strategy.config, &input.ip_groups)
}

fn stage_plugin_entries(input: &ReleaseInput) -> Result<Vec<PluginEntry>, CompileError> {
    let scope = format!("stage '{}'", input.stage.name);
    let mut entries = vec![stage_context(input.gateway.as_str(), &input.stage)];
    let mut seen = BTreeSet::new();
    for bound in &input.stage_plugins {
        let plugin = PluginType::parse(&bound.plugin_type)?.convert(&bound.config)?;
        push_unique(&scope, &mut entries, &mut seen, plugin)?;
    }
    for strategy in &input.stage_strategies {
        push_unique(&scope, &mut entries, &mut seen, convert_strategy(input, strategy)?)?;
    }
    Ok(entries)
}

fn stage_context(gateway: &str, stage: &StageConfig) -> PluginEntry {
    PluginEntry::new(
        STAGE_CONTEXT_PLUGIN,
        json!({
            "bk_gateway_name": gateway,
            "bk_stage_name": stage.name,
            "vars": stage.vars,
        }),
    )
}

fn parse_host(backend: &StageBackend, scheme: &str, raw: &str) -> Result<(String, u16), CompileError> {
    let invalid = |reason: String| CompileError::InvalidBackend {
        backend: backend.name.clone(),
        reason,
    };
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        other => return Err(invalid(format!("unsupported scheme '{other}'"))),
    };
    let port_of = |port: &str| {
        port.parse::<u16>()
            .map_err(|_| invalid(format!("invalid port in '{raw}'")))
    };
    let (host, port) = if let Some(rest) = raw.strip_prefix('[') {
        // [v6] or [v6]:port; the brackets stay on the host
        let Some(end) = rest.find(']') else {
            return Err(invalid(format!("unterminated '[' in '{raw}'")));
        };
        let (host, tail) = raw.split_at(end + 2);
        match tail {
            "" => (host, default_port),
            _ => match tail.strip_prefix(':') {
                Some(port) => (host, port_of(port)?),
                None => return Err(invalid(format!("unexpected '{tail}' after ']' in '{raw}'"))),
            },
        }
    } else {
        match raw.split_once(':') {
            // more than one colon is a bare IPv6 literal without a port
            Some((host, port)) if !port.contains(':') => (host, port_of(port)?),
            _ => (raw, default_port),
        }
    };
    if host.is_empty() {
        return Err(invalid(format!("empty host in '{raw}'")));
    }
    Ok((host.to_string(), port))
}

fn compile_service(
    input: &ReleaseInput,
    backend: &StageBackend,
    labels: &BTreeMap<String, String>,
    plugins: &[PluginEntry],
) -> Result<Service, CompileError> {
    let first = backend.hosts.first().ok_or_else(|| CompileError::InvalidBackend {
        backend: backend.name.clone(),
        reason: "no hosts configured".to_string(),
    })?;
    let scheme = first.scheme.to_ascii_lowercase();

    let mut nodes = Vec::with_capacity(backend.hosts.len());
    for host in &backend.hosts {
        if !host.scheme.eq_ignore_ascii_case(&scheme) {
            return Err(CompileError::InvalidBackend {
                backend: backend.name.clone(),
                reason: "hosts mix http and https".to_string(),
            });
        }
        let (name, port) = parse_host(backend, &scheme, &host.host)?;
        nodes.push(UpstreamNode {
            host: name,
            port,
            weight: host.weight,
            priority: 0,
        });
    }

    Ok(Service {
        id: service_id(&input.gateway, &input.stage.name, &backend.name),
        name: backend.name.clone(),
        labels: labels.clone(),
        upstream: Upstream {
            lb_type: backend.load_balance.as_str().to_string(),
            scheme,
            nodes,
            timeout: RouteTimeout::uniform(backend.timeout),
        },
        plugins: backend_plugin_entries(input, backend, plugins)?,
    })
}

fn backend_plugin_entries(
    input: &ReleaseInput,
    backend: &StageBackend,
    stage_plugins: &[PluginEntry],
) -> Result<Vec<PluginEntry>, CompileError> {
    let mut entries = stage_plugins.to_vec();
    let Some(bound) = input.backend_plugins.get(&backend.id) else {
        return Ok(entries);
    };
    let mut seen = BTreeSet::new();
    for plugin in bound {
        let converted = PluginType::parse(&plugin.plugin_type)?.convert(&plugin.config)?;
        if !seen.insert(converted.plugin_type) {
            return Err(CompileError::DuplicatePlugin {
                scope: format!("backend '{}'", backend.name),
                plugin: converted.type_code().to_string(),
            });
        }
        let entry = converted.into_entry();
        match entries.iter_mut().find(|e| e.name == entry.name) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
    }
    Ok(entries)
}

fn front_uris(gateway: &str, stage: &str, path: &str, match_subpath: bool) -> Vec<String> {
    let base = format!("/{gateway}/{stage}{path}");
    if !match_subpath {
        return vec![base];
    }
    let wildcard = format!("{}/*", base.trim_end_matches('/'));
    if wildcard == base {
        vec![base]
    } else {
        vec![base, wildcard]
    }
}

fn route_methods(method: &str) -> Vec<String> {
    if method.eq_ignore_ascii_case("ANY") {
        ALL_METHODS.iter().map(|m| m.to_string()).collect()
    } else {
        vec![method.to_ascii_uppercase()]
    }
}

fn compile_route(
    input: &ReleaseInput,
    resource: &ResourceSnapshot,
    proxy: &HttpProxyConfig,
    labels: &BTreeMap<String, String>,
) -> Result<Route, CompileError> {
    let stage = &input.stage;
    let backend = stage
        .backend(proxy.backend_id)
        .ok_or_else(|| CompileError::MissingBackend {
            resource: resource.name.clone(),
            backend_id: proxy.backend_id,
        })?;
    let scope = format!("resource '{}'", resource.name);

    let mut plugins = vec![PluginEntry::new(
        RESOURCE_CONTEXT_PLUGIN,
        json!({
            "bk_resource_id": resource.id,
            "bk_resource_name": resource.name,
            "bk_resource_auth": {
                "app_verified_required": resource.auth.app_verified_required,
                "auth_verified_required": resource.auth.auth_verified_required,
                "resource_perm_required": resource.auth.resource_perm_required,
            },
        }),
    )];
    let mut seen = BTreeSet::new();
    for snapshot in &resource.plugins {
        let plugin = PluginType::parse(&snapshot.plugin_type)?.convert(&snapshot.config)?;
        push_unique(&scope, &mut plugins, &mut seen, plugin)?;
    }
    if let Some(strategies) = input.resource_strategies.get(&resource.id) {
        for strategy in strategies {
            push_unique(&scope, &mut plugins, &mut seen, convert_strategy(input, strategy)?)?;
        }
    }

    let upstream_path = substitute_stage_vars(&resource.name, &proxy.path, &stage.vars)?;
    plugins.push(PluginEntry::new(
        PROXY_REWRITE_PLUGIN,
        json!({
            "method": proxy.method.to_ascii_uppercase(),
            "path": upstream_path,
            "match_subpath": resource.match_subpath,
        }),
    ));

    Ok(Route {
        id: route_id(&input.gateway, &stage.name, &resource.id.to_string()),
        name: resource.name.clone(),
        uris: front_uris(&input.gateway, &stage.name, &resource.path, resource.match_subpath),
        methods: route_methods(&resource.method),
        service_id: Some(service_id(&input.gateway, &stage.name, &backend.name)),
        enable_websocket: resource.enable_websocket,
        priority: if resource.match_subpath {
            SUBPATH_ROUTE_PRIORITY
        } else {
            0
        },
        timeout: proxy.timeout.map(RouteTimeout::uniform),
        labels: labels.clone(),
        plugins,
    })
}

fn version_probe_route(input: &ReleaseInput, labels: &BTreeMap<String, String>) -> Route {
    let body = json!({
        "publish_id": input.marker.publish_id,
        "published_at": input.marker.published_at.timestamp(),
        "resource_version": input.resource_version.version,
    });
    Route {
        id: route_id(&input.gateway, &input.stage.name, VERSION_PROBE_PATH),
        name: VERSION_PROBE_PATH.to_string(),
        uris: vec![format!(
            "/{}/{}/{VERSION_PROBE_PATH}",
            input.gateway, input.stage.name
        )],
        methods: vec!["GET".to_string()],
        service_id: None,
        enable_websocket: false,
        priority: 0,
        timeout: None,
        labels: labels.clone(),
        plugins: vec![PluginEntry::new(
            PluginType::Mock.code(),
            json!({
                "response_status": 200,
                "response_example": body.to_string(),
                "response_headers": { "Content-Type": "application/json" },
            }),
        )],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        BackendHost, BoundPlugin, LoadBalance, PluginSnapshot, ProxySnapshot, ProxyType,
        ReleaseMarker, ResourceAuth, ResourceVersionData, CURRENT_SCHEMA_VERSION,
    };
    use chrono::{TimeZone, Utc};
    use rampart_registry::ResourceKind;
    use uuid::Uuid;

    fn backend(timeout: u32) -> StageBackend {
        StageBackend {
            id: Uuid::new_v4(),
            name: "default".into(),
            load_balance: LoadBalance::Roundrobin,
            timeout,
            hosts: vec![BackendHost {
                scheme: "http".into(),
                host: "backend.internal:8080".into(),
                weight: 100,
            }],
        }
    }

    fn resource(name: &str, backend_id: Uuid, timeout: Option<u32>) -> ResourceSnapshot {
        ResourceSnapshot {
            id: Uuid::new_v4(),
            name: name.into(),
            method: "GET".into(),
            path: format!("/{name}"),
            match_subpath: false,
            enable_websocket: false,
            disabled_stages: vec![],
            proxy: ProxySnapshot {
                proxy_type: ProxyType::Http,
                config: json!({
                    "backend_id": backend_id,
                    "method": "GET",
                    "path": format!("/api/{name}"),
                    "timeout": timeout,
                }),
            },
            auth: ResourceAuth::default(),
            plugins: vec![],
        }
    }

    fn input(resources: Vec<ResourceSnapshot>, backend: StageBackend) -> ReleaseInput {
        ReleaseInput {
            gateway: "demo".into(),
            stage: StageConfig {
                id: Uuid::new_v4(),
                name: "prod".into(),
                vars: BTreeMap::from([("region".to_string(), "eu".to_string())]),
                backends: vec![backend],
            },
            resource_version: ResourceVersionData {
                id: Uuid::new_v4(),
                version: "1.0.0".into(),
                schema_version: CURRENT_SCHEMA_VERSION.into(),
                resources,
            },
            stage_plugins: vec![],
            stage_strategies: vec![],
            backend_plugins: BTreeMap::new(),
            resource_strategies: BTreeMap::new(),
            ip_groups: BTreeMap::new(),
            marker: ReleaseMarker {
                publish_id: Uuid::nil(),
                published_at: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
            },
        }
    }

    fn route<'a>(compiled: &'a CompiledRelease, name: &str) -> &'a Route {
        compiled.routes.iter().find(|r| r.name == name).unwrap()
    }

    #[test]
    fn resource_timeout_overrides_backend_timeout() {
        let b = backend(30);
        let inherit = resource("inherit", b.id, None);
        let short = resource("short", b.id, Some(10));
        let compiled =
            compile_release(&input(vec![inherit, short], b), &CompileOptions::default()).unwrap();

        assert_eq!(compiled.services.len(), 1);
        assert_eq!(compiled.services[0].upstream.timeout, RouteTimeout::uniform(30));
        assert_eq!(route(&compiled, "inherit").timeout, None);
        assert_eq!(route(&compiled, "short").timeout, Some(RouteTimeout::uniform(10)));
    }

    #[test]
    fn routes_carry_prefixed_uris_and_service() {
        let b = backend(30);
        let mut r = resource("users", b.id, None);
        r.method = "ANY".into();
        r.match_subpath = true;
        let compiled = compile_release(&input(vec![r], b), &CompileOptions::default()).unwrap();

        let users = route(&compiled, "users");
        assert_eq!(users.uris, vec!["/demo/prod/users", "/demo/prod/users/*"]);
        assert_eq!(users.methods.len(), ALL_METHODS.len());
        assert_eq!(users.priority, SUBPATH_ROUTE_PRIORITY);
        assert_eq!(users.service_id.as_deref(), Some("demo.prod.default"));
        assert_eq!(users.labels[LABEL_STAGE], "prod");

        let service = &compiled.services[0];
        assert_eq!(service.upstream.nodes[0].host, "backend.internal");
        assert_eq!(service.upstream.nodes[0].port, 8080);
        assert_eq!(service.plugins[0].name, STAGE_CONTEXT_PLUGIN);
    }

    #[test]
    fn host_ports_handle_ipv6_literals() {
        let b = backend(30);
        let parse = |scheme: &str, raw: &str| parse_host(&b, scheme, raw);

        assert_eq!(parse("http", "backend.internal").unwrap(), ("backend.internal".into(), 80));
        assert_eq!(parse("https", "10.0.0.1:8443").unwrap(), ("10.0.0.1".into(), 8443));
        assert_eq!(parse("http", "[::1]:8080").unwrap(), ("[::1]".into(), 8080));
        assert_eq!(parse("https", "[fe80::1]").unwrap(), ("[fe80::1]".into(), 443));
        assert_eq!(parse("http", "2001:db8::1").unwrap(), ("2001:db8::1".into(), 80));
        assert_eq!(parse("http", "::1").unwrap(), ("::1".into(), 80));

        assert!(parse("http", "[::1").is_err());
        assert!(parse("http", "[::1]8080").is_err());
        assert!(parse("http", "[::1]:http").is_err());
        assert!(parse("http", "backend:99999").is_err());
        assert!(parse("http", ":8080").is_err());
        assert!(parse("ftp", "backend").is_err());
    }

    #[test]
    fn disabled_and_mock_resources_are_skipped() {
        let b = backend(30);
        let mut disabled = resource("disabled", b.id, None);
        disabled.disabled_stages = vec!["prod".into()];
        let mut mock = resource("mocked", b.id, None);
        mock.proxy = ProxySnapshot {
            proxy_type: ProxyType::Mock,
            config: json!({ "code": 200 }),
        };
        let kept = resource("kept", b.id, None);
        let compiled = compile_release(
            &input(vec![disabled, mock, kept], b),
            &CompileOptions::default(),
        )
        .unwrap();

        let names: Vec<_> = compiled.routes.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"kept"));
        assert!(names.contains(&VERSION_PROBE_PATH));
    }

    #[test]
    fn version_probe_carries_publish_marker() {
        let b = backend(30);
        let compiled = compile_release(&input(vec![], b), &CompileOptions::default()).unwrap();
        let probe = route(&compiled, VERSION_PROBE_PATH);
        assert_eq!(probe.uris, vec!["/demo/prod/__rampart_version"]);
        let mock = probe.plugin("bk-mock").unwrap();
        let body: Value =
            serde_json::from_str(mock.config["response_example"].as_str().unwrap()).unwrap();
        assert_eq!(body["publish_id"], Uuid::nil().to_string());
        assert_eq!(body["published_at"], 1767323045);
    }

    #[test]
    fn stage_vars_are_substituted() {
        let b = backend(30);
        let mut r = resource("geo", b.id, None);
        r.proxy.config["path"] = json!("/{env.region}/geo");
        let compiled = compile_release(&input(vec![r], b), &CompileOptions::default()).unwrap();
        let rewrite = route(&compiled, "geo").plugin(PROXY_REWRITE_PLUGIN).unwrap();
        assert_eq!(rewrite.config["path"], "/eu/geo");
    }

    #[test]
    fn undefined_stage_var_fails_validation() {
        let b = backend(30);
        let mut r = resource("geo", b.id, None);
        r.proxy.config["path"] = json!("/{env.zone}/geo");
        let err = validate_release(&input(vec![r], b)).unwrap_err();
        assert!(
            matches!(err, CompileError::UndefinedStageVar { ref var, .. } if var == "zone")
        );
    }

    #[test]
    fn missing_backend_and_legacy_schema_fail_validation() {
        let b = backend(30);
        let r = resource("orphan", Uuid::new_v4(), None);
        assert!(matches!(
            validate_release(&input(vec![r], b.clone())),
            Err(CompileError::MissingBackend { .. })
        ));

        let mut legacy = input(vec![], b);
        legacy.resource_version.schema_version = "1.0".into();
        assert!(matches!(
            validate_release(&legacy),
            Err(CompileError::LegacySchema(ref v)) if v == "1.0"
        ));
    }

    #[test]
    fn resource_context_comes_first() {
        let b = backend(30);
        let mut r = resource("guarded", b.id, None);
        r.plugins = vec![PluginSnapshot {
            plugin_type: "bk-ip-restriction".into(),
            config: "whitelist: |\n  10.0.0.1\n".into(),
        }];
        let mut release = input(vec![r.clone()], b);
        release.resource_strategies.insert(
            r.id,
            vec![BoundAccessStrategy {
                strategy_type: "error_status_code_200".into(),
                config: json!({}),
            }],
        );
        let compiled = compile_release(&release, &CompileOptions::default()).unwrap();
        let names: Vec<_> = route(&compiled, "guarded")
            .plugins
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(
            names,
            vec![
                RESOURCE_CONTEXT_PLUGIN,
                "bk-ip-restriction",
                "bk-status-rewrite",
                PROXY_REWRITE_PLUGIN
            ]
        );
    }

    #[test]
    fn duplicate_plugin_type_on_stage_is_rejected() {
        let b = backend(30);
        let mut release = input(vec![], b);
        release.stage_plugins = vec![BoundPlugin {
            plugin_type: "bk-cors".into(),
            config: "allow_origins: http://a.com\n".into(),
        }];
        release.stage_strategies = vec![BoundAccessStrategy {
            strategy_type: "cors".into(),
            config: json!({ "allow_origins": ["http://b.com"] }),
        }];
        assert!(matches!(
            compile_release(&release, &CompileOptions::default()),
            Err(CompileError::DuplicatePlugin { .. })
        ));
    }

    #[test]
    fn backend_plugin_replaces_stage_plugin_of_same_type() {
        let b = backend(30);
        let mut release = input(vec![], b.clone());
        release.stage_plugins = vec![BoundPlugin {
            plugin_type: "bk-cors".into(),
            config: "allow_origins: http://stage.com\n".into(),
        }];
        release.backend_plugins.insert(
            b.id,
            vec![BoundPlugin {
                plugin_type: "bk-cors".into(),
                config: "allow_origins: http://backend.com\n".into(),
            }],
        );
        let compiled = compile_release(&release, &CompileOptions::default()).unwrap();
        let plugins = &compiled.services[0].plugins;
        assert_eq!(plugins.len(), 2);
        assert_eq!(plugins[1].name, "bk-cors");
        assert_eq!(plugins[1].config["allow_origins"], "http://backend.com");
    }

    #[test]
    fn resources_are_sorted_and_checksummed() {
        let b = backend(30);
        let r = resource("a", b.id, None);
        let options = CompileOptions {
            plugin_metadata: BTreeMap::from([(
                "file-logger".to_string(),
                json!({ "log_format": { "host": "$host" } }),
            )]),
        };
        let compiled = compile_release(&input(vec![r], b), &options).unwrap();
        let objects = compiled.clone().into_resources().unwrap();
        let checksum = resources_checksum(&objects);
        assert_eq!(checksum.len(), 64);
        assert_eq!(
            resources_checksum(&compiled.into_resources().unwrap()),
            checksum
        );
        assert_ne!(resources_checksum(&objects[1..]), checksum);

        let kinds: Vec<_> = objects.iter().map(|o| o.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ResourceKind::PluginMetadata,
                ResourceKind::Route,
                ResourceKind::Route,
                ResourceKind::Service
            ]
        );
    }
}
