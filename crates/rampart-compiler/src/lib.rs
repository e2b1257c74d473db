//! Compiles gateway resource versions into registry resource objects.
//!
//! Converts bound plugin configs and legacy access strategies into
//! normalized plugin configs, then turns a stage and its resource version
//! into the services, routes and plugin metadata a data plane reads.

pub mod access_strategy;
pub mod error;
pub mod model;
pub mod plugin;
pub mod release;

pub use access_strategy::AccessStrategyType;
pub use error::CompileError;
pub use model::{
    BackendHost, BoundAccessStrategy, BoundPlugin, HttpProxyConfig, IpGroup, LoadBalance,
    PluginSnapshot, ProxySnapshot, ProxyType, ReleaseInput, ReleaseMarker, ResourceAuth,
    ResourceSnapshot, ResourceVersionData, StageBackend, StageConfig, CURRENT_SCHEMA_VERSION,
};
pub use plugin::{ConvertedPlugin, PluginType};
pub use release::{
    compile_release, resources_checksum, substitute_stage_vars, validate_release, CompileOptions,
    CompiledRelease, VERSION_PROBE_PATH,
};

