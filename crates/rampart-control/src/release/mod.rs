//! Release orchestration: validation, audit history and rollout dispatch.

mod dispatcher;
mod error;
mod input;
mod orchestrator;
mod policy;
mod registry_provider;
mod reporter;

#[cfg(test)]
mod tests;

pub use dispatcher::{Dispatcher, DispatcherConfig, SUPERSEDED_MESSAGE};
pub use error::ReleaseError;
pub use orchestrator::{
    ReleaseOrchestrator, ReleaseRequest, ReleaseTicket, RevokeRequest, SkippedStage,
    TriggerOutcome, TriggerRequest,
};
pub use policy::{ReleasePolicy, TriggerSource};
pub use registry_provider::{DefaultRegistryProvider, RegistryProvider};
pub use reporter::{AttemptContext, ReleaseReporter, TracingReporter};

#[cfg(test)]
pub(crate) use reporter::testing::RecordingReporter;
