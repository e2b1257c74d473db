//! REST API handlers for the control plane.

mod bindings;
mod health;
mod metrics;
mod releases;
mod router;


pub use router::{create_router, AppState};
