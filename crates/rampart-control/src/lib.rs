//! Rampart control plane.
//!
//! Releases resource versions of a gateway stage to every bound data plane.
//! A release is validated and recorded synchronously; the registry writes
//! run later as outbox jobs claimed by the [`release::Dispatcher`].

pub mod api;
pub mod binding;
pub mod config;
pub mod db;
pub mod error;
mod keyed_lock;
pub mod release;
pub mod server;

#[cfg(test)]
mod testing;
