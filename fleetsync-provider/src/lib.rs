//! fleetsync provider: converges device configuration policies against a
//! fleet-management API.
//!
//! - [`clients`]: remote API boundary and an in-memory simulation of it
//! - [`resources`]: per-entity-type orchestrators built on `fleetsync_core`
//! - [`config`]: timeouts, retry defaults and call serialization
//! - [`manifest`]: desired-state files applied across many entities

pub mod clients;
pub mod config;
pub mod manifest;
pub mod model;
pub mod resources;

pub use config::ProviderConfig;
pub use manifest::{EntityOutcome, Manifest, apply_manifest};
pub use resources::{OrchestratorError, PolicyResource, Resource};
