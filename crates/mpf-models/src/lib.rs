//! Shared data models for the MPF storage layer.
//!
//! This crate provides:
//! - Job and media identifiers
//! - Output kinds and artifact keys
//! - The job property lookup contract and well-known property names

pub mod error;
pub mod job;
pub mod output;
pub mod properties;

pub use error::{ModelError, ModelResult};
pub use job::{JobId, MediaId};
pub use output::{ArtifactKey, OutputKind};
pub use properties::{props, EnvProperties, MapProperties, PropertyLookup, PropertyLookupExt};
