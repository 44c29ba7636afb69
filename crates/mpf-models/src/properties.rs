//! Job property lookup.
//!
//! Every storage decision is driven by the merged job/media/action
//! configuration. The storage layer only ever reads it through
//! [`PropertyLookup`], a pure `name -> value` function.

use std::collections::HashMap;
use std::str::FromStr;

use crate::error::{ModelError, ModelResult};

/// Well-known property names.
pub mod props {
    pub const S3_ACCESS_KEY: &str = "S3_ACCESS_KEY";
    pub const S3_SECRET_KEY: &str = "S3_SECRET_KEY";
    pub const S3_SESSION_TOKEN: &str = "S3_SESSION_TOKEN";
    pub const S3_RESULTS_BUCKET: &str = "S3_RESULTS_BUCKET";
    pub const S3_REGION: &str = "S3_REGION";
    pub const S3_USE_VIRTUAL_HOST: &str = "S3_USE_VIRTUAL_HOST";
    pub const S3_HOST: &str = "S3_HOST";
    pub const S3_UPLOAD_OBJECT_KEY_PREFIX: &str = "S3_UPLOAD_OBJECT_KEY_PREFIX";
    pub const S3_UPLOAD_ONLY: &str = "S3_UPLOAD_ONLY";
    pub const S3_ADD_TOKEN: &str = "S3_ADD_TOKEN";

    /// Prefix that selects the copy-source variant of an `S3_*` property.
    pub const COPY_SOURCE_PREFIX: &str = "TIES_DB_COPY_SRC_";

    pub const HTTP_STORAGE_SERVICE_URI: &str = "HTTP_STORAGE_SERVICE_URI";

    pub const UPLOAD_THREAD_COUNT: &str = "STORAGE_UPLOAD_THREAD_COUNT";
    pub const UPLOAD_SEGMENT_SIZE: &str = "STORAGE_UPLOAD_SEGMENT_SIZE";
    pub const UPLOAD_RETRY_COUNT: &str = "STORAGE_UPLOAD_RETRY_COUNT";
    pub const PARALLEL_UPLOAD_COUNT: &str = "STORAGE_PARALLEL_UPLOAD_COUNT";
}

/// Read-only view of the effective configuration for one job, media or action.
pub trait PropertyLookup: Send + Sync {
    /// Returns the raw value, or `None` when the property is not set.
    fn get(&self, name: &str) -> Option<String>;
}

/// Typed accessors available on every [`PropertyLookup`].
pub trait PropertyLookupExt: PropertyLookup {
    /// Returns the value only when it contains something other than whitespace.
    fn get_non_blank(&self, name: &str) -> Option<String> {
        self.get(name).filter(|v| !v.trim().is_empty())
    }

    /// `true` only for a case-insensitive `"true"`; anything else is `false`.
    fn get_bool(&self, name: &str) -> bool {
        self.get(name)
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// Parses a non-blank value, failing when it is present but malformed.
    fn get_parsed<T>(&self, name: &str) -> ModelResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_non_blank(name) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| ModelError::invalid_property(name, raw.clone(), e.to_string())),
        }
    }
}

impl<P: PropertyLookup + ?Sized> PropertyLookupExt for P {}

/// In-memory properties, mostly used by callers that already merged their
/// configuration and by tests.
#[derive(Debug, Clone, Default)]
pub struct MapProperties {
    values: HashMap<String, String>,
}

impl MapProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }
}

impl From<HashMap<String, String>> for MapProperties {
    fn from(values: HashMap<String, String>) -> Self {
        Self { values }
    }
}

impl PropertyLookup for MapProperties {
    fn get(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

impl PropertyLookup for HashMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        HashMap::get(self, name).cloned()
    }
}

/// Properties read from process environment variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvProperties;

impl PropertyLookup for EnvProperties {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}
