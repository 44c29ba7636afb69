//! Configuration for copying stored results into another bucket.
//!
//! The destination is described by the usual `S3_*` properties. Each source
//! property is read from its `TIES_DB_COPY_SRC_`-prefixed variant when that
//! is non-blank, and from the unprefixed property otherwise.

use std::collections::HashMap;

use mpf_models::{props, PropertyLookup, PropertyLookupExt};
use url::Url;

use super::client::RequestAuth;
use crate::addressing::UrlStyle;
use crate::error::{StorageError, StorageResult};

/// One side of a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySide {
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub session_token: Option<String>,
    pub region: Option<String>,
    pub use_virtual_host: bool,
    pub host: Option<String>,
    /// Object key prefix. Empty when unset.
    pub prefix: String,
    pub style: UrlStyle,
}

impl CopySide {
    fn read(get: impl Fn(&str) -> Option<String>) -> Self {
        let use_virtual_host = get(props::S3_USE_VIRTUAL_HOST)
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let host = get(props::S3_HOST);
        Self {
            access_key: get(props::S3_ACCESS_KEY),
            secret_key: get(props::S3_SECRET_KEY),
            session_token: get(props::S3_SESSION_TOKEN),
            region: get(props::S3_REGION),
            use_virtual_host,
            style: UrlStyle::from_parts(use_virtual_host, host.as_deref()),
            host,
            prefix: get(props::S3_UPLOAD_OBJECT_KEY_PREFIX).unwrap_or_default(),
        }
    }

    fn auth(&self, add_token: bool) -> StorageResult<RequestAuth> {
        RequestAuth::from_values(
            self.access_key.clone(),
            self.secret_key.clone(),
            self.session_token.clone(),
            add_token,
        )
    }
}

/// Source and destination settings of a copy.
#[derive(Debug, Clone)]
pub struct CopyConfig {
    pub source: CopySide,
    pub destination: CopySide,
    pub destination_bucket_uri: Url,
    pub add_token: bool,
}

impl CopyConfig {
    pub fn from_properties(props: &dyn PropertyLookup) -> StorageResult<Self> {
        let bucket = props.get_non_blank(props::S3_RESULTS_BUCKET).ok_or_else(|| {
            StorageError::config(format!(
                "Copying results requires the {} property.",
                props::S3_RESULTS_BUCKET
            ))
        })?;
        let destination_bucket_uri = Url::parse(bucket.trim()).map_err(|e| {
            StorageError::config(format!(
                "The {} property \"{}\" is not a valid URI: {}",
                props::S3_RESULTS_BUCKET,
                bucket,
                e
            ))
        })?;

        let source = CopySide::read(|name| source_property(props, name));
        let destination = CopySide::read(|name| props.get_non_blank(name));

        Ok(Self {
            source,
            destination,
            destination_bucket_uri,
            add_token: props.get_bool(props::S3_ADD_TOKEN),
        })
    }

    /// A server-side copy is possible only when both sides use the same
    /// credentials, region, addressing and endpoint.
    pub fn can_use_same_client(&self, source_uri: &str) -> StorageResult<bool> {
        let (src, dst) = (&self.source, &self.destination);
        if src.access_key != dst.access_key
            || src.secret_key != dst.secret_key
            || src.session_token != dst.session_token
            || src.region != dst.region
            || src.use_virtual_host != dst.use_virtual_host
            || src.host != dst.host
        {
            return Ok(false);
        }
        let source_endpoint = src.style.endpoint_of(source_uri)?;
        let destination_endpoint = dst.style.endpoint_of(self.destination_bucket_uri.as_str())?;
        Ok(source_endpoint == destination_endpoint)
    }

    pub fn destination_bucket(&self) -> StorageResult<String> {
        self.destination
            .style
            .bucket_name_of(&self.destination_bucket_uri)
    }

    /// Replace the source prefix of `source_key` (or the destination prefix,
    /// when the object was stored with that one) by the destination prefix.
    pub fn destination_key(&self, source_key: &str) -> String {
        let stripped = source_key
            .strip_prefix(self.source.prefix.as_str())
            .or_else(|| source_key.strip_prefix(self.destination.prefix.as_str()))
            .unwrap_or(source_key);
        format!("{}{}", self.destination.prefix, stripped)
    }

    pub fn source_auth(&self) -> StorageResult<RequestAuth> {
        self.source.auth(self.add_token)
    }

    pub fn destination_auth(&self) -> StorageResult<RequestAuth> {
        self.destination.auth(self.add_token)
    }
}

fn source_property(props: &dyn PropertyLookup, name: &str) -> Option<String> {
    props
        .get_non_blank(&format!("{}{}", props::COPY_SOURCE_PREFIX, name))
        .or_else(|| props.get_non_blank(name))
}

/// Outcome of copying a batch of results.
#[derive(Debug, Default)]
pub struct CopyResults {
    /// Source URI to destination URI.
    pub copied: HashMap<Url, Url>,
    pub failed: HashMap<Url, StorageError>,
}

impl CopyResults {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn destination_of(&self, source: &Url) -> Option<&Url> {
        self.copied.get(source)
    }

    pub(crate) fn record(&mut self, source: Url, outcome: StorageResult<Url>) {
        match outcome {
            Ok(destination) => {
                self.copied.insert(source, destination);
            }
            Err(err) => {
                self.failed.insert(source, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpf_models::MapProperties;

    fn base() -> MapProperties {
        MapProperties::new()
            .with(props::S3_RESULTS_BUCKET, "http://minio:9000/dest")
            .with(props::S3_ACCESS_KEY, "dest-access")
            .with(props::S3_SECRET_KEY, "dest-secret")
    }

    #[test]
    fn test_source_falls_back_to_destination_properties() {
        let config = CopyConfig::from_properties(&base()).unwrap();
        assert_eq!(config.source.access_key.as_deref(), Some("dest-access"));
        assert!(config
            .can_use_same_client("http://minio:9000/src/ab/cd/abcd")
            .unwrap());
    }

    #[test]
    fn test_prefixed_source_properties_win() {
        let props = base()
            .with("TIES_DB_COPY_SRC_S3_ACCESS_KEY", "src-access")
            .with("TIES_DB_COPY_SRC_S3_SECRET_KEY", "  ");
        let config = CopyConfig::from_properties(&props).unwrap();
        assert_eq!(config.source.access_key.as_deref(), Some("src-access"));
        assert_eq!(config.source.secret_key.as_deref(), Some("dest-secret"));
        assert!(!config
            .can_use_same_client("http://minio:9000/src/ab/cd/abcd")
            .unwrap());
    }

    #[test]
    fn test_different_endpoint_needs_two_clients() {
        let config = CopyConfig::from_properties(&base()).unwrap();
        assert!(!config
            .can_use_same_client("http://other:9000/src/ab/cd/abcd")
            .unwrap());
    }

    #[test]
    fn test_destination_key_swaps_prefix() {
        let props = base()
            .with("TIES_DB_COPY_SRC_S3_UPLOAD_OBJECT_KEY_PREFIX", "old/")
            .with(props::S3_UPLOAD_OBJECT_KEY_PREFIX, "new/");
        let config = CopyConfig::from_properties(&props).unwrap();
        assert_eq!(config.destination_key("old/ab/cd/abcd"), "new/ab/cd/abcd");
        assert_eq!(config.destination_key("new/ab/cd/abcd"), "new/ab/cd/abcd");
        assert_eq!(config.destination_key("ab/cd/abcd"), "new/ab/cd/abcd");
    }

    #[test]
    fn test_destination_key_without_prefixes_is_unchanged() {
        let config = CopyConfig::from_properties(&base()).unwrap();
        assert_eq!(config.destination_key("ab/cd/abcd"), "ab/cd/abcd");
    }

    #[test]
    fn test_bucket_is_required() {
        let err = CopyConfig::from_properties(&MapProperties::new()).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_session_token_is_passed_through() {
        let props = base().with(props::S3_SESSION_TOKEN, "session");
        let config = CopyConfig::from_properties(&props).unwrap();
        let auth = config.destination_auth().unwrap();
        assert_eq!(auth.session_token.as_deref(), Some("session"));
        assert_eq!(config.destination_bucket().unwrap(), "dest");
    }
}
