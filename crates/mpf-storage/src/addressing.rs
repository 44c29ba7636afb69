//! Path-style and virtual-host-style S3 addressing.
//!
//! Path style: `https://host/bucket/key...`
//! Virtual-host style: `https://bucket.host/key...`, where `host` is the
//! configured base host.

use mpf_models::{props, PropertyLookup, PropertyLookupExt};
use url::Url;

use crate::error::{StorageError, StorageResult};

/// Marker used to find the bucket subdomain when no base host is configured.
const DEFAULT_VIRTUAL_HOST_MARKER: &str = ".s3.";

/// How bucket names are encoded in object-storage URIs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UrlStyle {
    PathStyle,
    VirtualHost {
        /// Lower-cased base host with any leading dot removed. `None` means
        /// the host is located by its `.s3.` label.
        host: Option<String>,
    },
}

impl UrlStyle {
    /// Select the style from `S3_USE_VIRTUAL_HOST` and `S3_HOST`.
    pub fn from_properties(props: &dyn PropertyLookup) -> Self {
        Self::from_parts(
            props.get_bool(props::S3_USE_VIRTUAL_HOST),
            props.get_non_blank(props::S3_HOST).as_deref(),
        )
    }

    pub fn from_parts(use_virtual_host: bool, host: Option<&str>) -> Self {
        if !use_virtual_host {
            return UrlStyle::PathStyle;
        }
        let host = host
            .map(|h| h.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|h| !h.is_empty());
        UrlStyle::VirtualHost { host }
    }

    pub fn is_virtual_host(&self) -> bool {
        matches!(self, UrlStyle::VirtualHost { .. })
    }

    /// Scheme, host and port of `uri`. Virtual-host style also drops the
    /// bucket subdomain.
    pub fn endpoint_of(&self, uri: &str) -> StorageResult<Url> {
        let parsed = parse(uri)?;
        let host = parsed.host_str().ok_or_else(|| {
            StorageError::addressing(format!("Could not determine S3 host from \"{}\".", uri))
        })?;

        let endpoint_host = match self {
            UrlStyle::PathStyle => host.to_string(),
            UrlStyle::VirtualHost { .. } => {
                let bucket = self.bucket_from_host(host)?;
                host[bucket.len() + 1..].to_string()
            }
        };

        let mut endpoint = format!("{}://{}", parsed.scheme(), endpoint_host);
        if let Some(port) = parsed.port() {
            endpoint.push_str(&format!(":{}", port));
        }
        parse(&endpoint)
    }

    pub fn bucket_name_of(&self, bucket_uri: &Url) -> StorageResult<String> {
        match self {
            UrlStyle::PathStyle => {
                let path = bucket_uri.path();
                if path.len() < 2 || !path.starts_with('/') {
                    return Err(StorageError::addressing(format!(
                        "Could not determine bucket name from URI: {}",
                        bucket_uri
                    )));
                }
                let bucket = match path[1..].find('/') {
                    Some(idx) => &path[1..idx + 1],
                    None => &path[1..],
                };
                Ok(decode(bucket))
            }
            UrlStyle::VirtualHost { .. } => {
                let host = bucket_uri.host_str().ok_or_else(|| {
                    StorageError::addressing(format!(
                        "Could not determine bucket name from URI: {}",
                        bucket_uri
                    ))
                })?;
                self.bucket_from_host(host)
            }
        }
    }

    /// URI of `key` inside the bucket `bucket_uri` points at.
    pub fn full_uri(&self, bucket_uri: &Url, key: &str) -> StorageResult<Url> {
        let mut full = bucket_uri.clone();
        full.set_query(None);
        full.set_fragment(None);
        match self {
            UrlStyle::PathStyle => {
                let path = format!("{}/{}", bucket_uri.path().trim_end_matches('/'), key);
                full.set_path(&path);
            }
            UrlStyle::VirtualHost { .. } => full.set_path(key),
        }
        Ok(full)
    }

    /// Inverse of [`UrlStyle::full_uri`].
    pub fn split_bucket_and_key(&self, uri: &str) -> StorageResult<(String, String)> {
        let parsed = parse(uri)?;
        let path = parsed.path().strip_prefix('/').unwrap_or(parsed.path());

        match self {
            UrlStyle::PathStyle => {
                let mut parts = path.splitn(2, '/');
                let bucket = parts.next().unwrap_or("");
                let key = parts.next().unwrap_or("");
                if bucket.trim().is_empty() || key.trim().is_empty() {
                    return Err(StorageError::addressing(format!(
                        "Unable to determine bucket name and object key from uri: {}",
                        uri
                    )));
                }
                Ok((decode(bucket), decode(key)))
            }
            UrlStyle::VirtualHost { .. } => {
                let bucket = self.bucket_name_of(&parsed)?;
                if path.trim().is_empty() {
                    return Err(StorageError::addressing(format!(
                        "Unable to determine object key from uri: {}",
                        uri
                    )));
                }
                Ok((bucket, decode(path)))
            }
        }
    }

    fn bucket_from_host(&self, host: &str) -> StorageResult<String> {
        let host = host.to_ascii_lowercase();
        let base = match self {
            UrlStyle::VirtualHost { host: Some(base) } => base,
            UrlStyle::VirtualHost { host: None } => {
                return match host.find(DEFAULT_VIRTUAL_HOST_MARKER) {
                    Some(idx) if idx > 0 => Ok(host[..idx].to_string()),
                    _ => Err(StorageError::addressing(format!(
                        "The host name \"{}\" did not contain {}",
                        host, DEFAULT_VIRTUAL_HOST_MARKER
                    ))),
                };
            }
            UrlStyle::PathStyle => {
                return Err(StorageError::addressing(
                    "Path-style URIs do not carry the bucket in the host name",
                ))
            }
        };

        if host == *base {
            return Err(StorageError::addressing(format!(
                "The host name \"{}\" only contained the configured S3 host and did not \
                 contain a bucket name",
                host
            )));
        }
        match host.strip_suffix(base.as_str()).and_then(|b| b.strip_suffix('.')) {
            Some(bucket) if !bucket.is_empty() => Ok(bucket.to_string()),
            _ => Err(StorageError::addressing(format!(
                "The host name \"{}\" did not end with the configured S3 host \"{}\"",
                host, base
            ))),
        }
    }
}

/// Endpoint as the string handed to S3 clients and used as a cache key.
pub fn endpoint_string(endpoint: &Url) -> String {
    endpoint.as_str().trim_end_matches('/').to_string()
}

fn parse(uri: &str) -> StorageResult<Url> {
    Url::parse(uri.trim())
        .map_err(|e| StorageError::addressing(format!("Invalid URI \"{}\": {}", uri, e)))
}

fn decode(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}
