//! Content hashing and object naming.

use std::fmt;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{StorageError, StorageResult};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// SHA-256 of some content, as 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentKey(String);

impl ContentKey {
    /// Wrap an existing hex digest. Fails unless it is 64 lowercase hex chars.
    pub fn from_hex(hex: impl Into<String>) -> StorageResult<Self> {
        let hex = hex.into();
        let valid = hex.len() == 64
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(StorageError::protocol(format!(
                "\"{}\" is not a SHA-256 hex digest",
                hex
            )));
        }
        Ok(Self(hex))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `prefix + h[0..2] + "/" + h[2..4] + "/" + h`.
    ///
    /// A missing or blank prefix is treated as empty. The prefix is used as
    /// is, so callers wanting a directory-like prefix must include the
    /// trailing `/`.
    pub fn object_key(&self, prefix: Option<&str>) -> String {
        let prefix = prefix.filter(|p| !p.trim().is_empty()).unwrap_or("");
        let hash = self.as_str();
        format!("{}{}/{}/{}", prefix, &hash[0..2], &hash[2..4], hash)
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn finish(hasher: Sha256) -> ContentKey {
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest.iter() {
        hex.push_str(&format!("{:02x}", byte));
    }
    ContentKey(hex)
}

/// Stream a reader to the end once, hashing everything read.
pub async fn hash_reader<R>(reader: &mut R) -> StorageResult<ContentKey>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(finish(hasher))
}

pub async fn hash_file(path: &Path) -> StorageResult<ContentKey> {
    let mut file = tokio::fs::File::open(path).await?;
    hash_reader(&mut file).await
}

pub fn hash_bytes(data: &[u8]) -> ContentKey {
    let mut hasher = Sha256::new();
    hasher.update(data);
    finish(hasher)
}
