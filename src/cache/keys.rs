//! Request fingerprinting.
//!
//! A [`CacheKey`] identifies one (resource, transform) pair. A [`StoragePath`] is where the
//! artifact for that key lives inside a backend: `{shard}/{shard}/.../{key}.{ext}`.

use std::fmt;

use sha2::{Digest, Sha256};

/// Number of digest bytes kept in a [`CacheKey`] (128 bits).
const KEY_DIGEST_BYTES: usize = 16;

/// Deepest supported shard fan-out; one directory level per hex character of the key.
pub const MAX_PREFIX_DEPTH: usize = 16;

/// Separator between the resource path and the instruction inside the digest input.
const FIELD_SEPARATOR: u8 = 0;

/// Opaque digest of a request path plus its canonical transform instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend-relative location of a cached artifact.
///
/// Layout only; identity lives in [`CacheKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoragePath(String);

impl StoragePath {
    /// Wrap a path reported by a backend listing.
    pub fn from_backend(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File extension without the leading dot, if any.
    pub fn extension(&self) -> Option<&str> {
        self.file_name().rsplit_once('.').map(|(_, ext)| ext)
    }

    /// The key this path was built from (its file name without extension).
    pub fn cache_key(&self) -> CacheKey {
        let name = self.file_name();
        let stem = name.split_once('.').map_or(name, |(stem, _)| stem);
        CacheKey(stem.to_string())
    }

    fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives cache keys and sharded storage paths. Pure; no I/O.
#[derive(Debug, Clone, Copy)]
pub struct Fingerprinter {
    prefix_depth: usize,
}

impl Fingerprinter {
    /// `prefix_depth` is clamped to [`MAX_PREFIX_DEPTH`].
    pub fn new(prefix_depth: usize) -> Self {
        Self {
            prefix_depth: prefix_depth.min(MAX_PREFIX_DEPTH),
        }
    }

    pub fn prefix_depth(&self) -> usize {
        self.prefix_depth
    }

    /// Fingerprint a canonical resource path and canonical transform instruction.
    pub fn fingerprint(&self, resource_path: &str, transform_spec: &str) -> CacheKey {
        let mut hasher = Sha256::new();
        hasher.update(resource_path.as_bytes());
        hasher.update([FIELD_SEPARATOR]);
        hasher.update(transform_spec.as_bytes());
        let digest = hasher.finalize();
        CacheKey(hex::encode(&digest[..KEY_DIGEST_BYTES]))
    }

    /// Build `{c0}/{c1}/.../{key}.{ext}` using the first `prefix_depth` key characters as
    /// directory segments. An empty extension yields a bare `{key}` file name.
    pub fn storage_path_for(&self, key: &CacheKey, extension: &str) -> StoragePath {
        let key_str = key.as_str();
        let extension = sanitize_extension(extension);
        let mut path = String::with_capacity(self.prefix_depth * 2 + key_str.len() + 8);

        for shard in key_str.chars().take(self.prefix_depth) {
            path.push(shard);
            path.push('/');
        }
        path.push_str(key_str);
        if !extension.is_empty() {
            path.push('.');
            path.push_str(&extension);
        }

        StoragePath(path)
    }
}

/// Pick the artifact extension: an explicit `format=` option wins, otherwise the
/// resource's own extension is kept.
pub fn output_extension(resource_path: &str, transform_spec: &str) -> String {
    let requested = transform_spec.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        name.eq_ignore_ascii_case("format").then(|| value.to_string())
    });

    if let Some(format) = requested.map(|value| sanitize_extension(&value))
        && !format.is_empty()
    {
        return normalize_format(&format);
    }

    let file_name = resource_path.rsplit('/').next().unwrap_or_default();
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => normalize_format(&sanitize_extension(ext)),
        _ => String::new(),
    }
}

fn normalize_format(format: &str) -> String {
    match format {
        "jpeg" => "jpg".to_string(),
        "tiff" => "tif".to_string(),
        other => other.to_string(),
    }
}

fn sanitize_extension(raw: &str) -> String {
    raw.trim_start_matches('.')
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
