//! Source-image services: a root-jailed directory and a remote HTTP origin.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{StatusCode, header::LAST_MODIFIED};
use time::OffsetDateTime;
use tokio::fs;
use tracing::debug;
use url::Url;

use crate::application::ports::{
    DependencyHint, SourceDescriptor, SourceError, SourceImageService, SourceMetadata,
};
use crate::cache::SourceMeta;
use crate::infra::http::date::parse_http_date;

const SOURCE: &str = "infra::source";

/// Originals read from a local directory.
#[derive(Debug, Clone)]
pub struct FilesystemSource {
    root: PathBuf,
}

impl FilesystemSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, source: &SourceDescriptor) -> Result<PathBuf, SourceError> {
        let relative = source.relative_path();
        let invalid = || SourceError::InvalidPath(source.path().to_string());
        if relative.is_empty() || relative.contains('\\') {
            return Err(invalid());
        }
        if Path::new(relative)
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(invalid());
        }
        Ok(self.root.join(relative))
    }

    fn io_error(source: &SourceDescriptor, err: std::io::Error) -> SourceError {
        match err.kind() {
            ErrorKind::NotFound => SourceError::NotFound(source.path().to_string()),
            _ => SourceError::unavailable(source.path(), err.to_string()),
        }
    }
}

#[async_trait]
impl SourceImageService for FilesystemSource {
    async fn metadata(&self, source: &SourceDescriptor) -> Result<SourceMetadata, SourceError> {
        let file = self.resolve(source)?;
        let metadata = fs::metadata(&file)
            .await
            .map_err(|err| Self::io_error(source, err))?;
        if !metadata.is_file() {
            return Err(SourceError::NotFound(source.path().to_string()));
        }

        let last_modified = metadata.modified().ok().map(OffsetDateTime::from);
        Ok(SourceMetadata {
            meta: SourceMeta { last_modified },
            dependency: DependencyHint::LocalFile(file),
        })
    }

    async fn fetch(&self, source: &SourceDescriptor) -> Result<Bytes, SourceError> {
        let file = self.resolve(source)?;
        let bytes = fs::read(&file)
            .await
            .map_err(|err| Self::io_error(source, err))?;
        Ok(Bytes::from(bytes))
    }
}

/// Originals fetched from a remote origin under `base_url`.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpSource {
    pub fn new(client: reqwest::Client, mut base_url: Url, timeout: Duration) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            client,
            base_url,
            timeout,
        }
    }

    fn url_for(&self, source: &SourceDescriptor) -> Result<Url, SourceError> {
        let url = self
            .base_url
            .join(source.relative_path())
            .map_err(|_| SourceError::InvalidPath(source.path().to_string()))?;
        // `join` resolves dot segments; anything that escapes the base is rejected.
        if url.origin() != self.base_url.origin() || !url.path().starts_with(self.base_url.path())
        {
            return Err(SourceError::InvalidPath(source.path().to_string()));
        }
        Ok(url)
    }

    fn check_status(source: &SourceDescriptor, status: StatusCode) -> Result<(), SourceError> {
        match status {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                Err(SourceError::NotFound(source.path().to_string()))
            }
            status => Err(SourceError::unavailable(
                source.path(),
                format!("origin answered {status}"),
            )),
        }
    }
}

#[async_trait]
impl SourceImageService for HttpSource {
    async fn metadata(&self, source: &SourceDescriptor) -> Result<SourceMetadata, SourceError> {
        let url = self.url_for(source)?;
        let response = self
            .client
            .head(url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| SourceError::unavailable(source.path(), err.to_string()))?;
        Self::check_status(source, response.status())?;

        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_http_date);
        debug!(
            target = SOURCE,
            op = "metadata",
            url = %url,
            has_last_modified = last_modified.is_some(),
            result = "ok",
            "Fetched remote source metadata"
        );

        Ok(SourceMetadata {
            meta: SourceMeta { last_modified },
            dependency: DependencyHint::Remote(url),
        })
    }

    async fn fetch(&self, source: &SourceDescriptor) -> Result<Bytes, SourceError> {
        let url = self.url_for(source)?;
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| SourceError::unavailable(source.path(), err.to_string()))?;
        Self::check_status(source, response.status())?;

        response
            .bytes()
            .await
            .map_err(|err| SourceError::unavailable(source.path(), err.to_string()))
    }
}
