/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/repo.rs
*
* Client for Helm chart repositories.
*
* A chart repository is a plain HTTP tree: `<url>/index.yaml` lists every
* chart and its versions, and each version points at one or more `.tgz`
* archives. This module fetches and decodes the index, resolves a chart and
* version inside it, and unpacks an archive to read the chart's README and
* default `values.yaml`.
*
* Architecture:
* - `ChartRepository` is the seam the reconciler depends on; the HTTP
*   implementation lives here and tests substitute in-memory fakes.
* - Index documents are cached per store URL for a short TTL so a burst of
*   reconciliations against the same store costs a single download.
* - Archive extraction is CPU-bound and runs on the blocking pool.
*
* None of these operations mutate persisted state. All are safe to retry.
*
* SPDX-License-Identifier: Apache-2.0
*/

use async_trait::async_trait;
use flate2::read::GzDecoder;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::Component;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepoError {
    #[error("Chart repository unreachable: {0}")]
    RepoUnreachable(String),

    #[error("Chart index is malformed: {0}")]
    IndexMalformed(String),

    #[error("Chart index has no entries")]
    NoEntries,

    #[error("Chart '{0}' not found in repository index")]
    PackageNotFound(String),

    #[error("Version '{version}' of chart '{chart}' not found")]
    VersionNotFound { chart: String, version: String },

    #[error("Chart content unavailable: {0}")]
    ContentUnavailable(String),
}

impl RepoError {
    /// Condition reason token for this error.
    pub fn reason(&self) -> &'static str {
        match self {
            RepoError::RepoUnreachable(_) => "RepoUnreachable",
            RepoError::IndexMalformed(_) => "IndexMalformed",
            RepoError::NoEntries => "NoEntries",
            RepoError::PackageNotFound(_) => "PackageNotFound",
            RepoError::VersionNotFound { .. } => "VersionNotFound",
            RepoError::ContentUnavailable(_) => "ContentUnavailable",
        }
    }

    /// Not-found errors only clear when the spec changes. Everything else
    /// may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RepoError::PackageNotFound(_) | RepoError::VersionNotFound { .. }
        )
    }
}

/// A decoded `index.yaml`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartIndex {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub entries: BTreeMap<String, Vec<ChartVersion>>,
}

/// One version of one chart as listed in the index.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartVersion {
    #[serde(default)]
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub app_version: String,
}

/// Catalogue view of a chart version.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ChartInformation {
    pub version: String,
    pub keywords: Vec<String>,
    pub icon: String,
    pub description: String,
}

/// Text extracted from a chart archive.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChartContent {
    pub readme: String,
    pub values: String,
}

fn versions_of<'a>(index: &'a ChartIndex, name: &str) -> Result<&'a [ChartVersion], RepoError> {
    match index.entries.get(name) {
        Some(versions) if !versions.is_empty() => Ok(versions),
        _ => Err(RepoError::PackageNotFound(name.to_string())),
    }
}

/// Finds `name` at `version` in the index. An empty version picks the first
/// listed entry, which repositories keep sorted newest first.
pub fn resolve_version(
    index: &ChartIndex,
    name: &str,
    version: &str,
) -> Result<ChartVersion, RepoError> {
    let versions = versions_of(index, name)?;
    let wanted = version.trim();
    if wanted.is_empty() {
        return versions
            .first()
            .cloned()
            .ok_or_else(|| RepoError::PackageNotFound(name.to_string()));
    }
    let bare = wanted.trim_start_matches('v');
    versions
        .iter()
        .find(|v| v.version == wanted || v.version.trim_start_matches('v') == bare)
        .cloned()
        .ok_or_else(|| RepoError::VersionNotFound {
            chart: name.to_string(),
            version: wanted.to_string(),
        })
}

/// Lists every published version of `name` with its catalogue metadata.
pub fn chart_versions(index: &ChartIndex, name: &str) -> Result<Vec<ChartInformation>, RepoError> {
    if index.entries.is_empty() {
        return Err(RepoError::NoEntries);
    }
    Ok(versions_of(index, name)?
        .iter()
        .map(|v| ChartInformation {
            version: v.version.clone(),
            keywords: v.keywords.clone(),
            icon: v.icon.clone(),
            description: v.description.clone(),
        })
        .collect())
}

/// Access to chart repositories.
#[async_trait]
pub trait ChartRepository: Send + Sync {
    async fn fetch_index(&self, store_url: &str) -> Result<Arc<ChartIndex>, RepoError>;

    async fn fetch_content(
        &self,
        store_url: &str,
        chart: &ChartVersion,
    ) -> Result<ChartContent, RepoError>;
}

struct CachedIndex {
    index: Arc<ChartIndex>,
    expires_at: Instant,
}

/// `ChartRepository` over HTTP(S).
pub struct HttpChartRepository {
    http: reqwest::Client,
    cache_ttl: Duration,
    cache: RwLock<HashMap<String, CachedIndex>>,
}

impl HttpChartRepository {
    pub fn new(request_timeout: Duration, cache_ttl: Duration) -> Result<Self, RepoError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("helmapp-operator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RepoError::RepoUnreachable(e.to_string()))?;
        Ok(Self {
            http,
            cache_ttl,
            cache: RwLock::new(HashMap::new()),
        })
    }

    async fn cached(&self, key: &str) -> Option<Arc<ChartIndex>> {
        let cache = self.cache.read().await;
        cache
            .get(key)
            .filter(|entry| Instant::now() < entry.expires_at)
            .map(|entry| Arc::clone(&entry.index))
    }

    async fn download(&self, url: Url) -> Result<Vec<u8>, reqwest::Error> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

fn store_base(store_url: &str) -> Result<Url, RepoError> {
    let mut base = store_url.trim().to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Url::parse(&base).map_err(|e| RepoError::RepoUnreachable(format!("invalid store URL '{store_url}': {e}")))
}

/// Resolves a chart archive URL. Relative URLs are relative to the store.
fn archive_url(store_url: &str, raw: &str) -> Result<Url, RepoError> {
    match Url::parse(raw) {
        Ok(url) => Ok(url),
        Err(_) => store_base(store_url)?
            .join(raw)
            .map_err(|e| RepoError::ContentUnavailable(format!("invalid archive URL '{raw}': {e}"))),
    }
}

/// Decodes an index document.
pub fn parse_index(raw: &[u8]) -> Result<ChartIndex, RepoError> {
    let index: ChartIndex =
        serde_yaml::from_slice(raw).map_err(|e| RepoError::IndexMalformed(e.to_string()))?;
    if index.entries.is_empty() {
        return Err(RepoError::NoEntries);
    }
    Ok(index)
}

/// Reads `<chart>/README.md` and `<chart>/values.yaml` out of a `.tgz` chart
/// archive. Files from subcharts are ignored.
pub fn extract_chart_content(archive: &[u8]) -> Result<ChartContent, RepoError> {
    let unavailable = |e: std::io::Error| RepoError::ContentUnavailable(e.to_string());
    let mut tarball = tar::Archive::new(GzDecoder::new(archive));
    let mut readme = None;
    let mut values = None;

    for entry in tarball.entries().map_err(unavailable)? {
        let mut entry = entry.map_err(unavailable)?;
        let path = entry.path().map_err(unavailable)?.into_owned();
        let parts: Vec<_> = path
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect();
        let file = match parts.as_slice() {
            [Component::Normal(_), Component::Normal(file)] => file.to_string_lossy().into_owned(),
            _ => continue,
        };
        let slot = match file.as_str() {
            "values.yaml" => &mut values,
            "README.md" => &mut readme,
            _ => continue,
        };
        let mut text = String::new();
        entry.read_to_string(&mut text).map_err(unavailable)?;
        *slot = Some(text);
        if readme.is_some() && values.is_some() {
            break;
        }
    }

    let values = values.ok_or_else(|| {
        RepoError::ContentUnavailable("chart archive has no values.yaml".to_string())
    })?;
    Ok(ChartContent {
        readme: readme.unwrap_or_default(),
        values,
    })
}

#[async_trait]
impl ChartRepository for HttpChartRepository {
    async fn fetch_index(&self, store_url: &str) -> Result<Arc<ChartIndex>, RepoError> {
        let key = store_url.trim().trim_end_matches('/').to_string();
        if let Some(index) = self.cached(&key).await {
            debug!(store = %key, "Chart index served from cache");
            return Ok(index);
        }

        let url = store_base(store_url)?
            .join("index.yaml")
            .map_err(|e| RepoError::RepoUnreachable(e.to_string()))?;
        debug!(%url, "Fetching chart index");
        let raw = self.download(url.clone()).await.map_err(|e| {
            warn!(%url, error = %e, "Failed to fetch chart index");
            RepoError::RepoUnreachable(e.to_string())
        })?;

        let index = Arc::new(parse_index(&raw)?);
        if !self.cache_ttl.is_zero() {
            let mut cache = self.cache.write().await;
            cache.insert(
                key,
                CachedIndex {
                    index: Arc::clone(&index),
                    expires_at: Instant::now() + self.cache_ttl,
                },
            );
        }
        Ok(index)
    }

    async fn fetch_content(
        &self,
        store_url: &str,
        chart: &ChartVersion,
    ) -> Result<ChartContent, RepoError> {
        let raw = chart.urls.first().ok_or_else(|| {
            RepoError::ContentUnavailable(format!(
                "chart '{}' version '{}' lists no archive URL",
                chart.name, chart.version
            ))
        })?;
        let url = archive_url(store_url, raw)?;
        debug!(%url, "Downloading chart archive");
        let archive = self
            .download(url)
            .await
            .map_err(|e| RepoError::ContentUnavailable(e.to_string()))?;

        tokio::task::spawn_blocking(move || extract_chart_content(&archive))
            .await
            .map_err(|e| RepoError::ContentUnavailable(e.to_string()))?
    }
}
