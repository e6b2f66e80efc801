/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/installer/mod.rs
*
* The installer turns a chart plus tenant overrides into objects on the
* cluster, and removes them again on deletion.
*
* Architecture:
* - `Installer` is the trait the reconciler talks to. `helm::HelmInstaller`
*   is the production implementation: it renders with `helm template` and
*   server-side applies each rendered object.
* - Every applied object carries the release labels. Uninstall and the
*   post-upgrade prune find objects by those labels rather than by what the
*   status recorded, so objects left by a partial install are still removed.
* - Every failure is classified into one of three buckets. Render failures
*   and API rejections are non-retryable and park the resource until its spec
*   changes; transient failures (timeouts, conflicts, throttling, 5xx) are
*   retried with backoff.
*
* SPDX-License-Identifier: Apache-2.0
*/

pub mod helm;

use crate::crds::{AppStore, HelmApp, HelmAppStatus, ResourceRef};
use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use thiserror::Error;

/// Helm rejects release names longer than this.
pub const MAX_RELEASE_NAME_LEN: usize = 53;

/// Labels put on every object applied for a release.
pub const RELEASE_LABEL: &str = "ph.io/helmapp-release";
pub const RELEASE_NAMESPACE_LABEL: &str = "ph.io/helmapp-namespace";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const FIELD_MANAGER: &str = "helmapp-operator";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InstallError {
    #[error("Failed to render chart: {0}")]
    RenderError(String),

    #[error("Transient failure applying release: {0}")]
    ApplyTransient(String),

    #[error("Cluster rejected release: {0}")]
    ApplyFatal(String),
}

impl InstallError {
    pub fn reason(&self) -> &'static str {
        match self {
            InstallError::RenderError(_) => "RenderError",
            InstallError::ApplyTransient(_) => "ApplyTransient",
            InstallError::ApplyFatal(_) => "ApplyFatal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, InstallError::ApplyTransient(_))
    }
}

/// Maps a Kubernetes API failure onto the install error taxonomy. Conflicts,
/// throttling, server errors and transport failures are worth retrying;
/// any other API rejection is not.
pub fn classify_kube_error(err: &kube::Error) -> InstallError {
    match err {
        kube::Error::Api(ae) if ae.code == 409 || ae.code == 429 || ae.code >= 500 => {
            InstallError::ApplyTransient(ae.to_string())
        }
        kube::Error::Api(ae) => InstallError::ApplyFatal(ae.to_string()),
        kube::Error::SerdeError(e) => InstallError::ApplyFatal(e.to_string()),
        other => InstallError::ApplyTransient(other.to_string()),
    }
}

/// Hex characters of the identity hash appended to shortened names.
const RELEASE_HASH_LEN: usize = 8;

/// Release name for a HelmApp. Short names are used as is. Longer ones are
/// cut and suffixed with a hash of `namespace/name`, so two resources never
/// share a release.
pub fn release_name(namespace: &str, name: &str) -> String {
    if name.len() <= MAX_RELEASE_NAME_LEN {
        return name.to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update(b"/");
    hasher.update(name.as_bytes());
    let digest = hex::encode(hasher.finalize());

    let keep = MAX_RELEASE_NAME_LEN - RELEASE_HASH_LEN - 1;
    let mut release: String = name.chars().take(keep).collect();
    while release.ends_with(['-', '.']) {
        release.pop();
    }
    format!("{release}-{}", &digest[..RELEASE_HASH_LEN])
}

/// Label selector matching every object applied for a release.
pub fn release_selector(namespace: &str, release_name: &str) -> String {
    format!("{RELEASE_LABEL}={release_name},{RELEASE_NAMESPACE_LABEL}={namespace}")
}

/// Objects found on the cluster for a release that the latest apply did not
/// produce. Objects are matched by kind, namespace and name.
pub fn stale_objects(live: &[ResourceRef], applied: &[ResourceRef]) -> Vec<ResourceRef> {
    let keep: HashSet<(&str, Option<&str>, &str)> = applied
        .iter()
        .map(|r| (r.kind.as_str(), r.namespace.as_deref(), r.name.as_str()))
        .collect();
    live.iter()
        .filter(|r| !keep.contains(&(r.kind.as_str(), r.namespace.as_deref(), r.name.as_str())))
        .cloned()
        .collect()
}

/// Everything needed to render or install one release.
#[derive(Clone, Debug, PartialEq)]
pub struct InstallRequest {
    pub namespace: String,
    pub release_name: String,
    pub store: AppStore,
    pub chart: String,
    pub version: String,
    /// The chart's default `values.yaml`.
    pub default_values: String,
    pub overrides: Vec<String>,
}

impl InstallRequest {
    /// Builds the request from the resource's spec and the chart content
    /// recorded in `status`.
    pub fn for_app(app: &HelmApp, status: &HelmAppStatus) -> Self {
        let version = status
            .observed_chart
            .as_ref()
            .map(|c| c.resolved_version.clone())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| app.spec.version.clone());
        let namespace = app.namespace().unwrap_or_default();
        let release_name = status
            .release
            .as_ref()
            .map(|r| r.name.clone())
            .unwrap_or_else(|| release_name(&namespace, &app.name_any()));
        Self {
            namespace,
            release_name,
            store: app.spec.app_store.clone(),
            chart: app.spec.template_name.clone(),
            version,
            default_values: status.values.clone(),
            overrides: app.spec.overrides.clone(),
        }
    }
}

/// Result of a successful install.
#[derive(Clone, Debug, PartialEq)]
pub struct ReleaseManifest {
    pub release_name: String,
    pub namespace: String,
    pub manifest: String,
    pub resources: Vec<ResourceRef>,
}

impl ReleaseManifest {
    pub fn summary(&self) -> String {
        let kinds: Vec<String> = self
            .resources
            .iter()
            .map(|r| format!("{}/{}", r.kind, r.name))
            .collect();
        format!("{} object(s) applied: {}", kinds.len(), kinds.join(", "))
    }
}

/// Renders and applies charts.
#[async_trait]
pub trait Installer: Send + Sync {
    /// Renders the release without touching the cluster.
    async fn render(&self, request: &InstallRequest) -> Result<String, InstallError>;

    /// Renders and applies the release, then deletes objects of the release
    /// that the new render no longer contains. Repeating the call converges
    /// on the same set of objects.
    async fn install(&self, request: &InstallRequest) -> Result<ReleaseManifest, InstallError>;

    /// Deletes every object labelled for the release, whether or not an
    /// install ever completed. Objects that are already gone count as
    /// deleted.
    async fn uninstall(&self, namespace: &str, release_name: &str) -> Result<(), InstallError>;
}

/// Splits a rendered multi-document manifest into objects. Empty documents
/// (helm emits one per template that renders to nothing) are skipped.
pub fn parse_manifest(manifest: &str) -> Result<Vec<DynamicObject>, InstallError> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(manifest) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| InstallError::RenderError(format!("invalid manifest YAML: {e}")))?;
        if value.is_null() {
            continue;
        }
        let obj: DynamicObject = serde_yaml::from_value(value)
            .map_err(|e| InstallError::RenderError(format!("invalid manifest object: {e}")))?;
        if obj.types.is_none() {
            return Err(InstallError::RenderError(
                "rendered object has no apiVersion/kind".to_string(),
            ));
        }
        if obj.metadata.name.is_none() {
            return Err(InstallError::RenderError(
                "rendered object has no metadata.name".to_string(),
            ));
        }
        objects.push(obj);
    }
    Ok(objects)
}
