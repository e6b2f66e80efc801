/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/crds.rs
*
* This file defines the Rust data structures that correspond to the `HelmApp`
* Custom Resource Definition. By using the `kube::CustomResource` derive macro,
* we create a strongly-typed representation of the API, enabling safe and
* idiomatic interaction with the Kubernetes API server.
*
* Architecture:
* - `HelmAppSpec` is the tenant-declared desired state: which chart, from
*   which store, at which version, with which overrides, and whether the
*   tenant has finished configuring it (`preStatus`).
* - `HelmAppStatus` is owned exclusively by the operator. Its `phase` is the
*   coarse lifecycle stage and its `conditions` carry the fine-grained
*   progress and failure detail that tenants see.
* - `serde` attributes are used to map between idiomatic Rust `snake_case` and
*   idiomatic Kubernetes `camelCase`.
* - `schemars` is leveraged to automatically generate an OpenAPI v3 schema from the
*   Rust types, which is embedded into the CRD manifest for server-side validation.
*
* SPDX-License-Identifier: Apache-2.0
*/

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Finalizer that guards uninstallation of the release before deletion.
pub const HELMAPP_FINALIZER: &str = "ph.io/helmapp-finalizer";

/// `preStatus` value a tenant sets once the application is configured.
pub const PRE_STATUS_CONFIGURED: &str = "Configured";
/// `preStatus` value the operator fills in on first observation.
pub const PRE_STATUS_NOT_CONFIGURED: &str = "NotConfigured";

// --- HelmApp Custom Resource Definition ---

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "ph.io",
    version = "v1alpha1",
    kind = "HelmApp",
    namespaced,
    status = "HelmAppStatus",
    printcolumn = r#"{"name":"Chart", "type":"string", "jsonPath":".spec.templateName"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    shortname = "hlmapp"
)]
#[serde(rename_all = "camelCase")]
pub struct HelmAppSpec {
    /// Enterprise (tenant) the application belongs to.
    #[serde(default)]
    pub eid: String,
    /// The chart store the template is fetched from.
    pub app_store: AppStore,
    /// Name of the chart inside the store's index.
    pub template_name: String,
    /// Chart version. Empty selects the newest entry in the index.
    #[serde(default)]
    pub version: String,
    /// Values overrides in `path.to.key=value` form.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<String>,
    /// Set to `Configured` by the tenant once the values are final.
    #[serde(default)]
    pub pre_status: String,
}

impl HelmAppSpec {
    /// Whether the tenant has signalled that configuration is complete.
    pub fn is_configured(&self) -> bool {
        self.pre_status.eq_ignore_ascii_case(PRE_STATUS_CONFIGURED)
    }
}

/// Reference to a chart repository.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppStore {
    pub name: String,
    pub url: String,
}

/// The coarse lifecycle stage of a HelmApp. An absent phase means the
/// resource has never been reconciled.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum HelmAppPhase {
    Detecting,
    Configuring,
    Installing,
    Installed,
}

impl HelmAppPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            HelmAppPhase::Detecting => "Detecting",
            HelmAppPhase::Configuring => "Configuring",
            HelmAppPhase::Installing => "Installing",
            HelmAppPhase::Installed => "Installed",
        }
    }

    /// Label used for an optional phase in logs and metrics.
    pub fn label(phase: Option<HelmAppPhase>) -> &'static str {
        phase.map_or("New", |p| p.as_str())
    }

    /// Whether moving from `from` to `to` is a legal lifecycle transition.
    ///
    /// Forward moves follow the strict order. The only backward moves are
    /// the spec re-entry rules: an overrides change sends `Installed` back
    /// to `Configuring`, and a chart identity change sends any detected
    /// phase back to `Detecting`.
    pub fn can_transition(from: Option<HelmAppPhase>, to: Option<HelmAppPhase>) -> bool {
        use HelmAppPhase::*;
        match (from, to) {
            (a, b) if a == b => true,
            (None, Some(Detecting)) => true,
            (Some(Detecting), Some(Configuring)) => true,
            (Some(Configuring), Some(Installing)) => true,
            (Some(Installing), Some(Installed)) => true,
            (Some(Installed), Some(Configuring)) => true,
            (Some(Configuring | Installing | Installed), Some(Detecting)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for HelmAppPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed set of condition types a HelmApp can carry.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub enum HelmAppConditionType {
    /// The chart and version were found in the store's index.
    ChartReady,
    /// The chart archive was downloaded and its readme/values extracted.
    ChartParsed,
    /// Pre-install validation passed.
    PreInstalled,
    /// The rendered release was applied to the cluster.
    Installed,
    /// The release was removed during deletion.
    Uninstalled,
}

impl HelmAppConditionType {
    /// Condition types every HelmApp starts with.
    pub const DEFAULTS: [HelmAppConditionType; 3] = [
        HelmAppConditionType::ChartReady,
        HelmAppConditionType::ChartParsed,
        HelmAppConditionType::PreInstalled,
    ];
}

impl fmt::Display for HelmAppConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmAppCondition {
    #[serde(rename = "type")]
    pub type_: HelmAppConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// RFC 3339 timestamp of the last status change.
    pub last_transition_time: String,
}

/// The chart that `status.readme` and `status.values` were parsed from.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObservedChart {
    pub store_name: String,
    pub store_url: String,
    pub template_name: String,
    /// The version as requested in the spec, possibly empty.
    pub version: String,
    /// The concrete index entry the request resolved to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resolved_version: String,
}

impl ObservedChart {
    pub fn from_spec(spec: &HelmAppSpec, resolved_version: &str) -> Self {
        Self {
            store_name: spec.app_store.name.clone(),
            store_url: spec.app_store.url.clone(),
            template_name: spec.template_name.clone(),
            version: spec.version.clone(),
            resolved_version: resolved_version.to_string(),
        }
    }

    /// Whether this is still the chart the spec asks for.
    pub fn matches(&self, spec: &HelmAppSpec) -> bool {
        self.store_name == spec.app_store.name
            && self.store_url == spec.app_store.url
            && self.template_name == spec.template_name
            && self.version == spec.version
    }
}

/// A cluster object created by a release.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

/// Summary of the last successful install.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseStatus {
    pub name: String,
    pub namespace: String,
    pub revision: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceRef>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub installed_at: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmAppStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<HelmAppPhase>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub readme: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub values: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<HelmAppCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_chart: Option<ObservedChart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_overrides: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<ReleaseStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
