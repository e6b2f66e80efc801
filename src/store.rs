/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/store.rs
*
* Access to persisted HelmApp resources. The reconciler only ever reads
* through `get`, so every pass starts from the current state of the object
* rather than from a possibly stale watch event.
*
* The Kubernetes implementation writes status with Server-Side Apply under
* the operator's field manager, which makes the operator the single owner of
* the status fields it sets. Finalizer edits carry the object's
* `resourceVersion` so that a concurrent change surfaces as a conflict rather
* than being overwritten.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::crds::{HelmApp, HelmAppStatus};
use crate::installer::FIELD_MANAGER;
use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Identity of a HelmApp: the work queue key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_app(app: &HelmApp) -> Self {
        Self::new(app.namespace().unwrap_or_default(), app.name_any())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Conflicting update to {0}")]
    Conflict(ObjectKey),

    #[error("HelmApp {0} not found")]
    NotFound(ObjectKey),
}

impl StoreError {
    fn from_kube(key: &ObjectKey, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(key.clone()),
            kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(key.clone()),
            other => StoreError::Kube(other),
        }
    }
}

#[async_trait]
pub trait HelmAppStore: Send + Sync {
    /// Reads the current object. `None` if it no longer exists.
    async fn get(&self, key: &ObjectKey) -> Result<Option<HelmApp>, StoreError>;

    /// Replaces the operator-owned status.
    async fn update_status(&self, key: &ObjectKey, status: &HelmAppStatus) -> Result<(), StoreError>;

    /// Sets the finalizer list, guarded by the object's resourceVersion.
    async fn set_finalizers(&self, app: &HelmApp, finalizers: Vec<String>) -> Result<(), StoreError>;

    /// Fills in `spec.preStatus`, guarded by the object's resourceVersion so
    /// a tenant's concurrent edit is never overwritten.
    async fn set_pre_status(&self, app: &HelmApp, pre_status: &str) -> Result<(), StoreError>;
}

pub struct KubeHelmAppStore {
    client: Client,
}

impl KubeHelmAppStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<HelmApp> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl HelmAppStore for KubeHelmAppStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<HelmApp>, StoreError> {
        Ok(self.api(&key.namespace).get_opt(&key.name).await?)
    }

    async fn update_status(&self, key: &ObjectKey, status: &HelmAppStatus) -> Result<(), StoreError> {
        let patch = Patch::Apply(json!({
            "apiVersion": "ph.io/v1alpha1",
            "kind": "HelmApp",
            "status": status,
        }));
        self.api(&key.namespace)
            .patch_status(&key.name, &PatchParams::apply(FIELD_MANAGER).force(), &patch)
            .await
            .map_err(|e| StoreError::from_kube(key, e))?;
        Ok(())
    }

    async fn set_finalizers(&self, app: &HelmApp, finalizers: Vec<String>) -> Result<(), StoreError> {
        let key = ObjectKey::from_app(app);
        let patch = Patch::Merge(json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": app.resource_version(),
            }
        }));
        self.api(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &patch)
            .await
            .map_err(|e| StoreError::from_kube(&key, e))?;
        Ok(())
    }

    async fn set_pre_status(&self, app: &HelmApp, pre_status: &str) -> Result<(), StoreError> {
        let key = ObjectKey::from_app(app);
        let patch = Patch::Merge(json!({
            "metadata": { "resourceVersion": app.resource_version() },
            "spec": { "preStatus": pre_status },
        }));
        self.api(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &patch)
            .await
            .map_err(|e| StoreError::from_kube(&key, e))?;
        Ok(())
    }
}
