/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/testing.rs
*
* In-memory stand-ins for the reconciler's collaborators, used by the unit
* tests of the controller and reconciler. Each fake counts its calls and can
* be told to fail, so tests can assert both outcomes and the absence of
* external traffic.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::controllers::preinstall::{PreInstallValidator, ValidationError};
use crate::crds::{AppStore, HelmApp, HelmAppSpec, HelmAppStatus, ResourceRef};
use crate::installer::{InstallError, InstallRequest, Installer, ReleaseManifest};
use crate::repo::{self, ChartContent, ChartIndex, ChartRepository, ChartVersion, RepoError};
use crate::store::{HelmAppStore, ObjectKey, StoreError};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const BITNAMI_URL: &str = "https://charts.bitnami.com/bitnami";

/// A phpmyadmin HelmApp in `namespace`, as a tenant would first create it.
pub fn helm_app(namespace: &str, name: &str, version: &str) -> HelmApp {
    let mut app = HelmApp::new(
        name,
        HelmAppSpec {
            eid: "5bfba91b0ead72f612732535ef802217".into(),
            app_store: AppStore {
                name: "bitnami".into(),
                url: BITNAMI_URL.into(),
            },
            template_name: "phpmyadmin".into(),
            version: version.into(),
            overrides: Vec::new(),
            pre_status: String::new(),
        },
    );
    app.metadata.namespace = Some(namespace.into());
    app.metadata.generation = Some(1);
    app
}

// --- Chart repository ---

pub struct FakeRepo {
    index: Mutex<Result<ChartIndex, RepoError>>,
    content: Mutex<Result<ChartContent, RepoError>>,
    delay: Mutex<Duration>,
    index_calls: AtomicUsize,
    content_calls: AtomicUsize,
}

impl FakeRepo {
    fn with_index(index: Result<ChartIndex, RepoError>) -> Self {
        Self {
            index: Mutex::new(index),
            content: Mutex::new(Ok(ChartContent {
                readme: "# phpMyAdmin\n".into(),
                values: "replicaCount: 1\nimage:\n  registry: docker.io\n  tag: 5.1.0\n".into(),
            })),
            delay: Mutex::new(Duration::ZERO),
            index_calls: AtomicUsize::new(0),
            content_calls: AtomicUsize::new(0),
        }
    }

    pub fn phpmyadmin() -> Self {
        Self::with_index(Ok(phpmyadmin_index()))
    }

    pub fn unreachable() -> Self {
        Self::with_index(Err(RepoError::RepoUnreachable(
            "dial tcp: connection refused".into(),
        )))
    }

    /// Makes the repository reachable again.
    pub fn recover(&self) {
        *self.index.lock().unwrap() = Ok(phpmyadmin_index());
    }

    pub fn fail_content_with(&self, err: RepoError) {
        *self.content.lock().unwrap() = Err(err);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn index_calls(&self) -> usize {
        self.index_calls.load(Ordering::SeqCst)
    }

    pub fn content_calls(&self) -> usize {
        self.content_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

fn phpmyadmin_index() -> ChartIndex {
    repo::parse_index(repo::tests::PHPMYADMIN_INDEX.as_bytes()).unwrap()
}

#[async_trait]
impl ChartRepository for FakeRepo {
    async fn fetch_index(&self, _store_url: &str) -> Result<Arc<ChartIndex>, RepoError> {
        self.index_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.index.lock().unwrap().clone().map(Arc::new)
    }

    async fn fetch_content(
        &self,
        _store_url: &str,
        _chart: &ChartVersion,
    ) -> Result<ChartContent, RepoError> {
        self.content_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.content.lock().unwrap().clone()
    }
}

// --- Installer ---

/// Records which objects each release has on the "cluster". A successful
/// install replaces the release's objects with the new render, a partial
/// failure leaves the first object applied, and uninstall removes them all.
#[derive(Default)]
pub struct FakeInstaller {
    render_error: Mutex<Option<InstallError>>,
    install_error: Mutex<Option<InstallError>>,
    fail_partway: Mutex<bool>,
    live: Mutex<HashMap<String, Vec<ResourceRef>>>,
    uninstall_error: Mutex<Option<InstallError>>,
    install_delay: Mutex<Duration>,
    render_calls: AtomicUsize,
    install_calls: AtomicUsize,
    uninstall_calls: AtomicUsize,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight: AtomicUsize,
}

impl FakeInstaller {
    pub fn fail_render_with(&self, err: InstallError) {
        *self.render_error.lock().unwrap() = Some(err);
    }

    pub fn fail_install_with(&self, err: InstallError) {
        *self.install_error.lock().unwrap() = Some(err);
    }

    /// Fails installs after the first rendered object has been applied.
    pub fn fail_install_partway_with(&self, err: InstallError) {
        *self.install_error.lock().unwrap() = Some(err);
        *self.fail_partway.lock().unwrap() = true;
    }

    pub fn clear_install_failure(&self) {
        *self.install_error.lock().unwrap() = None;
        *self.fail_partway.lock().unwrap() = false;
    }

    /// Objects currently applied for `release` in `namespace`.
    pub fn live_objects(&self, namespace: &str, release: &str) -> Vec<ResourceRef> {
        self.live
            .lock()
            .unwrap()
            .get(&format!("{namespace}/{release}"))
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_uninstall_with(&self, err: InstallError) {
        *self.uninstall_error.lock().unwrap() = Some(err);
    }

    pub fn clear_uninstall_failure(&self) {
        *self.uninstall_error.lock().unwrap() = None;
    }

    pub fn set_install_delay(&self, delay: Duration) {
        *self.install_delay.lock().unwrap() = delay;
    }

    pub fn render_calls(&self) -> usize {
        self.render_calls.load(Ordering::SeqCst)
    }

    pub fn install_calls(&self) -> usize {
        self.install_calls.load(Ordering::SeqCst)
    }

    pub fn uninstall_calls(&self) -> usize {
        self.uninstall_calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous installs seen for any single release.
    pub fn max_concurrent_per_release(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn manifest_for(request: &InstallRequest) -> ReleaseManifest {
        let resources = ["Service", "Deployment"]
            .into_iter()
            .map(|kind| ResourceRef {
                api_version: if kind == "Service" { "v1" } else { "apps/v1" }.into(),
                kind: kind.into(),
                namespace: Some(request.namespace.clone()),
                name: request.release_name.clone(),
            })
            .collect();
        ReleaseManifest {
            release_name: request.release_name.clone(),
            namespace: request.namespace.clone(),
            manifest: format!(
                "apiVersion: v1\nkind: Service\nmetadata:\n  name: {0}\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: {0}\n",
                request.release_name
            ),
            resources,
        }
    }
}

#[async_trait]
impl Installer for FakeInstaller {
    async fn render(&self, request: &InstallRequest) -> Result<String, InstallError> {
        self.render_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.render_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(Self::manifest_for(request).manifest)
    }

    async fn install(&self, request: &InstallRequest) -> Result<ReleaseManifest, InstallError> {
        self.install_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let count = in_flight.entry(request.release_name.clone()).or_insert(0);
            *count += 1;
            self.max_in_flight.fetch_max(*count, Ordering::SeqCst);
        }
        let delay = *self.install_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(count) = self.in_flight.lock().unwrap().get_mut(&request.release_name) {
            *count -= 1;
        }

        let manifest = Self::manifest_for(request);
        let release = format!("{}/{}", request.namespace, request.release_name);
        if let Some(err) = self.install_error.lock().unwrap().clone() {
            if *self.fail_partway.lock().unwrap() {
                let mut live = self.live.lock().unwrap();
                let objects = live.entry(release).or_default();
                if !objects.contains(&manifest.resources[0]) {
                    objects.push(manifest.resources[0].clone());
                }
            }
            return Err(err);
        }
        self.live
            .lock()
            .unwrap()
            .insert(release, manifest.resources.clone());
        Ok(manifest)
    }

    async fn uninstall(&self, namespace: &str, release_name: &str) -> Result<(), InstallError> {
        self.uninstall_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.uninstall_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.live
            .lock()
            .unwrap()
            .remove(&format!("{namespace}/{release_name}"));
        Ok(())
    }
}

/// Rejects every chart.
pub struct RejectingValidator;

#[async_trait]
impl PreInstallValidator for RejectingValidator {
    async fn validate(&self, _request: &InstallRequest) -> Result<(), ValidationError> {
        Err(ValidationError::Rejected("chart requires a PersistentVolume class".into()))
    }
}

/// Rejects any request carrying an override under `prefix`.
pub struct RejectOverride(pub &'static str);

#[async_trait]
impl PreInstallValidator for RejectOverride {
    async fn validate(&self, request: &InstallRequest) -> Result<(), ValidationError> {
        match request.overrides.iter().find(|o| o.starts_with(self.0)) {
            Some(o) => Err(ValidationError::Rejected(format!("override '{o}' is not allowed"))),
            None => Ok(()),
        }
    }
}

// --- Resource store ---

/// Mimics the API server closely enough for the reconciler: spec edits bump
/// `metadata.generation`, every write bumps `resourceVersion`, and an object
/// marked for deletion disappears once its last finalizer is removed.
#[derive(Default)]
pub struct InMemoryStore {
    objects: Mutex<HashMap<ObjectKey, HelmApp>>,
    status_writes: AtomicUsize,
    version: AtomicUsize,
}

impl InMemoryStore {
    fn next_version(&self) -> Option<String> {
        Some((self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string())
    }

    pub fn insert(&self, mut app: HelmApp) -> ObjectKey {
        let key = ObjectKey::from_app(&app);
        app.metadata.resource_version = self.next_version();
        self.objects.lock().unwrap().insert(key.clone(), app);
        key
    }

    pub fn snapshot(&self, key: &ObjectKey) -> Option<HelmApp> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn edit_spec(&self, key: &ObjectKey, edit: impl FnOnce(&mut HelmAppSpec)) {
        let mut objects = self.objects.lock().unwrap();
        let app = objects.get_mut(key).unwrap();
        edit(&mut app.spec);
        app.metadata.generation = Some(app.metadata.generation.unwrap_or(0) + 1);
        app.metadata.resource_version = self.next_version();
    }

    pub fn mark_deleted(&self, key: &ObjectKey) {
        let mut objects = self.objects.lock().unwrap();
        let app = objects.get_mut(key).unwrap();
        app.metadata.deletion_timestamp =
            Some(serde_json::from_value::<Time>(serde_json::json!("2025-06-01T12:00:00Z")).unwrap());
        app.metadata.resource_version = self.next_version();
    }

    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HelmAppStore for InMemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<HelmApp>, StoreError> {
        Ok(self.snapshot(key))
    }

    async fn update_status(&self, key: &ObjectKey, status: &HelmAppStatus) -> Result<(), StoreError> {
        let mut objects = self.objects.lock().unwrap();
        let app = objects
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        app.status = Some(status.clone());
        app.metadata.resource_version = self.next_version();
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_finalizers(&self, app: &HelmApp, finalizers: Vec<String>) -> Result<(), StoreError> {
        let key = ObjectKey::from_app(app);
        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if stored.metadata.resource_version != app.metadata.resource_version {
            return Err(StoreError::Conflict(key));
        }
        if stored.metadata.deletion_timestamp.is_some() && finalizers.is_empty() {
            objects.remove(&key);
            return Ok(());
        }
        stored.metadata.finalizers = Some(finalizers);
        stored.metadata.resource_version = self.next_version();
        Ok(())
    }

    async fn set_pre_status(&self, app: &HelmApp, pre_status: &str) -> Result<(), StoreError> {
        let key = ObjectKey::from_app(app);
        match self.snapshot(&key) {
            None => return Err(StoreError::NotFound(key)),
            Some(stored) if stored.metadata.resource_version != app.metadata.resource_version => {
                return Err(StoreError::Conflict(key))
            }
            Some(_) => {}
        }
        self.edit_spec(&key, |spec| spec.pre_status = pre_status.to_string());
        Ok(())
    }
}
