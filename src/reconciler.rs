/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/reconciler.rs
*
* The reconciliation loop: a watch on HelmApp resources feeds a keyed work
* queue, and a pool of workers drains it.
*
* Architecture:
* - **Watch**: every relevant change to a HelmApp enqueues its
*   `namespace/name`. Events that only touch status are filtered out by
*   comparing `metadata.generation` and the deletion marker, so the operator's
*   own status writes do not wake it up again.
* - **Workers**: each worker takes a key, re-reads the object, and runs one
*   pass. The queue guarantees that a key is never processed by two workers
*   at once.
* - **Pass**: deletion runs the finalizer (uninstall, then release the
*   finalizer). Otherwise the finalizer and `preStatus` default are ensured,
*   the handler for the current phase computes the next status, the
*   transition is checked against the lifecycle table, and the status is
*   persisted only if it changed. Persisting is always the last step.
* - **Requeue**: the handler's directive decides whether the key comes back
*   immediately, after its backoff delay, or only on the next change.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::controllers::helmapp_controller::{handler_for, PhaseContext, Requeue};
use crate::controllers::preinstall::PreInstallValidator;
use crate::crds::{
    ConditionStatus, HelmApp, HelmAppConditionType, HelmAppPhase, HELMAPP_FINALIZER,
    PRE_STATUS_NOT_CONFIGURED,
};
use crate::installer::{InstallError, InstallRequest, Installer};
use crate::metrics;
use crate::repo::ChartRepository;
use crate::store::{HelmAppStore, ObjectKey, StoreError};
use crate::workqueue::WorkQueue;
use chrono::Utc;
use futures::TryStreamExt;
use kube::{Api, ResourceExt};
use kube_runtime::watcher::{self, watcher, Event};
use kube_runtime::WatchStreamExt;
use opentelemetry::propagation::{Extractor, TextMapPropagator};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Resource store error: {0}")]
    Store(#[from] StoreError),

    #[error("Illegal phase transition {from} -> {to}")]
    IllegalTransition { from: &'static str, to: &'static str },
}

impl Error {
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Store(_) => "StoreError",
            Error::IllegalTransition { .. } => "IllegalTransition",
        }
    }

    /// Controller-internal failures are always retried with backoff.
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// Rejects any phase change the lifecycle table does not allow.
fn check_transition(from: Option<HelmAppPhase>, to: Option<HelmAppPhase>) -> Result<(), Error> {
    if HelmAppPhase::can_transition(from, to) {
        return Ok(());
    }
    Err(Error::IllegalTransition {
        from: HelmAppPhase::label(from),
        to: HelmAppPhase::label(to),
    })
}

/// Decides which watch events are worth a reconciliation. An object is
/// enqueued when its generation or deletion marker differs from what was
/// last seen, so status-only writes do not wake the operator.
///
/// A re-list (`Init` .. `InitDone`) rebuilds the seen set, dropping objects
/// that were deleted while the watch was down.
#[derive(Default)]
struct WatchFilter {
    seen: HashMap<ObjectKey, (Option<i64>, bool)>,
    relisted: Option<HashSet<ObjectKey>>,
}

impl WatchFilter {
    /// Records `app` and reports whether it changed since last seen.
    fn observe(&mut self, app: &HelmApp) -> bool {
        let key = ObjectKey::from_app(app);
        let fingerprint = (
            app.metadata.generation,
            app.metadata.deletion_timestamp.is_some(),
        );
        if let Some(relisted) = self.relisted.as_mut() {
            relisted.insert(key.clone());
        }
        self.seen.insert(key, fingerprint) != Some(fingerprint)
    }

    fn forget(&mut self, key: &ObjectKey) {
        self.seen.remove(key);
    }

    fn relist_started(&mut self) {
        self.relisted = Some(HashSet::new());
    }

    fn relist_done(&mut self) {
        if let Some(relisted) = self.relisted.take() {
            self.seen.retain(|key, _| relisted.contains(key));
        }
    }
}

// Helper struct to extract trace context from Kubernetes annotations.
struct AnnotationExtractor<'a>(&'a BTreeMap<String, String>);

impl Extractor for AnnotationExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|s| s.as_str()).collect()
    }
}

pub struct Reconciler {
    store: Arc<dyn HelmAppStore>,
    repo: Arc<dyn ChartRepository>,
    installer: Arc<dyn Installer>,
    validator: Arc<dyn PreInstallValidator>,
    queue: WorkQueue<ObjectKey>,
    call_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn HelmAppStore>,
        repo: Arc<dyn ChartRepository>,
        installer: Arc<dyn Installer>,
        validator: Arc<dyn PreInstallValidator>,
        queue: WorkQueue<ObjectKey>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            repo,
            installer,
            validator,
            queue,
            call_timeout,
        }
    }

    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    fn phase_context(&self) -> PhaseContext {
        PhaseContext {
            repo: Arc::clone(&self.repo),
            installer: Arc::clone(&self.installer),
            validator: Arc::clone(&self.validator),
            call_timeout: self.call_timeout,
            now: Utc::now(),
        }
    }

    /// Runs one reconciliation pass for `key` against a fresh read of the
    /// object.
    pub async fn reconcile_key(&self, key: &ObjectKey) -> Result<Requeue, Error> {
        let Some(app) = self.store.get(key).await? else {
            debug!(%key, "HelmApp no longer exists");
            return Ok(Requeue::AwaitChange);
        };

        // --- OpenTelemetry: Context Extraction ---
        let propagator = TraceContextPropagator::new();
        let parent_context = propagator.extract(&AnnotationExtractor(app.annotations()));
        let span = info_span!(
            "reconcile_helmapp",
            "ph.helmapp.key" = %key,
            "ph.helmapp.chart" = app.spec.template_name.as_str(),
            "ph.helmapp.phase" = HelmAppPhase::label(app.status.as_ref().and_then(|s| s.phase)),
        );
        span.set_parent(parent_context);

        async move {
            let (phase, result) = if app.metadata.deletion_timestamp.is_some() {
                ("Deleting", self.finalize(key, &app).await)
            } else {
                let phase = HelmAppPhase::label(app.status.as_ref().and_then(|s| s.phase));
                (phase, self.apply(key, &app).await)
            };
            let outcome = match &result {
                Ok(Requeue::Now) => "progress",
                Ok(Requeue::Backoff) => "backoff",
                Ok(Requeue::AwaitChange) => "idle",
                Err(_) => "error",
            };
            metrics::HELMAPP_RECONCILE_TOTAL
                .with_label_values(&[phase, outcome])
                .inc();
            result
        }
        .instrument(span)
        .await
    }

    async fn apply(&self, key: &ObjectKey, app: &HelmApp) -> Result<Requeue, Error> {
        if !app.finalizers().iter().any(|f| f == HELMAPP_FINALIZER) {
            let mut finalizers = app.finalizers().to_vec();
            finalizers.push(HELMAPP_FINALIZER.to_string());
            self.store.set_finalizers(app, finalizers).await?;
            debug!("Finalizer added");
            return Ok(Requeue::Now);
        }
        if app.spec.pre_status.trim().is_empty() {
            self.store.set_pre_status(app, PRE_STATUS_NOT_CONFIGURED).await?;
            debug!("Defaulted preStatus");
            return Ok(Requeue::Now);
        }

        let before = app.status.clone().unwrap_or_default();
        let from = before.phase;
        let ctx = self.phase_context();
        let transition = handler_for(from)(app, before.clone(), &ctx).await;

        let mut next = transition.status;
        let to = next.phase;
        check_transition(from, to)?;
        next.observed_generation = app.metadata.generation;

        if next != before {
            self.store.update_status(key, &next).await?;
        }
        if from != to {
            metrics::HELMAPP_PHASE_TRANSITIONS_TOTAL
                .with_label_values(&[HelmAppPhase::label(from), HelmAppPhase::label(to)])
                .inc();
            info!(from = HelmAppPhase::label(from), to = HelmAppPhase::label(to), "Phase transition");
        }
        Ok(transition.requeue)
    }

    async fn finalize(&self, key: &ObjectKey, app: &HelmApp) -> Result<Requeue, Error> {
        if !app.finalizers().iter().any(|f| f == HELMAPP_FINALIZER) {
            return Ok(Requeue::AwaitChange);
        }

        // An install that failed partway leaves objects but no recorded
        // release, so the labelled objects are swept either way.
        let before = app.status.clone().unwrap_or_default();
        let request = InstallRequest::for_app(app, &before);
        info!(release = %request.release_name, "Uninstalling release before deletion");
        let uninstall = self
            .installer
            .uninstall(&request.namespace, &request.release_name);
        let result = match tokio::time::timeout(self.call_timeout, uninstall).await {
            Ok(result) => result,
            Err(_) => Err(InstallError::ApplyTransient(format!(
                "uninstall timed out after {}s",
                self.call_timeout.as_secs_f64()
            ))),
        };
        if let Err(e) = result {
            warn!(release = %request.release_name, error = %e, "Uninstall failed; will retry");
            let mut status = before.clone();
            status.set_condition(
                HelmAppConditionType::Uninstalled,
                ConditionStatus::False,
                e.reason(),
                &e.to_string(),
                Utc::now(),
            );
            status.last_error = Some(e.to_string());
            if status != before {
                self.store.update_status(key, &status).await?;
            }
            return Ok(Requeue::Backoff);
        }

        let finalizers: Vec<String> = app
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != HELMAPP_FINALIZER)
            .cloned()
            .collect();
        self.store.set_finalizers(app, finalizers).await?;
        info!("Finalizer removed");
        Ok(Requeue::AwaitChange)
    }

    /// Takes one key off the queue and processes it. Returns `false` once the
    /// queue has shut down.
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        match self.reconcile_key(&key).await {
            Ok(Requeue::Now) => {
                self.queue.forget(&key);
                self.queue.done(&key);
                self.queue.add(key);
            }
            Ok(Requeue::Backoff) => {
                self.queue.done(&key);
                let delay = self.queue.add_rate_limited(key.clone());
                debug!(
                    %key,
                    attempt = self.queue.num_requeues(&key),
                    delay_secs = delay.as_secs_f64(),
                    "Retrying after backoff"
                );
            }
            Ok(Requeue::AwaitChange) => {
                self.queue.forget(&key);
                self.queue.done(&key);
            }
            Err(e) => {
                error!(%key, reason = e.reason(), error = %e, "Reconciliation failed");
                self.queue.done(&key);
                if e.is_retryable() {
                    self.queue.add_rate_limited(key);
                }
            }
        }
        true
    }

    /// Runs `workers` concurrent workers until the queue shuts down.
    pub async fn run(self: Arc<Self>, workers: usize) {
        info!(workers, "Starting reconciliation workers");
        let handles: Vec<_> = (0..workers.max(1))
            .map(|id| {
                let this = Arc::clone(&self);
                tokio::spawn(
                    async move { while this.process_next().await {} }
                        .instrument(info_span!("worker", id)),
                )
            })
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task aborted");
            }
        }
        info!("Reconciliation workers stopped");
    }

    /// Feeds the work queue from a watch on `api`. Runs until the queue shuts
    /// down or the stream ends.
    pub async fn watch(self: Arc<Self>, api: Api<HelmApp>, label_selector: Option<String>) {
        let mut config = watcher::Config::default();
        if let Some(selector) = label_selector.as_deref() {
            config = config.labels(selector);
        }
        let mut filter = WatchFilter::default();
        let mut stream = Box::pin(watcher(api, config).default_backoff());

        loop {
            if self.queue.is_shutting_down() {
                return;
            }
            let event = match stream.try_next().await {
                Ok(Some(event)) => event,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "Watch error; the stream will retry");
                    continue;
                }
            };
            match event {
                Event::Apply(app) | Event::InitApply(app) => {
                    if filter.observe(&app) {
                        let key = ObjectKey::from_app(&app);
                        debug!(%key, "HelmApp changed; enqueueing");
                        self.queue.add(key);
                    }
                }
                Event::Delete(app) => {
                    let key = ObjectKey::from_app(&app);
                    filter.forget(&key);
                    self.queue.add(key);
                }
                Event::Init => filter.relist_started(),
                Event::InitDone => filter.relist_done(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::preinstall::StaticValidator;
    use crate::crds::{HelmAppConditionType::*, PRE_STATUS_CONFIGURED};
    use crate::testing::{helm_app, FakeInstaller, FakeRepo, InMemoryStore};
    use crate::workqueue::BackoffPolicy;

    struct Harness {
        store: Arc<InMemoryStore>,
        repo: Arc<FakeRepo>,
        installer: Arc<FakeInstaller>,
        reconciler: Arc<Reconciler>,
    }

    fn harness(repo: FakeRepo) -> Harness {
        let store = Arc::new(InMemoryStore::default());
        let repo = Arc::new(repo);
        let installer = Arc::new(FakeInstaller::default());
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            repo.clone(),
            installer.clone(),
            Arc::new(StaticValidator),
            WorkQueue::new(BackoffPolicy {
                base: Duration::from_secs(5),
                max: Duration::from_secs(300),
            }),
            Duration::from_secs(5),
        ));
        Harness {
            store,
            repo,
            installer,
            reconciler,
        }
    }

    impl Harness {
        /// Runs passes until the key stops asking to be requeued immediately.
        async fn settle(&self, key: &ObjectKey) -> Requeue {
            for _ in 0..20 {
                match self.reconciler.reconcile_key(key).await.unwrap() {
                    Requeue::Now => continue,
                    other => return other,
                }
            }
            panic!("{key} did not settle");
        }

        fn app(&self, key: &ObjectKey) -> HelmApp {
            self.store.snapshot(key).unwrap()
        }
    }

    #[tokio::test]
    async fn successful_install_scenario() {
        let h = harness(FakeRepo::phpmyadmin());
        let key = h.store.insert(helm_app("tenant-a", "phpmyadmin", "8.2.0"));

        assert_eq!(h.settle(&key).await, Requeue::AwaitChange);
        let app = h.app(&key);
        assert_eq!(app.spec.pre_status, PRE_STATUS_NOT_CONFIGURED);
        assert!(app.finalizers().iter().any(|f| f == HELMAPP_FINALIZER));
        let status = app.status.clone().unwrap();
        assert_eq!(status.phase, Some(HelmAppPhase::Configuring));
        assert!(!status.readme.is_empty());
        assert!(!status.values.is_empty());
        assert_eq!(status.observed_generation, app.metadata.generation);

        h.store.edit_spec(&key, |spec| spec.pre_status = PRE_STATUS_CONFIGURED.into());
        assert_eq!(h.settle(&key).await, Requeue::AwaitChange);
        let status = h.app(&key).status.unwrap();
        assert_eq!(status.phase, Some(HelmAppPhase::Installed));
        assert!(status.is_condition_true(Installed));
        assert_eq!(h.installer.install_calls(), 1);
    }

    #[tokio::test]
    async fn unreachable_repository_scenario() {
        let h = harness(FakeRepo::unreachable());
        let key = h.store.insert(helm_app("tenant-a", "phpmyadmin", "8.2.0"));

        assert_eq!(h.settle(&key).await, Requeue::Backoff);
        let status = h.app(&key).status.unwrap();
        assert_eq!(status.phase, Some(HelmAppPhase::Detecting));
        let (_, ready) = status.get_condition(ChartReady).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, "RepoUnreachable");

        h.repo.recover();
        h.settle(&key).await;
        assert_eq!(h.app(&key).status.unwrap().phase, Some(HelmAppPhase::Configuring));
    }

    #[tokio::test]
    async fn fatal_install_scenario() {
        let h = harness(FakeRepo::phpmyadmin());
        h.installer
            .fail_install_with(InstallError::ApplyFatal("forbidden: exceeded quota".into()));
        let mut app = helm_app("tenant-a", "phpmyadmin", "8.2.0");
        app.spec.pre_status = PRE_STATUS_CONFIGURED.into();
        let key = h.store.insert(app);

        assert_eq!(h.settle(&key).await, Requeue::AwaitChange);
        let status = h.app(&key).status.unwrap();
        assert_eq!(status.phase, Some(HelmAppPhase::Installing));
        let (_, installed) = status.get_condition(Installed).unwrap();
        assert_eq!(installed.status, ConditionStatus::False);
        assert_eq!(installed.reason, "ApplyFatal");
        assert!(status.last_error.as_deref().unwrap_or_default().contains("quota"));

        let writes = h.store.status_writes();
        assert_eq!(h.settle(&key).await, Requeue::AwaitChange);
        assert_eq!(h.installer.install_calls(), 1);
        assert_eq!(h.store.status_writes(), writes, "parked pass must not write");

        h.installer.clear_install_failure();
        h.store.edit_spec(&key, |spec| spec.overrides = vec!["resources.limits.memory=256Mi".into()]);
        h.settle(&key).await;
        assert_eq!(h.app(&key).status.unwrap().phase, Some(HelmAppPhase::Installed));
        assert_eq!(h.installer.install_calls(), 2);
    }

    #[tokio::test]
    async fn unchanged_resource_is_not_rewritten() {
        let h = harness(FakeRepo::phpmyadmin());
        let key = h.store.insert(helm_app("tenant-a", "phpmyadmin", "8.2.0"));
        h.settle(&key).await;
        let writes = h.store.status_writes();
        h.settle(&key).await;
        assert_eq!(h.store.status_writes(), writes);
    }

    #[tokio::test]
    async fn deletion_uninstalls_then_releases_finalizer() {
        let h = harness(FakeRepo::phpmyadmin());
        let mut app = helm_app("tenant-a", "phpmyadmin", "8.2.0");
        app.spec.pre_status = PRE_STATUS_CONFIGURED.into();
        let key = h.store.insert(app);
        h.settle(&key).await;
        assert!(h.app(&key).status.unwrap().release.is_some());

        h.installer
            .fail_uninstall_with(InstallError::ApplyTransient("etcd leader changed".into()));
        h.store.mark_deleted(&key);
        assert_eq!(h.reconciler.reconcile_key(&key).await.unwrap(), Requeue::Backoff);
        let status = h.app(&key).status.unwrap();
        let (_, uninstalled) = status.get_condition(Uninstalled).unwrap();
        assert_eq!(uninstalled.status, ConditionStatus::False);
        assert!(h.store.snapshot(&key).is_some(), "finalizer must hold the object");

        h.installer.clear_uninstall_failure();
        assert_eq!(h.reconciler.reconcile_key(&key).await.unwrap(), Requeue::AwaitChange);
        assert!(h.store.snapshot(&key).is_none());
        assert_eq!(h.installer.uninstall_calls(), 2);
    }

    #[tokio::test]
    async fn deleted_before_install_releases_finalizer() {
        let h = harness(FakeRepo::unreachable());
        let key = h.store.insert(helm_app("tenant-a", "phpmyadmin", "8.2.0"));
        h.settle(&key).await;
        h.store.mark_deleted(&key);
        h.reconciler.reconcile_key(&key).await.unwrap();
        assert!(h.store.snapshot(&key).is_none());
        assert_eq!(h.installer.uninstall_calls(), 1);
    }

    #[tokio::test]
    async fn deletion_after_partial_install_removes_applied_objects() {
        let h = harness(FakeRepo::phpmyadmin());
        h.installer
            .fail_install_partway_with(InstallError::ApplyFatal("quota exceeded for deployments".into()));
        let mut app = helm_app("tenant-a", "phpmyadmin", "8.2.0");
        app.spec.pre_status = PRE_STATUS_CONFIGURED.into();
        let key = h.store.insert(app);

        h.settle(&key).await;
        let status = h.app(&key).status.unwrap();
        assert_eq!(status.phase, Some(HelmAppPhase::Installing));
        assert!(status.release.is_none());
        assert_eq!(h.installer.live_objects("tenant-a", "phpmyadmin").len(), 1);

        h.store.mark_deleted(&key);
        assert_eq!(h.reconciler.reconcile_key(&key).await.unwrap(), Requeue::AwaitChange);
        assert_eq!(h.installer.uninstall_calls(), 1);
        assert!(h.installer.live_objects("tenant-a", "phpmyadmin").is_empty());
        assert!(h.store.snapshot(&key).is_none());
    }

    #[tokio::test]
    async fn pre_status_default_does_not_overwrite_a_concurrent_edit() {
        let h = harness(FakeRepo::phpmyadmin());
        let key = h.store.insert(helm_app("tenant-a", "phpmyadmin", "8.2.0"));
        h.reconciler.reconcile_key(&key).await.unwrap();
        let stale = h.app(&key);
        assert!(stale.spec.pre_status.is_empty());

        h.store.edit_spec(&key, |spec| spec.pre_status = PRE_STATUS_CONFIGURED.into());
        let err = h
            .store
            .set_pre_status(&stale, PRE_STATUS_NOT_CONFIGURED)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(h.app(&key).spec.pre_status, PRE_STATUS_CONFIGURED);

        h.settle(&key).await;
        assert_eq!(h.app(&key).spec.pre_status, PRE_STATUS_CONFIGURED);
        assert_eq!(h.app(&key).status.unwrap().phase, Some(HelmAppPhase::Installed));
    }

    fn watched(name: &str, generation: i64) -> HelmApp {
        let mut app = helm_app("tenant-a", name, "8.2.0");
        app.metadata.generation = Some(generation);
        app
    }

    #[test]
    fn watch_filter_ignores_status_only_updates() {
        let mut filter = WatchFilter::default();
        assert!(filter.observe(&watched("a", 1)));
        assert!(!filter.observe(&watched("a", 1)));
        assert!(filter.observe(&watched("a", 2)));

        let mut deleting = watched("a", 2);
        deleting.metadata.deletion_timestamp =
            Some(serde_json::from_value(serde_json::json!("2025-06-01T12:00:00Z")).unwrap());
        assert!(filter.observe(&deleting));
    }

    #[test]
    fn relist_drops_objects_deleted_during_a_watch_gap() {
        let mut filter = WatchFilter::default();
        filter.observe(&watched("a", 1));
        filter.observe(&watched("b", 1));

        filter.relist_started();
        assert!(!filter.observe(&watched("a", 1)), "unchanged object is not re-enqueued");
        filter.relist_done();

        assert_eq!(filter.seen.len(), 1);
        assert!(filter.seen.contains_key(&ObjectKey::new("tenant-a", "a")));
        assert!(filter.observe(&watched("b", 1)), "a recreated object is seen as new");
    }

    #[test]
    fn illegal_transition_is_refused() {
        assert!(check_transition(None, Some(HelmAppPhase::Detecting)).is_ok());
        let err = check_transition(Some(HelmAppPhase::Detecting), Some(HelmAppPhase::Installed))
            .unwrap_err();
        assert_eq!(err.reason(), "IllegalTransition");
        assert_eq!(err.to_string(), "Illegal phase transition Detecting -> Installed");
    }

    #[tokio::test]
    async fn missing_object_is_forgotten() {
        let h = harness(FakeRepo::phpmyadmin());
        let key = ObjectKey::new("tenant-a", "ghost");
        assert_eq!(h.reconciler.reconcile_key(&key).await.unwrap(), Requeue::AwaitChange);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn workers_never_reconcile_one_key_concurrently() {
        let h = harness(FakeRepo::phpmyadmin());
        h.installer.set_install_delay(Duration::from_millis(50));
        let mut keys = Vec::new();
        for name in ["a", "b", "c"] {
            let mut app = helm_app("tenant-a", name, "8.2.0");
            app.spec.pre_status = PRE_STATUS_CONFIGURED.into();
            keys.push(h.store.insert(app));
        }

        let queue = h.reconciler.queue().clone();
        let workers = tokio::spawn(Arc::clone(&h.reconciler).run(4));
        for _ in 0..5 {
            for key in &keys {
                queue.add(key.clone());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while keys.iter().any(|k| {
            h.store.snapshot(k).and_then(|a| a.status).and_then(|s| s.phase)
                != Some(HelmAppPhase::Installed)
        }) {
            assert!(tokio::time::Instant::now() < deadline, "apps did not install");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        queue.shutdown();
        workers.await.unwrap();

        assert_eq!(h.installer.max_concurrent_per_release(), 1);
        assert_eq!(h.installer.install_calls(), 3);
    }
}
