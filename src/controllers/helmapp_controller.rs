/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/helmapp_controller.rs
*
* This file implements the lifecycle state machine for the HelmApp custom
* resource. It is driven by the `status.phase` field, and every phase has its
* own handler that computes the next status and tells the reconciler when the
* resource should be looked at again.
*
* Core Logic & State Transitions:
* - **New (no phase)**: Initializes the default conditions to `Unknown` and
*   moves to `Detecting`. No external calls.
* - **`Detecting`**: Fetches the store's index and resolves the chart
*   (`ChartReady`), downloads the archive and extracts the README and default
*   values (`ChartParsed`), then runs pre-install validation (`PreInstalled`).
*   Once all three are true the phase becomes `Configuring`.
* - **`Configuring`**: Re-validates when the spec changed since the last pass,
*   then waits for the tenant to set `preStatus: Configured` and moves to
*   `Installing`. Does not poll; the next spec edit wakes it.
* - **`Installing`**: Installs the release, re-validating first if the spec
*   was edited since the last pass. Success records the release and moves to
*   `Installed`.
* - **`Installed`**: Idle. A chart identity change (store, chart or version)
*   re-enters `Detecting` with the parsed content cleared; an overrides change
*   resets `PreInstalled` and re-enters `Configuring`.
*
* Failures are written as a `False` condition with the error's reason and into
* `status.lastError`. Retryable failures keep the phase and ask for backoff.
* Non-retryable ones keep the phase and park the resource: later passes at the
* same `metadata.generation` return without making any external call.
*
* Handlers never persist anything themselves; the reconciler writes the
* returned status as the last action of a pass.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::controllers::preinstall::{PreInstallValidator, ValidationError};
use crate::crds::{
    ConditionStatus, HelmApp, HelmAppConditionType, HelmAppPhase, HelmAppStatus, ObservedChart,
    ReleaseStatus,
};
use crate::installer::{InstallError, InstallRequest, Installer, ReleaseManifest};
use crate::metrics;
use crate::repo::{self, ChartContent, ChartIndex, ChartRepository, ChartVersion, RepoError};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use ConditionStatus::{False, True};
use HelmAppConditionType::{ChartParsed, ChartReady, Installed, PreInstalled};

/// What the reconciler should do with the key after persisting the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Progress was made; run the next phase right away.
    Now,
    /// A retryable failure; come back after the key's backoff delay.
    Backoff,
    /// Nothing to do until the resource changes.
    AwaitChange,
}

/// The outcome of one handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub status: HelmAppStatus,
    pub requeue: Requeue,
}

impl Transition {
    fn now(status: HelmAppStatus) -> Self {
        Self { status, requeue: Requeue::Now }
    }

    fn await_change(status: HelmAppStatus) -> Self {
        Self { status, requeue: Requeue::AwaitChange }
    }
}

/// Collaborators available to phase handlers for one reconciliation pass.
#[derive(Clone)]
pub struct PhaseContext {
    pub repo: Arc<dyn ChartRepository>,
    pub installer: Arc<dyn Installer>,
    pub validator: Arc<dyn PreInstallValidator>,
    /// Upper bound for any single external call.
    pub call_timeout: Duration,
    pub now: DateTime<Utc>,
}

impl PhaseContext {
    /// Runs `call` under the per-call timeout, turning an elapsed timeout into
    /// the error produced by `on_timeout`.
    async fn call<T, E>(
        &self,
        call: impl Future<Output = Result<T, E>>,
        on_timeout: impl FnOnce(String) -> E,
    ) -> Result<T, E> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout(format!(
                "call timed out after {}s",
                self.call_timeout.as_secs_f64()
            ))),
        }
    }

    async fn fetch_index(&self, store_url: &str) -> Result<Arc<ChartIndex>, RepoError> {
        self.call(self.repo.fetch_index(store_url), RepoError::RepoUnreachable)
            .await
    }

    async fn fetch_content(
        &self,
        store_url: &str,
        chart: &ChartVersion,
    ) -> Result<ChartContent, RepoError> {
        self.call(
            self.repo.fetch_content(store_url, chart),
            RepoError::ContentUnavailable,
        )
        .await
    }

    async fn validate(&self, request: &InstallRequest) -> Result<(), ValidationError> {
        self.call(self.validator.validate(request), ValidationError::Unavailable)
            .await
    }

    async fn install(&self, request: &InstallRequest) -> Result<ReleaseManifest, InstallError> {
        self.call(self.installer.install(request), InstallError::ApplyTransient)
            .await
    }

    fn timestamp(&self) -> String {
        self.now.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

/// A phase handler. Receives the resource as read at the start of the pass
/// and a working copy of its status.
pub type PhaseHandler =
    for<'a> fn(&'a HelmApp, HelmAppStatus, &'a PhaseContext) -> BoxFuture<'a, Transition>;

/// Phase to handler lookup.
pub fn handler_for(phase: Option<HelmAppPhase>) -> PhaseHandler {
    match phase {
        None => handle_new,
        Some(HelmAppPhase::Detecting) => handle_detecting,
        Some(HelmAppPhase::Configuring) => handle_configuring,
        Some(HelmAppPhase::Installing) => handle_installing,
        Some(HelmAppPhase::Installed) => handle_installed,
    }
}

/// Records a failed step on `condition` and picks the requeue directive
/// from the error's retryability.
fn failed(
    mut status: HelmAppStatus,
    condition: HelmAppConditionType,
    reason: &str,
    message: String,
    retryable: bool,
    ctx: &PhaseContext,
) -> Transition {
    status.set_condition(condition, False, reason, &message, ctx.now);
    status.last_error = Some(message);
    Transition {
        status,
        requeue: if retryable {
            Requeue::Backoff
        } else {
            Requeue::AwaitChange
        },
    }
}

/// True when the last pass hit a non-retryable failure on one of
/// `conditions` and the spec has not changed since.
fn is_parked(app: &HelmApp, status: &HelmAppStatus, conditions: &[HelmAppConditionType]) -> bool {
    status.observed_generation.is_some()
        && status.observed_generation == app.metadata.generation
        && status.has_terminal_failure(conditions)
}

/// Whether the spec was edited after the last persisted pass.
fn spec_edited(app: &HelmApp, status: &HelmAppStatus) -> bool {
    status.observed_generation.is_some() && status.observed_generation != app.metadata.generation
}

/// Runs pre-install validation against the current spec and records the
/// outcome on `PreInstalled`. A failure comes back as the finished
/// transition.
async fn validate_current(
    app: &HelmApp,
    mut status: HelmAppStatus,
    ctx: &PhaseContext,
) -> Result<HelmAppStatus, Transition> {
    let request = InstallRequest::for_app(app, &status);
    if let Err(e) = ctx.validate(&request).await {
        warn!(chart = %app.spec.template_name, error = %e, "Pre-install validation failed");
        return Err(failed(status, PreInstalled, e.reason(), e.to_string(), e.is_retryable(), ctx));
    }
    status.set_condition(PreInstalled, True, "Validated", "", ctx.now);
    Ok(status)
}

/// Whether the spec now points at a different chart than the one the status
/// content was parsed from.
fn chart_changed(app: &HelmApp, status: &HelmAppStatus) -> bool {
    status
        .observed_chart
        .as_ref()
        .map_or(true, |observed| !observed.matches(&app.spec))
}

fn back_to_detecting(mut status: HelmAppStatus, ctx: &PhaseContext) -> Transition {
    status.reset_detection(ctx.now);
    status.phase = Some(HelmAppPhase::Detecting);
    Transition::now(status)
}

fn handle_new<'a>(
    _app: &'a HelmApp,
    mut status: HelmAppStatus,
    ctx: &'a PhaseContext,
) -> BoxFuture<'a, Transition> {
    async move {
        status.init_conditions(ctx.now);
        status.phase = Some(HelmAppPhase::Detecting);
        Transition::now(status)
    }
    .boxed()
}

fn handle_detecting<'a>(
    app: &'a HelmApp,
    mut status: HelmAppStatus,
    ctx: &'a PhaseContext,
) -> BoxFuture<'a, Transition> {
    async move {
        if is_parked(app, &status, &HelmAppConditionType::DEFAULTS) {
            debug!("Detection parked until the spec changes");
            return Transition::await_change(status);
        }
        let spec = &app.spec;
        status.init_conditions(ctx.now);

        // --- 1. Chart index and version resolution ---
        let index = match ctx.fetch_index(&spec.app_store.url).await {
            Ok(index) => index,
            Err(e) => {
                warn!(store = %spec.app_store.url, error = %e, "Chart index unavailable");
                return failed(status, ChartReady, e.reason(), e.to_string(), e.is_retryable(), ctx);
            }
        };
        let chart = match repo::resolve_version(&index, &spec.template_name, &spec.version) {
            Ok(chart) => chart,
            Err(e) => {
                warn!(chart = %spec.template_name, version = %spec.version, error = %e, "Chart not resolvable");
                let mut message = e.to_string();
                if let RepoError::VersionNotFound { .. } = e {
                    if let Ok(available) = repo::chart_versions(&index, &spec.template_name) {
                        let versions: Vec<&str> =
                            available.iter().take(5).map(|c| c.version.as_str()).collect();
                        message = format!("{message}; available: {}", versions.join(", "));
                    }
                }
                return failed(status, ChartReady, e.reason(), message, e.is_retryable(), ctx);
            }
        };
        status.set_condition(
            ChartReady,
            True,
            "ChartFound",
            &format!(
                "{} {} found in {}",
                spec.template_name, chart.version, spec.app_store.name
            ),
            ctx.now,
        );

        // --- 2. Chart content ---
        let observed = ObservedChart::from_spec(spec, &chart.version);
        let already_parsed =
            status.is_condition_true(ChartParsed) && status.observed_chart.as_ref() == Some(&observed);
        if !already_parsed {
            let content = match ctx.fetch_content(&spec.app_store.url, &chart).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(chart = %spec.template_name, error = %e, "Chart content unavailable");
                    return failed(status, ChartParsed, e.reason(), e.to_string(), e.is_retryable(), ctx);
                }
            };
            status.readme = content.readme;
            status.values = content.values;
            status.observed_chart = Some(observed);
            status.set_condition(ChartParsed, True, "ContentParsed", "", ctx.now);
        }

        // --- 3. Pre-install validation ---
        let mut status = match validate_current(app, status, ctx).await {
            Ok(status) => status,
            Err(transition) => return transition,
        };

        status.last_error = None;
        status.phase = Some(HelmAppPhase::Configuring);
        info!(chart = %spec.template_name, version = %chart.version, "Chart detected; waiting for configuration");
        Transition::now(status)
    }
    .boxed()
}

fn handle_configuring<'a>(
    app: &'a HelmApp,
    status: HelmAppStatus,
    ctx: &'a PhaseContext,
) -> BoxFuture<'a, Transition> {
    async move {
        if chart_changed(app, &status) {
            info!("Chart changed while configuring; detecting again");
            return back_to_detecting(status, ctx);
        }
        if is_parked(app, &status, &[PreInstalled]) {
            debug!("Configuration parked until the spec changes");
            return Transition::await_change(status);
        }
        let mut status = status;
        if !status.is_condition_true(PreInstalled) || spec_edited(app, &status) {
            status = match validate_current(app, status, ctx).await {
                Ok(status) => status,
                Err(transition) => return transition,
            };
            status.last_error = None;
        }
        if !app.spec.is_configured() {
            return Transition::await_change(status);
        }
        status.phase = Some(HelmAppPhase::Installing);
        Transition::now(status)
    }
    .boxed()
}

fn handle_installing<'a>(
    app: &'a HelmApp,
    mut status: HelmAppStatus,
    ctx: &'a PhaseContext,
) -> BoxFuture<'a, Transition> {
    async move {
        if chart_changed(app, &status) {
            info!("Chart changed before install; detecting again");
            return back_to_detecting(status, ctx);
        }
        if is_parked(app, &status, &[Installed, PreInstalled]) {
            debug!("Install parked until the spec changes");
            return Transition::await_change(status);
        }
        if spec_edited(app, &status) {
            status = match validate_current(app, status, ctx).await {
                Ok(status) => status,
                Err(transition) => return transition,
            };
        }

        let request = InstallRequest::for_app(app, &status);
        let started = Instant::now();
        let result = ctx.install(&request).await;
        metrics::HELMAPP_INSTALL_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());

        match result {
            Ok(manifest) => {
                let revision = status.release.as_ref().map_or(1, |r| r.revision + 1);
                let summary = manifest.summary();
                status.set_condition(Installed, True, "InstallSucceeded", &summary, ctx.now);
                status.release = Some(ReleaseStatus {
                    name: manifest.release_name,
                    namespace: manifest.namespace,
                    revision,
                    resources: manifest.resources,
                    summary,
                    installed_at: ctx.timestamp(),
                });
                status.applied_overrides = Some(app.spec.overrides.clone());
                status.last_error = None;
                status.phase = Some(HelmAppPhase::Installed);
                info!(release = %request.release_name, revision, "Release installed");
                Transition::await_change(status)
            }
            Err(e) => {
                warn!(release = %request.release_name, error = %e, "Install failed");
                failed(status, Installed, e.reason(), e.to_string(), e.is_retryable(), ctx)
            }
        }
    }
    .boxed()
}

fn handle_installed<'a>(
    app: &'a HelmApp,
    mut status: HelmAppStatus,
    ctx: &'a PhaseContext,
) -> BoxFuture<'a, Transition> {
    async move {
        if chart_changed(app, &status) {
            info!("Chart identity changed; detecting again");
            return back_to_detecting(status, ctx);
        }
        let applied = status.applied_overrides.as_deref().unwrap_or_default();
        if applied != app.spec.overrides.as_slice() {
            info!("Overrides changed; back to configuring");
            status.set_condition(
                PreInstalled,
                ConditionStatus::Unknown,
                "OverridesChanged",
                "",
                ctx.now,
            );
            status.phase = Some(HelmAppPhase::Configuring);
            return Transition::now(status);
        }
        Transition::await_change(status)
    }
    .boxed()
}
