/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/metrics.rs
*
* This module defines and registers the Prometheus metrics that the
* helmapp-operator exposes: how often each lifecycle phase is reconciled and
* with what outcome, which phase transitions happen, how long installs take,
* and how the work queue is doing.
*
* Using `lazy_static`, we ensure that the metrics are created only once and are
* available globally and safely across all reconciliation workers and the
* metrics web server.
*
* SPDX-License-Identifier: Apache-2.0
*/

use lazy_static::lazy_static;
use prometheus::{
    histogram_opts, opts, Histogram, IntCounter, IntCounterVec, IntGauge, Registry,
};

// --- Metric Definitions ---

lazy_static! {
    /// Reconciliation passes, labeled by the phase handled and the outcome.
    pub static ref HELMAPP_RECONCILE_TOTAL: IntCounterVec = IntCounterVec::new(
        opts!(
            "helmapp_reconcile_total",
            "Total number of HelmApp reconciliation passes."
        ),
        &["phase", "result"]
    )
    .unwrap_or_else(|e| panic!("invalid metric definition: {e}"));

    /// Persisted phase transitions.
    pub static ref HELMAPP_PHASE_TRANSITIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        opts!(
            "helmapp_phase_transitions_total",
            "Total number of HelmApp phase transitions."
        ),
        &["from", "to"]
    )
    .unwrap_or_else(|e| panic!("invalid metric definition: {e}"));

    /// Latency of a single install call, in seconds.
    pub static ref HELMAPP_INSTALL_DURATION_SECONDS: Histogram = Histogram::with_opts(
        histogram_opts!(
            "helmapp_install_duration_seconds",
            "Duration of HelmApp install calls.",
            vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]
        )
    )
    .unwrap_or_else(|e| panic!("invalid metric definition: {e}"));

    /// Keys waiting in the work queue.
    pub static ref WORKQUEUE_DEPTH: IntGauge = IntGauge::with_opts(opts!(
        "helmapp_workqueue_depth",
        "Current number of keys waiting in the work queue."
    ))
    .unwrap_or_else(|e| panic!("invalid metric definition: {e}"));

    /// Keys re-added with backoff after a failed pass.
    pub static ref WORKQUEUE_RETRIES_TOTAL: IntCounter = IntCounter::with_opts(opts!(
        "helmapp_workqueue_retries_total",
        "Total number of rate-limited work queue re-adds."
    ))
    .unwrap_or_else(|e| panic!("invalid metric definition: {e}"));
}

/// Creates a new Prometheus registry and registers all custom metrics.
///
/// This function is intended to be called once at operator startup.
pub fn create_and_register_metrics() -> Result<Registry, prometheus::Error> {
    let r = Registry::new();
    r.register(Box::new(HELMAPP_RECONCILE_TOTAL.clone()))?;
    r.register(Box::new(HELMAPP_PHASE_TRANSITIONS_TOTAL.clone()))?;
    r.register(Box::new(HELMAPP_INSTALL_DURATION_SECONDS.clone()))?;
    r.register(Box::new(WORKQUEUE_DEPTH.clone()))?;
    r.register(Box::new(WORKQUEUE_RETRIES_TOTAL.clone()))?;
    Ok(r)
}
