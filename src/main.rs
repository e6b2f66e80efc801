/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/main.rs
*
* Entry point of the helmapp-operator. Wires the Kubernetes client, the HTTP
* chart repository, the helm-backed installer and the status store into a
* `Reconciler`, then runs three tasks side by side:
*
* - the watch on HelmApp resources, which feeds the work queue;
* - the pool of reconciliation workers draining that queue;
* - the `/metrics` endpoint scraped by Prometheus.
*
* Ctrl-C shuts the queue down; workers finish their current item and exit.
*
* SPDX-License-Identifier: Apache-2.0
*/

use clap::Parser;
use helmapp_operator::config::{OperatorConfig, PreInstallCheck};
use helmapp_operator::controllers::preinstall::{
    DryRunValidator, PreInstallValidator, StaticValidator,
};
use helmapp_operator::crds::HelmApp;
use helmapp_operator::installer::{helm::HelmInstaller, Installer};
use helmapp_operator::metrics;
use helmapp_operator::reconciler::Reconciler;
use helmapp_operator::repo::HttpChartRepository;
use helmapp_operator::store::KubeHelmAppStore;
use helmapp_operator::telemetry::init_telemetry;
use helmapp_operator::workqueue::WorkQueue;
use kube::{Api, Client};
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use warp::Filter;

/// Renders the metrics into the Prometheus text format.
async fn metrics_handler(registry: Arc<Registry>) -> Result<impl warp::Reply, warp::Rejection> {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return Err(warp::reject::reject());
    }

    let response = String::from_utf8_lossy(&buffer).into_owned();
    Ok(warp::reply::with_header(
        response,
        "Content-Type",
        encoder.format_type(),
    ))
}

/// Runs the HTTP server exposing `/metrics`.
async fn run_metrics_server(registry: Arc<Registry>, addr: SocketAddr) {
    let metrics_route = warp::path("metrics")
        .and(warp::get())
        .and(warp::any().map(move || Arc::clone(&registry)))
        .and_then(metrics_handler);

    info!(%addr, "Starting metrics server");
    warp::serve(metrics_route).run(addr).await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::parse();

    let _telemetry = init_telemetry(config.log_format, config.jaeger)?;
    info!("Telemetry initialized.");

    let registry = Arc::new(metrics::create_and_register_metrics()?);
    info!("Custom metrics registered.");

    let client = Client::try_default().await?;
    let api: Api<HelmApp> = match config.namespace.as_deref() {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let repo = Arc::new(HttpChartRepository::new(
        config.http_timeout(),
        config.index_cache_ttl(),
    )?);
    let installer: Arc<dyn Installer> =
        Arc::new(HelmInstaller::new(client.clone(), config.helm_bin.clone()));
    let validator: Arc<dyn PreInstallValidator> = match config.preinstall_check {
        PreInstallCheck::Static => Arc::new(StaticValidator),
        PreInstallCheck::DryRun => Arc::new(DryRunValidator::new(Arc::clone(&installer))),
    };
    let store = Arc::new(KubeHelmAppStore::new(client));

    let reconciler = Arc::new(Reconciler::new(
        store,
        repo,
        installer,
        validator,
        WorkQueue::new(config.backoff()),
        config.call_timeout(),
    ));

    info!(
        namespace = config.namespace.as_deref().unwrap_or("*"),
        workers = config.workers,
        "HelmApp operator starting..."
    );

    let workers = tokio::spawn(Arc::clone(&reconciler).run(config.workers));
    let watch = tokio::spawn(Arc::clone(&reconciler).watch(api, config.label_selector.clone()));

    tokio::select! {
        _ = run_metrics_server(Arc::clone(&registry), config.metrics_addr) => {
            error!("Metrics server exited");
        }
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        }
    }

    reconciler.queue().shutdown();
    watch.abort();
    if let Err(e) = workers.await {
        error!(error = %e, "Worker pool aborted");
    }

    info!("HelmApp operator shutting down.");
    Ok(())
}
