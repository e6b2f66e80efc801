/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/config.rs
*
* Command-line and environment configuration for the operator process,
* declared with `clap`'s derive API. Every flag can also be supplied through
* the `HELMAPP_*` environment variable named next to it, which is how the
* operator is configured when running in-cluster from a Deployment manifest.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::workqueue::BackoffPolicy;
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// How the Detecting phase validates a chart before offering it for
/// configuration.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreInstallCheck {
    /// Values and overrides must parse.
    Static,
    /// Additionally render the release with `helm template`.
    DryRun,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

/// Kubernetes operator that deploys Helm charts declared as HelmApp resources.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct OperatorConfig {
    /// Namespace to watch. All namespaces when unset.
    #[arg(long, env = "HELMAPP_NAMESPACE")]
    pub namespace: Option<String>,

    /// Only reconcile HelmApps matching this label selector.
    #[arg(long, env = "HELMAPP_LABEL_SELECTOR")]
    pub label_selector: Option<String>,

    /// Number of concurrent reconciliation workers.
    #[arg(long, env = "HELMAPP_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Timeout for any single repository, validation or install call, in seconds.
    #[arg(long, env = "HELMAPP_CALL_TIMEOUT_SECS", default_value_t = 30)]
    pub call_timeout_secs: u64,

    /// First retry delay after a failed pass, in seconds.
    #[arg(long, env = "HELMAPP_BACKOFF_BASE_SECS", default_value_t = 5)]
    pub backoff_base_secs: u64,

    /// Upper bound for the retry delay, in seconds.
    #[arg(long, env = "HELMAPP_BACKOFF_MAX_SECS", default_value_t = 300)]
    pub backoff_max_secs: u64,

    /// How long a fetched chart index is reused, in seconds. 0 disables caching.
    #[arg(long, env = "HELMAPP_INDEX_CACHE_TTL_SECS", default_value_t = 60)]
    pub index_cache_ttl_secs: u64,

    /// Timeout for HTTP requests to chart repositories, in seconds.
    #[arg(long, env = "HELMAPP_HTTP_TIMEOUT_SECS", default_value_t = 20)]
    pub http_timeout_secs: u64,

    /// Path to the helm binary used for rendering.
    #[arg(long, env = "HELMAPP_HELM_BIN", default_value = "helm")]
    pub helm_bin: PathBuf,

    /// Pre-install validation strategy.
    #[arg(long, env = "HELMAPP_PREINSTALL_CHECK", value_enum, default_value_t = PreInstallCheck::Static)]
    pub preinstall_check: PreInstallCheck,

    /// Address of the Prometheus metrics endpoint.
    #[arg(long, env = "HELMAPP_METRICS_ADDR", default_value = "0.0.0.0:9090")]
    pub metrics_addr: SocketAddr,

    /// Log output format.
    #[arg(long, env = "HELMAPP_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Export traces to a Jaeger agent.
    #[arg(long, env = "HELMAPP_JAEGER", default_value_t = false)]
    pub jaeger: bool,
}

impl OperatorConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn index_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.index_cache_ttl_secs)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        let base = Duration::from_secs(self.backoff_base_secs.max(1));
        BackoffPolicy {
            base,
            max: Duration::from_secs(self.backoff_max_secs).max(base),
        }
    }
}
