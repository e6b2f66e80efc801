/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/telemetry.rs
*
* Logging and tracing setup. Structured events go to stdout through
* `tracing-subscriber` (JSON by default), filtered by `RUST_LOG`. When
* enabled, spans are also exported to a Jaeger agent through OpenTelemetry,
* and the W3C trace-context propagator is installed so a reconcile span can
* continue a trace started by whoever last edited the resource.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::config::LogFormat;
use opentelemetry::global;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Flushes and shuts down the exporter on drop.
pub struct TelemetryGuard {
    jaeger: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.jaeger {
            global::shutdown_tracer_provider();
        }
    }
}

/// Installs the global subscriber.
pub fn init_telemetry(format: LogFormat, jaeger: bool) -> anyhow::Result<TelemetryGuard> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().boxed(),
    };

    let telemetry = if jaeger {
        let tracer = opentelemetry_jaeger::new_agent_pipeline()
            .with_service_name("helmapp-operator")
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .with(telemetry)
        .try_init()?;

    Ok(TelemetryGuard { jaeger })
}
