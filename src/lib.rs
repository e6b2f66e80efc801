/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/lib.rs
*
* Library root of the helmapp-operator. The reconciliation core lives here so
* it can be exercised without a cluster; `main.rs` only wires the Kubernetes
* client, the HTTP chart repository and the helm installer into it.
*
* SPDX-License-Identifier: Apache-2.0
*/

pub mod conditions;
pub mod config;
pub mod crds;
pub mod installer;
pub mod metrics;
pub mod reconciler;
pub mod repo;
pub mod store;
pub mod telemetry;
pub mod values;
pub mod workqueue;
pub mod controllers {
    pub mod helmapp_controller;
    pub mod preinstall;
}

#[cfg(test)]
mod testing;
