/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/bin/crdgen.rs
*
* Prints the HelmApp CustomResourceDefinition as YAML, ready for
* `kubectl apply -f -`.
*
* SPDX-License-Identifier: Apache-2.0
*/

use helmapp_operator::crds::HelmApp;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(&HelmApp::crd())?;
    print!("{yaml}");
    Ok(())
}
