/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/installer/helm.rs
*
* Production installer. Rendering shells out to `helm template`; the
* templating engine itself is treated as an opaque renderer. Applying uses
* Kubernetes Server-Side Apply on each rendered object so that a repeated
* install converges on the same objects instead of failing on "already
* exists".
*
* Resource discovery goes through `kube::discovery::pinned_kind`, which
* resolves the `apiVersion`/`kind` of each rendered document to its REST
* endpoint and tells us whether the kind is namespaced. Namespaced objects
* without an explicit namespace land in the HelmApp's namespace.
*
* Every applied object is labelled with the release name and the HelmApp's
* namespace. Finding a release's objects is a full discovery pass followed by
* a label-selected metadata list of every listable, deletable kind. After an
* upgrade this removes what the new render dropped; on uninstall it removes
* everything, including objects from an install that failed partway.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::{
    classify_kube_error, parse_manifest, release_selector, stale_objects, InstallError,
    InstallRequest, Installer, ReleaseManifest, FIELD_MANAGER, MANAGED_BY_LABEL, RELEASE_LABEL,
    RELEASE_NAMESPACE_LABEL,
};
use crate::crds::ResourceRef;
use crate::values;
use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams},
    core::GroupVersionKind,
    discovery::{self, verbs, ApiCapabilities, ApiResource, Discovery, Scope},
    Client,
};
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Fragments of `helm` stderr that indicate a chart fetch or network
/// problem rather than a template error.
const TRANSIENT_HELM_ERRORS: &[&str] = &[
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "no such host",
    "failed to fetch",
    "tls handshake",
    "unexpected eof",
    "503",
    "502",
    "504",
];

pub struct HelmInstaller {
    client: Client,
    helm_bin: PathBuf,
}

impl HelmInstaller {
    pub fn new(client: Client, helm_bin: impl Into<PathBuf>) -> Self {
        Self {
            client,
            helm_bin: helm_bin.into(),
        }
    }

    async fn resolve(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<(ApiResource, ApiCapabilities), kube::Error> {
        let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
        let gvk = GroupVersionKind::gvk(group, version, kind);
        discovery::pinned_kind(&self.client, &gvk).await
    }

    fn api_for(
        &self,
        resource: &ApiResource,
        caps: &ApiCapabilities,
        namespace: Option<&str>,
    ) -> Api<DynamicObject> {
        match (caps.scope == Scope::Namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, resource),
            _ => Api::all_with(self.client.clone(), resource),
        }
    }

    async fn apply_object(
        &self,
        mut obj: DynamicObject,
        request: &InstallRequest,
    ) -> Result<ResourceRef, InstallError> {
        let types = obj
            .types
            .clone()
            .ok_or_else(|| InstallError::RenderError("object has no apiVersion/kind".into()))?;
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| InstallError::RenderError("object has no metadata.name".into()))?;

        let (resource, caps) = self
            .resolve(&types.api_version, &types.kind)
            .await
            .map_err(|e| classify_kube_error(&e))?;

        let namespace = if caps.scope == Scope::Namespaced {
            Some(
                obj.metadata
                    .namespace
                    .get_or_insert_with(|| request.namespace.clone())
                    .clone(),
            )
        } else {
            obj.metadata.namespace = None;
            None
        };

        let labels = obj.metadata.labels.get_or_insert_with(Default::default);
        labels.insert(RELEASE_LABEL.to_string(), request.release_name.clone());
        labels.insert(RELEASE_NAMESPACE_LABEL.to_string(), request.namespace.clone());
        labels.insert(MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string());

        let api = self.api_for(&resource, &caps, namespace.as_deref());
        debug!(kind = %types.kind, %name, "Applying rendered object");
        api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&obj))
            .await
            .map_err(|e| classify_kube_error(&e))?;

        Ok(ResourceRef {
            api_version: types.api_version,
            kind: types.kind,
            namespace,
            name,
        })
    }

    /// Every object on the cluster labelled for the release. Kinds the
    /// operator may not list are skipped.
    async fn release_objects(
        &self,
        namespace: &str,
        release_name: &str,
    ) -> Result<Vec<ResourceRef>, InstallError> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| classify_kube_error(&e))?;
        let params = ListParams::default().labels(&release_selector(namespace, release_name));

        let mut found = Vec::new();
        for group in discovery.groups() {
            for (resource, caps) in group.recommended_resources() {
                if !caps.supports_operation(verbs::LIST) || !caps.supports_operation(verbs::DELETE) {
                    continue;
                }
                let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
                let list = match api.list_metadata(&params).await {
                    Ok(list) => list,
                    Err(kube::Error::Api(ae)) if matches!(ae.code, 403 | 404 | 405) => {
                        debug!(kind = %resource.kind, code = ae.code, "Skipping unlistable kind");
                        continue;
                    }
                    Err(e) => return Err(classify_kube_error(&e)),
                };
                for item in list.items {
                    let Some(name) = item.metadata.name else { continue };
                    found.push(ResourceRef {
                        api_version: resource.api_version.clone(),
                        kind: resource.kind.clone(),
                        namespace: item.metadata.namespace,
                        name,
                    });
                }
            }
        }
        Ok(found)
    }

    /// Deletes the given objects in reverse order. Missing kinds and objects
    /// count as deleted.
    async fn delete_objects(&self, objects: &[ResourceRef]) -> Result<(), InstallError> {
        for resource in objects.iter().rev() {
            let (api_resource, caps) = match self.resolve(&resource.api_version, &resource.kind).await {
                Ok(found) => found,
                // The kind itself is gone (e.g. its CRD was removed), so are its objects.
                Err(kube::Error::Api(ae)) if ae.code == 404 => continue,
                Err(e) => return Err(classify_kube_error(&e)),
            };
            let api = self.api_for(&api_resource, &caps, resource.namespace.as_deref());
            match api.delete(&resource.name, &DeleteParams::background()).await {
                Ok(_) => debug!(kind = %resource.kind, name = %resource.name, "Deleted release object"),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    debug!(kind = %resource.kind, name = %resource.name, "Release object already deleted")
                }
                Err(e) => return Err(classify_kube_error(&e)),
            }
        }
        Ok(())
    }
}

/// Classifies a failed `helm template` run by its stderr.
fn classify_helm_failure(stderr: &str) -> InstallError {
    let lowered = stderr.to_lowercase();
    let message = stderr.trim().to_string();
    if TRANSIENT_HELM_ERRORS.iter().any(|needle| lowered.contains(needle)) {
        InstallError::ApplyTransient(message)
    } else {
        InstallError::RenderError(message)
    }
}

#[async_trait]
impl Installer for HelmInstaller {
    async fn render(&self, request: &InstallRequest) -> Result<String, InstallError> {
        let effective = values::effective_values(&request.default_values, &request.overrides)
            .map_err(|e| InstallError::RenderError(e.to_string()))?;
        let yaml = values::to_yaml(&effective).map_err(|e| InstallError::RenderError(e.to_string()))?;

        let mut values_file = tempfile::Builder::new()
            .prefix("helmapp-values-")
            .suffix(".yaml")
            .tempfile()
            .map_err(|e| InstallError::ApplyTransient(format!("cannot create values file: {e}")))?;
        values_file
            .write_all(yaml.as_bytes())
            .and_then(|_| values_file.flush())
            .map_err(|e| InstallError::ApplyTransient(format!("cannot write values file: {e}")))?;

        let mut cmd = Command::new(&self.helm_bin);
        cmd.arg("template")
            .arg(&request.release_name)
            .arg(&request.chart)
            .arg("--repo")
            .arg(&request.store.url)
            .arg("--namespace")
            .arg(&request.namespace)
            .arg("--values")
            .arg(values_file.path());
        if !request.version.is_empty() {
            cmd.arg("--version").arg(&request.version);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(release = %request.release_name, chart = %request.chart, "Running helm template");
        let output = cmd.output().await.map_err(|e| {
            InstallError::ApplyTransient(format!(
                "failed to run {}: {e}",
                self.helm_bin.display()
            ))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(release = %request.release_name, stderr = %stderr.trim(), "helm template failed");
            return Err(classify_helm_failure(&stderr));
        }
        String::from_utf8(output.stdout)
            .map_err(|e| InstallError::RenderError(format!("helm output is not UTF-8: {e}")))
    }

    async fn install(&self, request: &InstallRequest) -> Result<ReleaseManifest, InstallError> {
        let manifest = self.render(request).await?;
        let objects = parse_manifest(&manifest)?;

        let mut resources = Vec::with_capacity(objects.len());
        for obj in objects {
            resources.push(self.apply_object(obj, request).await?);
        }

        let live = self
            .release_objects(&request.namespace, &request.release_name)
            .await?;
        let stale = stale_objects(&live, &resources);
        if !stale.is_empty() {
            info!(release = %request.release_name, pruned = stale.len(), "Pruning objects dropped from the release");
            self.delete_objects(&stale).await?;
        }
        info!(
            release = %request.release_name,
            namespace = %request.namespace,
            objects = resources.len(),
            "Release applied"
        );

        Ok(ReleaseManifest {
            release_name: request.release_name.clone(),
            namespace: request.namespace.clone(),
            manifest,
            resources,
        })
    }

    async fn uninstall(&self, namespace: &str, release_name: &str) -> Result<(), InstallError> {
        let objects = self.release_objects(namespace, release_name).await?;
        self.delete_objects(&objects).await?;
        info!(release = %release_name, %namespace, objects = objects.len(), "Release uninstalled");
        Ok(())
    }
}
