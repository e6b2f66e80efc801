/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/preinstall.rs
*
* Pre-install validation, the last gate of the Detecting phase. A HelmApp
* only reaches Configuring once its chart content has passed this check.
*
* Two strategies are provided:
* - `StaticValidator` checks that the chart's default values are a YAML
*   mapping and that the tenant's overrides parse. No external calls.
* - `DryRunValidator` additionally renders the release through the installer
*   without applying it, which catches template errors before the tenant
*   spends time configuring.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::installer::{InstallError, InstallRequest, Installer};
use crate::values;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Chart failed validation: {0}")]
    Rejected(String),

    #[error("Validation could not complete: {0}")]
    Unavailable(String),
}

impl ValidationError {
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::Rejected(_) => "ValidationFailed",
            ValidationError::Unavailable(_) => "ValidationUnavailable",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ValidationError::Unavailable(_))
    }
}

impl From<InstallError> for ValidationError {
    fn from(err: InstallError) -> Self {
        if err.is_retryable() {
            ValidationError::Unavailable(err.to_string())
        } else {
            ValidationError::Rejected(err.to_string())
        }
    }
}

#[async_trait]
pub trait PreInstallValidator: Send + Sync {
    async fn validate(&self, request: &InstallRequest) -> Result<(), ValidationError>;
}

#[derive(Default)]
pub struct StaticValidator;

#[async_trait]
impl PreInstallValidator for StaticValidator {
    async fn validate(&self, request: &InstallRequest) -> Result<(), ValidationError> {
        values::effective_values(&request.default_values, &request.overrides)
            .map(|_| ())
            .map_err(|e| ValidationError::Rejected(e.to_string()))
    }
}

pub struct DryRunValidator {
    installer: Arc<dyn Installer>,
}

impl DryRunValidator {
    pub fn new(installer: Arc<dyn Installer>) -> Self {
        Self { installer }
    }
}

#[async_trait]
impl PreInstallValidator for DryRunValidator {
    async fn validate(&self, request: &InstallRequest) -> Result<(), ValidationError> {
        StaticValidator.validate(request).await?;
        let manifest = self.installer.render(request).await?;
        crate::installer::parse_manifest(&manifest)?;
        Ok(())
    }
}
