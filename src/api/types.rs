// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Request and response bodies of the public API.
//!
//! Unknown fields are rejected on decode so drifting clients fail with a
//! 400 instead of silently losing data.

use crate::config::{AppConfig, Domain, TargetConfig};
use crate::deploy::RollbackTarget;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    pub service: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeployRequest {
    #[serde(rename = "deploymentID")]
    pub deployment_id: String,
    pub target_config: TargetConfig,
    /// The descriptor without resolved secrets, persisted server-side for
    /// rollbacks.
    pub rollback_app_config: AppConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RollbackRequest {
    #[serde(rename = "targetDeploymentID")]
    pub target_deployment_id: String,
    #[serde(rename = "newDeploymentID")]
    pub new_deployment_id: String,
    pub new_target_config: TargetConfig,
}

#[derive(Debug, Serialize)]
pub struct RollbackTargetsResponse {
    pub targets: Vec<RollbackTarget>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatusResponse {
    pub state: String,
    pub deployment_id: String,
    pub container_ids: Vec<String>,
    pub domains: Vec<Domain>,
}

#[derive(Debug, Serialize)]
pub struct StopAppResponse {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ImageUploadResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub haloyd: String,
    pub haproxy: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecRequest {
    pub command: Vec<String>,
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub all_containers: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub container_id: String,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExecResponse {
    pub results: Vec<ExecResult>,
}

#[cfg(test)]
#[path = "types_tests.rs"]
mod types_tests;
