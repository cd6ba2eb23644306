// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Endpoint handlers.

use super::sse::{deployment_log_sse, general_log_sse};
use super::types::{
    AppStatusResponse, DeployRequest, ExecRequest, ExecResponse, ExecResult, HealthResponse,
    ImageUploadResponse, RollbackRequest, RollbackTargetsResponse, StopAppResponse,
    VersionResponse,
};
use super::ApiState;
use crate::config::Domain;
use crate::constants::{HAPROXY_VERSION, VERSION};
use crate::deploy;
use crate::docker;
use crate::helpers::safe_id_prefix;
use crate::labels::ContainerLabels;
use crate::logging::DeploymentLogger;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Deadline for a background deployment (image pull included).
const DEPLOY_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Deadline for command execution inside containers.
const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

type ApiError = (StatusCode, String);

fn bad_request(message: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, message.into())
}

fn internal_error(err: &anyhow::Error) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}

// ============================================================================
// Health and version
// ============================================================================

pub async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: VERSION.to_string(),
        service: "haloyd".to_string(),
    })
}

pub async fn handle_version() -> Json<VersionResponse> {
    Json(VersionResponse {
        haloyd: VERSION.to_string(),
        haproxy: HAPROXY_VERSION.to_string(),
    })
}

// ============================================================================
// Deploy
// ============================================================================

pub async fn handle_deploy(
    State(state): State<ApiState>,
    Json(request): Json<DeployRequest>,
) -> Result<StatusCode, ApiError> {
    if request.deployment_id.is_empty() {
        return Err(bad_request("Deployment ID is required"));
    }

    request
        .target_config
        .validate()
        .map_err(|err| bad_request(format!("Invalid app configuration: {err:#}")))?;

    let logger = DeploymentLogger::deployment(state.broker.clone(), &request.deployment_id);

    tokio::spawn(async move {
        let app_name = request.target_config.name.clone();
        let work = deploy::deploy_app(
            &state.docker,
            &state.db,
            &request.deployment_id,
            &request.target_config,
            &request.rollback_app_config,
            None,
            &logger,
        );

        match tokio::time::timeout(DEPLOY_TIMEOUT, work).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => logger.deployment_failed(&app_name, "Deployment failed", &err),
            Err(_) => logger.deployment_failed(
                &app_name,
                "Deployment failed",
                &anyhow::anyhow!("deployment timed out"),
            ),
        }
    });

    Ok(StatusCode::ACCEPTED)
}

// ============================================================================
// Log streams
// ============================================================================

pub async fn handle_deployment_logs(
    State(state): State<ApiState>,
    Path(deployment_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if deployment_id.is_empty() {
        return Err(bad_request("deployment ID is required"));
    }
    Ok(deployment_log_sse(&state.broker, &deployment_id))
}

pub async fn handle_logs(State(state): State<ApiState>) -> impl IntoResponse {
    general_log_sse(&state.broker)
}

// ============================================================================
// Image upload
// ============================================================================

pub async fn handle_image_upload(
    State(state): State<ApiState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<ImageUploadResponse>), ApiError> {
    let field = loop {
        match multipart
            .next_field()
            .await
            .map_err(|_| bad_request("Failed to parse multipart form"))?
        {
            Some(candidate) => {
                if candidate.name() == Some("image") {
                    break Some(candidate);
                }
            }
            None => break None,
        }
    };
    let mut field = field.ok_or_else(|| bad_request("Missing 'image' file in form data"))?;

    let file_name = field.file_name().unwrap_or_default().to_string();
    if !file_name.ends_with(".tar") {
        return Err(bad_request("File must be a .tar archive"));
    }

    let temp = tempfile::Builder::new()
        .prefix("haloy-image-")
        .suffix(".tar")
        .tempfile()
        .map_err(|_| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to create temporary file".to_string(),
            )
        })?;

    // Spool the upload to disk chunk by chunk to keep memory bounded.
    let mut file = tokio::fs::File::create(temp.path()).await.map_err(|_| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to save uploaded file".to_string(),
        )
    })?;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|_| bad_request("Failed to read uploaded file"))?
    {
        file.write_all(&chunk).await.map_err(|_| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to save uploaded file".to_string(),
            )
        })?;
    }
    file.flush().await.ok();
    drop(file);

    docker::load_image_from_tar(&state.docker, temp.path())
        .await
        .map_err(|err| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to load image: {err:#}"),
            )
        })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ImageUploadResponse {
            success: true,
            message: format!("Image loaded successfully from {file_name}"),
        }),
    ))
}

// ============================================================================
// Rollback
// ============================================================================

pub async fn handle_rollback_targets(
    State(state): State<ApiState>,
    Path(app_name): Path<String>,
) -> Result<Json<RollbackTargetsResponse>, ApiError> {
    if app_name.is_empty() {
        return Err(bad_request("App name is required"));
    }

    let targets = deploy::rollback_targets(&state.docker, &state.db, &app_name)
        .await
        .map_err(|err| internal_error(&err))?;

    Ok(Json(RollbackTargetsResponse { targets }))
}

pub async fn handle_rollback(
    State(state): State<ApiState>,
    Json(request): Json<RollbackRequest>,
) -> Result<StatusCode, ApiError> {
    if request.target_deployment_id.is_empty() {
        return Err(bad_request("Target deployment ID is required"));
    }
    if request.new_deployment_id.is_empty() {
        return Err(bad_request("New deployment ID is required"));
    }
    request
        .new_target_config
        .validate()
        .map_err(|err| bad_request(format!("Invalid app configuration: {err:#}")))?;

    let logger = DeploymentLogger::deployment(state.broker.clone(), &request.new_deployment_id);

    tokio::spawn(async move {
        let app_name = request.new_target_config.name.clone();
        let work = deploy::rollback_app(
            &state.docker,
            &state.db,
            &request.new_target_config,
            &request.target_deployment_id,
            &request.new_deployment_id,
            &logger,
        );

        match tokio::time::timeout(DEPLOY_TIMEOUT, work).await {
            Ok(Ok(())) => logger.info(format!(
                "Rollback initiated for {app_name} (deployment {})",
                request.new_deployment_id
            )),
            Ok(Err(err)) => logger.deployment_failed(&app_name, "Deployment failed", &err),
            Err(_) => logger.deployment_failed(
                &app_name,
                "Deployment failed",
                &anyhow::anyhow!("rollback timed out"),
            ),
        }
    });

    Ok(StatusCode::ACCEPTED)
}

// ============================================================================
// Status
// ============================================================================

pub async fn handle_app_status(
    State(state): State<ApiState>,
    Path(app_name): Path<String>,
) -> Result<Json<AppStatusResponse>, ApiError> {
    if app_name.is_empty() {
        return Err(bad_request("App name is required"));
    }

    let containers = docker::get_app_containers(&state.docker, true, Some(&app_name))
        .await
        .map_err(|err| internal_error(&err))?;

    if containers.is_empty() {
        return Err((
            StatusCode::NOT_FOUND,
            "No containers found for the specified app".to_string(),
        ));
    }

    let mut summaries = Vec::with_capacity(containers.len());
    for container in &containers {
        let id = container.id.clone().unwrap_or_default();
        let labels_map = container.labels.clone().unwrap_or_default();
        let labels = ContainerLabels::parse(&labels_map).map_err(|err| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!(
                    "failed to parse labels for container {}: {err:#}",
                    safe_id_prefix(&id)
                ),
            )
        })?;
        let container_state = container.state.clone().unwrap_or_default().to_lowercase();
        summaries.push((id, container_state, labels));
    }

    let response =
        aggregate_status(&summaries).map_err(|err| internal_error(&err))?;
    Ok(Json(response))
}

/// Group containers by deployment id and report the latest deployment's
/// aggregate state.
fn aggregate_status(
    containers: &[(String, String, ContainerLabels)],
) -> anyhow::Result<AppStatusResponse> {
    struct DeploymentData {
        container_ids: Vec<String>,
        states: Vec<String>,
        domains: Vec<Domain>,
    }

    let mut by_deployment: HashMap<&str, DeploymentData> = HashMap::new();
    let mut latest_deployment_id = "";

    for (id, state, labels) in containers {
        let data = by_deployment
            .entry(labels.deployment_id.as_str())
            .or_insert_with(|| DeploymentData {
                container_ids: Vec::new(),
                states: Vec::new(),
                domains: Vec::new(),
            });
        data.container_ids.push(id.clone());
        data.states.push(state.clone());
        data.domains.extend(labels.domains.iter().cloned());

        if labels.deployment_id.as_str() > latest_deployment_id {
            latest_deployment_id = labels.deployment_id.as_str();
        }
    }

    if latest_deployment_id.is_empty() {
        anyhow::bail!("no valid containers found");
    }

    let latest = &by_deployment[latest_deployment_id];
    Ok(AppStatusResponse {
        state: determine_overall_state(&latest.states).to_string(),
        deployment_id: latest_deployment_id.to_string(),
        container_ids: latest.container_ids.clone(),
        domains: latest.domains.clone(),
    })
}

/// Collapse a multiset of container states into one by priority:
/// `restarting > paused > running > exited|created > dead`.
fn determine_overall_state(states: &[String]) -> &'static str {
    fn priority(state: &str) -> Option<i32> {
        match state {
            "restarting" => Some(4),
            "paused" => Some(3),
            "running" => Some(2),
            "exited" | "created" => Some(1),
            "dead" => Some(0),
            _ => None,
        }
    }

    let mut highest = -1;
    let mut result = "unknown";
    for state in states {
        if let Some(p) = priority(state) {
            if p > highest {
                highest = p;
                result = match state.as_str() {
                    "restarting" => "restarting",
                    "paused" => "paused",
                    "running" => "running",
                    "exited" => "exited",
                    "created" => "created",
                    "dead" => "dead",
                    _ => unreachable!(),
                };
            }
        }
    }
    result
}

// ============================================================================
// Stop
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StopParams {
    #[serde(rename = "remove-containers", default)]
    pub remove_containers: Option<String>,
}

pub async fn handle_stop_app(
    State(state): State<ApiState>,
    Path(app_name): Path<String>,
    Query(params): Query<StopParams>,
) -> Result<(StatusCode, Json<StopAppResponse>), ApiError> {
    if app_name.is_empty() {
        return Err(bad_request("App name is required"));
    }

    let remove_containers = params.remove_containers.as_deref() == Some("true");
    let logger = DeploymentLogger::general(state.broker.clone());

    tokio::spawn(async move {
        logger.info(format!("Stopping containers for {app_name}"));
        let stopped = match docker::stop_containers(&state.docker, &logger, &app_name, "").await {
            Ok(stopped) => stopped,
            Err(err) => {
                logger.error(format!("Failed to stop containers for {app_name}: {err:#}"));
                return;
            }
        };

        if remove_containers {
            logger.info(format!("Removing containers for {app_name}"));
            match docker::remove_containers(&state.docker, &app_name, "").await {
                Ok(removed) => logger.info(format!(
                    "Successfully removed {} container(s) for {app_name}",
                    removed.len()
                )),
                Err(err) => {
                    logger.error(format!(
                        "Failed to remove containers for {app_name}: {err:#}"
                    ));
                    return;
                }
            }
        }

        logger.info(format!(
            "Successfully stopped {} container(s) for {app_name}",
            stopped.len()
        ));
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(StopAppResponse {
            message: "Stop operation started. Use 'haloy logs' to monitor progress.".to_string(),
        }),
    ))
}

// ============================================================================
// Exec
// ============================================================================

pub async fn handle_exec(
    State(state): State<ApiState>,
    Path(app_name): Path<String>,
    Json(request): Json<ExecRequest>,
) -> Result<Json<ExecResponse>, ApiError> {
    if app_name.is_empty() {
        return Err(bad_request("App name is required"));
    }
    if request.command.is_empty() {
        return Err(bad_request("Command is required"));
    }
    if !request.container_id.is_empty() && request.all_containers {
        return Err(bad_request("Cannot specify both containerId and allContainers"));
    }

    let containers = docker::get_app_containers(&state.docker, false, Some(&app_name))
        .await
        .map_err(|err| internal_error(&err))?;
    if containers.is_empty() {
        return Err((
            StatusCode::NOT_FOUND,
            "No running containers found for the specified app".to_string(),
        ));
    }

    let container_ids: Vec<String> = containers
        .iter()
        .filter_map(|container| container.id.clone())
        .collect();

    let target_ids: Vec<String> = if !request.container_id.is_empty() {
        // Short id prefixes are accepted.
        let matched = container_ids
            .iter()
            .find(|id| *id == &request.container_id || id.starts_with(&request.container_id))
            .cloned();
        match matched {
            Some(id) => vec![id],
            None => {
                return Err((
                    StatusCode::NOT_FOUND,
                    "Specified container not found for this app".to_string(),
                ))
            }
        }
    } else if request.all_containers {
        container_ids
    } else {
        vec![container_ids[0].clone()]
    };

    let command = request.command.clone();
    let fan_out = futures::future::join_all(target_ids.iter().map(|container_id| {
        let docker = state.docker.clone();
        let command = command.clone();
        let container_id = container_id.clone();
        async move {
            let result = docker::exec_in_container(&docker, &container_id, &command).await;
            match result {
                Ok(output) => ExecResult {
                    container_id: safe_id_prefix(&container_id).to_string(),
                    exit_code: output.exit_code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                    error: None,
                },
                Err(err) => ExecResult {
                    container_id: safe_id_prefix(&container_id).to_string(),
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: String::new(),
                    error: Some(format!("{err:#}")),
                },
            }
        }
    }));

    let results = tokio::time::timeout(EXEC_TIMEOUT, fan_out)
        .await
        .map_err(|_| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "command execution timed out".to_string(),
            )
        })?;

    Ok(Json(ExecResponse { results }))
}

#[cfg(test)]
#[path = "handlers_tests.rs"]
mod handlers_tests;
