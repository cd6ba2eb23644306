// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Container lifecycle operations: run, stop, remove, health check, exec.

use crate::config::TargetConfig;
use crate::constants::{DOCKER_NETWORK, ENV_VAR_REPLICA_ID};
use crate::helpers::safe_id_prefix;
use crate::labels::{ContainerLabels, APP_LABEL_ROLE, LABEL_APP_NAME, LABEL_DEPLOYMENT_ID, LABEL_ROLE};
use crate::logging::DeploymentLogger;
use anyhow::{anyhow, bail, Context, Result};
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerInspectResponse, ContainerSummary, HostConfig, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Graceful stop deadline per container before escalating to SIGKILL.
const STOP_GRACE_SECS: i64 = 20;

/// Overall deadline for a stop sweep.
const STOP_SWEEP_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Containers stopped concurrently at most when a sweep exceeds the
/// sequential threshold.
const STOP_CONCURRENCY: usize = 3;

/// One container created and started for a deployment.
#[derive(Debug, Clone)]
pub struct ContainerRunResult {
    pub id: String,
    pub deployment_id: String,
    pub replica_id: u32,
}

/// Captured output of a command executed inside a container.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

/// List containers carrying the app role label.
///
/// When `list_all` is false only running containers are returned. An
/// `app_name` narrows the listing to that application.
///
/// # Errors
///
/// Returns an error when the Docker API call fails.
pub async fn get_app_containers(
    docker: &Docker,
    list_all: bool,
    app_name: Option<&str>,
) -> Result<Vec<ContainerSummary>> {
    let mut label_filters = vec![format!("{LABEL_ROLE}={APP_LABEL_ROLE}")];
    if let Some(app) = app_name {
        label_filters.push(format!("{LABEL_APP_NAME}={app}"));
    }

    let options = ListContainersOptions {
        all: list_all,
        filters: HashMap::from([("label".to_string(), label_filters)]),
        ..Default::default()
    };

    docker
        .list_containers(Some(options))
        .await
        .with_context(|| match app_name {
            Some(app) => format!("failed to list containers for app {app}"),
            None => "failed to list containers".to_string(),
        })
}

/// Create and start `replicas` containers for a deployment.
///
/// Containers are named `<app>-haloy-<deploymentID>[-replica-<i>]`, attached
/// to the configured network with `restart=unless-stopped`, labelled with
/// the encoded descriptor, and given a replica index env var. On any
/// failure, containers created so far are force-removed before the error
/// propagates.
///
/// # Errors
///
/// Returns an error when the image platform does not match the host or any
/// create/start call fails.
pub async fn run_container(
    docker: &Docker,
    deployment_id: &str,
    image_ref: &str,
    target: &TargetConfig,
) -> Result<Vec<ContainerRunResult>> {
    super::image::check_image_platform(docker, image_ref).await?;

    let labels = ContainerLabels {
        app_name: target.name.clone(),
        deployment_id: deployment_id.to_string(),
        acme_email: target.acme_email.clone(),
        port: target.port().to_string(),
        health_check_path: target.health_check_path().to_string(),
        domains: target.domains.clone(),
        role: APP_LABEL_ROLE.to_string(),
    }
    .to_labels();

    let base_env: Vec<String> = target
        .env
        .iter()
        .map(|var| format!("{}={}", var.name, var.value))
        .collect();

    let network = if target.network.is_empty() {
        DOCKER_NETWORK.to_string()
    } else {
        target.network.clone()
    };

    let host_config = HostConfig {
        network_mode: Some(network),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
            ..Default::default()
        }),
        binds: if target.volumes.is_empty() {
            None
        } else {
            Some(target.volumes.clone())
        },
        ..Default::default()
    };

    let replicas = target.replicas();
    let mut results: Vec<ContainerRunResult> = Vec::with_capacity(replicas as usize);

    for i in 1..=replicas {
        let mut env = base_env.clone();
        env.push(format!("{ENV_VAR_REPLICA_ID}={i}"));

        let mut container_name = format!("{}-haloy-{deployment_id}", target.name);
        if replicas > 1 {
            container_name.push_str(&format!("-replica-{i}"));
        }

        let config = Config {
            image: Some(image_ref.to_string()),
            labels: Some(labels.clone()),
            env: Some(env),
            host_config: Some(host_config.clone()),
            ..Default::default()
        };

        let created = match docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name,
                    platform: None,
                }),
                config,
            )
            .await
        {
            Ok(response) => response,
            Err(err) => {
                rollback_created(docker, &results).await;
                return Err(err).context("failed to create container");
            }
        };

        if let Err(err) = docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            let mut to_remove = results.clone();
            to_remove.push(ContainerRunResult {
                id: created.id.clone(),
                deployment_id: deployment_id.to_string(),
                replica_id: i,
            });
            rollback_created(docker, &to_remove).await;
            return Err(err).context("failed to start container");
        }

        results.push(ContainerRunResult {
            id: created.id,
            deployment_id: deployment_id.to_string(),
            replica_id: i,
        });
    }

    Ok(results)
}

/// Best-effort removal of containers created before a failed run.
async fn rollback_created(docker: &Docker, created: &[ContainerRunResult]) {
    for container in created {
        if let Err(err) = docker
            .remove_container(
                &container.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            tracing::error!(
                container_id = safe_id_prefix(&container.id),
                error = %err,
                "Failed to clean up container after error"
            );
        }
    }
}

/// Stop containers for `app_name` whose deployment id differs from
/// `ignore_deployment_id` (pass an empty string to stop everything).
///
/// Sweeps of three or fewer containers run sequentially; larger sweeps run
/// concurrently with a fan-out of at most three. Each container gets a 20 s
/// graceful deadline before a SIGKILL. Returns the ids actually stopped.
///
/// # Errors
///
/// Returns an error when listing fails, when any container resisted both
/// stop and kill, or when the sweep deadline expires.
pub async fn stop_containers(
    docker: &Docker,
    logger: &DeploymentLogger,
    app_name: &str,
    ignore_deployment_id: &str,
) -> Result<Vec<String>> {
    let containers = get_app_containers(docker, true, Some(app_name)).await?;

    let to_stop: Vec<ContainerSummary> = containers
        .into_iter()
        .filter(|summary| {
            let deployment_id = summary
                .labels
                .as_ref()
                .and_then(|labels| labels.get(LABEL_DEPLOYMENT_ID))
                .map(String::as_str)
                .unwrap_or_default();
            deployment_id != ignore_deployment_id
        })
        .collect();

    if to_stop.is_empty() {
        return Ok(Vec::new());
    }

    let sweep = async {
        if to_stop.len() <= STOP_CONCURRENCY {
            stop_sequential(docker, &to_stop).await
        } else {
            logger.info(format!(
                "Stopping {} containers. This might take a moment...",
                to_stop.len()
            ));
            stop_concurrent(docker, &to_stop).await
        }
    };

    tokio::time::timeout(STOP_SWEEP_TIMEOUT, sweep)
        .await
        .map_err(|_| anyhow!("timed out stopping containers for app {app_name}"))?
}

async fn stop_sequential(
    docker: &Docker,
    containers: &[ContainerSummary],
) -> Result<Vec<String>> {
    let mut stopped = Vec::new();
    let mut failures = 0usize;

    for summary in containers {
        let Some(id) = summary.id.as_deref() else {
            continue;
        };
        if stop_single_container(docker, id).await.is_ok() {
            stopped.push(id.to_string());
        } else {
            failures += 1;
        }
    }

    if failures > 0 {
        bail!(
            "failed to stop {failures} out of {} containers",
            containers.len()
        );
    }
    Ok(stopped)
}

async fn stop_concurrent(
    docker: &Docker,
    containers: &[ContainerSummary],
) -> Result<Vec<String>> {
    let semaphore = Arc::new(Semaphore::new(STOP_CONCURRENCY));
    let mut handles = Vec::new();

    for summary in containers {
        let Some(id) = summary.id.clone() else {
            continue;
        };
        let docker = docker.clone();
        let semaphore = Arc::clone(&semaphore);
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await;
            let result = stop_single_container(&docker, &id).await;
            (id, result)
        }));
    }

    let mut stopped = Vec::new();
    let mut failures = 0usize;
    for handle in handles {
        match handle.await {
            Ok((id, Ok(()))) => stopped.push(id),
            Ok((_, Err(_))) | Err(_) => failures += 1,
        }
    }

    if failures > 0 {
        bail!(
            "failed to stop {failures} out of {} containers",
            containers.len()
        );
    }
    Ok(stopped)
}

/// Gracefully stop one container, escalating to SIGKILL on failure.
async fn stop_single_container(docker: &Docker, container_id: &str) -> Result<()> {
    let stop_result = docker
        .stop_container(
            container_id,
            Some(StopContainerOptions { t: STOP_GRACE_SECS }),
        )
        .await;

    let Err(stop_err) = stop_result else {
        return Ok(());
    };

    tracing::warn!(
        container_id = safe_id_prefix(container_id),
        error = %stop_err,
        "Graceful stop failed, attempting force kill"
    );

    docker
        .kill_container(container_id, Some(KillContainerOptions { signal: "SIGKILL" }))
        .await
        .map_err(|kill_err| {
            anyhow!("both stop and kill failed - stop: {stop_err}, kill: {kill_err}")
        })
}

/// Force-remove containers for `app_name`, skipping `ignore_deployment_id`.
/// Removal errors are logged, not fatal. Returns the ids removed.
///
/// # Errors
///
/// Returns an error only when listing containers fails.
pub async fn remove_containers(
    docker: &Docker,
    app_name: &str,
    ignore_deployment_id: &str,
) -> Result<Vec<String>> {
    let containers = get_app_containers(docker, true, Some(app_name)).await?;

    let mut removed = Vec::new();
    for summary in containers {
        let Some(id) = summary.id.as_deref() else {
            continue;
        };
        let deployment_id = summary
            .labels
            .as_ref()
            .and_then(|labels| labels.get(LABEL_DEPLOYMENT_ID))
            .map(String::as_str)
            .unwrap_or_default();
        if deployment_id == ignore_deployment_id {
            continue;
        }

        match docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => removed.push(id.to_string()),
            Err(err) => {
                tracing::error!(
                    container_id = safe_id_prefix(id),
                    error = %err,
                    "Error removing container"
                );
            }
        }
    }

    Ok(removed)
}

/// Health-gate a single container.
///
/// Waits for the runtime state to become `running` (500 ms poll, 30 s
/// deadline), applies an optional initial delay, then consults the Docker
/// healthcheck substate when the image declares one (polling through
/// `starting` with a 30 s deadline). Without a declared healthcheck, falls
/// back to probing `GET http://<ip>:<port><path>` with a 5 s timeout and up
/// to five attempts under exponential backoff starting at 500 ms; any 2xx
/// passes.
///
/// # Errors
///
/// Returns an error describing the failed stage: never-running, unhealthy
/// (with the last healthcheck log line when present), or probe exhaustion.
pub async fn health_check_container(
    docker: &Docker,
    logger: &DeploymentLogger,
    container_id: &str,
    initial_wait: Option<Duration>,
) -> Result<()> {
    let inspect = wait_until_running(docker, container_id).await?;

    if let Some(wait) = initial_wait {
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    let health_status = inspect
        .state
        .as_ref()
        .and_then(|state| state.health.as_ref())
        .and_then(|health| health.status);

    use bollard::models::HealthStatusEnum;
    match health_status {
        Some(HealthStatusEnum::HEALTHY) => return Ok(()),
        Some(HealthStatusEnum::STARTING) => {
            let settled = wait_for_healthcheck(docker, container_id).await?;
            match settled {
                HealthStatusEnum::HEALTHY => {
                    tracing::debug!(
                        container_id = safe_id_prefix(container_id),
                        "Container is healthy according to Docker healthcheck"
                    );
                    return Ok(());
                }
                HealthStatusEnum::UNHEALTHY => {
                    return Err(unhealthy_error(docker, container_id).await);
                }
                other => bail!(
                    "container {} health status unknown: {other:?}",
                    safe_id_prefix(container_id)
                ),
            }
        }
        Some(HealthStatusEnum::UNHEALTHY) => {
            return Err(unhealthy_error(docker, container_id).await);
        }
        Some(HealthStatusEnum::NONE) | Some(HealthStatusEnum::EMPTY) | None => {}
    }

    // No declared healthcheck: probe over HTTP using the labelled port and
    // path.
    let labels_map = inspect
        .config
        .as_ref()
        .and_then(|config| config.labels.clone())
        .unwrap_or_default();
    let labels =
        ContainerLabels::parse(&labels_map).context("failed to parse container labels")?;

    let target_ip = container_network_ip(&inspect, DOCKER_NETWORK)
        .context("failed to get container IP address")?;

    let url = format!(
        "http://{target_ip}:{}{}",
        labels.port, labels.health_check_path
    );

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("failed to build health check HTTP client")?;

    let max_retries = 5;
    let mut backoff = Duration::from_millis(500);

    for attempt in 0..max_retries {
        if attempt > 0 {
            logger.info(format!(
                "Retrying health check... (attempt {}/{max_retries})",
                attempt + 1
            ));
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }

        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => return Ok(()),
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let body = body.chars().take(1024).collect::<String>();
                logger.warn(format!(
                    "Health check returned error status {status}: {body}"
                ));
            }
            Err(err) => {
                logger.warn(format!("Health check attempt failed: {err}"));
            }
        }
    }

    bail!(
        "container {} failed health check after {max_retries} attempts",
        safe_id_prefix(container_id)
    )
}

/// Poll until the container reports `running`, 30 s deadline.
async fn wait_until_running(
    docker: &Docker,
    container_id: &str,
) -> Result<ContainerInspectResponse> {
    let deadline = async {
        loop {
            let inspect = docker
                .inspect_container(container_id, None)
                .await
                .with_context(|| {
                    format!(
                        "failed to inspect container {}",
                        safe_id_prefix(container_id)
                    )
                })?;

            if inspect
                .state
                .as_ref()
                .and_then(|state| state.running)
                .unwrap_or(false)
            {
                return Ok::<_, anyhow::Error>(inspect);
            }

            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    };

    tokio::time::timeout(Duration::from_secs(30), deadline)
        .await
        .map_err(|_| {
            anyhow!(
                "timed out waiting for container {} to start",
                safe_id_prefix(container_id)
            )
        })?
}

/// Poll a `starting` healthcheck until it settles, 30 s deadline.
async fn wait_for_healthcheck(
    docker: &Docker,
    container_id: &str,
) -> Result<bollard::models::HealthStatusEnum> {
    use bollard::models::HealthStatusEnum;

    let poll = async {
        loop {
            let inspect = docker
                .inspect_container(container_id, None)
                .await
                .context("failed to re-inspect container")?;

            let status = inspect
                .state
                .as_ref()
                .and_then(|state| state.health.as_ref())
                .and_then(|health| health.status)
                .unwrap_or(HealthStatusEnum::NONE);

            if status != HealthStatusEnum::STARTING {
                return Ok::<_, anyhow::Error>(status);
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    };

    tokio::time::timeout(Duration::from_secs(30), poll)
        .await
        .map_err(|_| anyhow!("timed out waiting for container health check to complete"))?
}

/// Build the error for an unhealthy container, quoting the last healthcheck
/// log line when the runtime kept one.
async fn unhealthy_error(docker: &Docker, container_id: &str) -> anyhow::Error {
    let last_output = match docker.inspect_container(container_id, None).await {
        Ok(inspect) => inspect
            .state
            .and_then(|state| state.health)
            .and_then(|health| health.log)
            .and_then(|log| log.into_iter().last())
            .and_then(|entry| entry.output),
        Err(_) => None,
    };

    match last_output {
        Some(output) if !output.is_empty() => anyhow!(
            "container {} is unhealthy: {output}",
            safe_id_prefix(container_id)
        ),
        _ => anyhow!(
            "container {} is unhealthy according to Docker healthcheck",
            safe_id_prefix(container_id)
        ),
    }
}

/// Execute a command inside a running container, demultiplexing stdout and
/// stderr and collecting the exit code.
///
/// # Errors
///
/// Returns an error when exec creation, attachment or inspection fails.
pub async fn exec_in_container(
    docker: &Docker,
    container_id: &str,
    cmd: &[String],
) -> Result<ExecOutput> {
    let exec = docker
        .create_exec(
            container_id,
            CreateExecOptions {
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                cmd: Some(cmd.to_vec()),
                ..Default::default()
            },
        )
        .await
        .context("failed to create exec")?;

    let mut stdout = String::new();
    let mut stderr = String::new();

    match docker
        .start_exec(&exec.id, None)
        .await
        .context("failed to attach to exec")?
    {
        StartExecResults::Attached { mut output, .. } => {
            while let Some(chunk) = output.next().await {
                match chunk.context("failed to read exec output")? {
                    bollard::container::LogOutput::StdOut { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    bollard::container::LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }
        StartExecResults::Detached => {}
    }

    let inspect = docker
        .inspect_exec(&exec.id)
        .await
        .context("failed to inspect exec")?;

    Ok(ExecOutput {
        stdout,
        stderr,
        exit_code: inspect.exit_code.unwrap_or(1),
    })
}

/// Extract the container's IPv4 address on `network_name`.
///
/// # Errors
///
/// Returns an error when the container is not running, is not attached to
/// the network, or has no address on it.
pub fn container_network_ip(
    inspect: &ContainerInspectResponse,
    network_name: &str,
) -> Result<String> {
    let state = inspect
        .state
        .as_ref()
        .context("container state is missing")?;

    if !state.running.unwrap_or(false) {
        let status = state
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        bail!(
            "container is not running (status: {status}, exit code: {})",
            state.exit_code.unwrap_or(0)
        );
    }

    let networks = inspect
        .network_settings
        .as_ref()
        .and_then(|settings| settings.networks.as_ref())
        .context("container has no network settings")?;

    let Some(endpoint) = networks.get(network_name) else {
        let available: Vec<&String> = networks.keys().collect();
        bail!(
            "container not connected to network '{network_name}'. Container is using: {available:?}"
        );
    };

    match endpoint.ip_address.as_deref() {
        Some(ip) if !ip.is_empty() => Ok(ip.to_string()),
        _ => bail!("container has no IP address on network '{network_name}'"),
    }
}
