// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Deployment pipeline: image preparation, container launch and history.
//!
//! A deployment ensures the image is present and current, tags it as
//! `<app>:<deploymentID>`, launches the replica set (honoring the
//! deployment strategy) and records history per the image's retention
//! policy. Rollback re-runs the same pipeline with a historical image.

use crate::config::{AppConfig, DeploymentStrategy, HistoryStrategy, TargetConfig};
use crate::constants::DEFAULT_DEPLOYMENTS_TO_KEEP;
use crate::docker;
use crate::labels::LABEL_DEPLOYMENT_ID;
use crate::logging::DeploymentLogger;
use crate::storage::{Db, DeploymentRecord};
use anyhow::{bail, Context, Result};
use bollard::Docker;
use serde::Serialize;

/// A prior deployment a client can roll back to.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackTarget {
    #[serde(rename = "deploymentID")]
    pub deployment_id: String,
    pub image_ref: String,
    /// Whether this deployment is the one currently running.
    pub is_running: bool,
    pub raw_app_config: Option<AppConfig>,
}

/// Run a full deployment for `target`.
///
/// The pre-resolution `raw_app_config` is what gets persisted for
/// rollbacks; the history row is written right after containers start,
/// before any cutover decision, so a later health failure still leaves an
/// auditable record.
///
/// # Errors
///
/// Returns an error when the image cannot be prepared, predecessors cannot
/// be stopped under the `replace` strategy, or containers fail to start.
/// History bookkeeping failures are logged, never fatal.
pub async fn deploy_app(
    docker: &Docker,
    db: &Db,
    deployment_id: &str,
    target: &TargetConfig,
    raw_app_config: &AppConfig,
    rolled_back_from: Option<&str>,
    logger: &DeploymentLogger,
) -> Result<()> {
    let image_ref = target.image.image_ref();

    docker::ensure_image_up_to_date(docker, logger, &target.image).await?;

    let new_image_ref = docker::tag_image(docker, &image_ref, &target.name, deployment_id)
        .await
        .context("failed to tag image")?;

    if target.deployment_strategy == DeploymentStrategy::Replace {
        docker::stop_containers(docker, logger, &target.name, "")
            .await
            .context("failed to stop containers before starting new deployment")?;
    }

    let started = docker::run_container(docker, deployment_id, &new_image_ref, target).await?;

    match started.len() {
        0 => bail!("no containers started, check logs for details"),
        1 => logger.info(format!(
            "Container started successfully (deployment {deployment_id})"
        )),
        n => logger.info(format!(
            "Containers started successfully ({n} replicas, deployment {deployment_id})"
        )),
    }

    handle_image_history(
        docker,
        db,
        raw_app_config,
        deployment_id,
        &new_image_ref,
        rolled_back_from,
        logger,
    )
    .await;

    Ok(())
}

/// Apply the image history policy after a successful launch: persist the
/// record and trim local images according to the strategy. Best-effort.
async fn handle_image_history(
    docker: &Docker,
    db: &Db,
    raw_app_config: &AppConfig,
    deployment_id: &str,
    new_image_ref: &str,
    rolled_back_from: Option<&str>,
    logger: &DeploymentLogger,
) {
    let Some(image) = &raw_app_config.image else {
        logger.debug("No image configuration found, skipping history management");
        return;
    };

    let strategy = image.history_strategy();
    let keep = image
        .history
        .as_ref()
        .and_then(|history| history.count)
        .unwrap_or(DEFAULT_DEPLOYMENTS_TO_KEEP);

    match strategy {
        HistoryStrategy::None => {
            logger.debug("History disabled, skipping cleanup and history storage");
        }
        HistoryStrategy::Local => {
            if let Err(err) = write_history_record(
                db,
                raw_app_config,
                deployment_id,
                new_image_ref,
                rolled_back_from,
                keep,
            )
            .await
            {
                logger.warn(format!("Failed to write app config history: {err:#}"));
            } else {
                logger.debug("App configuration saved to history");
            }

            // Keep N images locally for fast rollback.
            let keep_images = usize::try_from(keep).unwrap_or(0);
            if let Err(err) = docker::remove_images(
                docker,
                &raw_app_config.name,
                deployment_id,
                keep_images,
            )
            .await
            {
                logger.warn(format!("Failed to clean up old images: {err:#}"));
            } else {
                logger.debug(format!(
                    "Old images cleaned up, keeping {keep} recent images locally"
                ));
            }
        }
        HistoryStrategy::Registry => {
            if let Err(err) = write_history_record(
                db,
                raw_app_config,
                deployment_id,
                new_image_ref,
                rolled_back_from,
                keep,
            )
            .await
            {
                logger.warn(format!("Failed to write app config history: {err:#}"));
            } else {
                logger.debug("App configuration saved to history");
            }

            // The registry is the source of truth; keep only the current
            // deployment's image locally.
            if let Err(err) =
                docker::remove_images(docker, &raw_app_config.name, deployment_id, 1).await
            {
                logger.warn(format!("Failed to clean up old images: {err:#}"));
            } else {
                logger.debug("Old images cleaned up, registry strategy keeps only the current image locally");
            }
        }
    }
}

/// Persist one history row and prune the application's history to `keep`
/// records.
async fn write_history_record(
    db: &Db,
    raw_app_config: &AppConfig,
    deployment_id: &str,
    new_image_ref: &str,
    rolled_back_from: Option<&str>,
    keep: i64,
) -> Result<()> {
    let Some(image) = &raw_app_config.image else {
        bail!("image configuration must be set");
    };

    // The record's image points at the tag actually deployed so rollbacks
    // know exactly what to run.
    let mut deployed_image = image.clone();
    if let Some((repository, tag)) = new_image_ref.split_once(':') {
        deployed_image.repository = repository.to_string();
        deployed_image.tag = tag.to_string();
    }

    let record = DeploymentRecord {
        id: deployment_id.to_string(),
        app_name: raw_app_config.name.clone(),
        raw_app_config: serde_json::to_string(raw_app_config)
            .context("failed to convert app config to JSON")?,
        deployed_image: serde_json::to_string(&deployed_image)
            .context("failed to convert deployed image to JSON")?,
        rolled_back_from: rolled_back_from.map(ToString::to_string),
    };

    db.save_deployment(&record).await?;
    db.prune_old_deployments(&raw_app_config.name, keep).await?;
    Ok(())
}

/// Roll an application back to a prior deployment by re-running the
/// pipeline with the historical image under a fresh deployment id.
///
/// # Errors
///
/// Returns an error when no rollback targets exist, the requested target is
/// unknown, or the re-deployment fails.
pub async fn rollback_app(
    docker: &Docker,
    db: &Db,
    target_config: &TargetConfig,
    target_deployment_id: &str,
    new_deployment_id: &str,
    logger: &DeploymentLogger,
) -> Result<()> {
    let app_name = &target_config.name;

    let targets = rollback_targets(docker, db, app_name).await?;
    if targets.is_empty() {
        bail!("there are no images to rollback to for {app_name}");
    }

    let Some(target) = targets
        .iter()
        .find(|target| target.deployment_id == target_deployment_id)
    else {
        bail!("deployment ID '{target_deployment_id}' not found for app '{app_name}'");
    };

    let raw_app_config = target
        .raw_app_config
        .as_ref()
        .with_context(|| format!("no raw app config stored for app {app_name}"))?;

    deploy_app(
        docker,
        db,
        new_deployment_id,
        target_config,
        raw_app_config,
        Some(target_deployment_id),
        logger,
    )
    .await
    .with_context(|| format!("failed to deploy app {app_name}"))
}

/// List prior deployments of `app_name` still backed by a retrievable
/// image under their history strategy, newest first.
///
/// # Errors
///
/// Returns an error when the history query fails. Malformed records are
/// skipped.
pub async fn rollback_targets(
    docker: &Docker,
    db: &Db,
    app_name: &str,
) -> Result<Vec<RollbackTarget>> {
    if app_name.is_empty() {
        bail!("app name cannot be empty");
    }

    let records = db
        .deployment_history(app_name, 50)
        .await
        .context("failed to get deployment history")?;

    let running_deployment_id = running_deployment_id(docker, app_name)
        .await
        .unwrap_or_default();

    let mut targets = Vec::new();
    for record in records {
        let Ok(deployed_image) = record.image() else {
            continue;
        };

        let strategy = deployed_image.history_strategy();
        if strategy == HistoryStrategy::None {
            continue;
        }

        let image_ref = deployed_image.image_ref();
        if !image_available(docker, &image_ref, strategy).await {
            continue;
        }

        let Ok(mut raw_app_config) = record.app_config() else {
            continue;
        };
        // Point the config at the image that actually ran.
        raw_app_config.image = Some(deployed_image);

        targets.push(RollbackTarget {
            is_running: record.id == running_deployment_id,
            deployment_id: record.id,
            image_ref,
            raw_app_config: Some(raw_app_config),
        });
    }

    Ok(targets)
}

/// Whether an image can still be retrieved under its history strategy.
async fn image_available(docker: &Docker, image_ref: &str, strategy: HistoryStrategy) -> bool {
    match strategy {
        HistoryStrategy::Local => docker.inspect_image(image_ref).await.is_ok(),
        HistoryStrategy::Registry => true,
        HistoryStrategy::None => false,
    }
}

/// Highest deployment id among the app's running containers.
async fn running_deployment_id(docker: &Docker, app_name: &str) -> Result<String> {
    let containers = docker::get_app_containers(docker, false, Some(app_name)).await?;

    let max_id = containers
        .iter()
        .filter_map(|summary| summary.labels.as_ref())
        .filter_map(|labels| labels.get(LABEL_DEPLOYMENT_ID))
        .filter(|id| !id.is_empty())
        .max()
        .cloned();

    max_id.with_context(|| format!("no deployment IDs found in running containers for app {app_name}"))
}
