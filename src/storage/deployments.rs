// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Deployment record model and queries.

use super::Db;
use crate::config::{AppConfig, Image};
use anyhow::{anyhow, Context, Result};
use sqlx::FromRow;

/// One persisted deployment: enough to reconstruct a rollback.
#[derive(Debug, Clone, FromRow)]
pub struct DeploymentRecord {
    /// The deployment id (universally-sortable, so `ORDER BY id` is
    /// chronological).
    pub id: String,
    pub app_name: String,
    /// The pre-resolution descriptor as JSON.
    pub raw_app_config: String,
    /// The resolved image actually deployed, as JSON.
    pub deployed_image: String,
    /// Prior record this deployment was rolled back from, when applicable.
    pub rolled_back_from: Option<String>,
}

impl DeploymentRecord {
    /// Parse the persisted pre-resolution descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error when the stored JSON does not decode.
    pub fn app_config(&self) -> Result<AppConfig> {
        serde_json::from_str(&self.raw_app_config).context("failed to parse raw app config")
    }

    /// Parse the persisted deployed image.
    ///
    /// # Errors
    ///
    /// Returns an error when the stored JSON does not decode.
    pub fn image(&self) -> Result<Image> {
        serde_json::from_str(&self.deployed_image).context("failed to parse deployed image")
    }

    /// Image reference the deployment ran with.
    ///
    /// # Errors
    ///
    /// Returns an error when the stored image JSON does not decode.
    pub fn image_ref(&self) -> Result<String> {
        Ok(self.image()?.image_ref())
    }
}

impl Db {
    /// Insert a deployment record.
    ///
    /// # Errors
    ///
    /// Returns an error when the insert fails (including duplicate ids).
    pub async fn save_deployment(&self, record: &DeploymentRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO deployments (id, app_name, raw_app_config, deployed_image, rolled_back_from)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.app_name)
        .bind(&record.raw_app_config)
        .bind(&record.deployed_image)
        .bind(&record.rolled_back_from)
        .execute(self.pool())
        .await
        .context("failed to save deployment to database")?;
        Ok(())
    }

    /// Fetch one deployment record by id.
    ///
    /// # Errors
    ///
    /// Returns an error when the record does not exist or the query fails.
    pub async fn get_deployment(&self, deployment_id: &str) -> Result<DeploymentRecord> {
        sqlx::query_as::<_, DeploymentRecord>(
            "SELECT id, app_name, raw_app_config, deployed_image, rolled_back_from
             FROM deployments WHERE id = ?",
        )
        .bind(deployment_id)
        .fetch_optional(self.pool())
        .await
        .context("failed to get deployment")?
        .ok_or_else(|| anyhow!("deployment '{deployment_id}' not found"))
    }

    /// Fetch up to `limit` records for an application, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn deployment_history(
        &self,
        app_name: &str,
        limit: i64,
    ) -> Result<Vec<DeploymentRecord>> {
        sqlx::query_as::<_, DeploymentRecord>(
            "SELECT id, app_name, raw_app_config, deployed_image, rolled_back_from
             FROM deployments
             WHERE app_name = ?
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(app_name)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .context("failed to query deployment history")
    }

    /// Keep the `keep` newest records for an application and delete the
    /// rest. Returns the number of rows pruned.
    ///
    /// # Errors
    ///
    /// Returns an error when the delete fails.
    pub async fn prune_old_deployments(&self, app_name: &str, keep: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM deployments
             WHERE app_name = ?
             AND id NOT IN (
                 SELECT id FROM deployments
                 WHERE app_name = ?
                 ORDER BY id DESC
                 LIMIT ?
             )",
        )
        .bind(app_name)
        .bind(app_name)
        .bind(keep)
        .execute(self.pool())
        .await
        .context("failed to prune old deployments")?;

        let pruned = result.rows_affected();
        if pruned > 0 {
            tracing::info!(app = app_name, count = pruned, "Pruned old deployment records");
        }
        Ok(pruned)
    }
}
