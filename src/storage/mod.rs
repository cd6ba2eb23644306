// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Embedded relational store for deployment records.
//!
//! SQLite via sqlx: WAL journal, foreign keys on, 5 s busy timeout. The
//! schema is applied on startup; the only table is `deployments`, the
//! per-application history that rollbacks reconstruct prior state from.

mod deployments;

pub use deployments::DeploymentRecord;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;

/// Handle to the deployment database. Cheap to clone.
#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Open (creating if missing) the database at `path` and apply the
    /// schema.
    ///
    /// # Errors
    ///
    /// Returns an error when the parent directory cannot be created, the
    /// database cannot be opened, or migration fails.
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(5000))
            .pragma("cache_size", "10000");

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to connect to database")?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error when a DDL statement fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r"
CREATE TABLE IF NOT EXISTS deployments (
    id TEXT PRIMARY KEY,
    app_name TEXT NOT NULL,
    raw_app_config JSON NOT NULL,
    deployed_image JSON NOT NULL,
    rolled_back_from TEXT REFERENCES deployments(id)
);
",
        )
        .execute(&self.pool)
        .await
        .context("failed to create deployments table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_deployments_app_name ON deployments(app_name);",
        )
        .execute(&self.pool)
        .await
        .context("failed to create deployments index")?;

        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool, flushing WAL state.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod mod_tests;
