// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Structured log records and the deployment-aware logger.
//!
//! Everything a component logs during a deployment flows two ways: to the
//! console through `tracing`, and to the [`LogBroker`] as a structured
//! [`LogEntry`] so API clients can follow along over SSE. Terminal signals
//! (deployment complete/failed, init complete) are encoded on the record
//! itself; SSE handlers use them to close streams.

mod broker;

pub use broker::LogBroker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    #[serde(rename = "DEBUG")]
    Debug,
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "WARN")]
    Warn,
    #[serde(rename = "ERROR")]
    Error,
}

/// A structured log record as streamed to API clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "deploymentID", default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub fields: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_deployment_complete: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_deployment_failed: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_deployment_success: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_haloyd_init_complete: bool,
}

impl LogEntry {
    /// A plain record with the given level and message.
    #[must_use]
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
            deployment_id: None,
            app_name: None,
            domains: Vec::new(),
            fields: serde_json::Map::new(),
            is_deployment_complete: false,
            is_deployment_failed: false,
            is_deployment_success: false,
            is_haloyd_init_complete: false,
        }
    }
}

/// Logger handle carried through a deployment.
///
/// Mirrors every record to the console via `tracing` and publishes it on
/// the broker. A general variant (no deployment id) is used outside
/// deployment flows.
#[derive(Clone)]
pub struct DeploymentLogger {
    broker: LogBroker,
    deployment_id: Option<String>,
}

impl DeploymentLogger {
    /// Logger without a deployment id; records only reach the general
    /// stream.
    #[must_use]
    pub fn general(broker: LogBroker) -> Self {
        Self {
            broker,
            deployment_id: None,
        }
    }

    /// Logger whose records also reach the per-deployment stream for
    /// `deployment_id`.
    #[must_use]
    pub fn deployment(broker: LogBroker, deployment_id: impl Into<String>) -> Self {
        Self {
            broker,
            deployment_id: Some(deployment_id.into()),
        }
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.publish(LogLevel::Debug, message.into(), serde_json::Map::new());
    }

    pub fn info(&self, message: impl Into<String>) {
        self.publish(LogLevel::Info, message.into(), serde_json::Map::new());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.publish(LogLevel::Warn, message.into(), serde_json::Map::new());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.publish(LogLevel::Error, message.into(), serde_json::Map::new());
    }

    /// Mark a deployment as successfully completed. This is the signal that
    /// tells streaming clients to stop.
    pub fn deployment_complete(
        &self,
        app_name: &str,
        domains: &[String],
        message: impl Into<String>,
    ) {
        let mut entry = self.entry(LogLevel::Info, message.into(), serde_json::Map::new());
        entry.app_name = Some(app_name.to_string());
        entry.domains = domains.to_vec();
        entry.is_deployment_complete = true;
        entry.is_deployment_success = true;
        self.emit(entry);
    }

    /// Mark a deployment as failed. Also ends the stream.
    pub fn deployment_failed(&self, app_name: &str, message: impl Into<String>, error: &anyhow::Error) {
        let mut fields = serde_json::Map::new();
        fields.insert(
            "error".to_string(),
            serde_json::Value::String(format!("{error:#}")),
        );
        let mut entry = self.entry(LogLevel::Error, message.into(), fields);
        entry.app_name = Some(app_name.to_string());
        entry.is_deployment_complete = true;
        entry.is_deployment_failed = true;
        self.emit(entry);
    }

    /// Signal that daemon initialization finished, consumed by setup
    /// tooling streaming the general log.
    pub fn init_complete(&self, message: impl Into<String>) {
        let mut entry = self.entry(LogLevel::Info, message.into(), serde_json::Map::new());
        entry.is_haloyd_init_complete = true;
        self.emit(entry);
    }

    fn publish(
        &self,
        level: LogLevel,
        message: String,
        fields: serde_json::Map<String, serde_json::Value>,
    ) {
        let entry = self.entry(level, message, fields);
        self.emit(entry);
    }

    fn entry(
        &self,
        level: LogLevel,
        message: String,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> LogEntry {
        let mut entry = LogEntry::new(level, message);
        entry.deployment_id = self.deployment_id.clone();
        entry.fields = fields;
        entry
    }

    fn emit(&self, entry: LogEntry) {
        let deployment_id = entry.deployment_id.as_deref().unwrap_or_default();
        match entry.level {
            LogLevel::Debug => {
                tracing::debug!(deployment_id = %deployment_id, "{}", entry.message);
            }
            LogLevel::Info => {
                tracing::info!(deployment_id = %deployment_id, "{}", entry.message);
            }
            LogLevel::Warn => {
                tracing::warn!(deployment_id = %deployment_id, "{}", entry.message);
            }
            LogLevel::Error => {
                tracing::error!(deployment_id = %deployment_id, "{}", entry.message);
            }
        }
        self.broker.publish(entry);
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod mod_tests;
