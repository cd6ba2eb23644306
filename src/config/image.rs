// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Image reference, registry authentication and history policy types.

use serde::{Deserialize, Serialize};

/// How rollback images are retained for an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStrategy {
    /// Keep the last N images on the host.
    #[default]
    Local,
    /// Trust the remote registry; requires immutable tags.
    Registry,
    /// No rollback support.
    None,
}

/// Retention policy for deployment history.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImageHistory {
    #[serde(default)]
    pub strategy: HistoryStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// Registry credentials, resolved client-side.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RegistryAuth {
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Where a client-built image was pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildPush {
    /// Uploaded straight to the daemon host; the image must already be
    /// present locally and is never pulled.
    Server,
    /// Pushed to a registry and pulled like any other image.
    Registry,
}

/// Client-side build settings. The daemon never builds; it only needs to
/// know whether the image was uploaded to the host.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageBuild {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<BuildPush>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

/// A deployable image: repository, tag, retention policy and credentials.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Image {
    pub repository: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<ImageHistory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_auth: Option<RegistryAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<ImageBuild>,
}

impl Image {
    /// Full image reference (`repository:tag`, tag defaulting to `latest`).
    #[must_use]
    pub fn image_ref(&self) -> String {
        if self.tag.is_empty() {
            format!("{}:latest", self.repository)
        } else {
            format!("{}:{}", self.repository, self.tag)
        }
    }

    /// Effective history strategy.
    #[must_use]
    pub fn history_strategy(&self) -> HistoryStrategy {
        self.history.as_ref().map_or_else(Default::default, |h| h.strategy)
    }

    /// Registry server for this image: explicit auth server, else the host
    /// part of the repository when it looks like one, else Docker Hub.
    #[must_use]
    pub fn registry_server(&self) -> String {
        if let Some(auth) = &self.registry_auth {
            if !auth.server.is_empty() {
                return auth.server.clone();
            }
        }

        if let Some((host, _)) = self.repository.split_once('/') {
            if host.contains('.') || host.contains(':') {
                return host.to_string();
            }
        }

        "index.docker.io".to_string()
    }

    /// Whether this image was uploaded to the host rather than pushed to a
    /// registry.
    #[must_use]
    pub fn uploaded_to_host(&self) -> bool {
        self.build
            .as_ref()
            .is_some_and(|b| b.push == Some(BuildPush::Server))
    }
}

#[cfg(test)]
#[path = "image_tests.rs"]
mod image_tests;
