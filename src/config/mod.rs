// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Deployment descriptor and daemon configuration types.
//!
//! The daemon consumes a single already-normalized descriptor type
//! ([`TargetConfig`]): multi-format client config loading, secret resolution
//! and target extraction happen client-side and never re-enter the core.

mod daemon;
mod image;

pub use daemon::{config_dir, data_dir, ApiSection, CertificatesSection, HaloydConfig};
pub use image::{BuildPush, HistoryStrategy, Image, ImageBuild, ImageHistory, RegistryAuth};

use crate::constants::{DEFAULT_CONTAINER_PORT, DEFAULT_HEALTH_CHECK_PATH, DEFAULT_REPLICAS};
use crate::helpers;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};

/// How a new deployment replaces its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStrategy {
    /// Blue/green: start new containers, health-check, cut over, then stop
    /// the old set.
    #[default]
    Rolling,
    /// Stop the old set first, then start the new one.
    Replace,
}

/// A routable domain: one canonical host plus redirect-only aliases.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Domain {
    #[serde(rename = "domain")]
    pub canonical: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

impl Domain {
    /// Validate the canonical name and every alias.
    ///
    /// # Errors
    ///
    /// Returns the first domain-syntax violation found.
    pub fn validate(&self) -> Result<()> {
        helpers::is_valid_domain(&self.canonical)?;
        for alias in &self.aliases {
            helpers::is_valid_domain(alias).with_context(|| format!("alias '{alias}'"))?;
        }
        Ok(())
    }
}

/// An environment variable passed to app containers. Secrets are resolved
/// client-side; the daemon only ever sees plain values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Container port. Accepted as a string or an integer on the wire,
/// normalized to a string.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Port(pub String);

impl Port {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Port {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for Port {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum StringOrInt {
            String(String),
            Int(i64),
        }

        match StringOrInt::deserialize(deserializer)? {
            StringOrInt::String(s) => Ok(Self(s)),
            StringOrInt::Int(i) => Ok(Self(i.to_string())),
        }
    }
}

/// The deployment descriptor: the contract between clients and the daemon.
///
/// Arrives fully resolved (secrets substituted, defaults merged by the CLI);
/// unknown fields are rejected so a drifting client fails loudly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TargetConfig {
    pub name: String,
    pub image: Image,
    /// Host that runs this application. Used by clients for routing
    /// requests; opaque to the daemon.
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub deployment_strategy: DeploymentStrategy,
    #[serde(default)]
    pub domains: Vec<Domain>,
    #[serde(default)]
    pub acme_email: String,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub health_check_path: String,
    #[serde(default)]
    pub port: Port,
    #[serde(default)]
    pub replicas: Option<u32>,
    /// Host-or-named to container bind expressions.
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Overrides the default virtual network.
    #[serde(default)]
    pub network: String,
    /// Shell hooks run by the client, never by the daemon. Carried so the
    /// descriptor round-trips into rollback records unchanged.
    #[serde(default)]
    pub pre_deploy: Vec<String>,
    #[serde(default)]
    pub post_deploy: Vec<String>,
}

impl TargetConfig {
    /// Effective replica count.
    #[must_use]
    pub fn replicas(&self) -> u32 {
        self.replicas.unwrap_or(DEFAULT_REPLICAS).max(1)
    }

    /// Effective container port.
    #[must_use]
    pub fn port(&self) -> &str {
        if self.port.is_empty() {
            DEFAULT_CONTAINER_PORT
        } else {
            self.port.as_str()
        }
    }

    /// Effective health check path.
    #[must_use]
    pub fn health_check_path(&self) -> &str {
        if self.health_check_path.is_empty() {
            DEFAULT_HEALTH_CHECK_PATH
        } else {
            &self.health_check_path
        }
    }

    /// Validate the descriptor before it reaches the registry.
    ///
    /// # Errors
    ///
    /// Returns the first violation: bad app name, missing image repository,
    /// invalid domain or alias, malformed email, relative health check path,
    /// non-numeric port, zero replicas, or malformed volume binds.
    pub fn validate(&self) -> Result<()> {
        helpers::is_valid_app_name(&self.name).context("invalid app name")?;

        if self.image.repository.is_empty() {
            bail!("image.repository is required");
        }

        for domain in &self.domains {
            domain
                .validate()
                .with_context(|| format!("domain '{}'", domain.canonical))?;
        }

        if !self.acme_email.is_empty() && !helpers::is_valid_email(&self.acme_email) {
            bail!("acmeEmail '{}' is not a valid email", self.acme_email);
        }

        if !self.health_check_path.is_empty() && !self.health_check_path.starts_with('/') {
            bail!(
                "healthCheckPath '{}' must start with '/'",
                self.health_check_path
            );
        }

        if !self.port.is_empty() && self.port.as_str().parse::<u16>().is_err() {
            bail!("port '{}' is not a valid port number", self.port);
        }

        if let Some(replicas) = self.replicas {
            if replicas < 1 {
                bail!("replicas must be at least 1");
            }
        }

        for volume in &self.volumes {
            let Some((host_part, _)) = volume.split_once(':') else {
                bail!("volume '{volume}' must use '<source>:<target>' syntax");
            };
            // Bind paths must be absolute; anything else is treated as a
            // named volume and must be a plain identifier.
            if host_part.contains('/') && !host_part.starts_with('/') {
                bail!("volume bind path '{host_part}' must be absolute");
            }
        }

        Ok(())
    }
}

/// The pre-resolution application config persisted for rollbacks.
///
/// The daemon stores it verbatim and only ever reads the app name and image;
/// loader-side fields (targets, secret providers, hooks) travel through the
/// flattened remainder untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod mod_tests;
