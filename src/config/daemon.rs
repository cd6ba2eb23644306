// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Daemon configuration file and directory resolution.
//!
//! The daemon reads an optional `haloyd.{yaml,json,toml}` from the config
//! directory. Paths honor the `HALOY_DATA_DIR` / `HALOY_CONFIG_DIR`
//! overrides; without an override the system paths are used unless
//! `HALOY_SYSTEM_INSTALL=false` selects the per-user layout.

use crate::constants::{
    ENV_VAR_CONFIG_DIR, ENV_VAR_DATA_DIR, ENV_VAR_SYSTEM_INSTALL, HALOYD_CONFIG_FILE_STEM,
    SYSTEM_CONFIG_DIR, SYSTEM_DATA_DIR, USER_CONFIG_DIR_SUFFIX, USER_DATA_DIR_SUFFIX,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// `api` section of the daemon config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiSection {
    /// Domain the daemon's own API is served on through the proxy.
    #[serde(default)]
    pub domain: String,
}

/// `certificates` section of the daemon config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificatesSection {
    /// Fallback ACME contact email for apps that configure domains without
    /// their own.
    #[serde(default)]
    pub acme_email: String,
}

/// Daemon-level configuration loaded at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HaloydConfig {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub certificates: CertificatesSection,
}

impl HaloydConfig {
    /// Load the daemon config from `dir`, trying the `yaml`, `json` and
    /// `toml` extensions in that order. A missing file yields the default
    /// (empty) configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when a config file exists but cannot be read or
    /// parsed.
    pub fn load(dir: &Path) -> Result<Self> {
        for ext in ["yaml", "yml", "json", "toml"] {
            let path = dir.join(format!("{HALOYD_CONFIG_FILE_STEM}.{ext}"));
            if !path.exists() {
                continue;
            }
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            let config = match ext {
                "yaml" | "yml" => serde_yaml::from_str(&raw)
                    .with_context(|| format!("invalid YAML in {}", path.display()))?,
                "json" => serde_json::from_str(&raw)
                    .with_context(|| format!("invalid JSON in {}", path.display()))?,
                _ => toml::from_str(&raw)
                    .with_context(|| format!("invalid TOML in {}", path.display()))?,
            };
            return Ok(config);
        }
        Ok(Self::default())
    }
}

fn system_install() -> bool {
    std::env::var(ENV_VAR_SYSTEM_INSTALL).map_or(true, |v| v != "false" && v != "0")
}

fn home_dir() -> Result<PathBuf> {
    std::env::var("HOME")
        .map(PathBuf::from)
        .context("HOME environment variable not set")
}

/// Resolve the data directory (database, certificates, proxy config).
///
/// # Errors
///
/// Returns an error when the per-user layout is selected and `HOME` is
/// unset.
pub fn data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_VAR_DATA_DIR) {
        return Ok(PathBuf::from(dir));
    }
    if system_install() {
        Ok(PathBuf::from(SYSTEM_DATA_DIR))
    } else {
        Ok(home_dir()?.join(USER_DATA_DIR_SUFFIX))
    }
}

/// Resolve the config directory (daemon config file, .env).
///
/// # Errors
///
/// Returns an error when the per-user layout is selected and `HOME` is
/// unset.
pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_VAR_CONFIG_DIR) {
        return Ok(PathBuf::from(dir));
    }
    if system_install() {
        Ok(PathBuf::from(SYSTEM_CONFIG_DIR))
    } else {
        Ok(home_dir()?.join(USER_CONFIG_DIR_SUFFIX))
    }
}

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod daemon_tests;
