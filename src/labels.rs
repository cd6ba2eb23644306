// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Container label codec used for deployment discovery.
//!
//! Every container the daemon launches carries a label set encoding the
//! deployment descriptor. The labels are the persisted index: the registry
//! rebuilds its entire view of the world from them, so the mapping must
//! round-trip exactly (`parse(encode(d)) == d`).
//!
//! Domain order is preserved through integer-indexed keys:
//! `dev.haloy.domain.<i>` holds the canonical name and
//! `dev.haloy.domain.<i>.alias.<j>` each alias. Keys that do not conform are
//! ignored during parsing.

use crate::config::Domain;
use crate::constants::{DEFAULT_CONTAINER_PORT, DEFAULT_HEALTH_CHECK_PATH};
use crate::helpers;
use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, HashMap};

// ============================================================================
// Label keys
// ============================================================================

pub const LABEL_APP_NAME: &str = "dev.haloy.appName";
pub const LABEL_DEPLOYMENT_ID: &str = "dev.haloy.deployment-id";
pub const LABEL_HEALTH_CHECK_PATH: &str = "dev.haloy.health-check-path";
pub const LABEL_ACME_EMAIL: &str = "dev.haloy.acme.email";
pub const LABEL_PORT: &str = "dev.haloy.port";

/// Identifies the role of a container ("app", "haproxy" or "haloyd").
pub const LABEL_ROLE: &str = "dev.haloy.role";

/// Prefix shared by all indexed domain keys.
const LABEL_DOMAIN_PREFIX: &str = "dev.haloy.domain.";

// ============================================================================
// Role values
// ============================================================================

pub const HAPROXY_LABEL_ROLE: &str = "haproxy";
pub const HALOYD_LABEL_ROLE: &str = "haloyd";
pub const APP_LABEL_ROLE: &str = "app";

/// Build the label key for the canonical domain at `index`.
#[must_use]
pub fn domain_canonical_key(index: usize) -> String {
    format!("{LABEL_DOMAIN_PREFIX}{index}")
}

/// Build the label key for alias `alias_index` of the domain at
/// `domain_index`.
#[must_use]
pub fn domain_alias_key(domain_index: usize, alias_index: usize) -> String {
    format!("{LABEL_DOMAIN_PREFIX}{domain_index}.alias.{alias_index}")
}

/// Structured view of the deployment descriptor carried in container labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerLabels {
    pub app_name: String,
    pub deployment_id: String,
    pub health_check_path: String,
    pub acme_email: String,
    pub port: String,
    pub domains: Vec<Domain>,
    pub role: String,
}

impl ContainerLabels {
    /// Parse a raw Docker label map into a validated `ContainerLabels`.
    ///
    /// Missing port and health-check-path labels fall back to their
    /// defaults. Domain keys that do not conform to the indexed scheme are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns an error when validation fails (see [`Self::validate`]).
    pub fn parse(labels: &HashMap<String, String>) -> Result<Self> {
        let cl = Self {
            app_name: labels.get(LABEL_APP_NAME).cloned().unwrap_or_default(),
            deployment_id: labels
                .get(LABEL_DEPLOYMENT_ID)
                .cloned()
                .unwrap_or_default(),
            acme_email: labels.get(LABEL_ACME_EMAIL).cloned().unwrap_or_default(),
            role: labels.get(LABEL_ROLE).cloned().unwrap_or_default(),
            port: labels
                .get(LABEL_PORT)
                .cloned()
                .unwrap_or_else(|| DEFAULT_CONTAINER_PORT.to_string()),
            health_check_path: labels
                .get(LABEL_HEALTH_CHECK_PATH)
                .cloned()
                .unwrap_or_else(|| DEFAULT_HEALTH_CHECK_PATH.to_string()),
            domains: parse_domains(labels),
        };

        cl.validate()?;
        Ok(cl)
    }

    /// Encode back into a Docker label map. Inverse of [`Self::parse`] for
    /// any validated value.
    #[must_use]
    pub fn to_labels(&self) -> HashMap<String, String> {
        let mut labels = HashMap::from([
            (LABEL_APP_NAME.to_string(), self.app_name.clone()),
            (LABEL_DEPLOYMENT_ID.to_string(), self.deployment_id.clone()),
            (
                LABEL_HEALTH_CHECK_PATH.to_string(),
                self.health_check_path.clone(),
            ),
            (LABEL_PORT.to_string(), self.port.clone()),
            (LABEL_ACME_EMAIL.to_string(), self.acme_email.clone()),
            (LABEL_ROLE.to_string(), self.role.clone()),
        ]);

        for (i, domain) in self.domains.iter().enumerate() {
            labels.insert(domain_canonical_key(i), domain.canonical.clone());
            for (j, alias) in domain.aliases.iter().enumerate() {
                labels.insert(domain_alias_key(i, j), alias.clone());
            }
        }

        labels
    }

    /// Validate the parsed label set.
    ///
    /// # Errors
    ///
    /// Returns an error when the app name or deployment id is missing, the
    /// port is empty, the role is not `app`, the ACME email is malformed, or
    /// any domain fails validation.
    pub fn validate(&self) -> Result<()> {
        if self.app_name.is_empty() {
            bail!("appName is required");
        }
        if self.deployment_id.is_empty() {
            bail!("deploymentID is required");
        }

        for domain in &self.domains {
            domain.validate().context("domain validation failed")?;
        }

        if !self.acme_email.is_empty() && !helpers::is_valid_email(&self.acme_email) {
            bail!("ACME email is not valid");
        }

        if self.port.is_empty() {
            bail!("port is required");
        }

        if self.role != APP_LABEL_ROLE {
            bail!("role must be '{APP_LABEL_ROLE}'");
        }

        Ok(())
    }
}

/// Collect indexed domain labels into an ordered domain list.
fn parse_domains(labels: &HashMap<String, String>) -> Vec<Domain> {
    let mut domain_map: BTreeMap<usize, Domain> = BTreeMap::new();
    // Aliases keyed by (domain index, alias index) so their order survives
    // the unordered label map.
    let mut alias_map: BTreeMap<(usize, usize), String> = BTreeMap::new();

    for (key, value) in labels {
        let Some(rest) = key.strip_prefix(LABEL_DOMAIN_PREFIX) else {
            continue;
        };

        if let Some((domain_part, alias_part)) = rest.split_once(".alias.") {
            let (Ok(domain_idx), Ok(alias_idx)) =
                (domain_part.parse::<usize>(), alias_part.parse::<usize>())
            else {
                continue;
            };
            alias_map.insert((domain_idx, alias_idx), value.clone());
        } else {
            let Ok(domain_idx) = rest.parse::<usize>() else {
                continue;
            };
            domain_map.entry(domain_idx).or_default().canonical = value.clone();
        }
    }

    for ((domain_idx, _), alias) in alias_map {
        domain_map.entry(domain_idx).or_default().aliases.push(alias);
    }

    domain_map.into_values().collect()
}

#[cfg(test)]
#[path = "labels_tests.rs"]
mod labels_tests;
