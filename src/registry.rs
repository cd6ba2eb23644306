// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! In-memory deployment registry and diff engine.
//!
//! The registry owns the map of application to active deployment. A rebuild
//! enumerates running app-role containers, applies the eligibility rules
//! (valid labels, shared network membership, matching exposed port, at
//! least one domain, extractable IP), keeps the instance set of the highest
//! deployment id per application, and diffs the result against the previous
//! snapshot. Everything downstream works off defensive copies of that
//! snapshot.

use crate::certificates::CertificateDomain;
use crate::config::HaloydConfig;
use crate::constants::DOCKER_NETWORK;
use crate::docker;
use crate::helpers::safe_id_prefix;
use crate::labels::ContainerLabels;
use crate::logging::DeploymentLogger;
use anyhow::{bail, Context, Result};
use bollard::Docker;
use std::collections::HashMap;
use std::sync::RwLock;

/// One running container of a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentInstance {
    pub container_id: String,
    pub ip: String,
    pub port: String,
}

/// An application's active deployment: parsed labels plus its instances.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub labels: ContainerLabels,
    pub instances: Vec<DeploymentInstance>,
}

/// Why a container was left out of the registry during a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ExclusionReason {
    #[error("container inspection failed")]
    InspectionFailed,
    #[error("label parsing failed")]
    LabelParsingFailed,
    #[error("no domains configured")]
    NoDomains,
    #[error("not on haloy docker network")]
    NotDefaultNetwork,
    #[error("IP extraction failed")]
    IpExtractionFailed,
    #[error("label port does not match exposed container ports")]
    PortMismatch,
}

/// A container excluded from the registry, with enough context to log it.
#[derive(Debug, Clone)]
pub struct ExcludedContainer {
    pub container_id: String,
    pub reason: ExclusionReason,
    pub message: String,
    pub labels: Option<ContainerLabels>,
}

/// Diff between two registry snapshots, keyed by application name.
#[derive(Debug, Clone, Default)]
pub struct CompareResult {
    pub added: HashMap<String, Deployment>,
    pub updated: HashMap<String, Deployment>,
    pub removed: HashMap<String, Deployment>,
}

impl CompareResult {
    /// True when any application was added, updated or removed.
    #[must_use]
    pub fn has_changed(&self) -> bool {
        !self.added.is_empty() || !self.updated.is_empty() || !self.removed.is_empty()
    }
}

struct RegistryState {
    deployments: HashMap<String, Deployment>,
    compare_result: CompareResult,
}

/// Owner of the deployment map. See module docs.
pub struct DeploymentManager {
    docker: Docker,
    state: RwLock<RegistryState>,
    haloyd_config: HaloydConfig,
}

impl DeploymentManager {
    #[must_use]
    pub fn new(docker: Docker, haloyd_config: HaloydConfig) -> Self {
        Self {
            docker,
            state: RwLock::new(RegistryState {
                deployments: HashMap::new(),
                compare_result: CompareResult::default(),
            }),
            haloyd_config,
        }
    }

    /// Rebuild the deployment map from running containers and diff it
    /// against the previous snapshot.
    ///
    /// Returns whether anything changed plus the containers excluded along
    /// the way (with their reasons, for the updater to log).
    ///
    /// # Errors
    ///
    /// Returns an error only when the container listing itself fails;
    /// per-container problems become exclusions instead.
    pub async fn build_deployments(&self) -> Result<(bool, Vec<ExcludedContainer>)> {
        let mut new_deployments: HashMap<String, Deployment> = HashMap::new();
        let mut excluded: Vec<ExcludedContainer> = Vec::new();

        let containers = docker::get_app_containers(&self.docker, false, None)
            .await
            .context("failed to get containers")?;

        for summary in containers {
            let Some(container_id) = summary.id else {
                continue;
            };

            let inspect = match self.docker.inspect_container(&container_id, None).await {
                Ok(inspect) => inspect,
                Err(err) => {
                    excluded.push(ExcludedContainer {
                        container_id,
                        reason: ExclusionReason::InspectionFailed,
                        message: err.to_string(),
                        labels: None,
                    });
                    continue;
                }
            };

            let labels_map = inspect
                .config
                .as_ref()
                .and_then(|config| config.labels.clone())
                .unwrap_or_default();
            let labels = match ContainerLabels::parse(&labels_map) {
                Ok(labels) => labels,
                Err(err) => {
                    excluded.push(ExcludedContainer {
                        container_id,
                        reason: ExclusionReason::LabelParsingFailed,
                        message: err.to_string(),
                        labels: None,
                    });
                    continue;
                }
            };

            let on_network = inspect
                .network_settings
                .as_ref()
                .and_then(|settings| settings.networks.as_ref())
                .is_some_and(|networks| networks.contains_key(DOCKER_NETWORK));
            if !on_network {
                excluded.push(ExcludedContainer {
                    container_id,
                    reason: ExclusionReason::NotDefaultNetwork,
                    message: String::new(),
                    labels: Some(labels),
                });
                continue;
            }

            let exposed_ports = inspect
                .config
                .as_ref()
                .and_then(|config| config.exposed_ports.as_ref());
            if !validate_container_port(exposed_ports, &labels.port) {
                let exposed = exposed_ports_as_string(exposed_ports);
                excluded.push(ExcludedContainer {
                    container_id,
                    reason: ExclusionReason::PortMismatch,
                    message: format!(
                        "configured port {} does not match exposed ports {exposed}",
                        labels.port
                    ),
                    labels: Some(labels),
                });
                continue;
            }

            if labels.domains.is_empty() {
                excluded.push(ExcludedContainer {
                    container_id,
                    reason: ExclusionReason::NoDomains,
                    message: String::new(),
                    labels: Some(labels),
                });
                continue;
            }

            let ip = match docker::container_network_ip(&inspect, DOCKER_NETWORK) {
                Ok(ip) => ip,
                Err(err) => {
                    excluded.push(ExcludedContainer {
                        container_id,
                        reason: ExclusionReason::IpExtractionFailed,
                        message: err.to_string(),
                        labels: Some(labels),
                    });
                    continue;
                }
            };

            let instance = DeploymentInstance {
                container_id,
                ip,
                port: labels.port.clone(),
            };

            insert_instance(&mut new_deployments, labels, instance);
        }

        let mut state = self.state.write().expect("registry lock poisoned");
        let old_deployments = std::mem::replace(&mut state.deployments, new_deployments);
        let compare_result = compare_deployments(&old_deployments, &state.deployments);
        let has_changed = compare_result.has_changed();
        state.compare_result = compare_result;

        Ok((has_changed, excluded))
    }

    /// Health-check every instance of the deployments added or updated by
    /// the last rebuild. Returns the deployments checked and the ids of the
    /// containers that failed.
    pub async fn health_check_new_containers(
        &self,
        logger: &DeploymentLogger,
    ) -> (Vec<Deployment>, Vec<String>) {
        let checked: Vec<Deployment> = {
            let state = self.state.read().expect("registry lock poisoned");
            state
                .compare_result
                .added
                .values()
                .chain(state.compare_result.updated.values())
                .cloned()
                .collect()
        };

        let mut failed = Vec::new();
        for deployment in &checked {
            for instance in &deployment.instances {
                if let Err(err) = docker::health_check_container(
                    &self.docker,
                    logger,
                    &instance.container_id,
                    None,
                )
                .await
                {
                    logger.error(format!(
                        "Health check failed for container {}: {err:#}",
                        safe_id_prefix(&instance.container_id)
                    ));
                    failed.push(instance.container_id.clone());
                }
            }
        }

        (checked, failed)
    }

    /// Snapshot of the current deployments. Returns a copy so callers can
    /// never mutate registry state.
    #[must_use]
    pub fn deployments(&self) -> HashMap<String, Deployment> {
        let state = self.state.read().expect("registry lock poisoned");
        state.deployments.clone()
    }

    /// Collect the canonical domains (with aliases and contact email) that
    /// need certificates, including the daemon's own API domain when
    /// configured. Apps without their own ACME email inherit the
    /// daemon-level default.
    ///
    /// # Errors
    ///
    /// Returns an error when a domain has no usable email or fails
    /// validation.
    pub fn certificate_domains(&self) -> Result<Vec<CertificateDomain>> {
        let state = self.state.read().expect("registry lock poisoned");

        let mut cert_domains = Vec::with_capacity(state.deployments.len());
        for deployment in state.deployments.values() {
            for domain in &deployment.labels.domains {
                if domain.canonical.is_empty() {
                    continue;
                }

                let mut email = deployment.labels.acme_email.clone();
                if email.is_empty() {
                    email = self.haloyd_config.certificates.acme_email.clone();
                }
                if email.is_empty() {
                    bail!(
                        "ACME email for domain {} not found in haloyd config or labels",
                        domain.canonical
                    );
                }

                let cert_domain = CertificateDomain {
                    canonical: domain.canonical.clone(),
                    aliases: domain.aliases.clone(),
                    email,
                };
                cert_domain
                    .validate()
                    .with_context(|| format!("domain not valid '{}'", domain.canonical))?;
                cert_domains.push(cert_domain);
            }
        }

        if !self.haloyd_config.api.domain.is_empty()
            && !self.haloyd_config.certificates.acme_email.is_empty()
        {
            cert_domains.push(CertificateDomain {
                canonical: self.haloyd_config.api.domain.clone(),
                aliases: Vec::new(),
                email: self.haloyd_config.certificates.acme_email.clone(),
            });
        }

        Ok(cert_domains)
    }
}

/// Place an instance into the deployment map, keeping only the highest
/// deployment id per application.
fn insert_instance(
    deployments: &mut HashMap<String, Deployment>,
    labels: ContainerLabels,
    instance: DeploymentInstance,
) {
    match deployments.get_mut(&labels.app_name) {
        Some(existing) => {
            if existing.labels.deployment_id == labels.deployment_id {
                existing.instances.push(instance);
            } else if existing.labels.deployment_id < labels.deployment_id {
                // Newer deployment wins; older containers are reaped by the
                // updater's cleanup step.
                *existing = Deployment {
                    labels,
                    instances: vec![instance],
                };
            }
        }
        None => {
            deployments.insert(
                labels.app_name.clone(),
                Deployment {
                    labels,
                    instances: vec![instance],
                },
            );
        }
    }
}

/// Diff two deployment snapshots.
///
/// An app present in both with a different deployment id or instance id set
/// is updated; present only in the new map is added; present only in the
/// old map is removed.
#[must_use]
pub fn compare_deployments(
    old_deployments: &HashMap<String, Deployment>,
    new_deployments: &HashMap<String, Deployment>,
) -> CompareResult {
    let mut result = CompareResult::default();

    for (app_name, previous) in old_deployments {
        match new_deployments.get(app_name) {
            Some(current) => {
                if previous.labels.deployment_id != current.labels.deployment_id
                    || !instances_equal(&previous.instances, &current.instances)
                {
                    result.updated.insert(app_name.clone(), current.clone());
                }
            }
            None => {
                result.removed.insert(app_name.clone(), previous.clone());
            }
        }
    }

    for (app_name, current) in new_deployments {
        if !old_deployments.contains_key(app_name) {
            result.added.insert(app_name.clone(), current.clone());
        }
    }

    result
}

/// Compare instance sets by container id, ignoring order.
fn instances_equal(a: &[DeploymentInstance], b: &[DeploymentInstance]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let ids: std::collections::HashSet<&str> =
        a.iter().map(|instance| instance.container_id.as_str()).collect();
    b.iter().all(|instance| ids.contains(instance.container_id.as_str()))
}

/// Check the labelled port against the image's exposed ports. Images that
/// declare no ports pass; the health gate catches real connectivity
/// problems.
fn validate_container_port(
    exposed_ports: Option<&HashMap<String, HashMap<(), ()>>>,
    label_port: &str,
) -> bool {
    let Some(exposed) = exposed_ports else {
        return true;
    };
    if exposed.is_empty() {
        return true;
    }

    exposed
        .keys()
        .any(|key| key.split('/').next() == Some(label_port))
}

fn exposed_ports_as_string(exposed_ports: Option<&HashMap<String, HashMap<(), ()>>>) -> String {
    match exposed_ports {
        None => "none".to_string(),
        Some(exposed) if exposed.is_empty() => "none".to_string(),
        Some(exposed) => {
            let mut ports: Vec<&str> = exposed
                .keys()
                .filter_map(|key| key.split('/').next())
                .collect();
            ports.sort_unstable();
            format!("[{}]", ports.join(", "))
        }
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod registry_tests;
