// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! The reconciliation pipeline.
//!
//! One `update` call converges the world: rebuild the registry from running
//! containers, gate new instances on health, refresh certificates according
//! to the trigger reason, re-apply the proxy configuration, and finally
//! reap the triggering application's predecessors. The updater is the
//! single place that classifies failures and decides whether an update
//! aborts or proceeds.

use crate::certificates::{CertificateDomain, CertificatesManager};
use crate::config::Domain;
use crate::constants::HAPROXY_CONTAINER_NAME;
use crate::docker;
use crate::haproxy::HAProxyManager;
use crate::helpers::safe_id_prefix;
use crate::logging::DeploymentLogger;
use crate::registry::{DeploymentManager, ExcludedContainer, ExclusionReason};
use anyhow::{anyhow, bail, Context, Result};
use bollard::Docker;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Deadline for stopping and removing a deployment's predecessors.
const PREDECESSOR_CLEANUP_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// What caused an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    /// First convergence at daemon startup.
    Initial,
    /// A debounced burst of container events for one application.
    AppUpdated,
    /// The periodic maintenance sweep.
    PeriodicRefresh,
}

impl std::fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Initial => "initial update",
            Self::AppUpdated => "app updated",
            Self::PeriodicRefresh => "periodic refresh",
        };
        f.write_str(text)
    }
}

/// The application whose event burst triggered an update.
#[derive(Debug, Clone)]
pub struct TriggeredByApp {
    pub app_name: String,
    pub domains: Vec<Domain>,
    pub deployment_id: String,
    /// Container event action that fired the burst (start, die, ...).
    pub event_action: String,
}

impl TriggeredByApp {
    /// # Errors
    ///
    /// Returns an error when a required field is empty or a domain has no
    /// canonical name.
    pub fn validate(&self) -> Result<()> {
        if self.app_name.is_empty() {
            bail!("triggered by app: app name cannot be empty");
        }
        for (i, domain) in self.domains.iter().enumerate() {
            if domain.canonical.is_empty() {
                bail!("triggered by app: canonical name cannot be empty in index {i}");
            }
        }
        if self.deployment_id.is_empty() {
            bail!("triggered by app: latest deployment ID cannot be empty");
        }
        if self.event_action.is_empty() {
            bail!("triggered by app: event action cannot be empty");
        }
        Ok(())
    }
}

/// Orchestrates registry, health gate, certificates and proxy. See module
/// docs.
pub struct Updater {
    docker: Docker,
    registry: Arc<DeploymentManager>,
    certs: Arc<CertificatesManager>,
    haproxy: Arc<HAProxyManager>,
}

impl Updater {
    #[must_use]
    pub fn new(
        docker: Docker,
        registry: Arc<DeploymentManager>,
        certs: Arc<CertificatesManager>,
        haproxy: Arc<HAProxyManager>,
    ) -> Self {
        Self {
            docker,
            registry,
            certs,
            haproxy,
        }
    }

    /// Registry snapshot access for callers outside the pipeline (the main
    /// loop re-applies the proxy config on certificate renewals).
    #[must_use]
    pub fn registry(&self) -> &Arc<DeploymentManager> {
        &self.registry
    }

    /// Proxy manager access for the certificate-renewal reload path.
    #[must_use]
    pub fn haproxy(&self) -> &Arc<HAProxyManager> {
        &self.haproxy
    }

    /// Run one convergence pass. See module docs for the pipeline; the
    /// trigger reason selects certificate semantics (synchronous on initial
    /// and app triggers, debounced otherwise) and whether predecessors are
    /// reaped.
    ///
    /// # Errors
    ///
    /// Returns an error when the registry rebuild fails, any new instance
    /// fails its health gate (no cutover is performed), or the proxy
    /// configuration cannot be applied.
    pub async fn update(
        &self,
        logger: &DeploymentLogger,
        reason: TriggerReason,
        app: Option<&TriggeredByApp>,
    ) -> Result<()> {
        let (has_changed, excluded) = self
            .registry
            .build_deployments()
            .await
            .context("failed to build deployments")?;

        log_excluded_containers(&excluded, logger);

        // Nothing changed: skip, except on the initial update where the API
        // domain still needs certificates and proxy wiring.
        if !has_changed && reason != TriggerReason::Initial {
            logger.debug("Updater: No changes detected in deployments, skipping further processing");
            return Ok(());
        }

        let (checked, failed) = self.registry.health_check_new_containers(logger).await;
        if !failed.is_empty() {
            let failed_ids: Vec<&str> = failed.iter().map(|id| safe_id_prefix(id)).collect();
            bail!(
                "deployment aborted: failed to perform health check on containers ({})",
                failed_ids.join(", ")
            );
        }
        let apps: Vec<&str> = checked
            .iter()
            .map(|deployment| deployment.labels.app_name.as_str())
            .collect();
        logger.info(format!("Health check completed: {}", apps.join(", ")));

        let deployments = self.registry.deployments();

        // The daemon starts before HAProxy. ACME challenges route through
        // the proxy, so initial issuance waits for it to accept traffic.
        if reason == TriggerReason::Initial {
            if let Err(err) = wait_for_acme_routing(logger).await {
                logger.warn(format!("ACME routing check failed, continuing anyway: {err:#}"));
            }
        }

        let cert_domains = self
            .registry
            .certificate_domains()
            .context("failed to get certificate domains")?;

        // App-triggered updates refresh synchronously (and only the app's
        // own canonicals) so the client sees the outcome in its stream.
        // The initial update is synchronous for the API domain; everything
        // else is debounced.
        if let Some(app) = app.filter(|app| !app.domains.is_empty()) {
            let app_canonicals: HashSet<&str> = app
                .domains
                .iter()
                .map(|domain| domain.canonical.as_str())
                .collect();
            let app_cert_domains: Vec<CertificateDomain> = cert_domains
                .iter()
                .filter(|domain| app_canonicals.contains(domain.canonical.as_str()))
                .cloned()
                .collect();

            self.certs
                .refresh_sync(logger, &app_cert_domains)
                .await
                .with_context(|| {
                    format!("failed to refresh certificates for app {}", app.app_name)
                })?;
        } else if reason == TriggerReason::Initial {
            self.certs.refresh_sync(logger, &cert_domains).await?;
        } else {
            self.certs.refresh(logger, cert_domains.clone());
        }

        if reason == TriggerReason::PeriodicRefresh {
            self.certs.cleanup_expired_certificates(logger, &cert_domains);
        }

        self.haproxy
            .apply_config(logger, &deployments)
            .await
            .context("failed to apply HAProxy config")?;
        logger.info("HAProxy configuration applied successfully");

        // Cutover complete: predecessors of the triggering app can go.
        if let Some(app) = app {
            let cleanup = async {
                docker::stop_containers(&self.docker, logger, &app.app_name, &app.deployment_id)
                    .await
                    .context("failed to stop old containers")?;
                docker::remove_containers(&self.docker, &app.app_name, &app.deployment_id)
                    .await
                    .context("failed to remove old containers")?;
                Ok::<_, anyhow::Error>(())
            };
            tokio::time::timeout(PREDECESSOR_CLEANUP_TIMEOUT, cleanup)
                .await
                .map_err(|_| {
                    anyhow!(
                        "timed out cleaning up old containers for app {}",
                        app.app_name
                    )
                })??;
        }

        Ok(())
    }
}

/// Log excluded containers with a severity matching the reason: failures
/// worth operator attention at info, expected exclusions at debug.
fn log_excluded_containers(excluded: &[ExcludedContainer], logger: &DeploymentLogger) {
    for container in excluded {
        match container.reason {
            ExclusionReason::InspectionFailed
            | ExclusionReason::LabelParsingFailed
            | ExclusionReason::IpExtractionFailed
            | ExclusionReason::PortMismatch => match &container.labels {
                Some(labels) => logger.info(format!(
                    "Failed to process container {}: {} (app: {}, deployment: {}, reason: {})",
                    safe_id_prefix(&container.container_id),
                    container.message,
                    labels.app_name,
                    labels.deployment_id,
                    container.reason
                )),
                None => logger.info(format!(
                    "Container {} failed to start - no label info available (reason: {})",
                    safe_id_prefix(&container.container_id),
                    container.reason
                )),
            },
            ExclusionReason::NoDomains | ExclusionReason::NotDefaultNetwork => {
                logger.debug(format!(
                    "Container {} excluded from further processing (reason: {})",
                    safe_id_prefix(&container.container_id),
                    container.reason
                ));
            }
        }
    }
}

/// Wait for HAProxy to accept HTTP connections so ACME challenges can be
/// routed. Any HTTP response counts; the default backend's 404 is fine.
async fn wait_for_acme_routing(logger: &DeploymentLogger) -> Result<()> {
    const MAX_RETRIES: u32 = 30;
    const RETRY_INTERVAL: Duration = Duration::from_secs(1);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("failed to build HTTP client")?;

    // HAProxy shares the Docker network and is reachable by container name.
    let url = format!("http://{HAPROXY_CONTAINER_NAME}/");

    for attempt in 1..=MAX_RETRIES {
        match client.get(&url).send().await {
            Ok(response) => {
                logger.debug(format!(
                    "HAProxy is ready (status {}, attempt {attempt})",
                    response.status()
                ));
                return Ok(());
            }
            Err(err) => {
                logger.debug(format!(
                    "Waiting for HAProxy to be ready (attempt {attempt}): {err}"
                ));
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }

    bail!("timed out waiting for HAProxy after {MAX_RETRIES} attempts")
}

#[cfg(test)]
#[path = "updater_tests.rs"]
mod updater_tests;
