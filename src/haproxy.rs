// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! HAProxy configuration generation and reload signaling.
//!
//! The manager owns the proxy config file. One configuration is generated
//! from the current deployment snapshot into four template slots (HTTP
//! frontend, HTTPS frontend, backend selection, backends), written with
//! world-readable mode, and activated by sending SIGUSR2 to the proxy
//! container for a seamless reload. Generation, write and signal are
//! serialized by an internal lock.
//!
//! ACL names are deterministic (`<app>_<domain-with-dots-to-underscores>_<role>`)
//! and applications are emitted in sorted order so identical snapshots
//! produce byte-identical configs.

use crate::config::HaloydConfig;
use crate::constants::{
    API_SERVER_PORT, CERTIFICATES_HTTP_PROVIDER_PORT, HALOYD_CONTAINER_NAME,
    HAPROXY_CONFIG_FILE_NAME, MODE_FILE_DEFAULT,
};
use crate::helpers::safe_id_prefix;
use crate::labels::{HAPROXY_LABEL_ROLE, LABEL_ROLE};
use crate::logging::DeploymentLogger;
use crate::registry::Deployment;
use anyhow::{anyhow, Context, Result};
use bollard::container::{KillContainerOptions, ListContainersOptions};
use bollard::Docker;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;

/// Base configuration with the generated slots.
const CONFIG_TEMPLATE: &str = include_str!("../templates/haproxy.cfg");

const INDENT: &str = "    ";

/// Retries while waiting for the proxy container to be running.
const FIND_PROXY_MAX_RETRIES: u32 = 30;
const FIND_PROXY_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Owner of the proxy config file and reload signal. See module docs.
pub struct HAProxyManager {
    docker: Docker,
    haloyd_config: HaloydConfig,
    config_dir: PathBuf,
    debug: bool,
    update_lock: Mutex<()>,
}

impl HAProxyManager {
    #[must_use]
    pub fn new(
        docker: Docker,
        haloyd_config: HaloydConfig,
        config_dir: PathBuf,
        debug: bool,
    ) -> Self {
        Self {
            docker,
            haloyd_config,
            config_dir,
            debug,
            update_lock: Mutex::new(()),
        }
    }

    /// Generate, write and activate a new proxy configuration for the given
    /// deployment snapshot. Serialized internally; in debug mode the config
    /// is logged and nothing is written or reloaded.
    ///
    /// # Errors
    ///
    /// Returns an error when generation or the file write fails, or when
    /// the reload signal cannot be delivered. A written file without a
    /// delivered signal is left in place for the next update to overwrite.
    pub async fn apply_config(
        &self,
        logger: &DeploymentLogger,
        deployments: &HashMap<String, Deployment>,
    ) -> Result<()> {
        logger.debug("HAProxyManager: Attempting to apply new configuration...");

        let _guard = self.update_lock.lock().await;

        let config = self
            .generate_config(deployments)
            .context("HAProxyManager: failed to generate config")?;

        if self.debug {
            logger.debug("HAProxyManager: Skipping config write and reload.");
            logger.debug(config);
            return Ok(());
        }

        let config_path = self.config_dir.join(HAPROXY_CONFIG_FILE_NAME);
        logger.debug("HAProxyManager: Writing config");
        write_config_file(&config_path, &config)
            .with_context(|| format!("HAProxyManager: failed to write config file {}", config_path.display()))?;

        let Some(haproxy_id) = self.find_proxy_container().await? else {
            logger.warn("HAProxyManager: No HAProxy container found with label, cannot reload.");
            return Ok(());
        };

        logger.debug("HAProxyManager: Sending SIGUSR2 signal to HAProxy container...");
        self.docker
            .kill_container(&haproxy_id, Some(KillContainerOptions { signal: "SIGUSR2" }))
            .await
            .with_context(|| {
                format!(
                    "HAProxyManager: failed to send SIGUSR2 to HAProxy container {}",
                    safe_id_prefix(&haproxy_id)
                )
            })?;

        Ok(())
    }

    /// Render the full configuration for a deployment snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error when slot assembly fails (formatting only).
    pub fn generate_config(&self, deployments: &HashMap<String, Deployment>) -> Result<String> {
        let mut http_frontend = String::new();
        let mut https_frontend = String::new();
        let mut https_use_backend = String::new();
        let mut backends = String::new();

        // ACLs and backend for the daemon's own API.
        if !self.haloyd_config.api.domain.is_empty() {
            let api_domain = &self.haloyd_config.api.domain;
            let api_acl = generate_acl_name("haloy_api", api_domain, "acl");

            writeln!(https_frontend, "{INDENT}acl {api_acl} hdr(host) -i {api_domain}")?;
            writeln!(https_use_backend, "{INDENT}use_backend haloy_api if {api_acl}")?;

            writeln!(http_frontend, "{INDENT}acl {api_acl} hdr(host) -i {api_domain}")?;
            writeln!(
                http_frontend,
                "{INDENT}http-request redirect code 301 location https://{api_domain}%[path] if {api_acl} !is_acme_challenge"
            )?;

            writeln!(backends, "backend haloy_api")?;
            writeln!(backends, "{INDENT}mode http")?;
            writeln!(backends, "{INDENT}# Forward to the haloyd API server")?;
            writeln!(backends, "{INDENT}http-request set-header X-Forwarded-For %[src]")?;
            writeln!(backends, "{INDENT}http-request set-header X-Forwarded-Proto https")?;
            writeln!(backends, "{INDENT}http-request set-header X-Forwarded-Port %[dst_port]")?;
            writeln!(backends, "{INDENT}http-request set-header Host %[req.hdr(host)]")?;
            writeln!(
                backends,
                "{INDENT}server haloyd {HALOYD_CONTAINER_NAME}:{API_SERVER_PORT} check"
            )?;
            writeln!(backends)?;
        }

        // Sorted iteration keeps identical snapshots byte-identical.
        let mut app_names: Vec<&String> = deployments.keys().collect();
        app_names.sort();

        for app_name in &app_names {
            let deployment = &deployments[*app_name];
            if deployment.labels.domains.is_empty() {
                continue;
            }

            let mut canonical_acls: Vec<String> = Vec::new();

            for domain in &deployment.labels.domains {
                if domain.canonical.is_empty() {
                    continue;
                }
                let canonical = &domain.canonical;
                let canonical_acl = generate_acl_name(app_name, canonical, "canonical");

                writeln!(https_frontend, "{INDENT}acl {canonical_acl} hdr(host) -i {canonical}")?;
                canonical_acls.push(canonical_acl.clone());

                writeln!(http_frontend, "{INDENT}acl {canonical_acl} hdr(host) -i {canonical}")?;
                // HTTP traffic for the canonical host goes to HTTPS, except
                // the ACME challenge path.
                writeln!(
                    http_frontend,
                    "{INDENT}http-request redirect code 301 location https://{canonical}%[path] if {canonical_acl} !is_acme_challenge"
                )?;

                for alias in &domain.aliases {
                    if alias.is_empty() {
                        continue;
                    }
                    let alias_acl = generate_acl_name(app_name, alias, "alias");

                    // Aliases redirect to the canonical host on both
                    // frontends and never reach the app backend.
                    writeln!(https_frontend, "{INDENT}acl {alias_acl} hdr(host) -i {alias}")?;
                    writeln!(
                        https_frontend,
                        "{INDENT}http-request redirect code 301 location https://{canonical}%[path] if {alias_acl} !is_acme_challenge"
                    )?;

                    writeln!(http_frontend, "{INDENT}acl {alias_acl} hdr(host) -i {alias}")?;
                    writeln!(
                        http_frontend,
                        "{INDENT}http-request redirect code 301 location https://{canonical}%[path] if {alias_acl} !is_acme_challenge"
                    )?;
                }
            }

            if !canonical_acls.is_empty() {
                writeln!(
                    https_use_backend,
                    "{INDENT}use_backend {app_name} if {}",
                    canonical_acls.join(" or ")
                )?;
            }
        }

        for app_name in &app_names {
            let deployment = &deployments[*app_name];
            writeln!(backends, "backend {}", deployment.labels.app_name)?;
            for (i, instance) in deployment.instances.iter().enumerate() {
                writeln!(
                    backends,
                    "{INDENT}server app{} {}:{} check",
                    i + 1,
                    instance.ip,
                    instance.port
                )?;
            }
        }

        Ok(CONFIG_TEMPLATE
            .replace("{{HTTP_FRONTEND}}", http_frontend.trim_end_matches('\n'))
            .replace("{{HTTPS_FRONTEND}}", https_frontend.trim_end_matches('\n'))
            .replace(
                "{{HTTPS_FRONTEND_USE_BACKEND}}",
                https_use_backend.trim_end_matches('\n'),
            )
            .replace(
                "{{ACME_PROVIDER_PORT}}",
                &CERTIFICATES_HTTP_PROVIDER_PORT.to_string(),
            )
            .replace("{{BACKENDS}}", backends.trim_end_matches('\n')))
    }

    /// Find the running proxy container by its role label, waiting up to 30
    /// seconds for it to appear.
    async fn find_proxy_container(&self) -> Result<Option<String>> {
        for attempt in 0..FIND_PROXY_MAX_RETRIES {
            let containers = self
                .docker
                .list_containers(Some(ListContainersOptions {
                    filters: HashMap::from([
                        (
                            "label".to_string(),
                            vec![format!("{LABEL_ROLE}={HAPROXY_LABEL_ROLE}")],
                        ),
                        ("status".to_string(), vec!["running".to_string()]),
                    ]),
                    limit: Some(1),
                    ..Default::default()
                }))
                .await
                .with_context(|| {
                    format!(
                        "failed to list containers with label {LABEL_ROLE}={HAPROXY_LABEL_ROLE}"
                    )
                })?;

            if let Some(id) = containers.into_iter().find_map(|c| c.id) {
                return Ok(Some(id));
            }

            if attempt == 1 || attempt == FIND_PROXY_MAX_RETRIES / 2 {
                tracing::info!(
                    attempt = attempt + 1,
                    max_retries = FIND_PROXY_MAX_RETRIES,
                    "Waiting for HAProxy container to be running"
                );
            }

            tokio::time::sleep(FIND_PROXY_RETRY_INTERVAL).await;
        }

        Err(anyhow!(
            "timed out waiting for HAProxy container to be in running state after {FIND_PROXY_MAX_RETRIES} seconds"
        ))
    }
}

fn write_config_file(path: &std::path::Path, config: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, config.as_bytes())?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(MODE_FILE_DEFAULT))?;
    Ok(())
}

/// Convert a domain name into a safe ACL identifier.
fn sanitize_for_acl(domain: &str) -> String {
    domain.replace('.', "_")
}

/// Deterministic ACL name: `<app>_<domain-with-dots-to-underscores>_<role>`.
#[must_use]
pub fn generate_acl_name(app_name: &str, domain: &str, suffix: &str) -> String {
    format!("{app_name}_{}_{suffix}", sanitize_for_acl(domain))
}

#[cfg(test)]
#[path = "haproxy_tests.rs"]
mod haproxy_tests;
