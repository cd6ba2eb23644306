// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! ACME certificate management.
//!
//! The manager owns the certificate directory. Each canonical domain gets a
//! single PEM bundle `<certDir>/<canonical>.pem` holding the private key
//! followed by the certificate chain, written atomically via temp file and
//! rename. A certificate is (re)obtained when its configured domain set
//! changed or it expires within 30 days. Acquisition runs the HTTP-01
//! challenge through the proxy being reconfigured, so initial issuance
//! waits for the proxy to accept traffic (the updater handles that
//! ordering).
//!
//! Refresh comes in two flavors: synchronous for startup and app-triggered
//! updates, where the caller wants the result in the deployment stream, and
//! debounced-async for periodic sweeps, which signal the update channel on
//! success so the proxy re-reads renewed bundles.

mod acme;
mod http01;

pub use http01::{spawn_http01_server, ChallengeStore};

use crate::debouncer::Debouncer;
use crate::helpers;
use crate::logging::DeploymentLogger;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use x509_parser::extensions::GeneralName;

const REFRESH_DEBOUNCE_KEY: &str = "certificate_refresh";
const REFRESH_DEBOUNCE_DELAY: Duration = Duration::from_secs(5);
const ACCOUNTS_DIR_NAME: &str = "accounts";
const COMBINED_CERT_EXT: &str = ".pem";

/// Renew certificates expiring within this window (30 days).
const RENEWAL_WINDOW_SECS: i64 = 30 * 24 * 60 * 60;

/// A domain set needing a certificate: canonical name, aliases sharing the
/// certificate, and the ACME contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateDomain {
    pub canonical: String,
    pub aliases: Vec<String>,
    pub email: String,
}

impl CertificateDomain {
    /// Validate names and contact.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field: empty or malformed canonical,
    /// missing or malformed email, empty or malformed alias.
    pub fn validate(&self) -> Result<()> {
        if self.canonical.is_empty() {
            bail!("canonical domain cannot be empty");
        }
        helpers::is_valid_domain(&self.canonical)
            .with_context(|| format!("invalid canonical domain '{}'", self.canonical))?;

        if self.email.is_empty() {
            bail!("email cannot be empty");
        }
        if !helpers::is_valid_email(&self.email) {
            bail!("invalid email format: {}", self.email);
        }

        for alias in &self.aliases {
            if alias.is_empty() {
                bail!("alias cannot be empty");
            }
            helpers::is_valid_domain(alias)
                .with_context(|| format!("invalid alias '{alias}'"))?;
        }
        Ok(())
    }

    /// All names the certificate covers, canonical first.
    #[must_use]
    pub fn all_domains(&self) -> Vec<String> {
        let mut all = Vec::with_capacity(1 + self.aliases.len());
        all.push(self.canonical.clone());
        all.extend(self.aliases.iter().cloned());
        all
    }
}

/// Configuration for the certificate manager.
#[derive(Debug, Clone)]
pub struct CertificatesManagerConfig {
    pub cert_dir: PathBuf,
    pub http_provider_port: u16,
    /// Use the ACME staging directory (debug mode).
    pub tls_staging: bool,
}

/// Owner of the certificate directory. See module docs.
pub struct CertificatesManager {
    config: CertificatesManagerConfig,
    check_lock: Mutex<()>,
    accounts: acme::AccountStore,
    challenges: ChallengeStore,
    update_signal: mpsc::Sender<String>,
    debouncer: Debouncer,
    http01_server: tokio::task::JoinHandle<()>,
}

impl CertificatesManager {
    /// Create the manager: ensures the certificate and accounts directories
    /// exist with private permissions and starts the HTTP-01 responder.
    ///
    /// # Errors
    ///
    /// Returns an error when the directories cannot be created.
    pub fn new(
        config: CertificatesManagerConfig,
        update_signal: mpsc::Sender<String>,
    ) -> Result<Arc<Self>> {
        use std::os::unix::fs::DirBuilderExt;

        let key_dir = config.cert_dir.join(ACCOUNTS_DIR_NAME);
        for dir in [&config.cert_dir, &key_dir] {
            if !dir.exists() {
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(crate::constants::MODE_DIR_PRIVATE)
                    .create(dir)
                    .with_context(|| format!("failed to create directory '{}'", dir.display()))?;
            }
        }

        let challenges = ChallengeStore::new();
        let http01_server = spawn_http01_server(challenges.clone(), config.http_provider_port);

        Ok(Arc::new(Self {
            accounts: acme::AccountStore::new(key_dir, config.tls_staging),
            challenges,
            check_lock: Mutex::new(()),
            update_signal,
            debouncer: Debouncer::new(REFRESH_DEBOUNCE_DELAY),
            config,
            http01_server,
        }))
    }

    /// Stop background work: pending debounced refreshes and the challenge
    /// responder.
    pub fn stop(&self) {
        self.debouncer.stop();
        self.http01_server.abort();
    }

    /// Synchronous refresh, used on startup and app-triggered updates so
    /// callers see the outcome in their stream.
    ///
    /// # Errors
    ///
    /// Returns an error only for systemic failures; per-domain problems are
    /// logged and skipped.
    pub async fn refresh_sync(
        &self,
        logger: &DeploymentLogger,
        domains: &[CertificateDomain],
    ) -> Result<Vec<CertificateDomain>> {
        self.check_renewals(logger, domains).await
    }

    /// Debounced asynchronous refresh for periodic sweeps. Coalesces bursts
    /// under a single key; a successful renewal pushes a signal on the
    /// update channel so the proxy config gets re-applied.
    pub fn refresh(self: &Arc<Self>, logger: &DeploymentLogger, domains: Vec<CertificateDomain>) {
        logger.debug("Refresh requested for certificate manager, using debouncer.");

        let manager = Arc::clone(self);
        let logger = logger.clone();
        self.debouncer.debounce(REFRESH_DEBOUNCE_KEY, async move {
            match manager.check_renewals(&logger, &domains).await {
                Ok(renewed) => {
                    if !renewed.is_empty() {
                        let _ = manager
                            .update_signal
                            .send("certificates_renewed".to_string())
                            .await;
                    }
                }
                Err(err) => logger.error(format!("Certificate refresh failed: {err:#}")),
            }
        });
    }

    /// Check every managed domain and obtain certificates where the
    /// configuration changed or expiry is near. Returns the domains
    /// actually renewed.
    async fn check_renewals(
        &self,
        logger: &DeploymentLogger,
        domains: &[CertificateDomain],
    ) -> Result<Vec<CertificateDomain>> {
        let _guard = self.check_lock.lock().await;

        let mut renewed = Vec::new();
        if domains.is_empty() {
            return Ok(renewed);
        }

        let desired = deduplicate_domains(domains);
        if desired.len() != domains.len() {
            logger.debug(format!(
                "Deduplicated certificate domains: {} -> {}",
                domains.len(),
                desired.len()
            ));
        }

        for domain in desired.values() {
            let canonical = &domain.canonical;

            let config_changed = self.has_configuration_changed(domain);
            let needs_renewal = self.needs_renewal_due_to_expiry(logger, domain);

            if config_changed {
                // Remove the stale bundle first so the proxy can never keep
                // serving a certificate for the wrong domain set.
                logger.debug(format!(
                    "Configuration changed, cleaning up existing certificate for {canonical}"
                ));
                if let Err(err) = self.remove_bundle(canonical) {
                    logger.warn(format!(
                        "Failed to cleanup certificate for {canonical}: {err:#}"
                    ));
                }
            }

            if !(config_changed || needs_renewal) {
                logger.info(format!(
                    "Certificate is valid for {canonical} (aliases: {:?})",
                    domain.aliases
                ));
                continue;
            }

            logger.info(format!(
                "Requesting new certificate for {canonical} (aliases: {:?})",
                domain.aliases
            ));

            match self.obtain_certificate(domain).await {
                Ok(()) => {
                    logger.info(format!(
                        "Obtained new certificate for {canonical} (aliases: {:?})",
                        domain.aliases
                    ));
                    renewed.push(domain.clone());
                }
                Err(err) => {
                    logger.error(format!(
                        "Failed to obtain certificate for {canonical}: {err:#}"
                    ));
                }
            }
        }

        Ok(renewed)
    }

    /// Whether the stored bundle's DNS names differ from the desired set
    /// (or no parseable bundle exists).
    fn has_configuration_changed(&self, domain: &CertificateDomain) -> bool {
        let path = self.bundle_path(&domain.canonical);
        let Ok(data) = std::fs::read(&path) else {
            return true;
        };
        let Ok(parsed) = parse_certificate(&data) else {
            return true;
        };

        let mut required = domain.all_domains();
        required.sort();
        let mut existing = parsed.dns_names;
        existing.sort();

        required != existing
    }

    /// Whether the stored bundle expires within the renewal window (or is
    /// missing/unreadable).
    fn needs_renewal_due_to_expiry(
        &self,
        logger: &DeploymentLogger,
        domain: &CertificateDomain,
    ) -> bool {
        let path = self.bundle_path(&domain.canonical);
        let Ok(data) = std::fs::read(&path) else {
            return true;
        };
        let Ok(parsed) = parse_certificate(&data) else {
            return true;
        };

        let expires_in = parsed.not_after - chrono::Utc::now().timestamp();
        if expires_in < RENEWAL_WINDOW_SECS {
            logger.info(format!(
                "Certificate expires soon and needs renewal: {}",
                domain.canonical
            ));
            return true;
        }
        false
    }

    /// Obtain and atomically store one certificate bundle.
    async fn obtain_certificate(&self, domain: &CertificateDomain) -> Result<()> {
        validate_domain_resolves(&domain.canonical)
            .await
            .with_context(|| format!("domain validation failed for {}", domain.canonical))?;

        let account = self.accounts.load_or_register(&domain.email).await?;
        let all_domains = domain.all_domains();

        let (key_pem, chain_pem) =
            acme::order_certificate(&account, &self.challenges, &all_domains).await?;

        self.save_bundle(&domain.canonical, &key_pem, &chain_pem)
            .with_context(|| format!("failed to save certificate for {}", domain.canonical))
    }

    /// Write `privateKey || newline || certChain` via temp file + rename.
    fn save_bundle(&self, canonical: &str, key_pem: &str, chain_pem: &str) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let path = self.bundle_path(canonical);
        let tmp_path = path.with_extension("pem.tmp");

        let mut contents = String::with_capacity(key_pem.len() + chain_pem.len() + 1);
        contents.push_str(key_pem);
        if !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(chain_pem);

        std::fs::write(&tmp_path, contents.as_bytes())
            .context("failed to save temporary combined certificate/key")?;
        std::fs::set_permissions(
            &tmp_path,
            std::fs::Permissions::from_mode(crate::constants::MODE_FILE_SECRET),
        )
        .context("failed to set certificate permissions")?;

        std::fs::rename(&tmp_path, &path).map_err(|err| {
            let _ = std::fs::remove_file(&tmp_path);
            anyhow::anyhow!("failed to atomically replace combined certificate/key: {err}")
        })
    }

    fn remove_bundle(&self, canonical: &str) -> Result<()> {
        let path = self.bundle_path(canonical);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| {
                format!("failed to remove combined certificate file {}", path.display())
            }),
        }
    }

    fn bundle_path(&self, canonical: &str) -> PathBuf {
        self.config
            .cert_dir
            .join(format!("{canonical}{COMBINED_CERT_EXT}"))
    }

    /// Delete bundles that are both unmanaged and expired. Unmanaged but
    /// still-valid certificates are retained.
    pub fn cleanup_expired_certificates(
        &self,
        logger: &DeploymentLogger,
        managed: &[CertificateDomain],
    ) {
        logger.debug("Starting certificate cleanup check");

        let entries = match std::fs::read_dir(&self.config.cert_dir) {
            Ok(entries) => entries,
            Err(err) => {
                logger.error(format!(
                    "Failed to read certificates directory {}: {err}",
                    self.config.cert_dir.display()
                ));
                return;
            }
        };

        let managed_canonicals: std::collections::HashSet<&str> = managed
            .iter()
            .map(|domain| domain.canonical.as_str())
            .collect();

        let mut deleted = 0usize;
        let now = chrono::Utc::now().timestamp();

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let Some(stem) = file_name.strip_suffix(COMBINED_CERT_EXT) else {
                continue;
            };
            if managed_canonicals.contains(stem) {
                continue;
            }

            let Ok(data) = std::fs::read(&path) else {
                continue;
            };
            let Ok(parsed) = parse_certificate(&data) else {
                logger.warn(format!(
                    "Failed to parse certificate during cleanup: {}",
                    path.display()
                ));
                continue;
            };

            if parsed.not_after < now {
                logger.debug(format!(
                    "Deleting expired certificate for unmanaged domain {stem}"
                ));
                let _ = std::fs::remove_file(&path);
                deleted += 1;
            }
        }

        logger.debug(format!(
            "Certificate cleanup complete. Deleted {deleted} expired certificate(s) for unmanaged domains"
        ));
    }

    /// Whether a bundle for `canonical` currently exists on disk.
    #[must_use]
    pub fn bundle_exists(&self, canonical: &str) -> bool {
        self.bundle_path(canonical).exists()
    }
}

/// Deduplicate by canonical domain, preferring the entry with more aliases
/// when configurations conflict.
fn deduplicate_domains(domains: &[CertificateDomain]) -> HashMap<String, CertificateDomain> {
    let mut desired: HashMap<String, CertificateDomain> = HashMap::new();
    for domain in domains {
        match desired.get(&domain.canonical) {
            Some(existing) if domain.aliases.len() <= existing.aliases.len() => {}
            _ => {
                desired.insert(domain.canonical.clone(), domain.clone());
            }
        }
    }
    desired
}

/// Pre-issuance DNS check: the canonical name must resolve to at least one
/// IPv4 address. Failures produce a diagnostic the operator can act on.
async fn validate_domain_resolves(domain: &str) -> Result<()> {
    let lookup = tokio::net::lookup_host((domain, 443u16)).await;

    let addrs = match lookup {
        Ok(addrs) => addrs,
        Err(err) => bail!("\n\n{}", build_domain_error_message(domain, &err)),
    };

    if !addrs.into_iter().any(|addr| addr.is_ipv4()) {
        bail!(
            "domain {domain} has no IPv4 addresses assigned\n\n\
             Please add DNS records:\n\
             - A record: {domain} -> YOUR_SERVER_IP\n\
             - Test with: dig A {domain}"
        );
    }

    Ok(())
}

fn build_domain_error_message(domain: &str, err: &std::io::Error) -> String {
    let text = err.to_string();
    if text.contains("not known") || text.contains("no such host") || text.contains("NXDOMAIN") {
        format!("Domain {domain} not found. Check if domain exists and DNS A record is configured.")
    } else if text.contains("timed out") || text.contains("timeout") {
        format!("DNS timeout for {domain}. Check network connectivity or try different DNS server.")
    } else {
        format!("DNS resolution failed for {domain}. Verify domain exists and has proper DNS records.")
    }
}

/// Fields the manager needs out of a stored certificate.
#[derive(Debug, Clone)]
struct ParsedCertificate {
    dns_names: Vec<String>,
    /// Unix timestamp of `notAfter`.
    not_after: i64,
}

/// Parse the first CERTIFICATE block out of a PEM bundle.
fn parse_certificate(pem_data: &[u8]) -> Result<ParsedCertificate> {
    for pem in x509_parser::pem::Pem::iter_from_buffer(pem_data) {
        let pem = pem.context("failed to decode PEM block")?;
        if pem.label != "CERTIFICATE" {
            continue;
        }
        let cert = pem
            .parse_x509()
            .context("failed to parse certificate")?;

        let dns_names = cert
            .subject_alternative_name()
            .ok()
            .flatten()
            .map(|san| {
                san.value
                    .general_names
                    .iter()
                    .filter_map(|name| match name {
                        GeneralName::DNSName(dns) => Some((*dns).to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        return Ok(ParsedCertificate {
            dns_names,
            not_after: cert.validity().not_after.timestamp(),
        });
    }
    bail!("no CERTIFICATE PEM block found")
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod mod_tests;
