// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! ACME account cache and certificate order flow.
//!
//! Accounts are cached per contact email, with their credentials persisted
//! under `<certDir>/accounts/<sanitized-email>.key` so restarts reuse the
//! registration. Orders run the HTTP-01 flow against the shared challenge
//! store: publish key authorization, mark ready, poll, finalize with a
//! freshly generated P-256 key, then hand back the key and chain PEMs.

use super::http01::ChallengeStore;
use crate::constants::MODE_FILE_SECRET;
use crate::helpers::sanitize_string;
use anyhow::{bail, Context, Result};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// File extension for persisted account credentials.
const ACCOUNT_KEY_EXT: &str = ".key";

/// Cache of ACME accounts keyed by contact email.
pub(super) struct AccountStore {
    key_dir: PathBuf,
    staging: bool,
    accounts: RwLock<HashMap<String, Arc<Account>>>,
}

impl AccountStore {
    pub(super) fn new(key_dir: PathBuf, staging: bool) -> Self {
        Self {
            key_dir,
            staging,
            accounts: RwLock::new(HashMap::new()),
        }
    }

    fn directory_url(&self) -> String {
        if self.staging {
            LetsEncrypt::Staging.url().to_string()
        } else {
            LetsEncrypt::Production.url().to_string()
        }
    }

    fn credentials_path(&self, email: &str) -> PathBuf {
        self.key_dir
            .join(format!("{}{ACCOUNT_KEY_EXT}", sanitize_string(email)))
    }

    /// Return the cached account for `email`, loading persisted credentials
    /// or registering a fresh account on first use.
    pub(super) async fn load_or_register(&self, email: &str) -> Result<Arc<Account>> {
        if let Some(account) = self.accounts.read().await.get(email) {
            return Ok(Arc::clone(account));
        }

        let mut accounts = self.accounts.write().await;
        // Another task may have won the race while we waited for the lock.
        if let Some(account) = accounts.get(email) {
            return Ok(Arc::clone(account));
        }

        let path = self.credentials_path(email);
        let account = if path.exists() {
            let raw = tokio::fs::read(&path).await.with_context(|| {
                format!("failed to read account credentials {}", path.display())
            })?;
            let credentials: AccountCredentials = serde_json::from_slice(&raw)
                .with_context(|| format!("invalid account credentials {}", path.display()))?;
            Account::from_credentials(credentials)
                .await
                .context("failed to restore ACME account from credentials")?
        } else {
            let contact = format!("mailto:{email}");
            let (account, credentials) = Account::create(
                &NewAccount {
                    contact: &[&contact],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                &self.directory_url(),
                None,
            )
            .await
            .with_context(|| format!("failed to register ACME account for {email}"))?;

            let serialized = serde_json::to_vec_pretty(&credentials)
                .context("failed to serialize account credentials")?;
            write_secret_file(&path, &serialized).await?;

            account
        };

        let account = Arc::new(account);
        accounts.insert(email.to_string(), Arc::clone(&account));
        Ok(account)
    }
}

/// Write a secret file with restrictive permissions.
async fn write_secret_file(path: &Path, contents: &[u8]) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(MODE_FILE_SECRET))
        .await
        .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    Ok(())
}

/// Run one certificate order for `domains` (canonical first) and return the
/// private key PEM and the certificate chain PEM.
///
/// # Errors
///
/// Returns an error when any authorization cannot be satisfied, the order
/// is rejected, or finalization fails.
pub(super) async fn order_certificate(
    account: &Account,
    challenges: &ChallengeStore,
    domains: &[String],
) -> Result<(String, String)> {
    let identifiers: Vec<Identifier> = domains
        .iter()
        .map(|domain| Identifier::Dns(domain.clone()))
        .collect();

    let mut order = account
        .new_order(&NewOrder {
            identifiers: &identifiers,
        })
        .await
        .context("failed to create ACME order")?;

    let authorizations = order
        .authorizations()
        .await
        .context("failed to fetch order authorizations")?;

    let mut published_tokens: Vec<String> = Vec::new();

    let challenge_result = async {
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {}
                status => bail!("unexpected authorization status: {status:?}"),
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|challenge| challenge.r#type == ChallengeType::Http01)
                .context("CA offered no HTTP-01 challenge")?;

            let key_authorization = order.key_authorization(challenge);
            challenges.insert(
                challenge.token.clone(),
                key_authorization.as_str().to_string(),
            );
            published_tokens.push(challenge.token.clone());

            order
                .set_challenge_ready(&challenge.url)
                .await
                .context("failed to mark challenge ready")?;
        }

        // Poll until the order leaves the pending states.
        let mut delay = Duration::from_millis(500);
        let mut attempts = 0u32;
        loop {
            tokio::time::sleep(delay).await;
            order.refresh().await.context("failed to refresh order")?;
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => bail!("ACME order was rejected"),
                _ => {}
            }
            attempts += 1;
            if attempts >= 12 {
                bail!("timed out waiting for ACME order to become ready");
            }
            delay = (delay * 2).min(Duration::from_secs(10));
        }

        let key_pair = rcgen::KeyPair::generate().context("failed to generate certificate key")?;
        let params = rcgen::CertificateParams::new(domains.to_vec())
            .context("failed to build certificate request parameters")?;
        let csr = params
            .serialize_request(&key_pair)
            .context("failed to serialize certificate request")?;

        order
            .finalize(csr.der())
            .await
            .context("failed to finalize order")?;

        let chain_pem = loop {
            match order
                .certificate()
                .await
                .context("failed to download certificate")?
            {
                Some(chain) => break chain,
                None => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        };

        Ok((key_pair.serialize_pem(), chain_pem))
    }
    .await;

    for token in &published_tokens {
        challenges.remove(token);
    }

    challenge_result
}
