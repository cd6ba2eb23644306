// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for certificate bundle handling and renewal decisions.

#[cfg(test)]
mod tests {
    use super::super::{
        deduplicate_domains, parse_certificate, CertificateDomain, CertificatesManager,
        CertificatesManagerConfig,
    };
    use crate::logging::{DeploymentLogger, LogBroker};
    use std::path::Path;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn domain(canonical: &str, aliases: &[&str]) -> CertificateDomain {
        CertificateDomain {
            canonical: canonical.to_string(),
            aliases: aliases.iter().map(ToString::to_string).collect(),
            email: "ops@example.com".to_string(),
        }
    }

    /// Self-signed bundle (key + cert) for the given names and expiry year.
    fn write_bundle(dir: &Path, canonical: &str, names: &[&str], expiry_year: i32) {
        let mut params =
            rcgen::CertificateParams::new(names.iter().map(ToString::to_string).collect::<Vec<_>>())
                .unwrap();
        params.not_after = rcgen::date_time_ymd(expiry_year, 1, 1);
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        let bundle = format!("{}\n{}", key.serialize_pem().trim_end(), cert.pem());
        std::fs::write(dir.join(format!("{canonical}.pem")), bundle).unwrap();
    }

    async fn manager(dir: &Path) -> Arc<CertificatesManager> {
        let (tx, _rx) = mpsc::channel(5);
        CertificatesManager::new(
            CertificatesManagerConfig {
                cert_dir: dir.to_path_buf(),
                http_provider_port: 0,
                tls_staging: true,
            },
            tx,
        )
        .unwrap()
    }

    fn logger() -> DeploymentLogger {
        DeploymentLogger::general(LogBroker::new())
    }

    // ========================================================================
    // Domain validation
    // ========================================================================

    #[test]
    fn test_certificate_domain_validation() {
        assert!(domain("blog.example", &["www.blog.example"]).validate().is_ok());

        let mut bad_email = domain("blog.example", &[]);
        bad_email.email = "nope".to_string();
        assert!(bad_email.validate().is_err());

        let mut empty_canonical = domain("blog.example", &[]);
        empty_canonical.canonical = String::new();
        assert!(empty_canonical.validate().is_err());

        assert!(domain("blog.example", &["bad_alias"]).validate().is_err());
    }

    #[test]
    fn test_all_domains_canonical_first() {
        let d = domain("blog.example", &["www.blog.example", "alt.blog.example"]);
        assert_eq!(
            d.all_domains(),
            vec!["blog.example", "www.blog.example", "alt.blog.example"]
        );
    }

    // ========================================================================
    // Deduplication
    // ========================================================================

    #[test]
    fn test_deduplicate_prefers_more_aliases() {
        let domains = vec![
            domain("blog.example", &[]),
            domain("blog.example", &["www.blog.example"]),
            domain("api.example", &[]),
        ];
        let deduped = deduplicate_domains(&domains);
        assert_eq!(deduped.len(), 2);
        assert_eq!(
            deduped["blog.example"].aliases,
            vec!["www.blog.example"],
            "the entry with more aliases must win"
        );
    }

    #[test]
    fn test_deduplicate_keeps_first_on_tie() {
        let domains = vec![
            domain("blog.example", &["a.example"]),
            domain("blog.example", &["b.example"]),
        ];
        let deduped = deduplicate_domains(&domains);
        assert_eq!(deduped["blog.example"].aliases, vec!["a.example"]);
    }

    // ========================================================================
    // Bundle parsing
    // ========================================================================

    #[test]
    fn test_parse_certificate_extracts_names_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "blog.example", &["blog.example", "www.blog.example"], 2040);

        let data = std::fs::read(dir.path().join("blog.example.pem")).unwrap();
        let parsed = parse_certificate(&data).unwrap();
        assert_eq!(parsed.dns_names, vec!["blog.example", "www.blog.example"]);
        assert!(parsed.not_after > chrono::Utc::now().timestamp());
    }

    #[test]
    fn test_parse_certificate_rejects_garbage() {
        assert!(parse_certificate(b"not a pem").is_err());
        // A key-only bundle has no CERTIFICATE block.
        let key = rcgen::KeyPair::generate().unwrap();
        assert!(parse_certificate(key.serialize_pem().as_bytes()).is_err());
    }

    // ========================================================================
    // Renewal decisions
    // ========================================================================

    #[tokio::test]
    async fn test_missing_bundle_counts_as_configuration_changed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        assert!(manager.has_configuration_changed(&domain("blog.example", &[])));
    }

    #[tokio::test]
    async fn test_matching_bundle_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        write_bundle(dir.path(), "blog.example", &["blog.example", "www.blog.example"], 2040);

        assert!(!manager
            .has_configuration_changed(&domain("blog.example", &["www.blog.example"])));
    }

    #[tokio::test]
    async fn test_alias_change_is_configuration_changed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        write_bundle(dir.path(), "blog.example", &["blog.example"], 2040);

        assert!(manager
            .has_configuration_changed(&domain("blog.example", &["www.blog.example"])));
    }

    #[tokio::test]
    async fn test_alias_order_does_not_matter() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        write_bundle(
            dir.path(),
            "blog.example",
            &["blog.example", "b.example", "a.example"],
            2040,
        );

        assert!(!manager
            .has_configuration_changed(&domain("blog.example", &["a.example", "b.example"])));
    }

    #[tokio::test]
    async fn test_far_expiry_needs_no_renewal() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        write_bundle(dir.path(), "blog.example", &["blog.example"], 2040);

        assert!(!manager.needs_renewal_due_to_expiry(&logger(), &domain("blog.example", &[])));
    }

    #[tokio::test]
    async fn test_expired_bundle_needs_renewal() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        write_bundle(dir.path(), "blog.example", &["blog.example"], 2020);

        assert!(manager.needs_renewal_due_to_expiry(&logger(), &domain("blog.example", &[])));
    }

    #[tokio::test]
    async fn test_missing_bundle_needs_renewal() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        assert!(manager.needs_renewal_due_to_expiry(&logger(), &domain("blog.example", &[])));
    }

    // ========================================================================
    // Bundle writes
    // ========================================================================

    #[tokio::test]
    async fn test_save_bundle_atomic_and_secret() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;

        manager
            .save_bundle("blog.example", "KEY PEM", "CHAIN PEM")
            .unwrap();

        let path = dir.path().join("blog.example.pem");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "KEY PEM\nCHAIN PEM");

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        // No temp file may survive a successful write.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().contains("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_bundle_exists() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        assert!(!manager.bundle_exists("blog.example"));
        manager.save_bundle("blog.example", "K", "C").unwrap();
        assert!(manager.bundle_exists("blog.example"));
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    #[tokio::test]
    async fn test_cleanup_removes_only_expired_unmanaged() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;

        write_bundle(dir.path(), "managed.example", &["managed.example"], 2020);
        write_bundle(dir.path(), "stale.example", &["stale.example"], 2020);
        write_bundle(dir.path(), "valid.example", &["valid.example"], 2040);

        let managed = vec![domain("managed.example", &[])];
        manager.cleanup_expired_certificates(&logger(), &managed);

        assert!(
            dir.path().join("managed.example.pem").exists(),
            "managed bundles are never cleaned up, even when expired"
        );
        assert!(
            !dir.path().join("stale.example.pem").exists(),
            "expired unmanaged bundles are deleted"
        );
        assert!(
            dir.path().join("valid.example.pem").exists(),
            "unmanaged but valid bundles are retained"
        );
    }
}
