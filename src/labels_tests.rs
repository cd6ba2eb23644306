// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for the container label codec.

#[cfg(test)]
mod tests {
    use super::super::{
        domain_alias_key, domain_canonical_key, ContainerLabels, APP_LABEL_ROLE, LABEL_APP_NAME,
        LABEL_DEPLOYMENT_ID, LABEL_PORT, LABEL_ROLE,
    };
    use crate::config::Domain;
    use std::collections::HashMap;

    fn sample_labels() -> ContainerLabels {
        ContainerLabels {
            app_name: "blog".to_string(),
            deployment_id: "01HZ0000000000000000000001".to_string(),
            health_check_path: "/".to_string(),
            acme_email: "ops@example.com".to_string(),
            port: "8080".to_string(),
            domains: vec![
                Domain {
                    canonical: "blog.example".to_string(),
                    aliases: vec!["www.blog.example".to_string()],
                },
                Domain {
                    canonical: "alt.example".to_string(),
                    aliases: vec![],
                },
            ],
            role: APP_LABEL_ROLE.to_string(),
        }
    }

    // ========================================================================
    // Round trip
    // ========================================================================

    #[test]
    fn test_round_trip_is_identity() {
        let original = sample_labels();
        let encoded = original.to_labels();
        let parsed = ContainerLabels::parse(&encoded).unwrap();
        assert_eq!(parsed, original, "parse(encode(d)) must equal d");
    }

    #[test]
    fn test_round_trip_preserves_domain_order() {
        let mut labels = sample_labels();
        labels.domains = vec![
            Domain {
                canonical: "z.example".to_string(),
                aliases: vec![],
            },
            Domain {
                canonical: "a.example".to_string(),
                aliases: vec!["a1.example".to_string(), "a2.example".to_string()],
            },
            Domain {
                canonical: "m.example".to_string(),
                aliases: vec![],
            },
        ];
        let parsed = ContainerLabels::parse(&labels.to_labels()).unwrap();
        let canonicals: Vec<&str> = parsed
            .domains
            .iter()
            .map(|d| d.canonical.as_str())
            .collect();
        assert_eq!(
            canonicals,
            vec!["z.example", "a.example", "m.example"],
            "domain order is defined by index, not lexicographic order"
        );
        assert_eq!(
            parsed.domains[1].aliases,
            vec!["a1.example", "a2.example"],
            "alias order within a domain is defined by index"
        );
    }

    // ========================================================================
    // Parsing defaults and tolerance
    // ========================================================================

    #[test]
    fn test_parse_applies_defaults() {
        let raw = HashMap::from([
            (LABEL_APP_NAME.to_string(), "api".to_string()),
            (LABEL_DEPLOYMENT_ID.to_string(), "01HZX".to_string()),
            (LABEL_ROLE.to_string(), APP_LABEL_ROLE.to_string()),
        ]);
        let parsed = ContainerLabels::parse(&raw).unwrap();
        assert_eq!(parsed.port, "8080");
        assert_eq!(parsed.health_check_path, "/");
        assert!(parsed.domains.is_empty());
    }

    #[test]
    fn test_parse_ignores_nonconforming_domain_keys() {
        let mut raw = sample_labels().to_labels();
        raw.insert("dev.haloy.domain.notanumber".to_string(), "x".to_string());
        raw.insert(
            "dev.haloy.domain.0.alias.bogus".to_string(),
            "y".to_string(),
        );
        let parsed = ContainerLabels::parse(&raw).unwrap();
        assert_eq!(parsed.domains.len(), 2);
        assert_eq!(parsed.domains[0].aliases, vec!["www.blog.example"]);
    }

    #[test]
    fn test_parse_sparse_domain_indices() {
        let raw = HashMap::from([
            (LABEL_APP_NAME.to_string(), "api".to_string()),
            (LABEL_DEPLOYMENT_ID.to_string(), "01HZX".to_string()),
            (LABEL_ROLE.to_string(), APP_LABEL_ROLE.to_string()),
            (domain_canonical_key(5), "late.example".to_string()),
            (domain_canonical_key(2), "early.example".to_string()),
        ]);
        let parsed = ContainerLabels::parse(&raw).unwrap();
        let canonicals: Vec<&str> = parsed
            .domains
            .iter()
            .map(|d| d.canonical.as_str())
            .collect();
        assert_eq!(canonicals, vec!["early.example", "late.example"]);
    }

    // ========================================================================
    // Validation
    // ========================================================================

    #[test]
    fn test_validate_requires_app_name() {
        let mut raw = sample_labels().to_labels();
        raw.remove(LABEL_APP_NAME);
        let err = ContainerLabels::parse(&raw).unwrap_err();
        assert!(err.to_string().contains("appName"));
    }

    #[test]
    fn test_validate_requires_deployment_id() {
        let mut raw = sample_labels().to_labels();
        raw.remove(LABEL_DEPLOYMENT_ID);
        let err = ContainerLabels::parse(&raw).unwrap_err();
        assert!(err.to_string().contains("deploymentID"));
    }

    #[test]
    fn test_validate_rejects_wrong_role() {
        let mut raw = sample_labels().to_labels();
        raw.insert(LABEL_ROLE.to_string(), "haproxy".to_string());
        assert!(ContainerLabels::parse(&raw).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_port() {
        let mut raw = sample_labels().to_labels();
        raw.insert(LABEL_PORT.to_string(), String::new());
        assert!(ContainerLabels::parse(&raw).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_acme_email() {
        let mut labels = sample_labels();
        labels.acme_email = "not-an-email".to_string();
        assert!(labels.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_domain() {
        let mut labels = sample_labels();
        labels.domains[0].canonical = "single-label".to_string();
        assert!(labels.validate().is_err());
    }

    #[test]
    fn test_empty_acme_email_is_allowed() {
        let mut labels = sample_labels();
        labels.acme_email = String::new();
        assert!(labels.validate().is_ok());
    }

    // ========================================================================
    // Key builders
    // ========================================================================

    #[test]
    fn test_key_builders() {
        assert_eq!(domain_canonical_key(0), "dev.haloy.domain.0");
        assert_eq!(domain_alias_key(1, 2), "dev.haloy.domain.1.alias.2");
    }
}
