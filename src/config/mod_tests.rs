// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for descriptor types and validation.

#[cfg(test)]
mod tests {
    use super::super::{
        AppConfig, DeploymentStrategy, Domain, Image, Port, TargetConfig,
    };

    fn sample_config() -> TargetConfig {
        serde_json::from_value(serde_json::json!({
            "name": "blog",
            "image": {"repository": "blog", "tag": "v1"},
            "server": "host.example",
            "domains": [{"domain": "blog.example"}],
            "acmeEmail": "ops@example.com",
            "port": "8080",
            "replicas": 1,
            "healthCheckPath": "/",
            "deploymentStrategy": "rolling"
        }))
        .unwrap()
    }

    // ========================================================================
    // Deserialization
    // ========================================================================

    #[test]
    fn test_deserialize_full_descriptor() {
        let config = sample_config();
        assert_eq!(config.name, "blog");
        assert_eq!(config.image.image_ref(), "blog:v1");
        assert_eq!(config.deployment_strategy, DeploymentStrategy::Rolling);
        assert_eq!(config.domains[0].canonical, "blog.example");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result: Result<TargetConfig, _> = serde_json::from_value(serde_json::json!({
            "name": "blog",
            "image": {"repository": "blog"},
            "surprise": true
        }));
        assert!(result.is_err(), "unknown descriptor fields must be rejected");
    }

    #[test]
    fn test_port_accepts_string_or_integer() {
        let from_str: Port = serde_json::from_value(serde_json::json!("3000")).unwrap();
        let from_int: Port = serde_json::from_value(serde_json::json!(3000)).unwrap();
        assert_eq!(from_str, from_int);
        assert_eq!(from_int.as_str(), "3000");
    }

    #[test]
    fn test_strategy_replace_parses() {
        let strategy: DeploymentStrategy = serde_json::from_value(serde_json::json!("replace")).unwrap();
        assert_eq!(strategy, DeploymentStrategy::Replace);
    }

    // ========================================================================
    // Effective defaults
    // ========================================================================

    #[test]
    fn test_effective_defaults() {
        let config = TargetConfig {
            name: "api".to_string(),
            image: Image {
                repository: "api".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(config.port(), "8080");
        assert_eq!(config.health_check_path(), "/");
        assert_eq!(config.replicas(), 1);
    }

    // ========================================================================
    // Validation
    // ========================================================================

    #[test]
    fn test_validate_rejects_bad_name() {
        let mut config = sample_config();
        config.name = "-bad".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_image_repository() {
        let mut config = sample_config();
        config.image.repository = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_health_check_path_must_be_rooted() {
        let mut config = sample_config();
        config.health_check_path = "health".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must start with '/'"));
    }

    #[test]
    fn test_validate_rejects_non_numeric_port() {
        let mut config = sample_config();
        config.port = Port::from("http");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_replicas() {
        let mut config = sample_config();
        config.replicas = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_volumes() {
        let mut config = sample_config();
        config.volumes = vec!["/data:/var/data".to_string(), "named-vol:/cache".to_string()];
        assert!(config.validate().is_ok());

        config.volumes = vec!["no-target".to_string()];
        assert!(config.validate().is_err());

        config.volumes = vec!["relative/path:/data".to_string()];
        assert!(config.validate().is_err(), "bind paths must be absolute");
    }

    #[test]
    fn test_validate_rejects_invalid_alias() {
        let mut config = sample_config();
        config.domains = vec![Domain {
            canonical: "blog.example".to_string(),
            aliases: vec!["bad_alias".to_string()],
        }];
        assert!(config.validate().is_err());
    }

    // ========================================================================
    // AppConfig passthrough
    // ========================================================================

    #[test]
    fn test_app_config_preserves_unknown_fields() {
        let raw = serde_json::json!({
            "name": "blog",
            "image": {"repository": "blog", "tag": "v1"},
            "secretProviders": {"onepassword": {"vault": "infra"}},
            "preDeploy": ["echo hi"]
        });
        let config: AppConfig = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(config.name, "blog");
        let round_tripped = serde_json::to_value(&config).unwrap();
        assert_eq!(
            round_tripped["secretProviders"]["onepassword"]["vault"],
            "infra",
            "loader-side fields must survive the round trip for rollbacks"
        );
        assert_eq!(round_tripped["preDeploy"][0], "echo hi");
    }
}
