// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for image reference and registry resolution.

#[cfg(test)]
mod tests {
    use super::super::{BuildPush, HistoryStrategy, Image, ImageBuild, RegistryAuth};

    #[test]
    fn test_image_ref_with_tag() {
        let image = Image {
            repository: "blog".to_string(),
            tag: "v1".to_string(),
            ..Default::default()
        };
        assert_eq!(image.image_ref(), "blog:v1");
    }

    #[test]
    fn test_image_ref_defaults_to_latest() {
        let image = Image {
            repository: "blog".to_string(),
            ..Default::default()
        };
        assert_eq!(image.image_ref(), "blog:latest");
    }

    #[test]
    fn test_registry_server_from_auth() {
        let image = Image {
            repository: "blog".to_string(),
            registry_auth: Some(RegistryAuth {
                server: "registry.example.com".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(image.registry_server(), "registry.example.com");
    }

    #[test]
    fn test_registry_server_inferred_from_repository() {
        let image = Image {
            repository: "ghcr.io/acme/blog".to_string(),
            ..Default::default()
        };
        assert_eq!(image.registry_server(), "ghcr.io");

        let with_port = Image {
            repository: "localhost:5000/blog".to_string(),
            ..Default::default()
        };
        assert_eq!(with_port.registry_server(), "localhost:5000");
    }

    #[test]
    fn test_registry_server_defaults_to_docker_hub() {
        let image = Image {
            repository: "library/blog".to_string(),
            ..Default::default()
        };
        assert_eq!(
            image.registry_server(),
            "index.docker.io",
            "a plain namespace is not a registry host"
        );
    }

    #[test]
    fn test_history_strategy_default_is_local() {
        let image = Image::default();
        assert_eq!(image.history_strategy(), HistoryStrategy::Local);
    }

    #[test]
    fn test_uploaded_to_host() {
        let mut image = Image {
            repository: "blog".to_string(),
            ..Default::default()
        };
        assert!(!image.uploaded_to_host());

        image.build = Some(ImageBuild {
            push: Some(BuildPush::Server),
            ..Default::default()
        });
        assert!(image.uploaded_to_host());

        image.build = Some(ImageBuild {
            push: Some(BuildPush::Registry),
            ..Default::default()
        });
        assert!(!image.uploaded_to_host());
    }

    #[test]
    fn test_history_strategy_serde_names() {
        let strategy: HistoryStrategy = serde_json::from_value(serde_json::json!("registry")).unwrap();
        assert_eq!(strategy, HistoryStrategy::Registry);
        let none: HistoryStrategy = serde_json::from_value(serde_json::json!("none")).unwrap();
        assert_eq!(none, HistoryStrategy::None);
    }
}
