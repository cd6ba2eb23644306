// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for the registry diff engine and eligibility helpers.

#[cfg(test)]
mod tests {
    use super::super::{
        compare_deployments, insert_instance, validate_container_port, Deployment,
        DeploymentInstance,
    };
    use crate::config::Domain;
    use crate::labels::{ContainerLabels, APP_LABEL_ROLE};
    use std::collections::HashMap;

    fn labels(app: &str, deployment_id: &str) -> ContainerLabels {
        ContainerLabels {
            app_name: app.to_string(),
            deployment_id: deployment_id.to_string(),
            health_check_path: "/".to_string(),
            acme_email: String::new(),
            port: "8080".to_string(),
            domains: vec![Domain {
                canonical: format!("{app}.example"),
                aliases: vec![],
            }],
            role: APP_LABEL_ROLE.to_string(),
        }
    }

    fn instance(container_id: &str) -> DeploymentInstance {
        DeploymentInstance {
            container_id: container_id.to_string(),
            ip: "172.18.0.9".to_string(),
            port: "8080".to_string(),
        }
    }

    fn deployment(app: &str, deployment_id: &str, container_ids: &[&str]) -> Deployment {
        Deployment {
            labels: labels(app, deployment_id),
            instances: container_ids.iter().map(|id| instance(id)).collect(),
        }
    }

    fn snapshot(deployments: &[Deployment]) -> HashMap<String, Deployment> {
        deployments
            .iter()
            .map(|d| (d.labels.app_name.clone(), d.clone()))
            .collect()
    }

    // ========================================================================
    // insert_instance - active deployment selection
    // ========================================================================

    #[test]
    fn test_insert_aggregates_same_deployment_id() {
        let mut map = HashMap::new();
        insert_instance(&mut map, labels("api", "01HZ02"), instance("c1"));
        insert_instance(&mut map, labels("api", "01HZ02"), instance("c2"));

        let deployment = &map["api"];
        assert_eq!(deployment.instances.len(), 2);
    }

    #[test]
    fn test_insert_prefers_higher_deployment_id() {
        let mut map = HashMap::new();
        insert_instance(&mut map, labels("api", "01HZ02"), instance("old"));
        insert_instance(&mut map, labels("api", "01HZ05"), instance("new"));

        let deployment = &map["api"];
        assert_eq!(deployment.labels.deployment_id, "01HZ05");
        assert_eq!(deployment.instances.len(), 1);
        assert_eq!(deployment.instances[0].container_id, "new");
    }

    #[test]
    fn test_insert_ignores_lower_deployment_id() {
        let mut map = HashMap::new();
        insert_instance(&mut map, labels("api", "01HZ05"), instance("new"));
        insert_instance(&mut map, labels("api", "01HZ02"), instance("old"));

        let deployment = &map["api"];
        assert_eq!(
            deployment.labels.deployment_id, "01HZ05",
            "an older container must never displace the active deployment"
        );
        assert_eq!(deployment.instances[0].container_id, "new");
    }

    // ========================================================================
    // compare_deployments
    // ========================================================================

    #[test]
    fn test_compare_added() {
        let old = snapshot(&[]);
        let new = snapshot(&[deployment("api", "01HZ01", &["c1"])]);

        let result = compare_deployments(&old, &new);
        assert!(result.added.contains_key("api"));
        assert!(result.updated.is_empty());
        assert!(result.removed.is_empty());
        assert!(result.has_changed());
    }

    #[test]
    fn test_compare_removed() {
        let old = snapshot(&[deployment("api", "01HZ01", &["c1"])]);
        let new = snapshot(&[]);

        let result = compare_deployments(&old, &new);
        assert!(result.removed.contains_key("api"));
        assert!(result.has_changed());
    }

    #[test]
    fn test_compare_updated_on_new_deployment_id() {
        let old = snapshot(&[deployment("api", "01HZ01", &["c1"])]);
        let new = snapshot(&[deployment("api", "01HZ02", &["c2"])]);

        let result = compare_deployments(&old, &new);
        assert!(result.updated.contains_key("api"));
        assert_eq!(result.updated["api"].labels.deployment_id, "01HZ02");
    }

    #[test]
    fn test_compare_updated_on_instance_change() {
        let old = snapshot(&[deployment("api", "01HZ01", &["c1", "c2"])]);
        let new = snapshot(&[deployment("api", "01HZ01", &["c1", "c3"])]);

        let result = compare_deployments(&old, &new);
        assert!(
            result.updated.contains_key("api"),
            "a changed instance id set with the same deployment id is an update"
        );
    }

    #[test]
    fn test_compare_unchanged() {
        let old = snapshot(&[deployment("api", "01HZ01", &["c1", "c2"])]);
        let new = snapshot(&[deployment("api", "01HZ01", &["c2", "c1"])]);

        let result = compare_deployments(&old, &new);
        assert!(
            !result.has_changed(),
            "instance order must not matter for equality"
        );
    }

    #[test]
    fn test_compare_mixed() {
        let old = snapshot(&[
            deployment("api", "01HZ01", &["c1"]),
            deployment("blog", "01HZ01", &["b1"]),
        ]);
        let new = snapshot(&[
            deployment("blog", "01HZ02", &["b2"]),
            deployment("shop", "01HZ01", &["s1"]),
        ]);

        let result = compare_deployments(&old, &new);
        assert!(result.removed.contains_key("api"));
        assert!(result.updated.contains_key("blog"));
        assert!(result.added.contains_key("shop"));
    }

    // ========================================================================
    // validate_container_port
    // ========================================================================

    fn exposed(ports: &[&str]) -> HashMap<String, HashMap<(), ()>> {
        ports
            .iter()
            .map(|p| (format!("{p}/tcp"), HashMap::new()))
            .collect()
    }

    #[test]
    fn test_port_matches_exposed() {
        let ports = exposed(&["8080", "9000"]);
        assert!(validate_container_port(Some(&ports), "8080"));
        assert!(validate_container_port(Some(&ports), "9000"));
    }

    #[test]
    fn test_port_mismatch_rejected() {
        let ports = exposed(&["3000"]);
        assert!(!validate_container_port(Some(&ports), "8080"));
    }

    #[test]
    fn test_no_exposed_ports_passes() {
        assert!(validate_container_port(None, "8080"));
        let empty = exposed(&[]);
        assert!(
            validate_container_port(Some(&empty), "8080"),
            "images declaring no ports cannot be validated and must pass"
        );
    }
}
