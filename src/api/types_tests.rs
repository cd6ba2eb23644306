// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for API wire types.

#[cfg(test)]
mod tests {
    use super::super::{DeployRequest, ExecRequest, RollbackRequest};

    fn deploy_body() -> serde_json::Value {
        serde_json::json!({
            "deploymentID": "01HZ0000000000000000000001",
            "targetConfig": {
                "name": "blog",
                "image": {"repository": "blog", "tag": "v1"},
                "server": "host.example",
                "domains": [{"domain": "blog.example"}],
                "acmeEmail": "ops@example.com",
                "port": "8080",
                "replicas": 1,
                "healthCheckPath": "/",
                "deploymentStrategy": "rolling"
            },
            "rollbackAppConfig": {
                "name": "blog",
                "image": {"repository": "blog", "tag": "v1", "history": {"strategy": "local", "count": 3}}
            }
        })
    }

    #[test]
    fn test_deploy_request_decodes() {
        let request: DeployRequest = serde_json::from_value(deploy_body()).unwrap();
        assert_eq!(request.deployment_id, "01HZ0000000000000000000001");
        assert_eq!(request.target_config.name, "blog");
        assert_eq!(request.rollback_app_config.name, "blog");
    }

    #[test]
    fn test_deploy_request_rejects_unknown_fields() {
        let mut body = deploy_body();
        body["extra"] = serde_json::json!(1);
        assert!(serde_json::from_value::<DeployRequest>(body).is_err());
    }

    #[test]
    fn test_rollback_request_decodes() {
        let request: RollbackRequest = serde_json::from_value(serde_json::json!({
            "targetDeploymentID": "01HZ01",
            "newDeploymentID": "01HZ03",
            "newTargetConfig": {
                "name": "blog",
                "image": {"repository": "blog", "tag": "01HZ01"}
            }
        }))
        .unwrap();
        assert_eq!(request.target_deployment_id, "01HZ01");
        assert_eq!(request.new_deployment_id, "01HZ03");
    }

    #[test]
    fn test_exec_request_defaults() {
        let request: ExecRequest =
            serde_json::from_value(serde_json::json!({"command": ["ls", "-la"]})).unwrap();
        assert_eq!(request.command, vec!["ls", "-la"]);
        assert!(request.container_id.is_empty());
        assert!(!request.all_containers);
    }
}
