// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for log entries and the deployment logger.

#[cfg(test)]
mod tests {
    use super::super::{DeploymentLogger, LogBroker, LogEntry, LogLevel};

    #[test]
    fn test_entry_serialization_shape() {
        let mut entry = LogEntry::new(LogLevel::Info, "deployed");
        entry.deployment_id = Some("01HZX".to_string());
        entry.app_name = Some("blog".to_string());
        entry.is_deployment_complete = true;
        entry.is_deployment_success = true;

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["level"], "INFO");
        assert_eq!(value["message"], "deployed");
        assert_eq!(value["deploymentID"], "01HZX");
        assert_eq!(value["appName"], "blog");
        assert_eq!(value["isDeploymentComplete"], true);
        assert_eq!(value["isDeploymentSuccess"], true);
        assert!(
            value.get("isDeploymentFailed").is_none(),
            "false flags are omitted from the wire format"
        );
        assert!(value.get("domains").is_none());
    }

    #[test]
    fn test_entry_deserializes_without_optional_fields() {
        let entry: LogEntry =
            serde_json::from_str(r#"{"level":"ERROR","message":"x","timestamp":"2026-01-01T00:00:00Z"}"#)
                .unwrap();
        assert_eq!(entry.level, LogLevel::Error);
        assert!(entry.deployment_id.is_none());
        assert!(!entry.is_deployment_failed);
    }

    #[tokio::test]
    async fn test_deployment_logger_tags_records() {
        let broker = LogBroker::new();
        let mut rx = broker.subscribe_deployment("01HZX");

        let logger = DeploymentLogger::deployment(broker, "01HZX");
        logger.info("starting");

        let received = rx.recv().await.unwrap();
        assert_eq!(received.deployment_id.as_deref(), Some("01HZX"));
        assert_eq!(received.message, "starting");
    }

    #[tokio::test]
    async fn test_deployment_complete_record() {
        let broker = LogBroker::new();
        let mut rx = broker.subscribe_deployment("01HZX");

        let logger = DeploymentLogger::deployment(broker, "01HZX");
        logger.deployment_complete("blog", &["blog.example".to_string()], "Successfully deployed blog");

        let received = rx.recv().await.unwrap();
        assert!(received.is_deployment_complete);
        assert!(received.is_deployment_success);
        assert!(!received.is_deployment_failed);
        assert_eq!(received.app_name.as_deref(), Some("blog"));
        assert_eq!(received.domains, vec!["blog.example"]);
    }

    #[tokio::test]
    async fn test_deployment_failed_record_carries_error() {
        let broker = LogBroker::new();
        let mut rx = broker.subscribe_deployment("01HZX");

        let logger = DeploymentLogger::deployment(broker, "01HZX");
        let err = anyhow::anyhow!("health check failed");
        logger.deployment_failed("blog", "Deployment failed", &err);

        let received = rx.recv().await.unwrap();
        assert!(received.is_deployment_complete, "failure also ends the stream");
        assert!(received.is_deployment_failed);
        assert!(!received.is_deployment_success);
        assert!(received.fields["error"]
            .as_str()
            .unwrap()
            .contains("health check failed"));
    }

    #[tokio::test]
    async fn test_init_complete_record() {
        let broker = LogBroker::new();
        let (mut rx, _id) = broker.subscribe_general();

        let logger = DeploymentLogger::general(broker);
        logger.init_complete("haloyd successfully initialized");

        let received = rx.recv().await.unwrap();
        assert!(received.is_haloyd_init_complete);
    }
}
