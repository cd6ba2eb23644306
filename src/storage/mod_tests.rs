// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for the deployment store.

#[cfg(test)]
mod tests {
    use super::super::{Db, DeploymentRecord};

    async fn test_db() -> (tempfile::TempDir, Db) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::connect(&dir.path().join("haloy.db")).await.unwrap();
        (dir, db)
    }

    fn record(id: &str, app: &str) -> DeploymentRecord {
        DeploymentRecord {
            id: id.to_string(),
            app_name: app.to_string(),
            raw_app_config: serde_json::json!({
                "name": app,
                "image": {"repository": app, "tag": "v1"}
            })
            .to_string(),
            deployed_image: serde_json::json!({
                "repository": app,
                "tag": id,
                "history": {"strategy": "local", "count": 3}
            })
            .to_string(),
            rolled_back_from: None,
        }
    }

    #[tokio::test]
    async fn test_save_and_get_round_trip() {
        let (_dir, db) = test_db().await;
        db.save_deployment(&record("01HZ01", "blog")).await.unwrap();

        let loaded = db.get_deployment("01HZ01").await.unwrap();
        assert_eq!(loaded.app_name, "blog");
        assert_eq!(loaded.image_ref().unwrap(), "blog:01HZ01");
        assert_eq!(loaded.app_config().unwrap().name, "blog");
        assert!(loaded.rolled_back_from.is_none());
    }

    #[tokio::test]
    async fn test_get_missing_record_errors() {
        let (_dir, db) = test_db().await;
        let err = db.get_deployment("nope").await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let (_dir, db) = test_db().await;
        db.save_deployment(&record("01HZ01", "blog")).await.unwrap();
        assert!(db.save_deployment(&record("01HZ01", "blog")).await.is_err());
    }

    #[tokio::test]
    async fn test_history_newest_first() {
        let (_dir, db) = test_db().await;
        for id in ["01HZ01", "01HZ03", "01HZ02"] {
            db.save_deployment(&record(id, "blog")).await.unwrap();
        }
        db.save_deployment(&record("01HZ09", "other")).await.unwrap();

        let history = db.deployment_history("blog", 50).await.unwrap();
        let ids: Vec<&str> = history.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["01HZ03", "01HZ02", "01HZ01"]);
    }

    #[tokio::test]
    async fn test_history_respects_limit() {
        let (_dir, db) = test_db().await;
        for id in ["01HZ01", "01HZ02", "01HZ03"] {
            db.save_deployment(&record(id, "blog")).await.unwrap();
        }
        let history = db.deployment_history("blog", 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, "01HZ03");
    }

    #[tokio::test]
    async fn test_prune_keeps_newest_n() {
        let (_dir, db) = test_db().await;
        for id in ["01HZ01", "01HZ02", "01HZ03", "01HZ04", "01HZ05"] {
            db.save_deployment(&record(id, "blog")).await.unwrap();
        }
        db.save_deployment(&record("01HZ00", "other")).await.unwrap();

        let pruned = db.prune_old_deployments("blog", 2).await.unwrap();
        assert_eq!(pruned, 3);

        let remaining = db.deployment_history("blog", 50).await.unwrap();
        let ids: Vec<&str> = remaining.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["01HZ05", "01HZ04"],
            "exactly the N records with the largest ids must remain"
        );

        // Other apps are untouched.
        assert_eq!(db.deployment_history("other", 50).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_prune_noop_when_under_limit() {
        let (_dir, db) = test_db().await;
        db.save_deployment(&record("01HZ01", "blog")).await.unwrap();
        let pruned = db.prune_old_deployments("blog", 6).await.unwrap();
        assert_eq!(pruned, 0);
    }

    #[tokio::test]
    async fn test_rolled_back_from_reference() {
        let (_dir, db) = test_db().await;
        db.save_deployment(&record("01HZ01", "blog")).await.unwrap();

        let mut rollback = record("01HZ02", "blog");
        rollback.rolled_back_from = Some("01HZ01".to_string());
        db.save_deployment(&rollback).await.unwrap();

        let loaded = db.get_deployment("01HZ02").await.unwrap();
        assert_eq!(loaded.rolled_back_from.as_deref(), Some("01HZ01"));
    }
}
