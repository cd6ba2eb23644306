// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Container lifecycle event subscription.
//!
//! Streams Docker events filtered to the lifecycle actions the updater
//! cares about, inspects each container, and forwards only app-role
//! containers with parseable labels. Transient stream errors trigger a
//! reconnect after a back-off; the error channel carries what happened.

use crate::helpers::safe_id_prefix;
use crate::labels::{ContainerLabels, APP_LABEL_ROLE, LABEL_ROLE};
use anyhow::anyhow;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// Delay before reconnecting a dropped event stream.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Lifecycle actions forwarded to the debouncer.
const ALLOWED_ACTIONS: [&str; 5] = ["start", "restart", "die", "stop", "kill"];

/// A container lifecycle event enriched with its parsed labels.
#[derive(Debug, Clone)]
pub struct ContainerEvent {
    pub action: String,
    pub container_id: String,
    pub labels: ContainerLabels,
}

/// Listen for container lifecycle events until the channels close.
///
/// Each allowed event is resolved by inspecting the container; only
/// containers labelled with the app role and carrying a valid label set are
/// forwarded on `events_tx`. Stream errors are reported on `errors_tx` and
/// followed by a reconnect attempt after [`RECONNECT_BACKOFF`].
pub async fn listen_for_container_events(
    docker: Docker,
    events_tx: mpsc::Sender<ContainerEvent>,
    errors_tx: mpsc::Sender<anyhow::Error>,
) {
    loop {
        let options = EventsOptions::<String> {
            filters: HashMap::from([("type".to_string(), vec!["container".to_string()])]),
            ..Default::default()
        };
        let mut stream = docker.events(Some(options));

        while let Some(item) = stream.next().await {
            let event = match item {
                Ok(event) => event,
                Err(err) => {
                    if errors_tx.send(anyhow!(err)).await.is_err() {
                        return;
                    }
                    break;
                }
            };

            let action = event.action.as_deref().unwrap_or_default();
            if !ALLOWED_ACTIONS.contains(&action) {
                continue;
            }

            let Some(container_id) = event.actor.as_ref().and_then(|actor| actor.id.clone())
            else {
                continue;
            };

            let inspect = match docker.inspect_container(&container_id, None).await {
                Ok(inspect) => inspect,
                Err(err) => {
                    tracing::error!(
                        container_id = safe_id_prefix(&container_id),
                        error = %err,
                        "Error inspecting container"
                    );
                    continue;
                }
            };

            let labels_map = inspect
                .config
                .as_ref()
                .and_then(|config| config.labels.clone())
                .unwrap_or_default();

            // Only containers marked with the app role are managed.
            if labels_map.get(LABEL_ROLE).map(String::as_str) != Some(APP_LABEL_ROLE) {
                tracing::debug!(
                    container_id = safe_id_prefix(&container_id),
                    "Container not eligible for haloy management"
                );
                continue;
            }

            let labels = match ContainerLabels::parse(&labels_map) {
                Ok(labels) => labels,
                Err(err) => {
                    tracing::error!(error = %err, "Error parsing container labels");
                    continue;
                }
            };

            tracing::debug!(
                event = action,
                container_id = safe_id_prefix(&container_id),
                deployment_id = %labels.deployment_id,
                "Container is eligible"
            );

            let container_event = ContainerEvent {
                action: action.to_string(),
                container_id,
                labels,
            };
            if events_tx.send(container_event).await.is_err() {
                return;
            }
        }

        // Stream ended or errored: reconnect after a back-off unless the
        // receiver side is gone.
        if events_tx.is_closed() {
            return;
        }
        tokio::time::sleep(RECONNECT_BACKOFF).await;
    }
}
