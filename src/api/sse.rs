// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! SSE plumbing for log streams.
//!
//! Frames every log record as `data: <json>\n\n`, opens with an immediate
//! keepalive comment, sends a keepalive every 30 seconds, and (for
//! per-deployment streams) ends the stream on the record that marks the
//! deployment complete or failed. Unsubscription happens when the stream is
//! dropped, whether the client disconnected or the stream terminated.

use crate::logging::{LogBroker, LogEntry};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Cleanup handle owned by a stream; unsubscribes on drop.
enum Cleanup {
    General { broker: LogBroker, subscriber_id: u64 },
    Deployment { broker: LogBroker, deployment_id: String },
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        match self {
            Self::General {
                broker,
                subscriber_id,
            } => broker.unsubscribe_general(*subscriber_id),
            Self::Deployment {
                broker,
                deployment_id,
            } => broker.unsubscribe_deployment(deployment_id),
        }
    }
}

fn entry_event(entry: &LogEntry) -> Event {
    Event::default()
        .json_data(entry)
        .unwrap_or_else(|_| Event::default().data("{}"))
}

fn log_stream(
    rx: mpsc::Receiver<LogEntry>,
    cleanup: Cleanup,
    terminate_on_completion: bool,
) -> impl Stream<Item = Result<Event, Infallible>> {
    // The cleanup guard travels inside the unfold state so it drops exactly
    // when the stream does.
    let initial = futures::stream::once(async { Ok(Event::default().comment("keepalive")) });
    let records = futures::stream::unfold(
        (rx, cleanup, false),
        move |(mut rx, cleanup, finished)| async move {
            if finished {
                return None;
            }
            let entry = rx.recv().await?;
            let terminal = terminate_on_completion
                && (entry.is_deployment_complete || entry.is_deployment_failed);
            Some((Ok(entry_event(&entry)), (rx, cleanup, terminal)))
        },
    );
    futures::stream::StreamExt::chain(initial, records)
}

/// SSE response for the general log stream.
pub fn general_log_sse(
    broker: &LogBroker,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (rx, subscriber_id) = broker.subscribe_general();
    let cleanup = Cleanup::General {
        broker: broker.clone(),
        subscriber_id,
    };
    Sse::new(log_stream(rx, cleanup, false)).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    )
}

/// SSE response for one deployment's log stream; ends on the terminal
/// record.
pub fn deployment_log_sse(
    broker: &LogBroker,
    deployment_id: &str,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = broker.subscribe_deployment(deployment_id);
    let cleanup = Cleanup::Deployment {
        broker: broker.clone(),
        deployment_id: deployment_id.to_string(),
    };
    Sse::new(log_stream(rx, cleanup, true)).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    )
}
