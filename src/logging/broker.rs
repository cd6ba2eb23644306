// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Fan-out of structured log records to subscribers with bounded replay.
//!
//! Two subscription modes exist: a general stream every subscriber shares,
//! and at most one stream per deployment id. Both replay a bounded history
//! buffer on subscribe and drop subscribers that cannot keep up rather than
//! stalling publishers.

use super::LogEntry;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Maximum buffered records per stream (general and per-deployment).
const MAX_BUFFER: usize = 100;

/// Capacity of every subscriber channel.
const CHANNEL_CAPACITY: usize = 100;

/// Per-send timeout while replaying history to a fresh subscriber.
const REPLAY_SEND_TIMEOUT: Duration = Duration::from_secs(2);

struct BrokerInner {
    /// subscriber id -> channel
    streams: HashMap<u64, mpsc::Sender<LogEntry>>,
    buffer: VecDeque<LogEntry>,
    /// One channel per deployment id.
    deployment_streams: HashMap<String, mpsc::Sender<LogEntry>>,
    deployment_buffers: HashMap<String, VecDeque<LogEntry>>,
    next_subscriber_id: u64,
    closed: bool,
}

/// Log fan-out hub. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct LogBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl Default for LogBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BrokerInner {
                streams: HashMap::new(),
                buffer: VecDeque::new(),
                deployment_streams: HashMap::new(),
                deployment_buffers: HashMap::new(),
                next_subscriber_id: 1,
                closed: false,
            })),
        }
    }

    /// Publish a record to the general stream and, when it carries a
    /// deployment id, to that deployment's stream.
    ///
    /// Never blocks: subscribers whose channel is full are closed and
    /// removed.
    pub fn publish(&self, entry: LogEntry) {
        let mut inner = self.inner.lock().expect("log broker mutex poisoned");
        if inner.closed {
            return;
        }

        inner.buffer.push_back(entry.clone());
        while inner.buffer.len() > MAX_BUFFER {
            inner.buffer.pop_front();
        }

        inner
            .streams
            .retain(|_, tx| tx.try_send(entry.clone()).is_ok());

        if let Some(deployment_id) = entry.deployment_id.clone() {
            let buffer = inner
                .deployment_buffers
                .entry(deployment_id.clone())
                .or_default();
            buffer.push_back(entry.clone());
            while buffer.len() > MAX_BUFFER {
                buffer.pop_front();
            }

            let send_failed = inner
                .deployment_streams
                .get(&deployment_id)
                .is_some_and(|tx| tx.try_send(entry).is_err());
            if send_failed {
                inner.deployment_streams.remove(&deployment_id);
                inner.deployment_buffers.remove(&deployment_id);
            }
        }
    }

    /// Subscribe to all records. Buffered history (up to [`MAX_BUFFER`]
    /// entries) is replayed on a background task before live records
    /// interleave; a subscriber too slow to accept the replay is dropped.
    ///
    /// Returns the receiving channel and the subscriber id to pass to
    /// [`Self::unsubscribe_general`].
    #[must_use]
    pub fn subscribe_general(&self) -> (mpsc::Receiver<LogEntry>, u64) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        let (subscriber_id, history) = {
            let mut inner = self.inner.lock().expect("log broker mutex poisoned");
            if inner.closed {
                return (rx, 0);
            }
            let id = inner.next_subscriber_id;
            inner.next_subscriber_id += 1;
            let history: Vec<LogEntry> = inner.buffer.iter().cloned().collect();
            inner.streams.insert(id, tx.clone());
            (id, history)
        };

        if !history.is_empty() {
            let broker = self.clone();
            tokio::spawn(async move {
                for entry in history {
                    if tokio::time::timeout(REPLAY_SEND_TIMEOUT, tx.send(entry))
                        .await
                        .map_or(true, |sent| sent.is_err())
                    {
                        let mut inner = broker.inner.lock().expect("log broker mutex poisoned");
                        if inner
                            .streams
                            .get(&subscriber_id)
                            .is_some_and(|stored| stored.same_channel(&tx))
                        {
                            inner.streams.remove(&subscriber_id);
                        }
                        return;
                    }
                }
            });
        }

        (rx, subscriber_id)
    }

    /// Remove a general subscriber.
    pub fn unsubscribe_general(&self, subscriber_id: u64) {
        let mut inner = self.inner.lock().expect("log broker mutex poisoned");
        inner.streams.remove(&subscriber_id);
    }

    /// Subscribe to a single deployment's records.
    ///
    /// At most one channel exists per deployment id: a new subscription
    /// replaces (and thereby closes) any previous one. The deployment's
    /// buffered history is replayed first, with the same slow-subscriber
    /// semantics as the general stream.
    #[must_use]
    pub fn subscribe_deployment(&self, deployment_id: &str) -> mpsc::Receiver<LogEntry> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        let history = {
            let mut inner = self.inner.lock().expect("log broker mutex poisoned");
            if inner.closed {
                return rx;
            }
            let history: Vec<LogEntry> = inner
                .deployment_buffers
                .get(deployment_id)
                .map(|buffer| buffer.iter().cloned().collect())
                .unwrap_or_default();
            inner
                .deployment_streams
                .insert(deployment_id.to_string(), tx.clone());
            history
        };

        if !history.is_empty() {
            let broker = self.clone();
            let deployment_id = deployment_id.to_string();
            tokio::spawn(async move {
                for entry in history {
                    if tokio::time::timeout(REPLAY_SEND_TIMEOUT, tx.send(entry))
                        .await
                        .map_or(true, |sent| sent.is_err())
                    {
                        let mut inner = broker.inner.lock().expect("log broker mutex poisoned");
                        if inner
                            .deployment_streams
                            .get(&deployment_id)
                            .is_some_and(|stored| stored.same_channel(&tx))
                        {
                            inner.deployment_streams.remove(&deployment_id);
                            inner.deployment_buffers.remove(&deployment_id);
                        }
                        return;
                    }
                }
            });
        }

        rx
    }

    /// Remove a deployment subscriber and drop its buffered history.
    pub fn unsubscribe_deployment(&self, deployment_id: &str) {
        let mut inner = self.inner.lock().expect("log broker mutex poisoned");
        inner.deployment_streams.remove(deployment_id);
        inner.deployment_buffers.remove(deployment_id);
    }

    /// Shut the broker down: close all channels, drop all buffers. Further
    /// publishes and subscriptions are no-ops.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("log broker mutex poisoned");
        inner.closed = true;
        inner.streams.clear();
        inner.deployment_streams.clear();
        inner.buffer.clear();
        inner.deployment_buffers.clear();
    }
}

#[cfg(test)]
#[path = "broker_tests.rs"]
mod broker_tests;
