// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Debouncing primitives.
//!
//! [`Debouncer`] coalesces repeated calls per key into a single deferred
//! action after a quiet period. [`AppDebouncer`] specializes the pattern for
//! container event bursts: it buffers events per application and emits one
//! summary describing the burst once the application goes quiet.

use crate::config::Domain;
use crate::docker::ContainerEvent;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Key-partitioned timer map executing a deferred action per key.
pub struct Debouncer {
    delay: Duration,
    timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl Debouncer {
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Schedule or reset the timer for `key`. When the delay elapses without
    /// another call for the same key, `action` runs on a background task.
    pub fn debounce<F>(&self, key: &str, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut timers = self.timers.lock().expect("debouncer mutex poisoned");

        if let Some(timer) = timers.remove(key) {
            timer.abort();
        }

        let delay = self.delay;
        let timers_ref = Arc::clone(&self.timers);
        let key_owned = key.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            timers_ref
                .lock()
                .expect("debouncer mutex poisoned")
                .remove(&key_owned);
            action.await;
        });

        timers.insert(key.to_string(), handle);
    }

    /// Cancel all pending actions.
    pub fn stop(&self) {
        let mut timers = self.timers.lock().expect("debouncer mutex poisoned");
        for (_, timer) in timers.drain() {
            timer.abort();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Summary of one debounced burst of container events for an application.
#[derive(Debug, Clone)]
pub struct DebouncedAppEvent {
    pub app_name: String,
    /// Highest deployment id observed in the burst.
    pub deployment_id: String,
    /// Domains of the event carrying that deployment id.
    pub domains: Vec<Domain>,
    /// Action of the event carrying that deployment id.
    pub action: String,
    /// Whether any event in the burst was a `start`. A start means a new
    /// deployment is coming up, which drives the completion signal.
    pub saw_start: bool,
}

struct AppDebouncerInner {
    timers: HashMap<String, JoinHandle<()>>,
    captured: HashMap<String, Vec<ContainerEvent>>,
}

/// Coalesces bursts of container events per application into a single
/// [`DebouncedAppEvent`] on the output channel after a quiet period.
pub struct AppDebouncer {
    delay: Duration,
    inner: Arc<Mutex<AppDebouncerInner>>,
    output: mpsc::Sender<DebouncedAppEvent>,
}

impl AppDebouncer {
    #[must_use]
    pub fn new(delay: Duration, output: mpsc::Sender<DebouncedAppEvent>) -> Self {
        Self {
            delay,
            inner: Arc::new(Mutex::new(AppDebouncerInner {
                timers: HashMap::new(),
                captured: HashMap::new(),
            })),
            output,
        }
    }

    /// Buffer an event for its application and reset the application's
    /// quiet-period timer.
    pub fn capture_event(&self, event: ContainerEvent) {
        let app_name = event.labels.app_name.clone();

        tracing::debug!(
            app = %app_name,
            action = %event.action,
            deployment_id = %event.labels.deployment_id,
            "Captured event for debouncing"
        );

        let mut inner = self.inner.lock().expect("app debouncer mutex poisoned");
        inner
            .captured
            .entry(app_name.clone())
            .or_default()
            .push(event);

        if let Some(timer) = inner.timers.remove(&app_name) {
            timer.abort();
        }

        let delay = self.delay;
        let inner_ref = Arc::clone(&self.inner);
        let output = self.output.clone();
        let key = app_name.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(summary) = summarize_burst(&inner_ref, &key) {
                let _ = output.send(summary).await;
            }
        });

        inner.timers.insert(app_name, handle);
    }

    /// Cancel all pending timers and drop buffered events.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().expect("app debouncer mutex poisoned");
        for (_, timer) in inner.timers.drain() {
            timer.abort();
        }
        inner.captured.clear();
    }
}

impl Drop for AppDebouncer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Drain the buffered burst for `app_name` and build its summary: the event
/// with the maximum deployment id wins, and any `start` in the burst is
/// remembered.
fn summarize_burst(
    inner: &Arc<Mutex<AppDebouncerInner>>,
    app_name: &str,
) -> Option<DebouncedAppEvent> {
    let mut guard = inner.lock().expect("app debouncer mutex poisoned");
    guard.timers.remove(app_name);
    let events = guard.captured.remove(app_name)?;
    drop(guard);

    let mut latest = events.first()?;
    let mut saw_start = false;
    for event in &events {
        if event.labels.deployment_id > latest.labels.deployment_id {
            latest = event;
        }
        if event.action == "start" {
            saw_start = true;
        }
    }

    Some(DebouncedAppEvent {
        app_name: app_name.to_string(),
        deployment_id: latest.labels.deployment_id.clone(),
        domains: latest.labels.domains.clone(),
        action: latest.action.clone(),
        saw_start,
    })
}

#[cfg(test)]
#[path = "debouncer_tests.rs"]
mod debouncer_tests;
