// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for the log broker fan-out and replay semantics.

#[cfg(test)]
mod tests {
    use super::super::LogBroker;
    use crate::logging::{LogEntry, LogLevel};
    use std::time::Duration;

    fn entry(message: &str) -> LogEntry {
        LogEntry::new(LogLevel::Info, message)
    }

    fn deployment_entry(message: &str, deployment_id: &str) -> LogEntry {
        let mut e = entry(message);
        e.deployment_id = Some(deployment_id.to_string());
        e
    }

    #[tokio::test]
    async fn test_live_publish_reaches_general_subscriber() {
        let broker = LogBroker::new();
        let (mut rx, _id) = broker.subscribe_general();

        broker.publish(entry("hello"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.message, "hello");
    }

    #[tokio::test]
    async fn test_history_replayed_to_new_subscriber() {
        let broker = LogBroker::new();
        broker.publish(entry("one"));
        broker.publish(entry("two"));

        let (mut rx, _id) = broker.subscribe_general();
        assert_eq!(rx.recv().await.unwrap().message, "one");
        assert_eq!(rx.recv().await.unwrap().message, "two");
    }

    #[tokio::test]
    async fn test_general_buffer_bounded() {
        let broker = LogBroker::new();
        for i in 0..150 {
            broker.publish(entry(&format!("m{i}")));
        }

        let (mut rx, _id) = broker.subscribe_general();
        let first = rx.recv().await.unwrap();
        assert_eq!(
            first.message, "m50",
            "oldest records beyond the buffer cap must be evicted"
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_channel() {
        let broker = LogBroker::new();
        let (mut rx, id) = broker.subscribe_general();
        broker.unsubscribe_general(id);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_slow_general_subscriber_dropped_on_publish() {
        let broker = LogBroker::new();
        let (mut rx, _id) = broker.subscribe_general();

        // Fill the subscriber channel beyond capacity without draining.
        for i in 0..101 {
            broker.publish(entry(&format!("m{i}")));
        }

        // The 101st try_send failed, so the subscriber was removed and its
        // channel closed. Drain what made it through and expect the end.
        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 100);
    }

    #[tokio::test]
    async fn test_deployment_records_routed_to_deployment_stream() {
        let broker = LogBroker::new();
        let mut rx = broker.subscribe_deployment("01HZX");

        broker.publish(deployment_entry("scoped", "01HZX"));
        broker.publish(deployment_entry("other", "01ZZZ"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.message, "scoped");

        // The record for the other deployment must not arrive.
        let next = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(next.is_err(), "no cross-deployment leakage expected");
    }

    #[tokio::test]
    async fn test_deployment_history_replayed() {
        let broker = LogBroker::new();
        broker.publish(deployment_entry("early", "01HZX"));

        let mut rx = broker.subscribe_deployment("01HZX");
        assert_eq!(rx.recv().await.unwrap().message, "early");
    }

    #[tokio::test]
    async fn test_second_deployment_subscriber_replaces_first() {
        let broker = LogBroker::new();
        let mut first = broker.subscribe_deployment("01HZX");
        let mut second = broker.subscribe_deployment("01HZX");

        broker.publish(deployment_entry("after", "01HZX"));

        assert!(
            first.recv().await.is_none(),
            "first subscriber's channel closes when replaced"
        );
        assert_eq!(second.recv().await.unwrap().message, "after");
    }

    #[tokio::test]
    async fn test_close_stops_everything() {
        let broker = LogBroker::new();
        let (mut rx, _id) = broker.subscribe_general();
        broker.close();
        assert!(rx.recv().await.is_none());

        // Publishing after close is a no-op.
        broker.publish(entry("late"));
        let (mut rx2, _) = broker.subscribe_general();
        let next = tokio::time::timeout(Duration::from_millis(50), rx2.recv()).await;
        assert!(matches!(next, Ok(None) | Err(_)));
    }
}
