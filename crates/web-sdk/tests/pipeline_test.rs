//! Integration tests for the full tracking pipeline: tracker, file-backed
//! storage, queue carry-over and delivery.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use beacon_core::transport::{capture_transport, Transport};
    use beacon_core::types::{keys, Event, Properties};
    use beacon_core::TrackerConfig;
    use beacon_web_sdk::{FileStore, KeyValueStore, ManualClock, MemoryStore, Tracker};
    use serde_json::json;

    struct RejectingTransport;

    #[async_trait]
    impl Transport for RejectingTransport {
        async fn submit(&self, _events: &[Event]) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    fn config() -> TrackerConfig {
        TrackerConfig::default().with_credentials("https://ingest.example.com", "key-it")
    }

    #[tokio::test]
    async fn test_unflushed_events_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacon.json");
        let clock = Arc::new(ManualClock::new(1_000_000));

        let first_transport = capture_transport();
        {
            let durable = Arc::new(FileStore::open(&path).unwrap());
            let tracker = Tracker::builder(config())
                .with_durable_store(durable)
                .with_transport(first_transport.clone())
                .with_clock(clock.clone())
                .build()
                .unwrap();
            tracker.track("added_to_wishlist", Properties::new()).await;
            // Termination without a flush: events go to the snapshot.
            tracker.close().await;
        }
        assert_eq!(first_transport.batch_count(), 0);

        let second_transport = capture_transport();
        let durable = Arc::new(FileStore::open(&path).unwrap());
        let tracker = Tracker::builder(TrackerConfig::default())
            .with_durable_store(durable)
            .with_transport(second_transport.clone())
            .with_clock(clock)
            .from_stored_credentials()
            .unwrap()
            .build()
            .unwrap();
        second_transport.wait_for_batches(1).await;

        let names = second_transport.event_names();
        assert_eq!(names, vec!["session_created", "added_to_wishlist"]);
        assert_eq!(tracker.tracking_api_key(), "key-it");
        tracker.close().await;
    }

    #[tokio::test]
    async fn test_session_survives_restart_within_window() {
        let durable = Arc::new(MemoryStore::new());
        let volatile = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let transport = capture_transport();

        let build = || {
            Tracker::builder(config())
                .with_durable_store(durable.clone())
                .with_volatile_store(volatile.clone())
                .with_transport(transport.clone())
                .with_clock(clock.clone())
                .build()
                .unwrap()
        };

        let first = build();
        first.track("a", Properties::new()).await;
        first.flush();
        first.close().await;

        clock.advance(1_000);
        let second = build();
        second.track("b", Properties::new()).await;
        second.flush();
        second.close().await;

        let events = transport.events();
        let created: Vec<&Event> = events
            .iter()
            .filter(|e| e.name == "session_created")
            .collect();
        assert_eq!(created.len(), 1);
        let session_id = &created[0].properties[keys::SESSION_ID];
        assert!(events
            .iter()
            .all(|e| &e.properties[keys::SESSION_ID] == session_id));
    }

    #[tokio::test]
    async fn test_lost_liveness_marker_starts_new_session() {
        let durable = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let transport = capture_transport();

        for event in ["a", "b"] {
            // A fresh volatile store models a new browsing context.
            let tracker = Tracker::builder(config())
                .with_durable_store(durable.clone())
                .with_volatile_store(Arc::new(MemoryStore::new()))
                .with_transport(transport.clone())
                .with_clock(clock.clone())
                .build()
                .unwrap();
            tracker.track(event, Properties::new()).await;
            tracker.flush();
            tracker.close().await;
        }

        let names = transport.event_names();
        assert_eq!(
            names,
            vec!["session_created", "a", "session_end", "session_created", "b"]
        );
    }

    #[tokio::test]
    async fn test_rejected_batches_are_dropped() {
        let durable = Arc::new(MemoryStore::new());
        let tracker = Tracker::builder(config())
            .with_durable_store(durable.clone())
            .with_transport(Arc::new(RejectingTransport))
            .build()
            .unwrap();
        tracker
            .track("x", Properties::from_iter([("k".to_string(), json!(1))]))
            .await;
        tracker.flush();
        tracker.close().await;

        // Failed delivery is not retried or carried over.
        let snapshot = durable.get("beacon.events");
        assert!(snapshot.is_none());
    }
}
