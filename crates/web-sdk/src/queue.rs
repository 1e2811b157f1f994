//! Persistent event queue — buffers enriched events in memory, flushes them to
//! the delivery worker on a size or time trigger, and carries unflushed
//! events over to the next tracker instance through durable storage.
//!
//! Flush triggers:
//! - size: an `add` that leaves more than `buffer_size` events buffered swaps
//!   the buffer out and hands it to the worker immediately;
//! - time: otherwise a debounce timer is (re)armed, so the buffer is flushed
//!   once no event has been added for `flush_interval`.
//!
//! A swapped batch is recorded as pending in durable storage before it reaches
//! the worker. `start` replays both the carried-over snapshot and any pending
//! batches a previous instance never saw answered.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use beacon_core::error::{TrackerError, TrackerResult};
use beacon_core::transport::Transport;
use beacon_core::types::{Event, Properties};

use crate::delivery::{DeliveryChannel, DeliveryWorker};
use crate::store::{PendingBatch, TrackerStore};

#[derive(Clone)]
pub struct PersistentQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    store: TrackerStore,
    transport: Arc<dyn Transport>,
    buffer_size: usize,
    flush_interval: Duration,
    channel_capacity: usize,
    buffer: Mutex<Vec<Event>>,
    timer: Mutex<Option<FlushTimer>>,
    channel: Mutex<Option<DeliveryChannel>>,
    runtime: Mutex<Option<Handle>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct FlushTimer {
    deadline: Instant,
    task: JoinHandle<()>,
}

impl PersistentQueue {
    pub fn new(
        store: TrackerStore,
        transport: Arc<dyn Transport>,
        buffer_size: usize,
        flush_interval: Duration,
        channel_capacity: usize,
    ) -> Self {
        debug!(
            buffer_size,
            flush_interval_ms = flush_interval.as_millis() as u64,
            "persistent queue created"
        );
        Self {
            inner: Arc::new(QueueInner {
                store,
                transport,
                buffer_size,
                flush_interval,
                channel_capacity,
                buffer: Mutex::new(Vec::with_capacity(buffer_size + 1)),
                timer: Mutex::new(None),
                channel: Mutex::new(None),
                runtime: Mutex::new(None),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Start the delivery worker on the current tokio runtime, then replay any
    /// events carried over from a previous instance.
    pub fn start(&self) -> TrackerResult<()> {
        let runtime = Handle::try_current().map_err(|e| TrackerError::Runtime(e.to_string()))?;
        {
            let mut channel = self.inner.channel.lock();
            if channel.is_some() {
                debug!("persistent queue already started");
                return Ok(());
            }
            *channel = Some(DeliveryWorker::spawn(
                self.inner.transport.clone(),
                self.inner.store.clone(),
                self.inner.channel_capacity,
                &runtime,
            ));
        }
        *self.inner.runtime.lock() = Some(runtime);

        self.replay_undelivered();
        debug!("persistent queue started");
        Ok(())
    }

    fn replay_undelivered(&self) {
        let events = self.inner.store.carried_over_events();
        if !events.is_empty() {
            info!(count = events.len(), "replaying carried-over events");
            if let Err(e) = self.inner.store.delete_carried_over_events() {
                warn!(error = %e, "failed to clear carried-over events");
            }
            self.persist(events);
        }

        match self.inner.store.take_pending_batches() {
            Ok(batches) => {
                if !batches.is_empty() {
                    info!(count = batches.len(), "replaying undelivered batches");
                }
                for batch in batches {
                    self.persist(batch.events);
                }
            }
            Err(e) => warn!(error = %e, "failed to take pending batches"),
        }
    }

    pub fn add(&self, name: impl Into<String>, properties: Properties) {
        let event = Event::new(name, properties);
        metrics::counter!("beacon.events.queued").increment(1);

        // Swap under the lock so a concurrent add lands in the fresh buffer.
        let full_batch = {
            let mut buffer = self.inner.buffer.lock();
            buffer.push(event);
            if buffer.len() > self.inner.buffer_size {
                Some(std::mem::take(&mut *buffer))
            } else {
                None
            }
        };

        match full_batch {
            Some(batch) => {
                self.cancel_timer();
                self.persist(batch);
            }
            None => self.schedule_flush(),
        }
    }

    /// Hand everything buffered to the delivery worker now.
    pub fn flush(&self) {
        let batch = std::mem::take(&mut *self.inner.buffer.lock());
        self.persist(batch);
    }

    pub fn buffered_count(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    fn persist(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let count = events.len();
        let batch = PendingBatch::new(events);
        let batch_id = batch.id.clone();
        let sent = {
            let channel = self.inner.channel.lock();
            match channel.as_ref() {
                Some(channel) => {
                    if let Err(e) = self.inner.store.add_pending_batch(&batch) {
                        warn!(error = %e, count, "failed to record pending batch");
                    }
                    Ok(channel.send(batch))
                }
                None => Err(batch.events),
            }
        };
        match sent {
            Ok(Ok(())) => debug!(count, "event batch handed to delivery worker"),
            Ok(Err(e)) => {
                metrics::counter!("beacon.batches.dropped").increment(1);
                warn!(error = %e, count, "event batch dropped");
                if let Err(e) = self.inner.store.remove_pending_batch(&batch_id) {
                    warn!(error = %e, "failed to clear pending batch record");
                }
            }
            Err(events) => {
                debug!(count, "queue not running, carrying batch over");
                self.carry_over(events);
            }
        }
    }

    fn schedule_flush(&self) {
        let Some(runtime) = self.inner.runtime.lock().clone() else {
            debug!("queue not started, flush deferred");
            return;
        };
        // Held across deadline and spawn so the surviving timer is always the
        // one armed by the latest add.
        let mut timer = self.inner.timer.lock();
        let queue = self.clone();
        let deadline = Instant::now() + self.inner.flush_interval;
        let task = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            queue.flush();
        });
        if let Some(previous) = timer.replace(FlushTimer { deadline, task }) {
            previous.task.abort();
        }
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.task.abort();
        }
    }

    /// Append events to the durable snapshot replayed by the next `start`.
    fn carry_over(&self, events: Vec<Event>) {
        let mut snapshot = self.inner.store.carried_over_events();
        snapshot.extend(events);
        if let Err(e) = self.inner.store.save_carried_over_events(&snapshot) {
            warn!(error = %e, count = snapshot.len(), "failed to snapshot events");
        }
    }

    /// Synchronously snapshot buffered events to durable storage and shut the
    /// delivery channel. Safe to call from a termination hook and more than once.
    pub fn stop(&self) {
        self.cancel_timer();

        let pending = std::mem::take(&mut *self.inner.buffer.lock());
        if !pending.is_empty() {
            info!(count = pending.len(), "snapshotting unflushed events");
            self.carry_over(pending);
        }

        if let Some(channel) = self.inner.channel.lock().take() {
            *self.inner.worker.lock() = Some(channel.close());
        }
        self.inner.runtime.lock().take();
        debug!("persistent queue stopped");
    }

    /// `stop`, then wait for the delivery worker to finish batches it already holds.
    pub async fn close(&self) {
        self.stop();
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "delivery worker ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use beacon_core::transport::{capture_transport, CaptureTransport};

    /// Accepts a batch and never answers.
    struct StalledTransport;

    #[async_trait]
    impl Transport for StalledTransport {
        async fn submit(&self, _events: &[Event]) -> anyhow::Result<bool> {
            std::future::pending::<()>().await;
            Ok(true)
        }
    }

    const INTERVAL: Duration = Duration::from_millis(5_000);

    fn queue(
        buffer_size: usize,
        store: &TrackerStore,
        transport: &Arc<CaptureTransport>,
    ) -> PersistentQueue {
        PersistentQueue::new(store.clone(), transport.clone(), buffer_size, INTERVAL, 16)
    }

    fn store() -> TrackerStore {
        TrackerStore::new(Arc::new(MemoryStore::new()))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_flushes_after_quiet_interval() {
        let transport = capture_transport();
        let q = queue(50, &store(), &transport);
        q.start().unwrap();

        q.add("e1", Properties::new());
        tokio::time::advance(Duration::from_millis(4_900)).await;
        q.add("e2", Properties::new());
        tokio::time::advance(Duration::from_millis(4_900)).await;
        settle().await;
        assert_eq!(transport.batch_count(), 0);
        assert_eq!(q.buffered_count(), 2);

        tokio::time::advance(Duration::from_millis(200)).await;
        transport.wait_for_batches(1).await;
        assert_eq!(transport.batch_count(), 1);
        assert_eq!(transport.event_names(), vec!["e1", "e2"]);
        assert_eq!(q.buffered_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger_is_strictly_greater() {
        let transport = capture_transport();
        let q = queue(2, &store(), &transport);
        q.start().unwrap();

        q.add("e1", Properties::new());
        q.add("e2", Properties::new());
        settle().await;
        // Exactly `buffer_size` events stay buffered.
        assert_eq!(q.buffered_count(), 2);
        assert_eq!(transport.batch_count(), 0);

        q.add("e3", Properties::new());
        assert_eq!(q.buffered_count(), 0);
        assert!(q.inner.timer.lock().is_none());
        transport.wait_for_batches(1).await;
        assert_eq!(transport.batch_count(), 1);
        assert_eq!(transport.event_names(), vec!["e1", "e2", "e3"]);

        tokio::time::advance(INTERVAL * 2).await;
        settle().await;
        assert_eq!(transport.batch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_then_start_replays_snapshot() {
        let store = store();
        let transport = capture_transport();

        let first = queue(50, &store, &transport);
        first.start().unwrap();
        first.add("e1", Properties::new());
        first.add("e2", Properties::new());
        first.stop();
        assert_eq!(store.carried_over_events().len(), 2);

        tokio::time::advance(INTERVAL * 2).await;
        settle().await;
        assert_eq!(transport.batch_count(), 0);

        let second = queue(50, &store, &transport);
        second.start().unwrap();
        assert!(store.carried_over_events().is_empty());
        transport.wait_for_batches(1).await;

        let mut names = transport.event_names();
        names.sort();
        assert_eq!(names, vec!["e1", "e2"]);
    }

    #[tokio::test]
    async fn test_stop_appends_to_unconsumed_snapshot() {
        let store = store();
        store
            .save_carried_over_events(&[Event::new("old", Properties::new())])
            .unwrap();
        let transport = capture_transport();

        // Never started: nothing consumes the snapshot.
        let q = queue(50, &store, &transport);
        q.add("new", Properties::new());
        q.stop();

        let names: Vec<String> = store
            .carried_over_events()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["old", "new"]);
    }

    #[tokio::test]
    async fn test_close_drains_worker() {
        let transport = capture_transport();
        let q = queue(50, &store(), &transport);
        q.start().unwrap();
        q.add("e1", Properties::new());
        q.flush();
        q.close().await;
        assert_eq!(transport.event_names(), vec!["e1"]);
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let transport = capture_transport();
        let q = queue(50, &store(), &transport);
        assert!(matches!(q.start(), Err(TrackerError::Runtime(_))));
    }

    #[tokio::test]
    async fn test_flush_empty_is_noop() {
        let transport = capture_transport();
        let q = queue(50, &store(), &transport);
        q.start().unwrap();
        q.flush();
        q.close().await;
        assert_eq!(transport.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_swapped_batches_survive_stop() {
        let store = store();
        let first = PersistentQueue::new(store.clone(), Arc::new(StalledTransport), 1, INTERVAL, 16);
        first.start().unwrap();
        for name in ["e1", "e2", "e3", "e4"] {
            first.add(name, Properties::new());
        }
        settle().await;
        first.stop();
        assert!(store.carried_over_events().is_empty());
        assert_eq!(store.pending_batches().len(), 2);

        let transport = capture_transport();
        let second = queue(1, &store, &transport);
        second.start().unwrap();
        transport.wait_for_batches(2).await;
        assert_eq!(transport.event_names(), vec!["e1", "e2", "e3", "e4"]);

        second.close().await;
        assert!(store.pending_batches().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_deliver_each_event_once() {
        const BUFFER: usize = 5;
        let transport = capture_transport();
        let q = PersistentQueue::new(store(), transport.clone(), BUFFER, INTERVAL, 1024);
        q.start().unwrap();

        let mut handles = Vec::new();
        for t in 0..8 {
            let q = q.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    q.add(format!("t{t}-e{i}"), Properties::new());
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(q.buffered_count() <= BUFFER);
        q.flush();
        q.close().await;

        assert!(transport.batches().iter().all(|b| b.len() <= BUFFER + 1));
        let mut names = transport.event_names();
        names.sort();
        let mut expected: Vec<String> = (0..8)
            .flat_map(|t| (0..50).map(move |i| format!("t{t}-e{i}")))
            .collect();
        expected.sort();
        assert_eq!(names, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_surviving_timer_has_latest_deadline() {
        let transport = capture_transport();
        let q = PersistentQueue::new(store(), transport, 1_000, INTERVAL, 16);
        q.start().unwrap();

        let mut handles = Vec::new();
        for t in 0..8 {
            let q = q.clone();
            handles.push(tokio::spawn(async move {
                let mut latest: Option<Instant> = None;
                for i in 0..50 {
                    q.add(format!("t{t}-e{i}"), Properties::new());
                    let armed = q.inner.timer.lock().as_ref().map(|timer| timer.deadline);
                    latest = latest.max(armed);
                }
                latest
            }));
        }
        let mut observed = Vec::new();
        for handle in handles {
            observed.push(handle.await.unwrap());
        }

        let surviving = q.inner.timer.lock().as_ref().map(|timer| timer.deadline);
        assert!(surviving.is_some());
        assert!(observed.into_iter().all(|deadline| deadline <= surviving));
        q.stop();
    }
}
