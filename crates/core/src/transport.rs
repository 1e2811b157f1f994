//! Delivery transport — the capability the tracker uses to hand batches of
//! enriched events to an ingestion endpoint.
//!
//! The tracker accepts an `Arc<dyn Transport>`. It only cares about the
//! boolean outcome: `Ok(false)` and `Err(_)` are both delivery failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::types::Event;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn submit(&self, events: &[Event]) -> anyhow::Result<bool>;
}

/// Transport that accepts and discards every batch.
pub struct NoopTransport;

#[async_trait]
impl Transport for NoopTransport {
    async fn submit(&self, _events: &[Event]) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// In-memory transport that records every submitted batch.
pub struct CaptureTransport {
    batches: Mutex<Vec<Vec<Event>>>,
    accept: AtomicBool,
    submitted: watch::Sender<usize>,
}

impl Default for CaptureTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureTransport {
    pub fn new() -> Self {
        let (submitted, _) = watch::channel(0);
        Self {
            batches: Mutex::new(Vec::new()),
            accept: AtomicBool::new(true),
            submitted,
        }
    }

    /// Make subsequent submissions report failure (batches are still recorded).
    pub fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<Vec<Event>> {
        self.batches.lock().clone()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }

    /// All recorded events, flattened in submission order.
    pub fn events(&self) -> Vec<Event> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.name).collect()
    }

    pub fn clear(&self) {
        self.batches.lock().clear();
    }

    /// Wait until at least `count` batches have been submitted in total.
    pub async fn wait_for_batches(&self, count: usize) {
        let mut rx = self.submitted.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|submitted| *submitted >= count).await;
    }
}

#[async_trait]
impl Transport for CaptureTransport {
    async fn submit(&self, events: &[Event]) -> anyhow::Result<bool> {
        self.batches.lock().push(events.to_vec());
        self.submitted.send_modify(|submitted| *submitted += 1);
        Ok(self.accept.load(Ordering::SeqCst))
    }
}

/// Convenience: a transport that drops everything.
pub fn noop_transport() -> Arc<dyn Transport> {
    Arc::new(NoopTransport)
}

/// Convenience: create a capture transport for tests.
pub fn capture_transport() -> Arc<CaptureTransport> {
    Arc::new(CaptureTransport::new())
}
