//! Delivery worker — drains batches from a bounded channel and submits them
//! through the transport. Failures are logged and the batch is dropped.
//!
//! Every batch is recorded in durable storage before it enters the channel and
//! forgotten once the transport has answered, so batches still queued or in
//! flight when the process dies are replayed by the next queue start.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use beacon_core::error::{TrackerError, TrackerResult};
use beacon_core::transport::Transport;

use crate::store::{PendingBatch, TrackerStore};

/// Sending half of a running delivery worker.
pub struct DeliveryChannel {
    sender: mpsc::Sender<PendingBatch>,
    task: JoinHandle<()>,
}

impl DeliveryChannel {
    /// Queue a batch without waiting. Fails when the channel is full or the
    /// worker has gone away.
    pub fn send(&self, batch: PendingBatch) -> TrackerResult<()> {
        self.sender
            .try_send(batch)
            .map_err(|e| TrackerError::Delivery(e.to_string()))
    }

    /// Close the channel. The worker drains what is already queued and exits;
    /// the returned handle resolves once it has.
    pub fn close(self) -> JoinHandle<()> {
        drop(self.sender);
        self.task
    }
}

pub struct DeliveryWorker {
    transport: Arc<dyn Transport>,
    store: TrackerStore,
}

impl DeliveryWorker {
    /// Spawn a worker on `runtime` and return the channel feeding it.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        store: TrackerStore,
        capacity: usize,
        runtime: &Handle,
    ) -> DeliveryChannel {
        let (sender, receiver) = mpsc::channel::<PendingBatch>(capacity.max(1));
        let worker = Self { transport, store };
        let task = runtime.spawn(async move {
            worker.run(receiver).await;
        });
        DeliveryChannel { sender, task }
    }

    async fn run(self, mut receiver: mpsc::Receiver<PendingBatch>) {
        while let Some(batch) = receiver.recv().await {
            self.deliver(batch).await;
        }
        debug!("delivery channel closed, worker exiting");
    }

    async fn deliver(&self, batch: PendingBatch) {
        let count = batch.events.len();
        match self.transport.submit(&batch.events).await {
            Ok(true) => {
                metrics::counter!("beacon.batches.delivered").increment(1);
                debug!(count, "event batch delivered");
            }
            Ok(false) => {
                metrics::counter!("beacon.batches.failed").increment(1);
                warn!(count, "transport rejected event batch, dropping");
            }
            Err(e) => {
                metrics::counter!("beacon.batches.failed").increment(1);
                error!(error = %e, count, "failed to submit event batch, dropping");
            }
        }
        // At-most-once: the attempt is over whatever the outcome.
        if let Err(e) = self.store.remove_pending_batch(&batch.id) {
            warn!(error = %e, batch_id = %batch.id, "failed to clear pending batch record");
        }
    }
}
