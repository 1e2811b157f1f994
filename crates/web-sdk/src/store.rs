//! Typed accessors over the durable store: credentials, identity, global
//! properties, the carried-over event snapshot and batches in flight to the
//! delivery worker.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use beacon_core::error::TrackerResult;
use beacon_core::types::{Event, Properties};

use crate::storage::KeyValueStore;

pub const API_KEY: &str = "beacon.api_key";
pub const HOST: &str = "beacon.host";
pub const GLOBAL_PROPERTIES: &str = "beacon.global_properties";
pub const CUSTOMER_ID: &str = "beacon.customer_id";
pub const ANONYMOUS_ID: &str = "beacon.anonymous_id";
pub const CARRIED_OVER_EVENTS: &str = "beacon.events";
pub const PENDING_BATCHES: &str = "beacon.pending_batches";

/// A swapped-out batch recorded durably until the transport has answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingBatch {
    pub id: String,
    pub events: Vec<Event>,
}

impl PendingBatch {
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            events,
        }
    }
}

#[derive(Clone)]
pub struct TrackerStore {
    durable: Arc<dyn KeyValueStore>,
    // Serializes read-modify-write of the pending batch list between the
    // queue and the delivery worker.
    pending_lock: Arc<Mutex<()>>,
}

impl TrackerStore {
    pub fn new(durable: Arc<dyn KeyValueStore>) -> Self {
        Self {
            durable,
            pending_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn api_key(&self) -> Option<String> {
        self.non_empty(API_KEY)
    }

    pub fn host(&self) -> Option<String> {
        self.non_empty(HOST)
    }

    pub fn set_credentials(&self, host: &str, api_key: &str) -> TrackerResult<()> {
        self.durable.set(HOST, host)?;
        self.durable.set(API_KEY, api_key)
    }

    pub fn global_properties(&self) -> Properties {
        self.read_json(GLOBAL_PROPERTIES).unwrap_or_default()
    }

    pub fn set_global_properties(&self, properties: &Properties) -> TrackerResult<()> {
        self.durable
            .set(GLOBAL_PROPERTIES, &serde_json::to_string(properties)?)
    }

    pub fn delete_global_properties(&self) -> TrackerResult<()> {
        self.durable.remove(GLOBAL_PROPERTIES)
    }

    pub fn customer_id(&self) -> Option<String> {
        self.non_empty(CUSTOMER_ID)
    }

    pub fn set_customer_id(&self, customer_id: &str) -> TrackerResult<()> {
        self.durable.set(CUSTOMER_ID, customer_id)
    }

    pub fn delete_customer_id(&self) -> TrackerResult<()> {
        self.durable.remove(CUSTOMER_ID)
    }

    /// Stable surrogate id for an unidentified visitor, created on first use.
    ///
    /// If the new id cannot be persisted it is still returned, so the current
    /// event is attributed; the next call will mint another one.
    pub fn anonymous_id(&self) -> String {
        if let Some(id) = self.non_empty(ANONYMOUS_ID) {
            return id;
        }
        let id = Uuid::new_v4().to_string();
        if let Err(e) = self.durable.set(ANONYMOUS_ID, &id) {
            warn!(error = %e, "failed to persist anonymous id");
        }
        id
    }

    pub fn delete_anonymous_id(&self) -> TrackerResult<()> {
        self.durable.remove(ANONYMOUS_ID)
    }

    pub fn carried_over_events(&self) -> Vec<Event> {
        self.read_json(CARRIED_OVER_EVENTS).unwrap_or_default()
    }

    pub fn save_carried_over_events(&self, events: &[Event]) -> TrackerResult<()> {
        self.durable
            .set(CARRIED_OVER_EVENTS, &serde_json::to_string(events)?)
    }

    pub fn delete_carried_over_events(&self) -> TrackerResult<()> {
        self.durable.remove(CARRIED_OVER_EVENTS)
    }

    pub fn pending_batches(&self) -> Vec<PendingBatch> {
        self.read_json(PENDING_BATCHES).unwrap_or_default()
    }

    pub fn add_pending_batch(&self, batch: &PendingBatch) -> TrackerResult<()> {
        let _guard = self.pending_lock.lock();
        let mut batches = self.pending_batches();
        batches.push(batch.clone());
        self.write_pending(&batches)
    }

    /// Forget a batch once its delivery attempt is over. Unknown ids are ignored.
    pub fn remove_pending_batch(&self, id: &str) -> TrackerResult<()> {
        let _guard = self.pending_lock.lock();
        let mut batches = self.pending_batches();
        let before = batches.len();
        batches.retain(|b| b.id != id);
        if batches.len() == before {
            return Ok(());
        }
        self.write_pending(&batches)
    }

    /// Remove and return every recorded batch, oldest first.
    pub fn take_pending_batches(&self) -> TrackerResult<Vec<PendingBatch>> {
        let _guard = self.pending_lock.lock();
        let batches = self.pending_batches();
        if !batches.is_empty() {
            self.durable.remove(PENDING_BATCHES)?;
        }
        Ok(batches)
    }

    fn write_pending(&self, batches: &[PendingBatch]) -> TrackerResult<()> {
        if batches.is_empty() {
            return self.durable.remove(PENDING_BATCHES);
        }
        self.durable
            .set(PENDING_BATCHES, &serde_json::to_string(batches)?)
    }

    fn non_empty(&self, key: &str) -> Option<String> {
        self.durable.get(key).filter(|v| !v.is_empty())
    }

    /// Corrupt records are logged and treated as absent.
    fn read_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.durable.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "ignoring unparseable stored record");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn store() -> (TrackerStore, Arc<MemoryStore>) {
        let durable = Arc::new(MemoryStore::new());
        (TrackerStore::new(durable.clone()), durable)
    }

    #[test]
    fn test_anonymous_id_is_stable() {
        let (store, _) = store();
        let first = store.anonymous_id();
        assert_eq!(store.anonymous_id(), first);
        store.delete_anonymous_id().unwrap();
        assert_ne!(store.anonymous_id(), first);
    }

    #[test]
    fn test_corrupt_global_properties_read_as_empty() {
        let (store, durable) = store();
        durable.set(GLOBAL_PROPERTIES, "{{{").unwrap();
        assert!(store.global_properties().is_empty());
    }

    #[test]
    fn test_global_properties_roundtrip() {
        let (store, _) = store();
        let mut props = Properties::new();
        props.insert("tenant".into(), json!("acme"));
        store.set_global_properties(&props).unwrap();
        assert_eq!(store.global_properties(), props);
    }

    #[test]
    fn test_carried_over_events() {
        let (store, _) = store();
        assert!(store.carried_over_events().is_empty());
        store
            .save_carried_over_events(&[Event::new("e1", Properties::new())])
            .unwrap();
        assert_eq!(store.carried_over_events()[0].name, "e1");
        store.delete_carried_over_events().unwrap();
        assert!(store.carried_over_events().is_empty());
    }

    #[test]
    fn test_empty_credentials_are_absent() {
        let (store, _) = store();
        store.set_credentials("", "").unwrap();
        assert!(store.host().is_none());
        assert!(store.api_key().is_none());
    }

    #[test]
    fn test_pending_batches_lifecycle() {
        let (store, durable) = store();
        let first = PendingBatch::new(vec![Event::new("e1", Properties::new())]);
        let second = PendingBatch::new(vec![Event::new("e2", Properties::new())]);
        store.add_pending_batch(&first).unwrap();
        store.add_pending_batch(&second).unwrap();
        assert_eq!(store.pending_batches(), vec![first.clone(), second.clone()]);

        store.remove_pending_batch(&first.id).unwrap();
        store.remove_pending_batch("unknown").unwrap();
        assert_eq!(store.pending_batches(), vec![second.clone()]);

        assert_eq!(store.take_pending_batches().unwrap(), vec![second]);
        assert!(store.pending_batches().is_empty());
        assert!(durable.get(PENDING_BATCHES).is_none());
    }
}
