//! Beacon tracking client — sessions, event enrichment, a crash-safe event
//! queue and background delivery for an embedded analytics SDK.
//!
//! # Modules
//!
//! - [`storage`] — Key/value storage adapters (in-memory, JSON file)
//! - [`clock`] — Wall-clock abstraction with a manual clock for tests
//! - [`stopwatch`] — Named timers backed by volatile storage
//! - [`store`] — Typed access to the durable tracker records
//! - [`session`] — Inactivity-bounded session lifecycle
//! - [`context`] — Device, page and referrer context
//! - [`enrich`] — Merges global, system and caller properties
//! - [`events`] — Typed payloads for the commerce verbs
//! - [`queue`] — Buffered, persistent event queue
//! - [`delivery`] — Background worker submitting batches to a transport
//! - [`tracker`] — The public tracking façade

pub mod clock;
pub mod context;
pub mod delivery;
pub mod enrich;
pub mod events;
pub mod queue;
pub mod session;
pub mod stopwatch;
pub mod storage;
pub mod store;
pub mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{ContextProvider, SearchEngine, UrlContextProvider};
pub use events::{
    CartProperties, CheckoutProperties, CustomerGender, CustomerProperties, IntoProperties,
    OrderProperties, SearchProperties, ViewProductProperties,
};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use tracker::{Tracker, TrackerBuilder, TrackerCore};
