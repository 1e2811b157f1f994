//! Event enrichment — merges global properties, system context and caller
//! properties into the final property bag of an event.
//!
//! Precedence, later wins: global properties, then system properties computed
//! for this call, then the caller's own properties. The event name is stamped
//! last.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::trace;
use uuid::Uuid;

use beacon_core::error::TrackerResult;
use beacon_core::types::{keys, Properties};

use crate::clock::Clock;
use crate::context::ContextProvider;
use crate::session::SessionManager;
use crate::stopwatch::Stopwatch;
use crate::store::TrackerStore;

pub struct EventEnricher {
    store: TrackerStore,
    sessions: Arc<SessionManager>,
    stopwatch: Arc<Stopwatch>,
    context: Arc<dyn ContextProvider>,
    clock: Arc<dyn Clock>,
    app_name: String,
    app_version: String,
    global_properties: Mutex<Properties>,
    last_screen_name: Mutex<Option<String>>,
}

impl EventEnricher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: TrackerStore,
        sessions: Arc<SessionManager>,
        stopwatch: Arc<Stopwatch>,
        context: Arc<dyn ContextProvider>,
        clock: Arc<dyn Clock>,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        global_properties: Properties,
    ) -> Self {
        Self {
            store,
            sessions,
            stopwatch,
            context,
            clock,
            app_name: app_name.into(),
            app_version: app_version.into(),
            global_properties: Mutex::new(global_properties),
            last_screen_name: Mutex::new(None),
        }
    }

    /// Merge `properties` into the global properties and persist the result.
    pub fn register(&self, properties: Properties) -> TrackerResult<()> {
        let mut global = self.global_properties.lock();
        global.extend(properties);
        self.store.set_global_properties(&global)
    }

    pub fn global_properties(&self) -> Properties {
        self.global_properties.lock().clone()
    }

    pub fn clear_global_properties(&self) -> TrackerResult<()> {
        self.global_properties.lock().clear();
        self.store.delete_global_properties()
    }

    pub fn set_last_screen_name(&self, name: Option<String>) {
        *self.last_screen_name.lock() = name;
    }

    pub fn last_screen_name(&self) -> Option<String> {
        self.last_screen_name.lock().clone()
    }

    pub fn build_event_properties(&self, event_name: &str, custom: Properties) -> Properties {
        let mut custom = custom;
        self.enrich_screen_name(&mut custom);
        self.enrich_duration(event_name, &mut custom);

        let now = self.clock.now_ms();
        let anonymous_id = self.store.anonymous_id();
        let customer_id = self
            .store
            .customer_id()
            .unwrap_or_else(|| anonymous_id.clone());
        let session_id = self
            .sessions
            .get_session()
            .map(|s| s.session_id)
            .unwrap_or_default();

        let mut system = Properties::new();
        system.insert(keys::EVENT_ID.into(), json!(Uuid::new_v4().to_string()));
        system.insert(keys::TIMESTAMP.into(), json!(now));
        system.insert(keys::CUSTOMER_ID.into(), json!(customer_id));
        system.insert(keys::ANONYMOUS_ID.into(), json!(anonymous_id));
        system.insert(keys::SESSION_ID.into(), json!(session_id));
        system.insert(keys::APP_NAME.into(), json!(self.app_name));
        system.insert(keys::APP_VERSION.into(), json!(self.app_version));
        system.extend(self.context.client_specifications());
        system.extend(self.context.page_and_referrer_info(
            string_value(&custom, keys::URL),
            string_value(&custom, keys::REFERRER),
        ));

        let mut merged = self.global_properties();
        merged.extend(system);
        merged.extend(custom);
        merged.insert(keys::EVENT_NAME.into(), json!(event_name));

        trace!(event = event_name, keys = merged.len(), "event properties built");
        merged
    }

    fn enrich_screen_name(&self, properties: &mut Properties) {
        if is_unset(properties.get(keys::SCREEN_NAME)) {
            let screen = self
                .last_screen_name()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| self.context.current_path());
            properties.insert(keys::SCREEN_NAME.into(), json!(screen));
        }
    }

    /// Always consumes the stopwatch entry named after the event, even when
    /// the caller supplied both values.
    fn enrich_duration(&self, event_name: &str, properties: &mut Properties) {
        let elapsed = self.stopwatch.stop(event_name);
        if is_unset(properties.get(keys::START_TIME)) {
            properties.insert(keys::START_TIME.into(), json!(elapsed.start_time));
        }
        if is_unset(properties.get(keys::DURATION)) {
            properties.insert(keys::DURATION.into(), json!(elapsed.duration));
        }
    }
}

/// A property counts as unset when it is absent, null or an empty string.
pub fn is_unset(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

fn string_value<'a>(properties: &'a Properties, key: &str) -> Option<&'a str> {
    properties
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}
