//! Tracker — the single entry point a host application talks to.
//!
//! A [`Tracker`] is either enabled, owning one [`TrackerCore`] (session
//! manager, enricher, stopwatch and persistent queue), or disabled, in which
//! case every call is a no-op. Public methods never return errors: failures
//! are logged so tracking can never disrupt the host.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info};

use beacon_core::config::TrackerConfig;
use beacon_core::error::{TrackerError, TrackerResult};
use beacon_core::transport::{NoopTransport, Transport};
use beacon_core::types::{keys, Properties, SessionInfo, SystemEvent};

use crate::clock::{Clock, SystemClock};
use crate::context::{ContextProvider, UrlContextProvider};
use crate::enrich::EventEnricher;
use crate::events::{
    CartProperties, CheckoutProperties, CustomerProperties, IntoProperties, OrderProperties,
    SearchProperties, ViewProductProperties,
};
use crate::queue::PersistentQueue;
use crate::session::SessionManager;
use crate::stopwatch::Stopwatch;
use crate::storage::{KeyValueStore, MemoryStore};
use crate::store::TrackerStore;

fn page_timer_id(screen: &str) -> String {
    format!("page_view.{screen}")
}

/// Enabled tracker state. Exactly one per application instance.
pub struct TrackerCore {
    config: Arc<TrackerConfig>,
    store: TrackerStore,
    sessions: Arc<SessionManager>,
    stopwatch: Arc<Stopwatch>,
    enricher: EventEnricher,
    queue: PersistentQueue,
    clock: Arc<dyn Clock>,
    session_lock: AsyncMutex<()>,
}

impl TrackerCore {
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn session(&self) -> Option<SessionInfo> {
        self.sessions.get_session()
    }

    pub fn global_properties(&self) -> Properties {
        self.enricher.global_properties()
    }

    pub fn buffered_count(&self) -> usize {
        self.queue.buffered_count()
    }

    /// Confirm, renew or create the current session.
    ///
    /// Serialized so that overlapping callers observing the same expired
    /// session produce exactly one session-end and one session-created event.
    pub async fn touch_session(&self) -> TrackerResult<()> {
        let _guard = self.session_lock.lock().await;
        match self.sessions.get_session() {
            Some(session) if !session.is_expired => {
                self.sessions.update_session(&session.session_id)
            }
            Some(session) => {
                debug!(session_id = %session.session_id, "session expired, renewing");
                if !session.session_id.is_empty() {
                    self.end_session(&session);
                }
                self.sessions.delete_session()?;
                self.create_session()
            }
            None => self.create_session(),
        }
    }

    fn create_session(&self) -> TrackerResult<()> {
        let event = SystemEvent::SessionCreated.as_str();
        let mut properties = self.enricher.build_event_properties(event, Properties::new());
        let (session_id, created_at, _) = self.sessions.create_session(properties.clone())?;
        properties.insert(keys::SESSION_ID.into(), json!(session_id));
        properties.insert(keys::START_TIME.into(), json!(created_at));
        properties.insert(keys::TIMESTAMP.into(), json!(created_at));
        info!(session_id = %session_id, "tracking session started");
        self.queue.add(event, properties);
        Ok(())
    }

    fn end_session(&self, session: &SessionInfo) {
        let now = self.clock.now_ms();
        let mut properties = session.properties.clone();
        // The snapshot belongs to the session-created event; mint a fresh id.
        properties.remove(keys::EVENT_ID);
        properties.insert(keys::SESSION_ID.into(), json!(session.session_id));
        properties.insert(keys::START_TIME.into(), json!(session.created_at));
        properties.insert(keys::DURATION.into(), json!(now - session.created_at));
        properties.insert(keys::TIMESTAMP.into(), json!(now));
        info!(session_id = %session.session_id, "tracking session ended");
        self.track(SystemEvent::SessionEnd.as_str(), properties);
    }

    pub fn track(&self, event: &str, properties: Properties) {
        let properties = self.enricher.build_event_properties(event, properties);
        self.queue.add(event, properties);
    }

    pub fn time(&self, event: &str) {
        self.stopwatch.start(event);
    }

    pub fn register(&self, properties: Properties) -> TrackerResult<()> {
        self.enricher.register(properties)
    }

    pub fn enter_screen_start(&self, name: &str) {
        self.time(SystemEvent::ScreenEnter.as_str());
        self.enricher.set_last_screen_name(Some(name.to_string()));
    }

    pub fn enter_screen(&self, name: &str, properties: Properties) {
        self.enricher.set_last_screen_name(Some(name.to_string()));
        self.time(&page_timer_id(name));
        let mut properties = properties;
        properties.insert(keys::SCREEN_NAME.into(), json!(name));
        self.track(SystemEvent::ScreenEnter.as_str(), properties);
    }

    pub fn exit_screen(&self, name: &str, properties: Properties) {
        let elapsed = self.stopwatch.stop(&page_timer_id(name));
        let mut properties = properties;
        properties.insert(keys::SCREEN_NAME.into(), json!(name));
        properties.insert(keys::START_TIME.into(), json!(elapsed.start_time));
        properties.insert(keys::DURATION.into(), json!(elapsed.duration));
        self.enricher.set_last_screen_name(None);
        self.track(SystemEvent::PageView.as_str(), properties);
    }

    pub fn identify(&self, customer_id: &str) -> TrackerResult<()> {
        self.store.set_customer_id(customer_id)
    }

    pub fn set_user_profile(&self, customer_id: &str, properties: Properties) -> TrackerResult<()> {
        self.identify(customer_id)?;
        let mut properties = properties;
        properties.insert(keys::CUSTOMER_ID.into(), json!(customer_id));
        self.track(SystemEvent::AddCustomer.as_str(), properties);
        Ok(())
    }

    /// End the current session and forget the visitor: identity, anonymous
    /// id, global properties, timers and the session record.
    pub async fn destroy_session(&self) -> TrackerResult<()> {
        let _guard = self.session_lock.lock().await;
        if let Some(session) = self.sessions.get_session() {
            self.end_session(&session);
        }
        self.enricher.set_last_screen_name(None);
        self.stopwatch.clear();
        self.store.delete_customer_id()?;
        self.store.delete_anonymous_id()?;
        self.enricher.clear_global_properties()?;
        self.sessions.delete_session()
    }

    pub fn flush(&self) {
        self.queue.flush();
    }

    /// Termination hook: snapshot unflushed events and stop delivery.
    pub fn shutdown(&self) {
        self.queue.stop();
    }

    pub async fn close(&self) {
        self.queue.close().await;
    }
}

impl Drop for TrackerCore {
    fn drop(&mut self) {
        self.queue.stop();
    }
}

/// Public tracking façade.
#[derive(Clone)]
pub enum Tracker {
    Enabled(Arc<TrackerCore>),
    Disabled,
}

impl Tracker {
    pub fn builder(config: TrackerConfig) -> TrackerBuilder {
        TrackerBuilder::new(config)
    }

    pub fn disabled() -> Self {
        Self::Disabled
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled(_))
    }

    pub fn core(&self) -> Option<&TrackerCore> {
        match self {
            Self::Enabled(core) => Some(core.as_ref()),
            Self::Disabled => None,
        }
    }

    pub fn tracking_api_key(&self) -> String {
        self.core()
            .map(|core| core.config().api_key.clone())
            .unwrap_or_default()
    }

    /// Touch the session first, as every public call does.
    async fn touched(&self, operation: &'static str) -> Option<&TrackerCore> {
        let core = self.core()?;
        if let Err(e) = core.touch_session().await {
            error!(error = %e, operation, "touch session failed");
        }
        Some(core)
    }

    pub async fn touch_session(&self) {
        self.touched("touch_session").await;
    }

    pub async fn track(&self, event: &str, properties: Properties) {
        if let Some(core) = self.touched("track").await {
            core.track(event, properties);
        }
    }

    pub async fn time(&self, event: &str) {
        if let Some(core) = self.touched("time").await {
            core.time(event);
        }
    }

    pub async fn register(&self, properties: Properties) {
        if let Some(core) = self.touched("register").await {
            if let Err(e) = core.register(properties) {
                error!(error = %e, "register global properties failed");
            }
        }
    }

    pub async fn set_global_config(&self, properties: Properties) {
        self.register(properties).await;
    }

    pub async fn enter_screen_start(&self, name: &str) {
        if let Some(core) = self.touched("enter_screen_start").await {
            core.enter_screen_start(name);
        }
    }

    pub async fn enter_screen(&self, name: &str, properties: Properties) {
        if let Some(core) = self.touched("enter_screen").await {
            core.enter_screen(name, properties);
        }
    }

    pub async fn exit_screen(&self, name: &str, properties: Properties) {
        if let Some(core) = self.touched("exit_screen").await {
            core.exit_screen(name, properties);
        }
    }

    pub async fn identify(&self, customer_id: &str) {
        if let Some(core) = self.touched("identify").await {
            if let Err(e) = core.identify(customer_id) {
                error!(error = %e, "identify failed");
            }
        }
    }

    pub async fn set_user_profile(&self, customer_id: &str, customer: CustomerProperties) {
        if let Some(core) = self.touched("set_user_profile").await {
            if let Err(e) = core.set_user_profile(customer_id, customer.into_properties()) {
                error!(error = %e, "set user profile failed");
            }
        }
    }

    pub async fn view_product(&self, product: ViewProductProperties) {
        self.track(SystemEvent::ViewProduct.as_str(), product.into_properties())
            .await;
    }

    pub async fn search(&self, search: SearchProperties) {
        self.track(SystemEvent::Search.as_str(), search.into_properties())
            .await;
    }

    pub async fn add_to_cart(&self, item: CartProperties) {
        self.track(SystemEvent::AddToCart.as_str(), item.into_properties())
            .await;
    }

    pub async fn remove_from_cart(&self, item: CartProperties) {
        self.track(SystemEvent::RemoveFromCart.as_str(), item.into_properties())
            .await;
    }

    /// Track a checkout, followed by the customer's profile when supplied.
    pub async fn checkout(&self, checkout: CheckoutProperties, customer: Option<CustomerProperties>) {
        self.track(SystemEvent::Checkout.as_str(), checkout.into_properties())
            .await;
        if let Some(customer) = customer {
            self.track(SystemEvent::AddCustomer.as_str(), customer.into_properties())
                .await;
        }
    }

    pub async fn cancel_order(&self, order: OrderProperties) {
        self.track(SystemEvent::CancelOrder.as_str(), order.into_properties())
            .await;
    }

    pub async fn return_order(&self, order: OrderProperties) {
        self.track(SystemEvent::ReturnOrder.as_str(), order.into_properties())
            .await;
    }

    pub async fn destroy_session(&self) {
        if let Some(core) = self.core() {
            if let Err(e) = core.destroy_session().await {
                error!(error = %e, "destroy session failed");
            }
        }
    }

    /// Alias of [`Tracker::destroy_session`].
    pub async fn reset(&self) {
        self.destroy_session().await;
    }

    pub fn flush(&self) {
        if let Some(core) = self.core() {
            core.flush();
        }
    }

    /// Synchronous termination hook.
    pub fn shutdown(&self) {
        if let Some(core) = self.core() {
            core.shutdown();
        }
    }

    /// Shut down and wait for in-flight batches to reach the transport.
    pub async fn close(&self) {
        if let Some(core) = self.core() {
            core.close().await;
        }
    }
}

/// Assembles a [`Tracker`] from configuration and collaborators.
pub struct TrackerBuilder {
    config: TrackerConfig,
    transport: Option<Arc<dyn Transport>>,
    durable: Option<Arc<dyn KeyValueStore>>,
    volatile: Option<Arc<dyn KeyValueStore>>,
    clock: Option<Arc<dyn Clock>>,
    context: Option<Arc<dyn ContextProvider>>,
}

impl TrackerBuilder {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            transport: None,
            durable: None,
            volatile: None,
            clock: None,
            context: None,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_durable_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.durable = Some(store);
        self
    }

    pub fn with_volatile_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.volatile = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_context_provider(mut self, context: Arc<dyn ContextProvider>) -> Self {
        self.context = Some(context);
        self
    }

    /// Fill missing credentials from durable storage, as left by an earlier build.
    pub fn from_stored_credentials(mut self) -> TrackerResult<Self> {
        let store = TrackerStore::new(self.durable_store());
        if self.config.host.is_empty() {
            self.config.host = store.host().ok_or_else(|| {
                TrackerError::Config("no stored tracking host, initialise the tracker first".into())
            })?;
        }
        if self.config.api_key.is_empty() {
            self.config.api_key = store.api_key().ok_or_else(|| {
                TrackerError::Config("no stored api key, initialise the tracker first".into())
            })?;
        }
        Ok(self)
    }

    fn durable_store(&mut self) -> Arc<dyn KeyValueStore> {
        self.durable
            .get_or_insert_with(|| Arc::new(MemoryStore::new()))
            .clone()
    }

    /// Build and start the tracker. Must run inside a tokio runtime unless the
    /// configuration disables tracking.
    pub fn build(mut self) -> TrackerResult<Tracker> {
        if !self.config.enabled {
            info!("tracking disabled by configuration");
            return Ok(Tracker::Disabled);
        }
        self.config.validate()?;

        let durable = self.durable_store();
        let volatile = self
            .volatile
            .take()
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let clock = self.clock.take().unwrap_or_else(|| Arc::new(SystemClock));
        let context = self
            .context
            .take()
            .unwrap_or_else(|| Arc::new(UrlContextProvider::from_config(&self.config)));
        let transport = self.transport.take().unwrap_or_else(|| {
            debug!("no transport configured, batches will be discarded");
            Arc::new(NoopTransport)
        });
        let config = Arc::new(self.config);

        let store = TrackerStore::new(durable.clone());
        store.set_credentials(&config.host, &config.api_key)?;

        let mut global = store.global_properties();
        global.extend(config.global_properties.clone());
        store.set_global_properties(&global)?;

        let sessions = Arc::new(SessionManager::new(
            durable,
            volatile.clone(),
            clock.clone(),
            config.session_max_inactive_ms,
        ));
        let stopwatch = Arc::new(Stopwatch::new(volatile, clock.clone()));
        let enricher = EventEnricher::new(
            store.clone(),
            sessions.clone(),
            stopwatch.clone(),
            context,
            clock.clone(),
            config.platform.clone(),
            config.app_version.clone(),
            global,
        );
        let queue = PersistentQueue::new(
            store.clone(),
            transport,
            config.buffer_size,
            Duration::from_millis(config.flush_interval_ms),
            config.delivery_channel_capacity,
        );
        queue.start()?;

        info!(host = %config.host, "tracker initialised");
        Ok(Tracker::Enabled(Arc::new(TrackerCore {
            config,
            store,
            sessions,
            stopwatch,
            enricher,
            queue,
            clock,
            session_lock: AsyncMutex::new(()),
        })))
    }
}
