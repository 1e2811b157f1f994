use serde::{Deserialize, Serialize};

/// Flat property bag attached to every tracked event.
pub type Properties = serde_json::Map<String, serde_json::Value>;

/// Reserved property keys. After enrichment every event carries all of these.
pub mod keys {
    pub const EVENT_ID: &str = "event_id";
    pub const EVENT_NAME: &str = "event_name";
    pub const TIMESTAMP: &str = "timestamp";
    pub const SESSION_ID: &str = "session_id";
    pub const CUSTOMER_ID: &str = "customer_id";
    pub const ANONYMOUS_ID: &str = "anonymous_id";
    pub const SCREEN_NAME: &str = "screen_name";
    pub const START_TIME: &str = "start_time";
    pub const DURATION: &str = "duration";
    pub const APP_NAME: &str = "app_name";
    pub const APP_VERSION: &str = "app_version";

    // Page and referrer facts.
    pub const URL: &str = "url";
    pub const PATH: &str = "path";
    pub const URL_PARAMS: &str = "url_params";
    pub const REFERRER: &str = "referrer";
    pub const REFERRER_HOST: &str = "referrer_host";
    pub const REFERRER_PARAMS: &str = "referrer_params";
    pub const REFERRER_SEARCH_ENGINE: &str = "referrer_search_engine";
    pub const REFERRER_SEARCH_KEYWORD: &str = "referrer_search_keyword";
}

/// A tracked event: a name plus its fully enriched properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub properties: Properties,
}

impl Event {
    pub fn new(name: impl Into<String>, properties: Properties) -> Self {
        Self {
            name: name.into(),
            properties,
        }
    }
}

/// Persisted session record. `is_expired` is computed on read and never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub expired_at: i64,
    #[serde(default)]
    pub last_activity_at: i64,
    #[serde(skip)]
    pub is_expired: bool,
    /// Snapshot of the session-created event, reused for the session-end event.
    #[serde(default)]
    pub properties: Properties,
}

/// Events emitted by the tracker itself or by its named tracking verbs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SystemEvent {
    ScreenEnter,
    PageView,
    SessionCreated,
    SessionEnd,
    AddCustomer,
    ViewProduct,
    Search,
    AddToCart,
    RemoveFromCart,
    Checkout,
    CancelOrder,
    ReturnOrder,
}

impl SystemEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScreenEnter => "screen_enter",
            Self::PageView => "page_view",
            Self::SessionCreated => "session_created",
            Self::SessionEnd => "session_end",
            Self::AddCustomer => "add_customer",
            Self::ViewProduct => "view_product",
            Self::Search => "search",
            Self::AddToCart => "add_to_cart",
            Self::RemoveFromCart => "remove_from_cart",
            Self::Checkout => "checkout",
            Self::CancelOrder => "cancel_order",
            Self::ReturnOrder => "return_order",
        }
    }
}

impl std::fmt::Display for SystemEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_system_event_name_matches_serde() {
        for event in [
            SystemEvent::ScreenEnter,
            SystemEvent::SessionCreated,
            SystemEvent::RemoveFromCart,
            SystemEvent::ReturnOrder,
        ] {
            let serialized = serde_json::to_value(event).unwrap();
            assert_eq!(serialized, json!(event.as_str()));
        }
    }

    #[test]
    fn test_session_info_tolerates_missing_fields() {
        let parsed: SessionInfo = serde_json::from_str(r#"{"session_id":"abc"}"#).unwrap();
        assert_eq!(parsed.session_id, "abc");
        assert_eq!(parsed.created_at, 0);
        assert_eq!(parsed.expired_at, 0);
        assert!(parsed.properties.is_empty());
    }

    #[test]
    fn test_is_expired_not_persisted() {
        let info = SessionInfo {
            session_id: "s-1".into(),
            created_at: 1,
            expired_at: 2,
            last_activity_at: 1,
            is_expired: true,
            properties: Properties::new(),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("is_expired").is_none());
    }
}
