//! Context providers — device facts and page/referrer/campaign attribution
//! attached to every event.

use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use beacon_core::config::{DeviceConfig, TrackerConfig};
use beacon_core::types::{keys, Properties};

const CAMPAIGN_PARAMS: [&str; 6] = [
    "utm_id",
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
];

/// Pure, side-effect-free source of contextual properties.
pub trait ContextProvider: Send + Sync {
    /// Device, OS and platform facts.
    fn client_specifications(&self) -> Properties;

    /// Page, referrer and campaign facts. `None` means "the current page".
    fn page_and_referrer_info(&self, url: Option<&str>, referrer: Option<&str>) -> Properties;

    /// Path of the current page, used as the default screen name.
    fn current_path(&self) -> String;
}

/// Well-known search engines recognised in referrers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchEngine {
    Google,
    Bing,
    Yahoo,
    DuckDuckGo,
    CocCoc,
    Yandex,
}

impl SearchEngine {
    pub fn detect(referrer: &Url) -> Option<Self> {
        let host = referrer.host_str()?.to_ascii_lowercase();
        let engine = if host.contains("google.") {
            Self::Google
        } else if host.ends_with("bing.com") {
            Self::Bing
        } else if host.ends_with("yahoo.com") {
            Self::Yahoo
        } else if host.ends_with("duckduckgo.com") {
            Self::DuckDuckGo
        } else if host.ends_with("coccoc.com") {
            Self::CocCoc
        } else if host.ends_with("yandex.com") {
            Self::Yandex
        } else {
            return None;
        };
        Some(engine)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Bing => "bing",
            Self::Yahoo => "yahoo",
            Self::DuckDuckGo => "duckduckgo",
            Self::CocCoc => "coccoc",
            Self::Yandex => "yandex",
        }
    }

    /// Query parameter carrying the search keyword.
    fn keyword_param(&self) -> &'static str {
        match self {
            Self::Yahoo => "p",
            Self::CocCoc => "query",
            Self::Yandex => "text",
            _ => "q",
        }
    }
}

/// Context provider backed by the configured device profile and page URL.
pub struct UrlContextProvider {
    device: DeviceConfig,
    page_url: String,
    referrer: Option<String>,
}

impl UrlContextProvider {
    pub fn new(device: DeviceConfig, page_url: impl Into<String>, referrer: Option<String>) -> Self {
        Self {
            device,
            page_url: page_url.into(),
            referrer,
        }
    }

    pub fn from_config(config: &TrackerConfig) -> Self {
        Self::new(
            config.device.clone(),
            config.page_url.clone(),
            config.referrer.clone(),
        )
    }
}

impl ContextProvider for UrlContextProvider {
    fn client_specifications(&self) -> Properties {
        let mut props = Properties::new();
        props.insert("device_name".into(), json!(self.device.device_name));
        props.insert("device_version".into(), json!(self.device.device_version));
        props.insert("os_name".into(), json!(self.device.os_name));
        props.insert("os_version".into(), json!(self.device.os_version));
        props.insert("platform_name".into(), json!(self.device.platform_name));
        props.insert(
            "platform_version".into(),
            json!(self.device.platform_version),
        );
        props
    }

    fn page_and_referrer_info(&self, url: Option<&str>, referrer: Option<&str>) -> Properties {
        let mut props = Properties::new();

        let raw_url = url.unwrap_or(&self.page_url);
        match Url::parse(raw_url) {
            Ok(page) => {
                props.insert(keys::URL.into(), json!(page.as_str()));
                props.insert(
                    keys::PATH.into(),
                    json!(format!("{}{}", page.host_str().unwrap_or(""), page.path())),
                );
                props.insert(keys::URL_PARAMS.into(), query_params_json(&page));
                for (name, value) in page.query_pairs() {
                    if CAMPAIGN_PARAMS.contains(&&*name) {
                        props.insert(name.into_owned(), json!(value.into_owned()));
                    }
                }
            }
            Err(e) => debug!(url = raw_url, error = %e, "skipping unparseable page url"),
        }

        let raw_referrer = referrer.or(self.referrer.as_deref()).filter(|r| !r.is_empty());
        if let Some(raw_referrer) = raw_referrer {
            match Url::parse(raw_referrer) {
                Ok(referrer) => {
                    let engine = SearchEngine::detect(&referrer);
                    let keyword_param = engine.map_or("q", |e| e.keyword_param());
                    let keyword = referrer
                        .query_pairs()
                        .find(|(name, _)| name == keyword_param)
                        .map(|(_, value)| value.into_owned())
                        .unwrap_or_default();

                    props.insert(keys::REFERRER.into(), json!(referrer.as_str()));
                    props.insert(
                        keys::REFERRER_HOST.into(),
                        json!(referrer.host_str().unwrap_or("")),
                    );
                    props.insert(
                        keys::REFERRER_SEARCH_ENGINE.into(),
                        json!(engine.map_or("", |e| e.as_str())),
                    );
                    props.insert(keys::REFERRER_SEARCH_KEYWORD.into(), json!(keyword));
                    props.insert(keys::REFERRER_PARAMS.into(), query_params_json(&referrer));
                }
                Err(e) => {
                    debug!(referrer = raw_referrer, error = %e, "skipping unparseable referrer")
                }
            }
        }

        props
    }

    fn current_path(&self) -> String {
        Url::parse(&self.page_url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| self.page_url.clone())
    }
}

/// Query parameters encoded as a JSON object string.
fn query_params_json(url: &Url) -> Value {
    let params: serde_json::Map<String, Value> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
        .collect();
    Value::String(Value::Object(params).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> UrlContextProvider {
        UrlContextProvider::new(
            DeviceConfig::default(),
            "https://shop.example.com/products/42?utm_source=newsletter&utm_campaign=spring&ref=x",
            None,
        )
    }

    #[test]
    fn test_page_info_and_campaign() {
        let props = provider().page_and_referrer_info(None, None);
        assert_eq!(props[keys::PATH], json!("shop.example.com/products/42"));
        assert_eq!(props["utm_source"], json!("newsletter"));
        assert_eq!(props["utm_campaign"], json!("spring"));
        assert!(props.get("utm_medium").is_none());
        assert!(props.get("ref").is_none());
        assert!(props.get(keys::REFERRER).is_none());

        let params: Properties =
            serde_json::from_str(props[keys::URL_PARAMS].as_str().unwrap()).unwrap();
        assert_eq!(params["ref"], json!("x"));
    }

    #[test]
    fn test_referrer_search_keyword() {
        let props = provider().page_and_referrer_info(
            Some("https://shop.example.com/"),
            Some("https://www.google.com/search?q=running+shoes"),
        );
        assert_eq!(props[keys::REFERRER_HOST], json!("www.google.com"));
        assert_eq!(props[keys::REFERRER_SEARCH_ENGINE], json!("google"));
        assert_eq!(props[keys::REFERRER_SEARCH_KEYWORD], json!("running shoes"));
        assert!(props.get("utm_source").is_none());
    }

    #[test]
    fn test_yahoo_keyword_param() {
        let props = provider()
            .page_and_referrer_info(None, Some("https://search.yahoo.com/search?p=boots&q=no"));
        assert_eq!(props[keys::REFERRER_SEARCH_ENGINE], json!("yahoo"));
        assert_eq!(props[keys::REFERRER_SEARCH_KEYWORD], json!("boots"));
    }

    #[test]
    fn test_unknown_referrer() {
        let props =
            provider().page_and_referrer_info(None, Some("https://blog.example.org/post?q=hi"));
        assert_eq!(props[keys::REFERRER_SEARCH_ENGINE], json!(""));
        assert_eq!(props[keys::REFERRER_SEARCH_KEYWORD], json!("hi"));
    }

    #[test]
    fn test_unparseable_url_is_skipped() {
        let props = provider().page_and_referrer_info(Some("not a url"), Some("also bad"));
        assert!(props.is_empty());
    }

    #[test]
    fn test_current_path() {
        assert_eq!(provider().current_path(), "/products/42");
    }
}
