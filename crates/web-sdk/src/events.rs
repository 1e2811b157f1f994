//! Typed payloads for the named tracking verbs (product views, searches,
//! cart and order actions, customer profiles).
//!
//! Every payload flattens an `extra` map so callers can attach arbitrary
//! additional properties.

use serde::{Deserialize, Serialize};
use tracing::warn;

use beacon_core::types::Properties;

/// Convert a payload into a flat property bag. `None` fields are omitted.
pub trait IntoProperties {
    fn into_properties(self) -> Properties;
}

impl<T: Serialize> IntoProperties for T {
    fn into_properties(self) -> Properties {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(other) => {
                warn!(kind = ?other, "payload did not serialize to an object");
                Properties::new()
            }
            Err(e) => {
                warn!(error = %e, "failed to serialize payload");
                Properties::new()
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewProductProperties {
    pub product_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_stock: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_id: Option<String>,
    #[serde(flatten)]
    pub extra: Properties,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchProperties {
    pub search_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_detect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(flatten)]
    pub extra: Properties,
}

/// Payload for both add-to-cart and remove-from-cart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CartProperties {
    pub cart_id: String,
    pub product_id: String,
    pub product_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_quantity: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_discount: Option<f64>,
    #[serde(flatten)]
    pub extra: Properties,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckoutProperties {
    pub checkout_id: String,
    pub cart_id: String,
    pub checkout_stage: String,
    #[serde(flatten)]
    pub extra: Properties,
}

/// Payload for order cancellations and returns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderProperties {
    pub order_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_price: Option<f64>,
    #[serde(flatten)]
    pub extra: Properties,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CustomerGender {
    Female,
    Male,
    Other,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomerProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<CustomerGender>,
    /// Date of birth, epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dob: Option<i64>,
    #[serde(flatten)]
    pub extra: Properties,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cart_properties_flatten_extra() {
        let mut extra = Properties::new();
        extra.insert("coupon".into(), json!("SPRING10"));
        let props = CartProperties {
            cart_id: "c-1".into(),
            product_id: "p-9".into(),
            product_price: 19.5,
            product_quantity: Some(2),
            product_discount: None,
            extra,
        }
        .into_properties();

        assert_eq!(props["cart_id"], json!("c-1"));
        assert_eq!(props["product_quantity"], json!(2));
        assert_eq!(props["coupon"], json!("SPRING10"));
        assert!(!props.contains_key("product_discount"));
        assert!(!props.contains_key("extra"));
    }

    #[test]
    fn test_customer_gender_serializes_snake_case() {
        let props = CustomerProperties {
            email: Some("a@example.com".into()),
            gender: Some(CustomerGender::Female),
            ..Default::default()
        }
        .into_properties();
        assert_eq!(props["gender"], json!("female"));
        assert_eq!(props.len(), 2);
    }
}
