//! Boundary normalization: loosely typed order payloads into [`OrderRecord`].
//!
//! Upstream payloads (poll batches, push events, remote query pages) disagree on
//! field names and types. Everything is folded into the canonical shape here so
//! optional/absent source fields never reach matching or cache-key code.

#![forbid(unsafe_code)]

use serde_json::Value;
use smallvec::SmallVec;

use crate::{normalize_email, Customer, FulfillmentStatus, LineItem, Millis, Money, OrderRecord, PaymentStatus, RecordError};

// Top-level keys consumed by the normalizer; everything else lands in `extra`.
const CONSUMED: &[&str] = &[
    "id", "_id", "number", "orderNumber", "createdAt", "createdDate", "_createdDate", "status",
    "fulfillmentStatus", "paymentStatus", "priceSummary", "totalAmount", "currency", "customer",
    "buyerInfo", "billingInfo", "lineItems",
];

impl OrderRecord {
    /// Normalize a raw JSON order. Fails only when no usable id is present.
    pub fn from_raw(raw: &Value) -> Result<Self, RecordError> {
        let id = first_scalar(raw, &["/id", "/_id"]).unwrap_or_default();
        if id.is_empty() {
            return Err(RecordError::MalformedRecord("missing id".into()));
        }
        let number = first_scalar(raw, &["/number", "/orderNumber"]).unwrap_or_default();
        let created_at = ["/createdAt", "/createdDate", "/_createdDate"]
            .iter()
            .find_map(|p| raw.pointer(p).and_then(parse_ts))
            .unwrap_or(0);

        // An order-level CANCELED wins over the fulfillment status.
        let canceled = raw
            .pointer("/status")
            .and_then(|v| v.as_str())
            .map(|s| matches!(s.parse::<FulfillmentStatus>(), Ok(FulfillmentStatus::Canceled)))
            .unwrap_or(false);
        let status = if canceled {
            FulfillmentStatus::Canceled
        } else {
            ["/fulfillmentStatus", "/status"]
                .iter()
                .find_map(|p| raw.pointer(p).and_then(|v| v.as_str()).and_then(|s| s.parse::<FulfillmentStatus>().ok()))
                .unwrap_or(FulfillmentStatus::NotFulfilled)
        };
        let payment_status = raw
            .pointer("/paymentStatus")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<PaymentStatus>().ok())
            .unwrap_or_default();

        let total = if let Some(t) = raw.pointer("/priceSummary/total") {
            Money { amount: t.get("amount").and_then(parse_amount).unwrap_or(0.0), currency: currency_of(raw, t) }
        } else {
            Money { amount: raw.pointer("/totalAmount").and_then(parse_amount).unwrap_or(0.0), currency: currency_of(raw, &Value::Null) }
        };

        let line_items: SmallVec<[LineItem; 2]> = raw
            .pointer("/lineItems")
            .and_then(|v| v.as_array())
            .map(|items| items.iter().map(line_item).collect())
            .unwrap_or_default();

        let mut extra = serde_json::Map::new();
        if let Some(obj) = raw.as_object() {
            for (k, v) in obj.iter() {
                if !CONSUMED.contains(&k.as_str()) { extra.insert(k.clone(), v.clone()); }
            }
        }

        Ok(OrderRecord {
            id,
            created_at,
            status,
            payment_status,
            total,
            number,
            customer: customer(raw),
            line_items,
            extra: if extra.is_empty() { Value::Null } else { Value::Object(extra) },
        })
    }
}

fn first_scalar(raw: &Value, paths: &[&str]) -> Option<String> {
    paths.iter().find_map(|p| match raw.pointer(p) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn non_empty(v: Option<&Value>) -> Option<String> {
    v.and_then(|v| v.as_str()).map(|s| s.trim()).filter(|s| !s.is_empty()).map(|s| s.to_string())
}

fn parse_ts(v: &Value) -> Option<Millis> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.timestamp_millis())
            .or_else(|| s.trim().parse::<i64>().ok()),
        _ => None,
    }
}

fn parse_amount(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn currency_of(raw: &Value, total: &Value) -> String {
    non_empty(total.get("currency"))
        .or_else(|| non_empty(raw.pointer("/currency")))
        .map(|c| c.to_ascii_uppercase())
        .unwrap_or_default()
}

fn customer(raw: &Value) -> Customer {
    let first = non_empty(raw.pointer("/buyerInfo/firstName"))
        .or_else(|| non_empty(raw.pointer("/billingInfo/contactDetails/firstName")));
    let last = non_empty(raw.pointer("/buyerInfo/lastName"))
        .or_else(|| non_empty(raw.pointer("/billingInfo/contactDetails/lastName")));
    let joined = match (first, last) {
        (Some(f), Some(l)) => Some(format!("{} {}", f, l)),
        (Some(f), None) => Some(f),
        (None, Some(l)) => Some(l),
        (None, None) => None,
    };
    let email = non_empty(raw.pointer("/customer/email"))
        .or_else(|| non_empty(raw.pointer("/buyerInfo/email")))
        .map(|e| normalize_email(&e))
        .filter(|e| !e.is_empty());
    Customer {
        name: non_empty(raw.pointer("/customer/name")).or(joined),
        email,
        phone: non_empty(raw.pointer("/customer/phone"))
            .or_else(|| non_empty(raw.pointer("/buyerInfo/phone")))
            .or_else(|| non_empty(raw.pointer("/billingInfo/contactDetails/phone"))),
        company: non_empty(raw.pointer("/customer/company"))
            .or_else(|| non_empty(raw.pointer("/billingInfo/contactDetails/company"))),
    }
}

fn line_item(v: &Value) -> LineItem {
    let name = non_empty(v.get("name"))
        .or_else(|| non_empty(v.pointer("/productName/original")))
        .unwrap_or_default();
    let quantity = v.get("quantity").and_then(|q| q.as_u64()).unwrap_or(1).min(u32::MAX as u64) as u32;
    let sku = non_empty(v.get("sku")).or_else(|| non_empty(v.pointer("/physicalProperties/sku")));
    let price = v.get("price").and_then(|p| {
        let amount = p.get("amount").and_then(parse_amount).or_else(|| parse_amount(p))?;
        Some(Money { amount, currency: non_empty(p.get("currency")).map(|c| c.to_ascii_uppercase()).unwrap_or_default() })
    });
    LineItem { name, quantity, sku, price }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn camel_case_payload_is_normalized() {
        let raw = json!({
            "_id": "ord-1",
            "number": 10042,
            "_createdDate": "2024-03-01T10:00:00Z",
            "status": "APPROVED",
            "fulfillmentStatus": "PARTIALLY_FULFILLED",
            "paymentStatus": "PAID",
            "priceSummary": { "total": { "amount": "42.50", "currency": "usd" } },
            "buyerInfo": { "email": "  John@Example.COM " },
            "billingInfo": { "contactDetails": { "firstName": "John", "lastName": "Doe", "company": "Acme" } },
            "lineItems": [ { "productName": { "original": "Mug" }, "quantity": 2, "physicalProperties": { "sku": "M-1" } } ],
            "channelInfo": { "type": "WEB" }
        });
        let o = OrderRecord::from_raw(&raw).unwrap();
        assert_eq!(o.id, "ord-1");
        assert_eq!(o.number, "10042");
        assert_eq!(o.created_at, 1_709_287_200_000);
        assert_eq!(o.status, FulfillmentStatus::PartiallyFulfilled);
        assert_eq!(o.payment_status, PaymentStatus::Paid);
        assert_eq!(o.total, Money { amount: 42.5, currency: "USD".into() });
        assert_eq!(o.customer.email.as_deref(), Some("john@example.com"));
        assert_eq!(o.customer.name.as_deref(), Some("John Doe"));
        assert_eq!(o.customer.company.as_deref(), Some("Acme"));
        assert_eq!(o.line_items.len(), 1);
        assert_eq!(o.line_items[0].quantity, 2);
        assert_eq!(o.line_items[0].sku.as_deref(), Some("M-1"));
        assert_eq!(o.extra["channelInfo"]["type"], "WEB");
        assert!(o.extra.get("buyerInfo").is_none());
    }

    #[test]
    fn missing_id_is_malformed() {
        let err = OrderRecord::from_raw(&json!({ "number": "1" })).unwrap_err();
        assert!(matches!(err, RecordError::MalformedRecord(_)));
        assert!(OrderRecord::from_raw(&json!({ "id": "   " })).is_err());
    }

    #[test]
    fn order_level_cancel_wins() {
        let o = OrderRecord::from_raw(&json!({ "id": 7, "status": "CANCELED", "fulfillmentStatus": "FULFILLED" })).unwrap();
        assert_eq!(o.id, "7");
        assert_eq!(o.status, FulfillmentStatus::Canceled);
    }

    #[test]
    fn flat_payload_with_defaults() {
        let o = OrderRecord::from_raw(&json!({
            "id": "a", "createdAt": 1234, "totalAmount": 9.5, "currency": "eur",
            "customer": { "name": "Ann", "email": "", "phone": "555-0101" }
        }))
        .unwrap();
        assert_eq!(o.created_at, 1234);
        assert_eq!(o.status, FulfillmentStatus::NotFulfilled);
        assert_eq!(o.payment_status, PaymentStatus::Unspecified);
        assert_eq!(o.total.currency, "EUR");
        assert_eq!(o.customer.email, None);
        assert_eq!(o.customer.phone.as_deref(), Some("555-0101"));
        assert_eq!(o.extra, Value::Null);
    }
}
