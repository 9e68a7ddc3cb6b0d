//! Mapping from record payloads to search documents.
//!
//! [`build_document`] is pure and total: any JSON value maps to a document.
//! Missing or malformed optional fields fall back to defaults.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use search_sync_shared::{DocumentKey, SearchDocument};

/// Currency used when the payload carries none.
pub const DEFAULT_CURRENCY: &str = "USD";

/// Status used when the payload carries none.
pub const DEFAULT_STATUS: &str = "active";

/// Payload keys mapped onto dedicated document fields.
const MAPPED_KEYS: &[&str] = &[
    "id",
    "title",
    "name",
    "description",
    "category",
    "tags",
    "price",
    "currency",
    "status",
    "seller_id",
    "user_id",
    "location",
    "image_urls",
    "images",
    "created_at",
    "updated_at",
];

/// Build the search document for a record.
///
/// # Arguments
///
/// * `key` - The record the payload belongs to
/// * `payload` - Current projection of the record
/// * `source_version` - Version the document will carry
pub fn build_document(key: &DocumentKey, payload: &Value, source_version: u64) -> SearchDocument {
    let empty = Map::new();
    let fields = payload.as_object().unwrap_or(&empty);

    let title = text(fields.get("title"))
        .or_else(|| text(fields.get("name")))
        .unwrap_or_default();

    SearchDocument {
        id: key.document_id(),
        entity_type: key.entity_type.clone(),
        entity_id: key.entity_id.clone(),
        title,
        description: text(fields.get("description")),
        category: category(fields.get("category")),
        tags: tags(fields.get("tags")),
        price: number(fields.get("price")),
        currency: text(fields.get("currency"))
            .map(|c| c.to_uppercase())
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
        status: text(fields.get("status"))
            .map(|s| s.to_lowercase())
            .unwrap_or_else(|| DEFAULT_STATUS.to_string()),
        seller_id: identifier(fields.get("seller_id")).or_else(|| identifier(fields.get("user_id"))),
        location: location(fields.get("location")),
        image_urls: image_urls(fields.get("image_urls").or_else(|| fields.get("images"))),
        created_at: timestamp(fields.get("created_at")),
        updated_at: timestamp(fields.get("updated_at")),
        attributes: attributes(fields),
        source_version,
    }
}

/// Non-empty trimmed string.
fn text(value: Option<&Value>) -> Option<String> {
    let s = value?.as_str()?.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Strings and numbers both serve as ids.
fn identifier(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Number(n) => Some(n.to_string()),
        other => text(Some(other)),
    }
}

/// A finite number, given as a JSON number or a numeric string.
fn number(value: Option<&Value>) -> Option<f64> {
    let n = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// A slug string, or an object carrying `slug` or `name`.
fn category(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Object(obj) => text(obj.get("slug")).or_else(|| text(obj.get("name"))),
        other => text(Some(other)),
    }
}

/// An array of strings or a comma separated string. Trimmed, deduplicated,
/// first occurrence kept.
fn tags(value: Option<&Value>) -> Vec<String> {
    let raw: Vec<String> = match value {
        Some(Value::Array(items)) => items.iter().filter_map(|v| text(Some(v))).collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };

    let mut tags: Vec<String> = Vec::with_capacity(raw.len());
    for tag in raw {
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

/// A string, or an object whose `city`, `region`/`state` and `country` are
/// joined with ", ".
fn location(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Object(obj) => {
            let parts: Vec<String> = [
                text(obj.get("city")),
                text(obj.get("region")).or_else(|| text(obj.get("state"))),
                text(obj.get("country")),
            ]
            .into_iter()
            .flatten()
            .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(", "))
            }
        }
        other => text(Some(other)),
    }
}

/// Strings, or objects carrying a `url`.
fn image_urls(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::Object(obj) => text(obj.get("url")),
                other => text(Some(other)),
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// RFC 3339 string or epoch milliseconds.
fn timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => Utc.timestamp_millis_opt(n.as_i64()?).single(),
        _ => None,
    }
}

/// Scalar payload fields without a dedicated document field.
fn attributes(fields: &Map<String, Value>) -> BTreeMap<String, Value> {
    fields
        .iter()
        .filter(|(k, v)| {
            !MAPPED_KEYS.contains(&k.as_str())
                && matches!(v, Value::String(_) | Value::Number(_) | Value::Bool(_))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> DocumentKey {
        DocumentKey::new("listing", "L1")
    }

    #[test]
    fn test_full_payload() {
        let payload = json!({
            "id": "L1",
            "title": "  Oak Chair ",
            "description": "Solid oak",
            "category": {"slug": "furniture", "name": "Furniture"},
            "tags": ["wood", "chair", "wood", " "],
            "price": "45.50",
            "currency": "eur",
            "status": "SOLD",
            "seller_id": 42,
            "location": {"city": "Lyon", "country": "FR"},
            "images": [{"url": "https://img/1.jpg"}, "https://img/2.jpg"],
            "created_at": "2024-03-01T10:00:00Z",
            "updated_at": 1709287200000i64,
            "condition": "used",
            "negotiable": true,
            "dimensions": {"w": 40}
        });

        let doc = build_document(&key(), &payload, 7);

        assert_eq!(doc.id, "listing:L1");
        assert_eq!(doc.title, "Oak Chair");
        assert_eq!(doc.description.as_deref(), Some("Solid oak"));
        assert_eq!(doc.category.as_deref(), Some("furniture"));
        assert_eq!(doc.tags, vec!["wood", "chair"]);
        assert_eq!(doc.price, Some(45.5));
        assert_eq!(doc.currency, "EUR");
        assert_eq!(doc.status, "sold");
        assert_eq!(doc.seller_id.as_deref(), Some("42"));
        assert_eq!(doc.location.as_deref(), Some("Lyon, FR"));
        assert_eq!(doc.image_urls, vec!["https://img/1.jpg", "https://img/2.jpg"]);
        assert!(doc.created_at.is_some());
        assert_eq!(doc.updated_at.map(|t| t.timestamp_millis()), Some(1709287200000));
        assert_eq!(doc.attributes.len(), 2);
        assert_eq!(doc.attributes["condition"], "used");
        assert_eq!(doc.source_version, 7);
    }

    #[test]
    fn test_minimal_payload_defaults() {
        let doc = build_document(&key(), &json!({"title": "Chair"}), 1);

        assert_eq!(doc.title, "Chair");
        assert_eq!(doc.description, None);
        assert!(doc.tags.is_empty());
        assert_eq!(doc.price, None);
        assert_eq!(doc.currency, DEFAULT_CURRENCY);
        assert_eq!(doc.status, DEFAULT_STATUS);
        assert!(doc.attributes.is_empty());
    }

    #[test]
    fn test_total_over_malformed_values() {
        let payload = json!({
            "name": "Lamp",
            "price": "free",
            "tags": "a, b ,,a",
            "created_at": "yesterday",
            "location": 12,
            "image_urls": "not-a-list"
        });

        let doc = build_document(&key(), &payload, 1);

        assert_eq!(doc.title, "Lamp");
        assert_eq!(doc.price, None);
        assert_eq!(doc.tags, vec!["a", "b"]);
        assert_eq!(doc.created_at, None);
        assert_eq!(doc.location, None);
        assert!(doc.image_urls.is_empty());

        // Not even an object.
        let doc = build_document(&key(), &json!([1, 2, 3]), 1);
        assert_eq!(doc.title, "");
    }

    #[test]
    fn test_deterministic() {
        let payload = json!({"title": "Desk", "z": 1, "a": "x", "m": false});
        assert_eq!(
            build_document(&key(), &payload, 3),
            build_document(&key(), &payload, 3)
        );
    }
}
