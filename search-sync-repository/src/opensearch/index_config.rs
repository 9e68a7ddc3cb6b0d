//! OpenSearch index configuration and mappings.
//!
//! This module defines the index settings and mappings for the listing search index.

use serde_json::{json, Value};

use crate::config::SearchIndexConfig;

/// Get the index settings and mappings for the listing search index.
///
/// The configuration includes:
/// - **search_as_you_type**: Built-in field type for autocomplete on title and description
/// - **Keyword fields**: For filtering and exact ID lookups
/// - **deleted / source_version**: Tombstone flag and version marker used by the sync pipeline
pub fn get_index_settings(config: &SearchIndexConfig) -> Value {
    json!({
        "settings": {
            "number_of_shards": config.number_of_shards,
            "number_of_replicas": config.number_of_replicas
        },
        "mappings": {
            "dynamic": false,
            "properties": {
                "id": {
                    "type": "keyword"
                },
                "entity_type": {
                    "type": "keyword"
                },
                "entity_id": {
                    "type": "keyword"
                },
                "title": {
                    "type": "search_as_you_type",
                    "fields": {
                        "raw": {
                            "type": "keyword"
                        }
                    }
                },
                "description": {
                    "type": "search_as_you_type"
                },
                "category": {
                    "type": "keyword"
                },
                "tags": {
                    "type": "keyword"
                },
                "price": {
                    "type": "double"
                },
                "currency": {
                    "type": "keyword"
                },
                "status": {
                    "type": "keyword"
                },
                "seller_id": {
                    "type": "keyword"
                },
                "location": {
                    "type": "text",
                    "fields": {
                        "raw": {
                            "type": "keyword"
                        }
                    }
                },
                "image_urls": {
                    "type": "keyword",
                    "index": false
                },
                "created_at": {
                    "type": "date"
                },
                "updated_at": {
                    "type": "date"
                },
                "attributes": {
                    "type": "object",
                    "enabled": false
                },
                "source_version": {
                    "type": "long"
                },
                "deleted": {
                    "type": "boolean"
                }
            }
        }
    })
}
