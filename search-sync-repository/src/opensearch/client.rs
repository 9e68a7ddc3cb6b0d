//! OpenSearch client implementation.
//!
//! This module provides the concrete implementation of `SearchEngineClient`
//! using the OpenSearch Rust client.

use std::collections::HashMap;

use async_trait::async_trait;
use opensearch::{
    cluster::ClusterHealthParts,
    http::request::JsonBody,
    http::transport::{SingleNodeConnectionPool, TransportBuilder},
    indices::{IndicesCreateParts, IndicesDeleteParts, IndicesExistsParts},
    BulkParts, GetParts, MgetParts, OpenSearch,
};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::config::SearchIndexConfig;
use crate::errors::SearchError;
use crate::interfaces::SearchEngineClient;
use crate::opensearch::index_config::get_index_settings;
use crate::types::{DeleteRequest, HealthStatus, PerItemResult};
use search_sync_shared::{DocumentKey, DocumentVersion, SearchDocument};

/// OpenSearch client implementation.
///
/// Documents are written with external versioning: the document's
/// `source_version` becomes the OpenSearch `_version`. Upserts use
/// `version_type=external` (strictly greater wins) and deletes write a
/// tombstone with `version_type=external_gte`, so a delete wins a tie with an
/// upsert at the same version.
///
/// # Example
///
/// ```ignore
/// let client = OpenSearchClient::new("http://localhost:9200", SearchIndexConfig::new("listings")).await?;
/// client.ensure_index().await?;
/// let results = client.bulk_upsert(&documents).await?;
/// ```
pub struct OpenSearchClient {
    client: OpenSearch,
    config: SearchIndexConfig,
}

impl OpenSearchClient {
    /// Create a new OpenSearch client connected to the specified URL.
    ///
    /// # Arguments
    ///
    /// * `url` - The OpenSearch server URL (e.g., "http://localhost:9200")
    /// * `config` - Index name and bulk limits
    ///
    /// # Returns
    ///
    /// * `Ok(OpenSearchClient)` - A new client instance
    /// * `Err(SearchError)` - If connection setup fails
    pub async fn new(url: &str, config: SearchIndexConfig) -> Result<Self, SearchError> {
        let parsed_url = Url::parse(url).map_err(|e| SearchError::connection(e.to_string()))?;

        let conn_pool = SingleNodeConnectionPool::new(parsed_url);
        let transport = TransportBuilder::new(conn_pool)
            .disable_proxy()
            .build()
            .map_err(|e| SearchError::connection(e.to_string()))?;

        let client = OpenSearch::new(transport);

        info!(
            url = %url,
            index = %config.index_name,
            "Created OpenSearch client"
        );

        Ok(Self { client, config })
    }

    /// Source body of a live document.
    fn document_body(document: &SearchDocument) -> Result<Value, SearchError> {
        let mut body = serde_json::to_value(document)
            .map_err(|e| SearchError::SerializationError(e.to_string()))?;
        if let Some(map) = body.as_object_mut() {
            map.insert("deleted".to_string(), json!(false));
        }
        Ok(body)
    }

    /// Source body of a tombstone.
    fn tombstone_body(request: &DeleteRequest) -> Value {
        json!({
            "id": request.key.document_id(),
            "entity_type": request.key.entity_type,
            "entity_id": request.key.entity_id,
            "source_version": request.source_version,
            "deleted": true
        })
    }

    /// Send one bulk request and map its per-item results.
    async fn send_bulk(
        &self,
        body: Vec<JsonBody<Value>>,
        keys: &[DocumentKey],
    ) -> Result<Vec<PerItemResult>, SearchError> {
        let response = self
            .client
            .bulk(BulkParts::Index(&self.config.index_name))
            .body(body)
            .send()
            .await
            .map_err(|e| SearchError::connection(e.to_string()))?;

        let status = response.status_code();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %error_body, "Bulk request failed");
            return Err(SearchError::bulk_index(format!(
                "Bulk request failed with status {}: {}",
                status, error_body
            )));
        }

        let response_body: Value = response
            .json()
            .await
            .map_err(|e| SearchError::parse(e.to_string()))?;

        parse_bulk_items(&response_body, keys)
    }
}

/// Map a bulk response to per-item results, in request order.
///
/// Per-item status 409 (`version_conflict_engine_exception`) is reported as a
/// version conflict rather than a failure.
pub(crate) fn parse_bulk_items(
    response: &Value,
    keys: &[DocumentKey],
) -> Result<Vec<PerItemResult>, SearchError> {
    let items = response
        .get("items")
        .and_then(|i| i.as_array())
        .ok_or_else(|| SearchError::parse("Bulk response has no items"))?;

    if items.len() != keys.len() {
        return Err(SearchError::parse(format!(
            "Bulk response has {} items, expected {}",
            items.len(),
            keys.len()
        )));
    }

    let results = items
        .iter()
        .zip(keys)
        .map(|(item, key)| {
            // Each item is keyed by its action name ("index", "delete", ...)
            let result = item
                .as_object()
                .and_then(|o| o.values().next())
                .cloned()
                .unwrap_or(Value::Null);
            let status = result.get("status").and_then(|s| s.as_u64()).unwrap_or(0);

            match result.get("error") {
                None if (200..300).contains(&status) => PerItemResult::ok(key.clone()),
                _ if status == 409 => PerItemResult::conflict(key.clone()),
                Some(error) => {
                    let error_type = error
                        .get("type")
                        .and_then(|t| t.as_str())
                        .unwrap_or("unknown");
                    let reason = error
                        .get("reason")
                        .and_then(|r| r.as_str())
                        .unwrap_or_default();
                    PerItemResult::failed(
                        key.clone(),
                        format!("status {}: {}: {}", status, error_type, reason),
                    )
                }
                None => PerItemResult::failed(key.clone(), format!("unexpected status {}", status)),
            }
        })
        .collect();

    Ok(results)
}

/// Extract the version state of a found `mget` doc.
fn parse_version(doc: &Value) -> Option<(DocumentKey, DocumentVersion)> {
    if !doc.get("found").and_then(|f| f.as_bool()).unwrap_or(false) {
        return None;
    }
    let key = DocumentKey::from_document_id(doc.get("_id")?.as_str()?)?;
    let source = doc.get("_source")?;
    let source_version = source.get("source_version")?.as_u64()?;
    let deleted = source
        .get("deleted")
        .and_then(|d| d.as_bool())
        .unwrap_or(false);

    Some((
        key,
        DocumentVersion {
            source_version,
            deleted,
        },
    ))
}

#[async_trait]
impl SearchEngineClient for OpenSearchClient {
    async fn health(&self) -> Result<HealthStatus, SearchError> {
        let response = self
            .client
            .cluster()
            .health(ClusterHealthParts::None)
            .send()
            .await
            .map_err(|e| SearchError::connection(e.to_string()))?;

        if !response.status_code().is_success() {
            warn!(status = %response.status_code(), "Cluster health request failed");
            return Ok(HealthStatus::Unreachable);
        }

        let health: Value = response
            .json()
            .await
            .map_err(|e| SearchError::parse(e.to_string()))?;
        let status = health
            .get("status")
            .and_then(|s| s.as_str())
            .unwrap_or("unknown");

        debug!(status = %status, "Cluster health");
        Ok(HealthStatus::from_status(status))
    }

    #[instrument(skip(self, documents), fields(count = documents.len()))]
    async fn bulk_upsert(
        &self,
        documents: &[SearchDocument],
    ) -> Result<Vec<PerItemResult>, SearchError> {
        let mut results = Vec::with_capacity(documents.len());

        for chunk in documents.chunks(self.config.chunk_size()) {
            let mut body: Vec<JsonBody<Value>> = Vec::with_capacity(chunk.len() * 2);
            let mut keys = Vec::with_capacity(chunk.len());

            for doc in chunk {
                body.push(
                    json!({
                        "index": {
                            "_id": doc.id,
                            "version": doc.source_version,
                            "version_type": "external"
                        }
                    })
                    .into(),
                );
                body.push(Self::document_body(doc)?.into());
                keys.push(doc.key());
            }

            results.extend(self.send_bulk(body, &keys).await?);
        }

        debug!(count = results.len(), "Bulk upsert completed");
        Ok(results)
    }

    #[instrument(skip(self, requests), fields(count = requests.len()))]
    async fn bulk_delete(
        &self,
        requests: &[DeleteRequest],
    ) -> Result<Vec<PerItemResult>, SearchError> {
        let mut results = Vec::with_capacity(requests.len());

        for chunk in requests.chunks(self.config.chunk_size()) {
            let mut body: Vec<JsonBody<Value>> = Vec::with_capacity(chunk.len() * 2);
            let mut keys = Vec::with_capacity(chunk.len());

            for request in chunk {
                body.push(
                    json!({
                        "index": {
                            "_id": request.key.document_id(),
                            "version": request.source_version,
                            "version_type": "external_gte"
                        }
                    })
                    .into(),
                );
                body.push(Self::tombstone_body(request).into());
                keys.push(request.key.clone());
            }

            results.extend(self.send_bulk(body, &keys).await?);
        }

        debug!(count = results.len(), "Bulk delete completed");
        Ok(results)
    }

    async fn fetch_versions(
        &self,
        keys: &[DocumentKey],
    ) -> Result<HashMap<DocumentKey, DocumentVersion>, SearchError> {
        let mut versions = HashMap::with_capacity(keys.len());
        if keys.is_empty() {
            return Ok(versions);
        }

        for chunk in keys.chunks(self.config.chunk_size()) {
            let docs: Vec<Value> = chunk
                .iter()
                .map(|key| {
                    json!({
                        "_id": key.document_id(),
                        "_source": ["source_version", "deleted"]
                    })
                })
                .collect();

            let response = self
                .client
                .mget(MgetParts::Index(&self.config.index_name))
                .body(json!({ "docs": docs }))
                .send()
                .await
                .map_err(|e| SearchError::connection(e.to_string()))?;

            let status = response.status_code();
            // Index not created yet: nothing is indexed
            if status.as_u16() == 404 {
                return Ok(versions);
            }
            if !status.is_success() {
                let error_body = response.text().await.unwrap_or_default();
                return Err(SearchError::index(format!(
                    "Version lookup failed with status {}: {}",
                    status, error_body
                )));
            }

            let body: Value = response
                .json()
                .await
                .map_err(|e| SearchError::parse(e.to_string()))?;

            if let Some(found) = body.get("docs").and_then(|d| d.as_array()) {
                versions.extend(found.iter().filter_map(parse_version));
            }
        }

        Ok(versions)
    }

    async fn get_document(&self, key: &DocumentKey) -> Result<Option<SearchDocument>, SearchError> {
        let doc_id = key.document_id();
        let response = self
            .client
            .get(GetParts::IndexId(&self.config.index_name, &doc_id))
            .send()
            .await
            .map_err(|e| SearchError::connection(e.to_string()))?;

        let status = response.status_code();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(SearchError::index(format!(
                "Get failed with status {}: {}",
                status, error_body
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| SearchError::parse(e.to_string()))?;
        let source = match body.get("_source") {
            Some(source) => source,
            None => return Ok(None),
        };
        if source.get("deleted").and_then(|d| d.as_bool()).unwrap_or(false) {
            return Ok(None);
        }

        serde_json::from_value(source.clone())
            .map(Some)
            .map_err(|e| SearchError::parse(e.to_string()))
    }

    async fn create_index(&self, mapping: &Value) -> Result<(), SearchError> {
        let response = self
            .client
            .indices()
            .create(IndicesCreateParts::Index(&self.config.index_name))
            .body(mapping.clone())
            .send()
            .await
            .map_err(|e| SearchError::connection(e.to_string()))?;

        let status = response.status_code();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            // Another instance won the race
            if error_body.contains("resource_already_exists_exception") {
                debug!(index = %self.config.index_name, "Index already exists");
                return Ok(());
            }
            error!(status = %status, body = %error_body, "Create index failed");
            return Err(SearchError::index_creation(format!(
                "Create index failed with status {}: {}",
                status, error_body
            )));
        }

        info!(index = %self.config.index_name, "Created search index");
        Ok(())
    }

    async fn delete_index(&self) -> Result<(), SearchError> {
        let response = self
            .client
            .indices()
            .delete(IndicesDeleteParts::Index(&[&self.config.index_name]))
            .send()
            .await
            .map_err(|e| SearchError::connection(e.to_string()))?;

        let status = response.status_code();
        // 404 is acceptable - index may not exist
        if !status.is_success() && status.as_u16() != 404 {
            let error_body = response.text().await.unwrap_or_default();
            return Err(SearchError::index_creation(format!(
                "Delete index failed with status {}: {}",
                status, error_body
            )));
        }

        info!(index = %self.config.index_name, "Deleted search index");
        Ok(())
    }

    async fn ensure_index(&self) -> Result<(), SearchError> {
        let response = self
            .client
            .indices()
            .exists(IndicesExistsParts::Index(&[&self.config.index_name]))
            .send()
            .await
            .map_err(|e| SearchError::connection(e.to_string()))?;

        if response.status_code().is_success() {
            debug!(index = %self.config.index_name, "Search index exists");
            return Ok(());
        }

        self.create_index(&get_index_settings(&self.config)).await
    }
}
