//! Configuration types for the search engine client.

/// Default name of the search index.
pub const DEFAULT_INDEX_NAME: &str = "listings";

/// Configuration for the search engine client.
#[derive(Debug, Clone)]
pub struct SearchIndexConfig {
    /// Name of the index documents are written to.
    pub index_name: String,
    /// Maximum number of documents sent in a single bulk request.
    /// Larger inputs are split into several requests.
    /// Set to None to disable the limit (not recommended for production).
    pub max_batch_size: Option<usize>,
    /// Primary shards used when the index is created.
    pub number_of_shards: u32,
    /// Replicas used when the index is created.
    pub number_of_replicas: u32,
}

impl Default for SearchIndexConfig {
    fn default() -> Self {
        Self {
            index_name: DEFAULT_INDEX_NAME.to_string(),
            max_batch_size: Some(1000),
            number_of_shards: 1,
            number_of_replicas: 1,
        }
    }
}

impl SearchIndexConfig {
    /// Create a config for the named index with default limits.
    pub fn new(index_name: impl Into<String>) -> Self {
        Self {
            index_name: index_name.into(),
            ..Self::default()
        }
    }

    /// Create a config with no batch size limit (use with caution).
    pub fn unlimited(mut self) -> Self {
        self.max_batch_size = None;
        self
    }

    /// Set a custom batch size limit.
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = Some(max_batch_size.max(1));
        self
    }

    /// Chunk size for bulk requests.
    pub fn chunk_size(&self) -> usize {
        self.max_batch_size.unwrap_or(usize::MAX)
    }
}
