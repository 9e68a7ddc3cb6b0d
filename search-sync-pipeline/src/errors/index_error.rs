//! Indexer errors.

use search_sync_repository::SearchError;
use thiserror::Error;

/// Errors raised while applying change events to the search engine.
#[derive(Error, Debug, Clone)]
pub enum IndexError {
    /// The event payload cannot be turned into a search document.
    #[error("Mapping error for {key}: {reason}")]
    MappingError { key: String, reason: String },

    /// The search engine rejected a single item of a bulk request.
    #[error("Search engine rejected {key}: {reason}")]
    ItemRejected { key: String, reason: String },

    /// The search engine failed the request as a whole.
    #[error("Search error: {0}")]
    Search(#[from] SearchError),
}

impl IndexError {
    /// Create a mapping error.
    pub fn mapping(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MappingError {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create an item rejection.
    pub fn rejected(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ItemRejected {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Whether redelivering the event may succeed.
    ///
    /// Mapping errors are deterministic and never retryable. Rejected items
    /// are assumed transient (the engine may be shedding load) unless the
    /// engine explained them as a mapping or parsing problem.
    pub fn is_retryable(&self) -> bool {
        match self {
            IndexError::MappingError { .. } => false,
            IndexError::ItemRejected { reason, .. } => {
                let reason = reason.to_lowercase();
                !(reason.contains("mapper_parsing_exception")
                    || reason.contains("illegal_argument_exception"))
            }
            IndexError::Search(err) => err.is_retryable(),
        }
    }

    /// Whether the search engine could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, IndexError::Search(SearchError::ConnectionError(_)))
    }

    /// Whether this is a payload mapping failure.
    pub fn is_mapping_error(&self) -> bool {
        matches!(self, IndexError::MappingError { .. })
    }
}
