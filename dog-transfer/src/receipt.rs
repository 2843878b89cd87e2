use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Service acknowledgement for one staged block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageBlockResult {
    pub request_id: Option<String>,
    pub content_md5: Option<Vec<u8>>,
}

/// Result of committing an ordered block list into the final blob
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub request_id: Option<String>,
    /// Number of blocks the blob was assembled from
    pub block_count: u32,
}

impl CommitResult {
    pub fn new(block_count: u32) -> Self {
        Self {
            block_count,
            ..Self::default()
        }
    }

    pub fn with_etag<S: Into<String>>(mut self, etag: S) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_last_modified(mut self, last_modified: DateTime<Utc>) -> Self {
        self.last_modified = Some(last_modified);
        self
    }

    pub fn with_request_id<S: Into<String>>(mut self, request_id: S) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}
