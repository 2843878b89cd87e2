use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;
use uuid::Uuid;

use crate::{TransferError, TransferResult};

/// Stream of bytes for blob content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// User-defined name/value pairs stored with a committed blob
pub type Metadata = BTreeMap<String, String>;

/// Length of the per-transfer prefix carried by every block id
pub const BLOCK_ID_PREFIX_LEN: usize = 12;

const BLOCK_ID_LEN: usize = BLOCK_ID_PREFIX_LEN + 4;

/// Identifier of a staged block: a per-transfer random prefix followed by the
/// block's sequence number (big-endian), rendered as standard base64.
///
/// Every id of a transfer has the same encoded length, so ids of one transfer
/// compare in sequence order, and two transfers never share an id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId([u8; BLOCK_ID_LEN]);

impl BlockId {
    /// Build the id of block `number` for the transfer identified by `transfer`
    pub fn new(transfer: Uuid, number: u32) -> Self {
        let mut raw = [0u8; BLOCK_ID_LEN];
        raw[..BLOCK_ID_PREFIX_LEN].copy_from_slice(&transfer.as_bytes()[..BLOCK_ID_PREFIX_LEN]);
        raw[BLOCK_ID_PREFIX_LEN..].copy_from_slice(&number.to_be_bytes());
        Self(raw)
    }

    /// Decode an id previously produced by [`BlockId::to_base64`]
    pub fn from_base64(encoded: &str) -> TransferResult<Self> {
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|e| TransferError::invalid(format!("Malformed block id {encoded:?}: {e}")))?;
        let raw: [u8; BLOCK_ID_LEN] = decoded.as_slice().try_into().map_err(|_| {
            TransferError::invalid(format!(
                "Block id {encoded:?} decodes to {} bytes, expected {BLOCK_ID_LEN}",
                decoded.len()
            ))
        })?;
        Ok(Self(raw))
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// The transfer prefix shared by all blocks of one upload
    pub fn prefix(&self) -> [u8; BLOCK_ID_PREFIX_LEN] {
        let mut prefix = [0u8; BLOCK_ID_PREFIX_LEN];
        prefix.copy_from_slice(&self.0[..BLOCK_ID_PREFIX_LEN]);
        prefix
    }

    pub fn number(&self) -> u32 {
        let mut number = [0u8; 4];
        number.copy_from_slice(&self.0[BLOCK_ID_PREFIX_LEN..]);
        u32::from_be_bytes(number)
    }

    /// Same transfer prefix, different sequence number
    pub fn with_number(mut self, number: u32) -> Self {
        self.0[BLOCK_ID_PREFIX_LEN..].copy_from_slice(&number.to_be_bytes());
        self
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// The remaining range a ranged GET must fetch.
///
/// `count == None` means "until the end of the blob".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpGetterInfo {
    /// Start offset for the request's Range header
    pub offset: u64,
    /// Bytes still wanted, or `None` to read to the end
    pub count: Option<u64>,
    /// Version pin sent as If-Match on every request
    pub etag: Option<String>,
}

impl HttpGetterInfo {
    pub fn new(offset: u64, count: Option<u64>) -> Self {
        Self {
            offset,
            count,
            etag: None,
        }
    }

    /// The whole blob
    pub fn to_end() -> Self {
        Self::default()
    }

    pub fn with_etag<S: Into<String>>(mut self, etag: S) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// Record `read` consumed bytes
    pub fn advance(&mut self, read: u64) {
        self.offset += read;
        if let Some(count) = self.count.as_mut() {
            *count = count.saturating_sub(read);
        }
    }

    /// Inclusive `(start, end)` of the range, `end == None` meaning open-ended
    pub fn range(&self) -> (u64, Option<u64>) {
        match self.count {
            Some(count) if count > 0 => (self.offset, Some(self.offset.saturating_add(count - 1))),
            _ => (self.offset, None),
        }
    }

    /// Render as an HTTP `Range` header value
    pub fn range_header(&self) -> String {
        match self.range() {
            (start, Some(end)) => format!("bytes={start}-{end}"),
            (start, None) => format!("bytes={start}-"),
        }
    }
}

/// Standard HTTP properties stored with a blob on commit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobHttpHeaders {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub content_disposition: Option<String>,
    pub cache_control: Option<String>,
    pub content_md5: Option<Vec<u8>>,
}

impl BlobHttpHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_encoding<S: Into<String>>(mut self, encoding: S) -> Self {
        self.content_encoding = Some(encoding.into());
        self
    }

    pub fn with_cache_control<S: Into<String>>(mut self, cache_control: S) -> Self {
        self.cache_control = Some(cache_control.into());
        self
    }

    pub fn with_content_disposition<S: Into<String>>(mut self, disposition: S) -> Self {
        self.content_disposition = Some(disposition.into());
        self
    }
}

/// Lease the caller must hold for the write to be accepted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseAccessConditions {
    pub lease_id: Option<String>,
}

/// Preconditions applied to the final commit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobAccessConditions {
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<DateTime<Utc>>,
    pub if_unmodified_since: Option<DateTime<Utc>>,
    pub lease: LeaseAccessConditions,
}

impl BlobAccessConditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn if_match<S: Into<String>>(mut self, etag: S) -> Self {
        self.if_match = Some(etag.into());
        self
    }

    /// `"*"` makes the commit fail if the blob already exists
    pub fn if_none_match<S: Into<String>>(mut self, etag: S) -> Self {
        self.if_none_match = Some(etag.into());
        self
    }

    pub fn with_lease<S: Into<String>>(mut self, lease_id: S) -> Self {
        self.lease.lease_id = Some(lease_id.into());
        self
    }
}
