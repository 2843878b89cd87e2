use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use http::StatusCode;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::{
    BlobAccessConditions, BlobHttpHeaders, BlockId, BlockWriter, CommitResult, HttpGetter,
    HttpGetterInfo, LeaseAccessConditions, LiveResponse, Metadata, OpContext, StageBlockResult,
    TransferError, TransferResult,
};

/// In-memory block blob, useful for tests and demos.
///
/// Bodies are served in pieces of `piece_size` bytes through a cancellable
/// stream so forced retries work against it.
#[derive(Debug)]
pub struct MemoryBlobStore {
    state: RwLock<State>,
    piece_size: usize,
    stage_calls: AtomicUsize,
    commit_calls: AtomicUsize,
    get_calls: AtomicUsize,
}

#[derive(Debug, Default)]
struct State {
    staged: HashMap<String, Bytes>,
    blob: Option<CommittedBlob>,
    version: u64,
}

/// The committed state of the blob
#[derive(Debug, Clone)]
pub struct CommittedBlob {
    pub data: Bytes,
    pub etag: String,
    pub block_ids: Vec<String>,
    pub headers: BlobHttpHeaders,
    pub metadata: Metadata,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            piece_size: 64 * 1024,
            stage_calls: AtomicUsize::new(0),
            commit_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_piece_size(mut self, piece_size: usize) -> Self {
        self.piece_size = piece_size.max(1);
        self
    }

    /// Replace the blob outright, bypassing staging
    pub fn put_blob(&self, data: Bytes) -> String {
        let mut state = self.state.write();
        let etag = next_etag(&mut state);
        state.blob = Some(CommittedBlob {
            data,
            etag: etag.clone(),
            block_ids: Vec::new(),
            headers: BlobHttpHeaders::default(),
            metadata: Metadata::new(),
        });
        etag
    }

    pub fn committed(&self) -> Option<CommittedBlob> {
        self.state.read().blob.clone()
    }

    pub fn staged_count(&self) -> usize {
        self.state.read().staged.len()
    }

    pub fn stage_calls(&self) -> usize {
        self.stage_calls.load(Ordering::Acquire)
    }

    pub fn commit_calls(&self) -> usize {
        self.commit_calls.load(Ordering::Acquire)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::Acquire)
    }
}

fn next_etag(state: &mut State) -> String {
    state.version += 1;
    format!("\"0x{:016X}\"", state.version)
}

fn precondition_failed() -> TransferError {
    TransferError::status(StatusCode::PRECONDITION_FAILED)
}

fn check_conditions(
    blob: Option<&CommittedBlob>,
    conditions: &BlobAccessConditions,
) -> TransferResult<()> {
    if let Some(expected) = &conditions.if_match {
        match blob {
            Some(blob) if expected == "*" || *expected == blob.etag => {}
            _ => return Err(precondition_failed()),
        }
    }
    if let Some(unwanted) = &conditions.if_none_match {
        match blob {
            Some(_) if unwanted == "*" => return Err(precondition_failed()),
            Some(blob) if *unwanted == blob.etag => return Err(precondition_failed()),
            _ => {}
        }
    }
    Ok(())
}

#[async_trait]
impl BlockWriter for MemoryBlobStore {
    async fn stage_block(
        &self,
        ctx: &OpContext,
        block_id: &str,
        body: Bytes,
        _lease: &LeaseAccessConditions,
    ) -> TransferResult<StageBlockResult> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        BlockId::from_base64(block_id)?;
        self.stage_calls.fetch_add(1, Ordering::AcqRel);

        // Copy so the caller's buffer can be reused.
        let data = Bytes::copy_from_slice(&body);
        self.state.write().staged.insert(block_id.to_string(), data);
        Ok(StageBlockResult {
            request_id: Some(Uuid::new_v4().to_string()),
            content_md5: None,
        })
    }

    async fn commit_block_list(
        &self,
        ctx: &OpContext,
        ids: &[String],
        headers: &BlobHttpHeaders,
        metadata: &Metadata,
        conditions: &BlobAccessConditions,
    ) -> TransferResult<CommitResult> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        self.commit_calls.fetch_add(1, Ordering::AcqRel);

        let mut state = self.state.write();
        check_conditions(state.blob.as_ref(), conditions)?;

        let mut data = BytesMut::new();
        for id in ids {
            let block = state
                .staged
                .get(id)
                .ok_or_else(|| TransferError::invalid(format!("Unknown block id {id}")))?;
            data.extend_from_slice(block);
        }

        let etag = next_etag(&mut state);
        state.staged.clear();
        state.blob = Some(CommittedBlob {
            data: data.freeze(),
            etag: etag.clone(),
            block_ids: ids.to_vec(),
            headers: headers.clone(),
            metadata: metadata.clone(),
        });

        Ok(CommitResult::new(ids.len() as u32)
            .with_etag(etag)
            .with_last_modified(Utc::now())
            .with_request_id(Uuid::new_v4().to_string()))
    }
}

#[async_trait]
impl HttpGetter for MemoryBlobStore {
    async fn get(&self, ctx: &OpContext, info: &HttpGetterInfo) -> TransferResult<LiveResponse> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        self.get_calls.fetch_add(1, Ordering::AcqRel);

        let (data, etag) = {
            let state = self.state.read();
            let blob = state
                .blob
                .as_ref()
                .ok_or_else(|| TransferError::status(StatusCode::NOT_FOUND))?;
            if info.etag.as_ref().is_some_and(|pinned| *pinned != blob.etag) {
                return Err(precondition_failed());
            }
            (blob.data.clone(), blob.etag.clone())
        };

        let len = data.len() as u64;
        if info.offset > len || (info.offset == len && len > 0) {
            return Err(TransferError::status(StatusCode::RANGE_NOT_SATISFIABLE));
        }
        let end = match info.count {
            Some(count) => info.offset.saturating_add(count).min(len),
            None => len,
        };
        let mut range = data.slice(info.offset as usize..end as usize);

        let mut pieces: Vec<Result<Bytes, std::io::Error>> = Vec::new();
        while !range.is_empty() {
            let n = self.piece_size.min(range.len());
            pieces.push(Ok(range.split_to(n)));
        }
        let body = Box::pin(futures_util::stream::iter(pieces));
        Ok(LiveResponse::cancellable(body).with_etag(etag))
    }
}
