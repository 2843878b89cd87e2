//! # dog-transfer: Resilient blob transfers for DogRS applications
//!
//! `dog-transfer` moves large byte streams to and from block-blob storage over
//! an unreliable network. It owns the hard parts of a transfer and leaves the
//! REST surface and request signing to the collaborators you plug in.
//!
//! ## Key Features
//!
//! - **Chunked uploads**: Split any `AsyncRead` into blocks, stage them concurrently, commit atomically
//! - **Resumable downloads**: One continuous stream over ranged GETs that resumes after network failures
//! - **Retry policy**: Exponential or fixed back-off with jitter, per-try timeouts and read failover to a secondary host
//! - **Request instrumentation**: Request logging with signature redaction, telemetry and client request ids
//! - **Storage agnostic**: Works with any backend that implements `BlockWriter` and `HttpGetter`
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_transfer::prelude::*;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> TransferResult<()> {
//! let store = Arc::new(MemoryBlobStore::new());
//! let adapter = TransferAdapter::from_store(store)
//!     .with_upload_options(UploadOptions::new().with_block_size(4).with_max_concurrency(2));
//!
//! let ctx = OpContext::new();
//! let receipt = adapter.upload(&ctx, &b"Hello, world!"[..]).await?;
//! assert_eq!(receipt.block_count, 4);
//!
//! let data = adapter.download_to_vec(&ctx).await?;
//! assert_eq!(data, b"Hello, world!");
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ TransferAdapter              │  ← upload / open / download
//! ├──────────────┬───────────────┤
//! │ coordinator  │ RetryReader   │  ← chunking, resumption
//! ├──────────────┴───────────────┤
//! │ BlockWriter / HttpGetter     │  ← your storage client
//! ├──────────────────────────────┤
//! │ Pipeline                     │  ← telemetry, request id, retry, request log
//! └──────────────────────────────┘
//! ```

pub mod adapter;
mod config;
mod context;
mod coordinator;
mod error;
pub mod memory;
pub mod pipeline;
pub mod policy;
mod pool;
mod receipt;
mod retry_reader;
pub mod store;
mod types;

// Re-export main types for clean API
pub use adapter::TransferAdapter;
pub use config::{
    FailedRead, FailedReadFn, LogLevel, PipelineOptions, ProgressFn, RequestLogOptions,
    RetryOptions, RetryPolicyKind, RetryReaderOptions, TelemetryOptions, UploadOptions,
    DEFAULT_BLOCK_SIZE, DEFAULT_MAX_TRIES, MAX_BLOCKS, MAX_STAGE_BLOCK_BYTES,
};
pub use context::OpContext;
pub use coordinator::{upload_stream, UploadCoordinator};
pub use error::{is_network_io_error, NetworkError, NetworkErrorKind, TransferError, TransferResult};
pub use memory::MemoryBlobStore;
pub use pipeline::{Body, Pipeline, PipelineBuilder, Policy, PolicyFactory, Request, Response};
pub use pool::BufferPool;
pub use receipt::{CommitResult, StageBlockResult};
pub use retry_reader::{download_to_writer, ForceRetryHandle, RetryReader};
pub use store::{cancellable_body, BlockWriter, BodyCanceller, CancelRequest, HttpGetter, LiveResponse};
pub use types::{
    BlobAccessConditions, BlobHttpHeaders, BlockId, ByteStream, HttpGetterInfo,
    LeaseAccessConditions, Metadata, BLOCK_ID_PREFIX_LEN,
};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        BlockWriter, ByteStream, CommitResult, HttpGetter, HttpGetterInfo, MemoryBlobStore,
        OpContext, Pipeline, PipelineOptions, RetryOptions, RetryReader, RetryReaderOptions,
        TransferAdapter, TransferError, TransferResult, UploadOptions,
    };
}
