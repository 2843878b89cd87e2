use std::sync::Arc;

use tokio::io::AsyncRead;

use crate::{
    BlockWriter, CommitResult, HttpGetter, HttpGetterInfo, OpContext, RetryReader,
    RetryReaderOptions, TransferResult, UploadCoordinator, UploadOptions,
};

/// Transfer facade for one blob - this is what services embed
#[derive(Clone)]
pub struct TransferAdapter {
    writer: Arc<dyn BlockWriter>,
    getter: Arc<dyn HttpGetter>,
    upload_options: UploadOptions,
    reader_options: RetryReaderOptions,
}

impl std::fmt::Debug for TransferAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferAdapter")
            .field("upload_options", &self.upload_options)
            .field("reader_options", &self.reader_options)
            .finish_non_exhaustive()
    }
}

impl TransferAdapter {
    /// Create a new adapter from separate write and read collaborators
    pub fn new(writer: Arc<dyn BlockWriter>, getter: Arc<dyn HttpGetter>) -> Self {
        Self {
            writer,
            getter,
            upload_options: UploadOptions::default(),
            reader_options: RetryReaderOptions::new(3),
        }
    }

    /// Create from a store that both writes blocks and serves ranged reads
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: BlockWriter + HttpGetter + 'static,
    {
        Self::new(store.clone(), store)
    }

    pub fn with_upload_options(mut self, options: UploadOptions) -> Self {
        self.upload_options = options;
        self
    }

    pub fn with_reader_options(mut self, options: RetryReaderOptions) -> Self {
        self.reader_options = options;
        self
    }

    /// Upload `source` with the adapter's default options
    pub async fn upload<R>(&self, ctx: &OpContext, source: R) -> TransferResult<CommitResult>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.upload_with(ctx, source, self.upload_options.clone())
            .await
    }

    pub async fn upload_with<R>(
        &self,
        ctx: &OpContext,
        source: R,
        options: UploadOptions,
    ) -> TransferResult<CommitResult>
    where
        R: AsyncRead + Unpin + Send,
    {
        UploadCoordinator::new(self.writer.clone(), options)
            .upload(ctx, source)
            .await
    }

    /// Open `count` bytes from `offset` (`None` reads to the end).
    ///
    /// The first GET is issued here so missing blobs and bad ranges fail early.
    pub async fn open(
        &self,
        ctx: &OpContext,
        offset: u64,
        count: Option<u64>,
    ) -> TransferResult<RetryReader> {
        let info = HttpGetterInfo::new(offset, count);
        let initial = ctx.run(self.getter.get(ctx, &info)).await?;
        Ok(RetryReader::new(
            ctx.clone(),
            Some(initial),
            info,
            self.reader_options.clone(),
            self.getter.clone(),
        ))
    }

    /// Read the whole blob into memory
    pub async fn download_to_vec(&self, ctx: &OpContext) -> TransferResult<Vec<u8>> {
        let mut reader = self.open(ctx, 0, None).await?;
        let mut out = Vec::new();
        reader.copy_to(&mut out).await?;
        Ok(out)
    }
}
