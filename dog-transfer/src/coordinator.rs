use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::pool::BufferPool;
use crate::{
    BlockId, BlockWriter, CommitResult, LeaseAccessConditions, OpContext, ProgressFn,
    TransferError, TransferResult, UploadOptions, MAX_BLOCKS,
};

/// Split `source` into blocks, stage them concurrently and commit them in order.
///
/// Nothing is committed unless every block was staged. The first staging error
/// (or the context error) is returned as-is.
pub async fn upload_stream<R>(
    ctx: &OpContext,
    source: R,
    writer: Arc<dyn BlockWriter>,
    options: UploadOptions,
) -> TransferResult<CommitResult>
where
    R: AsyncRead + Unpin + Send,
{
    UploadCoordinator::new(writer, options).upload(ctx, source).await
}

/// Drives chunked uploads of whole streams into one block blob
#[derive(Clone)]
pub struct UploadCoordinator {
    writer: Arc<dyn BlockWriter>,
    options: UploadOptions,
}

impl std::fmt::Debug for UploadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadCoordinator")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl UploadCoordinator {
    pub fn new(writer: Arc<dyn BlockWriter>, options: UploadOptions) -> Self {
        Self { writer, options }
    }

    pub fn options(&self) -> &UploadOptions {
        &self.options
    }

    pub async fn upload<R>(&self, ctx: &OpContext, mut source: R) -> TransferResult<CommitResult>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.options.validate()?;

        let transfer = Uuid::new_v4();
        let shared = ctx.child();
        // Workers still running when this future is dropped get cancelled.
        let _cancel_on_exit = shared.drop_guard();

        let pool = Arc::new(BufferPool::new(self.options.block_size));
        let first_error = Arc::new(FirstError::default());
        let staged = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::channel::<Chunk>(1);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut workers = JoinSet::new();
        for _ in 0..self.options.max_concurrency {
            workers.spawn(stage_chunks(Worker {
                ctx: shared.clone(),
                transfer,
                rx: rx.clone(),
                writer: self.writer.clone(),
                pool: pool.clone(),
                first_error: first_error.clone(),
                lease: self.options.access_conditions.lease.clone(),
                progress: self.options.progress.clone(),
                staged: staged.clone(),
            }));
        }
        // Only workers hold the receiver, so a send fails once they are all gone.
        drop(rx);

        let produced = {
            let producing = produce(&shared, &mut source, &tx, &pool, &first_error);
            tokio::pin!(producing);
            loop {
                tokio::select! {
                    produced = &mut producing => break produced,
                    Some(joined) = workers.join_next(), if !workers.is_empty() => {
                        worker_finished(joined, &shared, &first_error);
                    }
                }
            }
        };
        if produced.is_err() {
            shared.cancel();
        }
        drop(tx);

        while let Some(joined) = workers.join_next().await {
            worker_finished(joined, &shared, &first_error);
        }

        let block_count = produced?;
        if let Some(err) = first_error.take() {
            return Err(err);
        }
        if let Some(err) = shared.err() {
            return Err(err);
        }

        let ids: Vec<String> = (0..block_count)
            .map(|number| BlockId::new(transfer, number).to_base64())
            .collect();
        let mut result = shared
            .run(self.writer.commit_block_list(
                &shared,
                &ids,
                &self.options.http_headers,
                &self.options.metadata,
                &self.options.access_conditions,
            ))
            .await?;
        result.block_count = block_count;
        Ok(result)
    }
}

/// A worker that panicked fails the whole upload
fn worker_finished(
    joined: Result<(), tokio::task::JoinError>,
    shared: &OpContext,
    first_error: &FirstError,
) {
    if let Err(e) = joined {
        first_error.record(TransferError::Internal(format!("upload worker failed: {e}")));
        shared.cancel();
    }
}

/// One block's payload, owned by exactly one worker until staged
struct Chunk {
    number: u32,
    payload: BytesMut,
}

/// First-error-wins slot shared by the producer and all workers
#[derive(Default)]
struct FirstError {
    set: AtomicBool,
    slot: Mutex<Option<TransferError>>,
}

impl FirstError {
    fn record(&self, err: TransferError) -> bool {
        if self
            .set
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *self.slot.lock() = Some(err);
            return true;
        }
        false
    }

    fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    fn take(&self) -> Option<TransferError> {
        self.slot.lock().take()
    }
}

/// Read chunks from `source` until it ends, an error was recorded or the context is done.
/// Returns the number of chunks handed to the workers; `Err` only for source failures.
async fn produce<R>(
    ctx: &OpContext,
    source: &mut R,
    tx: &mpsc::Sender<Chunk>,
    pool: &BufferPool,
    first_error: &FirstError,
) -> TransferResult<u32>
where
    R: AsyncRead + Unpin + Send,
{
    let block_size = pool.buffer_size();
    let mut number = 0u32;
    loop {
        if first_error.is_set() || ctx.is_done() {
            return Ok(number);
        }

        let mut buffer = pool.get();
        let filled = match ctx.run(read_full(source, &mut buffer)).await {
            Ok(filled) => filled,
            Err(err) if err.is_context_error() => return Ok(number),
            Err(err) => return Err(err),
        };
        if filled == 0 {
            pool.put(buffer);
            return Ok(number);
        }
        if number == MAX_BLOCKS {
            return Err(TransferError::invalid(format!(
                "Source needs more than {MAX_BLOCKS} blocks of {block_size} bytes"
            )));
        }

        buffer.truncate(filled);
        let chunk = Chunk {
            number,
            payload: buffer,
        };
        tokio::select! {
            biased;
            _ = ctx.done() => return Ok(number),
            sent = tx.send(chunk) => {
                if sent.is_err() {
                    return Ok(number);
                }
            }
        }
        number += 1;

        if filled < block_size {
            return Ok(number);
        }
    }
}

/// Fill `buffer` completely unless the source ends first
async fn read_full<R>(source: &mut R, buffer: &mut [u8]) -> TransferResult<usize>
where
    R: AsyncRead + Unpin + Send,
{
    let mut filled = 0;
    while filled < buffer.len() {
        let n = source.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

struct Worker {
    ctx: OpContext,
    transfer: Uuid,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Chunk>>>,
    writer: Arc<dyn BlockWriter>,
    pool: Arc<BufferPool>,
    first_error: Arc<FirstError>,
    lease: LeaseAccessConditions,
    progress: Option<ProgressFn>,
    staged: Arc<AtomicU64>,
}

async fn stage_chunks(worker: Worker) {
    loop {
        let next = {
            let mut rx = worker.rx.lock().await;
            rx.recv().await
        };
        let Some(chunk) = next else {
            return;
        };
        if worker.ctx.is_done() {
            worker.pool.put(chunk.payload);
            return;
        }

        let id = BlockId::new(worker.transfer, chunk.number).to_base64();
        let len = chunk.payload.len() as u64;
        let body = chunk.payload.freeze();
        let result = worker
            .ctx
            .run(worker.writer.stage_block(&worker.ctx, &id, body.clone(), &worker.lease))
            .await;
        if let Ok(buffer) = body.try_into_mut() {
            worker.pool.put(buffer);
        }

        match result {
            Ok(_) => {
                let total = worker.staged.fetch_add(len, Ordering::AcqRel) + len;
                if let Some(progress) = &worker.progress {
                    progress(total);
                }
            }
            // Shared context already ended; its error or the recorded one wins.
            Err(_) if worker.ctx.is_done() => return,
            Err(err) => {
                worker.first_error.record(err);
                worker.ctx.cancel();
                return;
            }
        }
    }
}
