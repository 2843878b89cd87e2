//! Resumable download reader.
//!
//! A [`RetryReader`] presents one continuous byte stream over a series of
//! ranged GETs. When a body read fails with a network error (or a forced
//! retry), it drops the body and asks its [`HttpGetter`] for the rest of the
//! range, starting at the last byte it handed out.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::io::StreamReader;

use crate::error::is_network_io_error;
use crate::{
    ByteStream, CancelRequest, FailedRead, HttpGetter, HttpGetterInfo, LiveResponse, OpContext,
    RetryReaderOptions, TransferResult,
};

const STREAM_CHUNK: usize = 64 * 1024;

struct LiveBody {
    stream: ByteStream,
    pending: Bytes,
}

impl LiveBody {
    fn new(stream: ByteStream) -> Self {
        Self {
            stream,
            pending: Bytes::new(),
        }
    }

    /// `Ok(0)` at end of body
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.pending.is_empty() {
            match self.stream.next().await {
                Some(Ok(chunk)) => self.pending = chunk,
                Some(Err(err)) => return Err(err),
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending.split_to(n));
        Ok(n)
    }
}

#[derive(Default)]
struct ForceState {
    canceller: Option<Arc<dyn CancelRequest>>,
    forced: bool,
}

/// Forces the owning reader to abandon its current response and re-fetch.
///
/// May be used from any task while a read is in flight.
#[derive(Clone)]
pub struct ForceRetryHandle {
    state: Arc<Mutex<ForceState>>,
}

impl fmt::Debug for ForceRetryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForceRetryHandle")
            .field("forced", &self.state.lock().forced)
            .finish()
    }
}

impl ForceRetryHandle {
    /// Cancel the in-flight response; the failed read is treated as retryable
    pub fn force_retry(&self) {
        let mut state = self.state.lock();
        if let Some(canceller) = state.canceller.clone() {
            state.forced = true;
            canceller.cancel_request();
        }
    }
}

/// Reads a blob range, resuming with a new ranged GET after network failures
pub struct RetryReader {
    ctx: OpContext,
    body: Option<LiveBody>,
    info: HttpGetterInfo,
    count_was_bounded: bool,
    options: RetryReaderOptions,
    getter: Arc<dyn HttpGetter>,
    force: Arc<Mutex<ForceState>>,
}

impl fmt::Debug for RetryReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryReader")
            .field("info", &self.info)
            .field("has_response", &self.body.is_some())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl RetryReader {
    /// `initial` is the response of the first GET if the caller already issued it
    pub fn new(
        ctx: OpContext,
        initial: Option<LiveResponse>,
        info: HttpGetterInfo,
        options: RetryReaderOptions,
        getter: Arc<dyn HttpGetter>,
    ) -> Self {
        let mut reader = Self {
            ctx,
            body: None,
            count_was_bounded: info.count.is_some(),
            info,
            options,
            getter,
            force: Arc::new(Mutex::new(ForceState::default())),
        };
        if let Some(response) = initial {
            reader.install(response);
        }
        reader
    }

    /// The range still to be read
    pub fn info(&self) -> &HttpGetterInfo {
        &self.info
    }

    /// `None` when the current response cannot be cancelled
    pub fn force_retry_handle(&self) -> Option<ForceRetryHandle> {
        if self.force.lock().canceller.is_none() {
            return None;
        }
        Some(ForceRetryHandle {
            state: self.force.clone(),
        })
    }

    /// Read up to `buf.len()` bytes; `Ok(0)` means the range is exhausted.
    ///
    /// An empty `buf` returns `Ok(0)` right away without touching the response,
    /// so callers must only treat `Ok(0)` as the end when they asked for bytes.
    pub async fn read(&mut self, buf: &mut [u8]) -> TransferResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut try_index = 0usize;
        loop {
            if self.count_was_bounded && self.info.count == Some(0) {
                return Ok(0);
            }

            if self.body.is_none() {
                let response = self
                    .ctx
                    .run(self.getter.get(&self.ctx, &self.info))
                    .await?;
                self.install(response);
            }

            let limit = match self.info.count {
                Some(count) => buf.len().min(usize::try_from(count).unwrap_or(usize::MAX)),
                None => buf.len(),
            };
            let ctx = self.ctx.clone();
            let Some(body) = self.body.as_mut() else {
                continue;
            };
            let result = tokio::select! {
                biased;
                err = ctx.done() => return Err(err),
                result = body.read(&mut buf[..limit]) => result,
            };

            let err = match result {
                Ok(n) => {
                    self.info.advance(n as u64);
                    return Ok(n);
                }
                Err(err) => err,
            };

            self.discard_body();
            let exhausted = try_index >= self.options.max_retry_requests;
            let will_retry = (is_network_io_error(&err) || self.was_forced()) && !exhausted;
            if let Some(notify) = &self.options.on_failed_read {
                notify(&FailedRead {
                    failure_count: try_index + 1,
                    error: &err,
                    offset: self.info.offset,
                    count: self.info.count,
                    will_retry,
                });
            }
            if !will_retry {
                return Err(err.into());
            }
            try_index += 1;
        }
    }

    /// Release the current response; the next read issues a new GET.
    ///
    /// Closing only drops the body stream, so it never fails today. The result
    /// leaves room for responses that report errors when released.
    pub fn close(&mut self) -> TransferResult<()> {
        self.discard_body();
        Ok(())
    }

    fn discard_body(&mut self) {
        self.body = None;
    }

    /// Copy the rest of the range into `writer`, returning the byte count
    pub async fn copy_to<W>(&mut self, writer: &mut W) -> TransferResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; STREAM_CHUNK];
        let mut total = 0u64;
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
            total += n as u64;
        }
        writer.flush().await?;
        Ok(total)
    }

    pub fn into_stream(mut self) -> ByteStream {
        Box::pin(async_stream::stream! {
            let mut buf = vec![0u8; STREAM_CHUNK];
            loop {
                match self.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => yield Ok(Bytes::copy_from_slice(&buf[..n])),
                    Err(err) => {
                        yield Err(err.into_io());
                        break;
                    }
                }
            }
        })
    }

    pub fn into_async_read(self) -> impl AsyncRead + Send + Unpin {
        StreamReader::new(self.into_stream())
    }

    fn install(&mut self, response: LiveResponse) {
        if self.info.etag.is_none() {
            self.info.etag = response.etag.clone();
        }
        self.body = Some(LiveBody::new(response.body));
        let mut force = self.force.lock();
        force.canceller = response.canceller;
        force.forced = false;
    }

    fn was_forced(&self) -> bool {
        self.force.lock().forced
    }
}

/// Copy everything `reader` still has to deliver into `writer`
pub async fn download_to_writer<W>(mut reader: RetryReader, writer: &mut W) -> TransferResult<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    reader.copy_to(writer).await
}
