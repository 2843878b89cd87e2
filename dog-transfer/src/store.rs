use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::{
    BlobAccessConditions, BlobHttpHeaders, ByteStream, CommitResult, HttpGetterInfo,
    LeaseAccessConditions, Metadata, OpContext, StageBlockResult, TransferResult,
};

/// Block-blob write primitives the upload engine drives
#[async_trait]
pub trait BlockWriter: Send + Sync {
    /// Upload one block under `block_id` (base64); it stays uncommitted until listed in a commit
    async fn stage_block(
        &self,
        ctx: &OpContext,
        block_id: &str,
        body: Bytes,
        lease: &LeaseAccessConditions,
    ) -> TransferResult<StageBlockResult>;

    /// Assemble the blob from `ids`, in order
    async fn commit_block_list(
        &self,
        ctx: &OpContext,
        ids: &[String],
        headers: &BlobHttpHeaders,
        metadata: &Metadata,
        conditions: &BlobAccessConditions,
    ) -> TransferResult<CommitResult>;
}

/// Aborts an in-flight request; its body then fails with a read error
pub trait CancelRequest: Send + Sync {
    fn cancel_request(&self);
}

/// A live ranged-GET response
pub struct LiveResponse {
    pub body: ByteStream,
    pub etag: Option<String>,
    /// Present when the transport can abort this response from another task
    pub canceller: Option<Arc<dyn CancelRequest>>,
}

impl fmt::Debug for LiveResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveResponse")
            .field("etag", &self.etag)
            .field("cancellable", &self.canceller.is_some())
            .finish_non_exhaustive()
    }
}

impl LiveResponse {
    pub fn new(body: ByteStream) -> Self {
        Self {
            body,
            etag: None,
            canceller: None,
        }
    }

    /// Wrap `body` so the response can be aborted through its canceller
    pub fn cancellable(body: ByteStream) -> Self {
        let (body, canceller) = cancellable_body(body);
        Self {
            body,
            etag: None,
            canceller: Some(canceller),
        }
    }

    pub fn with_etag<S: Into<String>>(mut self, etag: S) -> Self {
        self.etag = Some(etag.into());
        self
    }
}

/// Issues a ranged GET for the remaining range of a download
#[async_trait]
pub trait HttpGetter: Send + Sync {
    async fn get(&self, ctx: &OpContext, info: &HttpGetterInfo) -> TransferResult<LiveResponse>;
}

#[async_trait]
impl<F, Fut> HttpGetter for F
where
    F: Fn(OpContext, HttpGetterInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TransferResult<LiveResponse>> + Send + 'static,
{
    async fn get(&self, ctx: &OpContext, info: &HttpGetterInfo) -> TransferResult<LiveResponse> {
        (self)(ctx.clone(), info.clone()).await
    }
}

/// Canceller returned by [`cancellable_body`]
#[derive(Debug, Clone, Default)]
pub struct BodyCanceller {
    token: CancellationToken,
}

impl BodyCanceller {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl CancelRequest for BodyCanceller {
    fn cancel_request(&self) {
        self.token.cancel();
    }
}

/// Make any body abortable. After cancellation the next poll yields an
/// `Interrupted` error and the stream ends.
pub fn cancellable_body(body: ByteStream) -> (ByteStream, Arc<BodyCanceller>) {
    let canceller = Arc::new(BodyCanceller::default());
    let token = canceller.token.clone();
    let stream = async_stream::stream! {
        let mut body = body;
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                next = body.next() => Some(next),
            };
            match next {
                None => {
                    yield Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "request canceled"));
                    break;
                }
                Some(Some(item)) => yield item,
                Some(None) => break,
            }
        }
    };
    (Box::pin(stream), canceller)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn pieces(parts: &[&'static [u8]]) -> ByteStream {
        let items: Vec<Result<Bytes, std::io::Error>> =
            parts.iter().map(|p| Ok(Bytes::from_static(p))).collect();
        Box::pin(stream::iter(items))
    }

    #[tokio::test]
    async fn uncancelled_body_passes_through() {
        let (mut body, _canceller) = cancellable_body(pieces(&[b"ab", b"cd"]));
        assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from_static(b"ab"));
        assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from_static(b"cd"));
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn cancelled_body_fails_with_interrupted() {
        let (mut body, canceller) = cancellable_body(pieces(&[b"ab", b"cd"]));
        assert!(body.next().await.unwrap().is_ok());
        canceller.cancel_request();
        assert!(canceller.is_cancelled());
        let err = body.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::Interrupted);
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn closures_are_getters() {
        let getter = |_ctx: OpContext, info: HttpGetterInfo| async move {
            let text = format!("{}", info.offset);
            Ok::<_, crate::TransferError>(LiveResponse::new(Box::pin(stream::once(async move {
                Ok::<_, std::io::Error>(Bytes::from(text))
            }))))
        };
        let getter: Arc<dyn HttpGetter> = Arc::new(getter);
        let response = getter
            .get(&OpContext::new(), &HttpGetterInfo::new(42, None))
            .await
            .unwrap();
        let mut body = response.body;
        assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from_static(b"42"));
    }
}
