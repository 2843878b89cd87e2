use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use tokio_util::sync::DropGuard;
use url::Url;

use crate::policy::{
    RequestLogPolicyFactory, RetryPolicyFactory, TelemetryPolicyFactory,
    UniqueRequestIdPolicyFactory,
};
use crate::{ByteStream, OpContext, PipelineOptions, TransferError, TransferResult};

/// Request id header the service echoes back in its responses
pub const REQUEST_ID_HEADER: &str = "x-ms-request-id";

/// Rewindable request payload; every retry resends it from the start
#[derive(Debug, Clone, Default)]
pub struct Body {
    data: Bytes,
    position: usize,
}

impl Body {
    pub fn new(data: Bytes) -> Self {
        Self { data, position: 0 }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Seek back to the first byte
    pub fn rewind(&mut self) {
        self.position = 0;
    }

    /// The bytes not yet consumed
    pub fn remaining(&self) -> Bytes {
        self.data.slice(self.position..)
    }

    /// Mark `n` bytes as consumed
    pub fn advance(&mut self, n: usize) {
        self.position = (self.position + n).min(self.data.len());
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Bytes> for Body {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

impl From<&'static str> for Body {
    fn from(data: &'static str) -> Self {
        Self::new(Bytes::from_static(data.as_bytes()))
    }
}

/// An outgoing service request as seen by the policies
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Body,
    /// Time budget of the current try, set by the retry policy
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Body::empty(),
            timeout: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn put(url: Url, body: Bytes) -> Self {
        Self::new(Method::PUT, url).with_body(body)
    }

    pub fn with_body<B: Into<Body>>(mut self, body: B) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> TransferResult<Self> {
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransferError::invalid(format!("Invalid value for header {name}: {e}")))?;
        self.headers.insert(HeaderName::from_static(name), value);
        Ok(self)
    }

    /// GET and HEAD may be served by a read-only secondary
    pub fn is_read(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }

    /// Set a query parameter, replacing any existing values of the same name
    pub fn set_query_param(&mut self, name: &str, value: &str) {
        let kept: Vec<(String, String)> = self
            .url
            .query_pairs()
            .filter(|(key, _)| key != name)
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        self.url
            .query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair(name, value);
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }
}

/// A service response travelling back up the policy chain.
///
/// Scopes retained through [`Response::retain`] stay alive for as long as the
/// response or its body does.
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: ByteStream,
    guards: Vec<DropGuard>,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("guards", &self.guards.len())
            .finish_non_exhaustive()
    }
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Box::pin(futures_util::stream::empty()),
            guards: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: ByteStream) -> Self {
        self.body = body;
        self
    }

    pub fn with_bytes(self, data: Bytes) -> Self {
        self.with_body(Box::pin(futures_util::stream::once(async move {
            Ok::<_, std::io::Error>(data)
        })))
    }

    pub fn with_header(mut self, name: &'static str, value: HeaderValue) -> Self {
        self.headers.insert(HeaderName::from_static(name), value);
        self
    }

    /// Keep a cancellation scope alive until this response is dropped
    pub fn retain(&mut self, guard: DropGuard) {
        self.guards.push(guard);
    }

    pub fn request_id(&self) -> Option<String> {
        self.headers
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    /// Turn 4xx and 5xx responses into [`TransferError::Status`]
    pub fn error_for_status(self) -> TransferResult<Self> {
        if self.status.is_client_error() || self.status.is_server_error() {
            return Err(TransferError::Status {
                status: self.status,
                request_id: self.request_id(),
            });
        }
        Ok(self)
    }

    /// Take the body; retained scopes move with it
    pub fn into_body(self) -> ByteStream {
        let Self { body, guards, .. } = self;
        if guards.is_empty() {
            return body;
        }
        Box::pin(async_stream::stream! {
            let _guards = guards;
            let mut body = body;
            while let Some(item) = body.next().await {
                yield item;
            }
        })
    }

    /// Collect the whole body
    pub async fn bytes(self) -> TransferResult<Bytes> {
        let mut body = self.into_body();
        let mut collected = BytesMut::new();
        while let Some(chunk) = body.next().await {
            collected.extend_from_slice(&chunk?);
        }
        Ok(collected.freeze())
    }
}

/// One link of the request pipeline
#[async_trait]
pub trait Policy: Send + Sync {
    async fn send(&self, ctx: &OpContext, request: Request) -> TransferResult<Response>;
}

/// Any async closure taking an owned context and request can act as a transport
#[async_trait]
impl<F, Fut> Policy for F
where
    F: Fn(OpContext, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TransferResult<Response>> + Send + 'static,
{
    async fn send(&self, ctx: &OpContext, request: Request) -> TransferResult<Response> {
        (self)(ctx.clone(), request).await
    }
}

/// Builds a policy in front of `next`; called once per pipeline operation
pub trait PolicyFactory: Send + Sync {
    fn create(&self, next: Arc<dyn Policy>) -> Arc<dyn Policy>;
}

/// An ordered policy chain in front of a transport
#[derive(Clone)]
pub struct Pipeline {
    factories: Vec<Arc<dyn PolicyFactory>>,
    transport: Arc<dyn Policy>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("policies", &self.factories.len())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn builder<T: Policy + 'static>(transport: T) -> PipelineBuilder {
        PipelineBuilder::new(Arc::new(transport))
    }

    /// Assemble the default chain: telemetry, unique request id, retry, request log
    pub fn new(transport: Arc<dyn Policy>, options: PipelineOptions) -> TransferResult<Self> {
        let mut builder = PipelineBuilder::new(transport)
            .with_telemetry(TelemetryPolicyFactory::new(options.telemetry)?)
            .with_retry(RetryPolicyFactory::new(options.retry)?)
            .with_request_log(RequestLogPolicyFactory::new(options.request_log));
        if options.unique_request_id {
            builder = builder.with_unique_request_id(UniqueRequestIdPolicyFactory);
        }
        Ok(builder.build())
    }

    /// Send one operation through a freshly built chain
    pub async fn send(&self, ctx: &OpContext, request: Request) -> TransferResult<Response> {
        let chain = self
            .factories
            .iter()
            .rev()
            .fold(self.transport.clone(), |next, factory| factory.create(next));
        chain.send(ctx, request).await
    }
}

/// Collects policy factories; the chain order is fixed regardless of call order
pub struct PipelineBuilder {
    transport: Arc<dyn Policy>,
    telemetry: Option<Arc<dyn PolicyFactory>>,
    request_id: Option<Arc<dyn PolicyFactory>>,
    retry: Option<Arc<dyn PolicyFactory>>,
    request_log: Option<Arc<dyn PolicyFactory>>,
    custom: Vec<Arc<dyn PolicyFactory>>,
}

impl PipelineBuilder {
    pub fn new(transport: Arc<dyn Policy>) -> Self {
        Self {
            transport,
            telemetry: None,
            request_id: None,
            retry: None,
            request_log: None,
            custom: Vec::new(),
        }
    }

    pub fn with_telemetry(mut self, factory: TelemetryPolicyFactory) -> Self {
        self.telemetry = Some(Arc::new(factory));
        self
    }

    pub fn with_unique_request_id(mut self, factory: UniqueRequestIdPolicyFactory) -> Self {
        self.request_id = Some(Arc::new(factory));
        self
    }

    pub fn with_retry(mut self, factory: RetryPolicyFactory) -> Self {
        self.retry = Some(Arc::new(factory));
        self
    }

    pub fn with_request_log(mut self, factory: RequestLogPolicyFactory) -> Self {
        self.request_log = Some(Arc::new(factory));
        self
    }

    /// Custom policies run after the request log, right in front of the transport
    pub fn with_policy<P: PolicyFactory + 'static>(mut self, factory: P) -> Self {
        self.custom.push(Arc::new(factory));
        self
    }

    pub fn build(self) -> Pipeline {
        let factories = [self.telemetry, self.request_id, self.retry, self.request_log]
            .into_iter()
            .flatten()
            .chain(self.custom)
            .collect();
        Pipeline {
            factories,
            transport: self.transport,
        }
    }
}
