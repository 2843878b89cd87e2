use std::sync::Arc;

use async_trait::async_trait;
use http::header::HeaderValue;
use uuid::Uuid;

use crate::pipeline::{Policy, PolicyFactory, Request, Response};
use crate::{OpContext, TransferResult};

/// Header carrying the client-generated id of an operation
pub const CLIENT_REQUEST_ID_HEADER: &str = "x-ms-client-request-id";

/// Stamps every operation with a fresh UUID unless the caller already set one
#[derive(Debug, Clone, Copy, Default)]
pub struct UniqueRequestIdPolicyFactory;

impl PolicyFactory for UniqueRequestIdPolicyFactory {
    fn create(&self, next: Arc<dyn Policy>) -> Arc<dyn Policy> {
        Arc::new(UniqueRequestIdPolicy { next })
    }
}

pub struct UniqueRequestIdPolicy {
    next: Arc<dyn Policy>,
}

#[async_trait]
impl Policy for UniqueRequestIdPolicy {
    async fn send(&self, ctx: &OpContext, mut request: Request) -> TransferResult<Response> {
        if !request.headers.contains_key(CLIENT_REQUEST_ID_HEADER) {
            let id = Uuid::new_v4().to_string();
            if let Ok(value) = HeaderValue::from_str(&id) {
                request.headers.insert(CLIENT_REQUEST_ID_HEADER, value);
            }
        }
        self.next.send(ctx, request).await
    }
}
