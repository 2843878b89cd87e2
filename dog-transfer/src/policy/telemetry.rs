use std::sync::Arc;

use async_trait::async_trait;
use http::header::{HeaderValue, USER_AGENT};
use once_cell::sync::Lazy;

use crate::pipeline::{Policy, PolicyFactory, Request, Response};
use crate::{OpContext, TelemetryOptions, TransferError, TransferResult};

static PLATFORM: Lazy<String> = Lazy::new(|| {
    format!(
        "{}/{} ({}; {})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});

/// Sets the User-Agent header; the value is computed once per factory
#[derive(Debug, Clone)]
pub struct TelemetryPolicyFactory {
    user_agent: HeaderValue,
}

impl TelemetryPolicyFactory {
    pub fn new(options: TelemetryOptions) -> TransferResult<Self> {
        let user_agent = if options.value.is_empty() {
            PLATFORM.clone()
        } else {
            format!("{} {}", options.value, *PLATFORM)
        };
        let user_agent = HeaderValue::from_str(&user_agent).map_err(|e| {
            TransferError::invalid(format!("Telemetry value is not a valid header: {e}"))
        })?;
        Ok(Self { user_agent })
    }

    pub fn user_agent(&self) -> &str {
        self.user_agent.to_str().unwrap_or_default()
    }
}

impl PolicyFactory for TelemetryPolicyFactory {
    fn create(&self, next: Arc<dyn Policy>) -> Arc<dyn Policy> {
        Arc::new(TelemetryPolicy {
            user_agent: self.user_agent.clone(),
            next,
        })
    }
}

pub struct TelemetryPolicy {
    user_agent: HeaderValue,
    next: Arc<dyn Policy>,
}

#[async_trait]
impl Policy for TelemetryPolicy {
    async fn send(&self, ctx: &OpContext, mut request: Request) -> TransferResult<Response> {
        request.headers.insert(USER_AGENT, self.user_agent.clone());
        self.next.send(ctx, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use http::StatusCode;
    use parking_lot::Mutex;
    use url::Url;

    #[test]
    fn user_agent_has_no_leading_space_without_prefix() {
        let factory = TelemetryPolicyFactory::new(TelemetryOptions::default()).unwrap();
        assert!(factory.user_agent().starts_with("dog-transfer/"));
        assert!(factory.user_agent().contains(std::env::consts::OS));

        let factory = TelemetryPolicyFactory::new(TelemetryOptions::new("media-svc/2.1")).unwrap();
        assert!(factory.user_agent().starts_with("media-svc/2.1 dog-transfer/"));
    }

    #[test]
    fn invalid_prefix_is_rejected_at_build_time() {
        let result = TelemetryPolicyFactory::new(TelemetryOptions::new("bad\nvalue"));
        assert!(matches!(result, Err(TransferError::Invalid { .. })));
    }

    #[tokio::test]
    async fn overwrites_user_agent_on_every_request() {
        let seen = Arc::new(Mutex::new(None));
        let captured = seen.clone();
        let pipeline = Pipeline::builder(move |_ctx: OpContext, request: Request| {
            let captured = captured.clone();
            async move {
                *captured.lock() = request
                    .headers
                    .get(USER_AGENT)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok(Response::new(StatusCode::OK))
            }
        })
        .with_telemetry(TelemetryPolicyFactory::new(TelemetryOptions::new("app")).unwrap())
        .build();

        let url = Url::parse("https://account.blob.example.net/c/b").unwrap();
        let request = Request::get(url).with_header("user-agent", "curl/8").unwrap();
        pipeline.send(&OpContext::new(), request).await.unwrap();
        let agent = seen.lock().clone().unwrap();
        assert!(agent.starts_with("app dog-transfer/"), "{agent}");
    }
}
