//! Request pipeline policies

mod request_id;
mod request_log;
mod retry;
mod telemetry;

pub use request_id::{UniqueRequestIdPolicy, UniqueRequestIdPolicyFactory, CLIENT_REQUEST_ID_HEADER};
pub use request_log::{redact_url, RequestLogPolicy, RequestLogPolicyFactory};
pub use retry::{RetryDecision, RetryEvent, RetryObserver, RetryPolicy, RetryPolicyFactory, RetryTarget};
pub use telemetry::{TelemetryPolicy, TelemetryPolicyFactory};
