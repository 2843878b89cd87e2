use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::header::AUTHORIZATION;
use parking_lot::Mutex;
use tokio::time::Instant;
use url::Url;

use crate::pipeline::{Policy, PolicyFactory, Request, Response};
use crate::{LogLevel, OpContext, RequestLogOptions, TransferResult};

const LOG_TARGET: &str = "dog_transfer::request_log";
const REDACTED: &str = "REDACTED";

/// Logs every try of an operation; state is kept per operation
#[derive(Debug, Clone, Default)]
pub struct RequestLogPolicyFactory {
    options: RequestLogOptions,
}

impl RequestLogPolicyFactory {
    pub fn new(options: RequestLogOptions) -> Self {
        Self { options }
    }
}

impl PolicyFactory for RequestLogPolicyFactory {
    fn create(&self, next: Arc<dyn Policy>) -> Arc<dyn Policy> {
        Arc::new(RequestLogPolicy {
            options: self.options.clone(),
            state: Mutex::new(OperationState::default()),
            next,
        })
    }
}

#[derive(Debug, Default)]
struct OperationState {
    tries: u32,
    started: Option<Instant>,
}

pub struct RequestLogPolicy {
    options: RequestLogOptions,
    state: Mutex<OperationState>,
    next: Arc<dyn Policy>,
}

impl RequestLogPolicy {
    fn begin_try(&self) -> (u32, Instant) {
        let mut state = self.state.lock();
        state.tries += 1;
        let now = Instant::now();
        if state.tries == 1 {
            state.started = Some(now);
        }
        (state.tries, state.started.unwrap_or(now))
    }

    fn is_slow(&self, elapsed: Duration) -> bool {
        self.options
            .slow_threshold
            .is_some_and(|threshold| elapsed > threshold)
    }

    fn is_unexpected_status(&self, status: u16) -> bool {
        ((400..=499).contains(&status) && !self.options.expected_statuses.contains(&status))
            || (500..=599).contains(&status)
    }

    fn classify(&self, outcome: &TransferResult<Response>, elapsed: Duration) -> (LogLevel, bool) {
        match outcome {
            Ok(response) if self.is_unexpected_status(response.status.as_u16()) => {
                (LogLevel::Error, true)
            }
            Ok(_) if self.is_slow(elapsed) => (LogLevel::Warning, true),
            Ok(_) => (LogLevel::Info, false),
            Err(_) => (LogLevel::Error, true),
        }
    }
}

#[async_trait]
impl Policy for RequestLogPolicy {
    async fn send(&self, ctx: &OpContext, request: Request) -> TransferResult<Response> {
        let (try_number, op_started) = self.begin_try();

        if self.options.min_level.allows(LogLevel::Info) {
            let mut message = format!("==> OUTGOING REQUEST (Try={try_number}) ");
            write_request(&mut message, &request);
            emit(LogLevel::Info, false, try_number, None, &message, None);
        }

        let logged = request.clone();
        let try_started = Instant::now();
        let outcome = self.next.send(ctx, request).await;
        let try_elapsed = try_started.elapsed();
        let op_elapsed = op_started.elapsed();

        let (level, forced) = self.classify(&outcome, try_elapsed);
        let allowed = self.options.min_level.allows(level);
        let forced = forced && self.options.force_log;
        if !(allowed || forced) {
            return outcome;
        }

        let mut message = String::new();
        let slow = match self.options.slow_threshold {
            Some(threshold) if try_elapsed > threshold => format!("[SLOW >{threshold:?}]"),
            _ => String::new(),
        };
        let _ = write!(
            message,
            "==> REQUEST/RESPONSE (Try={try_number}/{try_elapsed:?}{slow}, OpTime={op_elapsed:?}) -- "
        );
        match &outcome {
            Err(_) => message.push_str("REQUEST ERROR "),
            Ok(_) if level == LogLevel::Error => message.push_str("RESPONSE STATUS CODE ERROR "),
            Ok(_) => message.push_str("RESPONSE SUCCESSFULLY RECEIVED "),
        }
        write_request(&mut message, &logged);
        let status = match &outcome {
            Ok(response) => {
                write_response(&mut message, response);
                Some(response.status.as_u16())
            }
            Err(err) => {
                let _ = write!(message, " -- ERROR: {err}");
                None
            }
        };
        let backtrace = (level == LogLevel::Error)
            .then(|| std::backtrace::Backtrace::force_capture().to_string());

        emit(level, forced && !allowed, try_number, status, &message, backtrace.as_deref());
        outcome
    }
}

fn emit(
    level: LogLevel,
    forced: bool,
    try_number: u32,
    status: Option<u16>,
    message: &str,
    backtrace: Option<&str>,
) {
    match level {
        LogLevel::Error => {
            tracing::error!(target: LOG_TARGET, try_number, status, forced, backtrace, "{message}")
        }
        LogLevel::Warning => {
            tracing::warn!(target: LOG_TARGET, try_number, status, forced, "{message}")
        }
        LogLevel::Info => {
            tracing::info!(target: LOG_TARGET, try_number, status, forced, "{message}")
        }
        LogLevel::Debug => {
            tracing::debug!(target: LOG_TARGET, try_number, status, forced, "{message}")
        }
        LogLevel::None => {}
    }
}

/// Copy of `url` with any `sig` query parameter (any case) replaced by `REDACTED`
pub fn redact_url(url: &Url) -> Url {
    let mut redacted = url.clone();
    if !url
        .query_pairs()
        .any(|(key, _)| key.eq_ignore_ascii_case("sig"))
    {
        return redacted;
    }
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| {
            if key.eq_ignore_ascii_case("sig") {
                (key.into_owned(), REDACTED.to_string())
            } else {
                (key.into_owned(), value.into_owned())
            }
        })
        .collect();
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted
}

fn write_request(out: &mut String, request: &Request) {
    let _ = write!(out, "{} {}", request.method, redact_url(&request.url));
    write_headers(out, request.headers.iter().map(|(name, value)| {
        let value = if name == AUTHORIZATION {
            REDACTED
        } else {
            value.to_str().unwrap_or("<binary>")
        };
        (name.as_str(), value)
    }));
}

fn write_response(out: &mut String, response: &Response) {
    let _ = write!(out, " -- RESPONSE Status: {}", response.status);
    write_headers(out, response.headers.iter().map(|(name, value)| {
        (name.as_str(), value.to_str().unwrap_or("<binary>"))
    }));
}

fn write_headers<'a>(out: &mut String, headers: impl Iterator<Item = (&'a str, &'a str)>) {
    let mut first = true;
    for (name, value) in headers {
        out.push_str(if first { " [" } else { ", " });
        let _ = write!(out, "{name}: {value}");
        first = false;
    }
    if !first {
        out.push(']');
    }
}
