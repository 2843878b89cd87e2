use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{BlobAccessConditions, BlobHttpHeaders, Metadata, TransferError, TransferResult};

/// Tries per operation when [`RetryOptions::max_tries`] is left at zero
pub const DEFAULT_MAX_TRIES: u32 = 4;

/// Largest block a single stage call may carry (4000 MiB)
pub const MAX_STAGE_BLOCK_BYTES: usize = 4000 * 1024 * 1024;

/// Most blocks a committed blob may be assembled from
pub const MAX_BLOCKS: u32 = 50_000;

/// Block size used when none is configured (1 MiB)
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

/// Which back-off curve the retry policy follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicyKind {
    /// `(2^(try-1) - 1) * retry_delay`
    #[default]
    Exponential,
    /// `retry_delay` before every try but the first
    Fixed,
}

impl FromStr for RetryPolicyKind {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exponential" => Ok(Self::Exponential),
            "fixed" => Ok(Self::Fixed),
            other => Err(TransferError::invalid(format!(
                "Unknown retry policy {other:?} (expected exponential or fixed)"
            ))),
        }
    }
}

/// Retry policy configuration.
///
/// Zero values mean "use the policy default"; call [`RetryOptions::validated`]
/// to check the combination and fill the defaults in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    pub policy: RetryPolicyKind,

    /// Attempts before giving up; 1 means no retries
    pub max_tries: u32,

    /// Upper bound for any single try. Large transfers usually need more than
    /// the default; about 60 seconds per MiB of payload is a safe start.
    pub try_timeout: Duration,

    /// Base delay between tries; zero exactly when `max_retry_delay` is zero
    pub retry_delay: Duration,

    /// Ceiling for any computed delay
    pub max_retry_delay: Duration,

    /// Host to alternate with for GET/HEAD retries (may serve stale data)
    pub retry_reads_from_secondary_host: Option<String>,
}

impl RetryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exponential() -> Self {
        Self::default()
    }

    pub fn fixed() -> Self {
        Self {
            policy: RetryPolicyKind::Fixed,
            ..Self::default()
        }
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    pub fn with_try_timeout(mut self, timeout: Duration) -> Self {
        self.try_timeout = timeout;
        self
    }

    /// Set the base and maximum delay together; they must be both zero or both non-zero
    pub fn with_retry_delay(mut self, delay: Duration, max_delay: Duration) -> Self {
        self.retry_delay = delay;
        self.max_retry_delay = max_delay;
        self
    }

    pub fn with_secondary_host<S: Into<String>>(mut self, host: S) -> Self {
        self.retry_reads_from_secondary_host = Some(host.into());
        self
    }

    /// Check the option combination and fill in policy defaults
    pub fn validated(mut self) -> TransferResult<Self> {
        if self.retry_delay > self.max_retry_delay {
            return Err(TransferError::invalid(
                "retry_delay must be <= max_retry_delay",
            ));
        }
        if self.retry_delay.is_zero() != self.max_retry_delay.is_zero() {
            return Err(TransferError::invalid(
                "retry_delay and max_retry_delay must both be zero or both be non-zero",
            ));
        }
        if self
            .retry_reads_from_secondary_host
            .as_deref()
            .is_some_and(str::is_empty)
        {
            self.retry_reads_from_secondary_host = None;
        }

        if self.max_tries == 0 {
            self.max_tries = DEFAULT_MAX_TRIES;
        }
        let (delay, max_delay) = match self.policy {
            RetryPolicyKind::Exponential => (Duration::from_secs(4), Duration::from_secs(120)),
            RetryPolicyKind::Fixed => (Duration::from_secs(30), Duration::from_secs(120)),
        };
        if self.try_timeout.is_zero() {
            self.try_timeout = Duration::from_secs(30);
        }
        if self.retry_delay.is_zero() {
            self.retry_delay = delay;
            self.max_retry_delay = max_delay;
        }
        Ok(self)
    }

    /// Delay before primary try `try_number` (1-based) without jitter
    pub fn base_delay(&self, try_number: u32) -> Duration {
        match self.policy {
            RetryPolicyKind::Exponential => {
                let factor = try_number
                    .checked_sub(1)
                    .and_then(|exp| 2u32.checked_pow(exp))
                    .map(|pow| pow - 1)
                    .unwrap_or(u32::MAX);
                self.retry_delay.saturating_mul(factor)
            }
            RetryPolicyKind::Fixed if try_number > 1 => self.retry_delay,
            RetryPolicyKind::Fixed => Duration::ZERO,
        }
    }

    /// Jittered delay for a given jitter factor, clamped to `max_retry_delay`
    pub fn delay_with_jitter(&self, try_number: u32, jitter: f64) -> Duration {
        // Anything past twice the ceiling clamps the same way; keeps mul_f64 in range.
        let base = self
            .base_delay(try_number)
            .min(self.max_retry_delay.saturating_mul(2));
        base.mul_f64(jitter).min(self.max_retry_delay)
    }

    /// Delay before primary try `try_number` with jitter drawn from `[0.8, 1.3)`
    pub fn calc_delay(&self, try_number: u32) -> Duration {
        self.delay_with_jitter(try_number, jitter())
    }

    /// Apply `PREFIX` + `MAX_TRIES`, `TRY_TIMEOUT_SECS`, `RETRY_DELAY_MS`,
    /// `MAX_RETRY_DELAY_MS`, `POLICY` and `SECONDARY_HOST` from the process environment
    pub fn from_env(prefix: &str) -> TransferResult<Self> {
        Self::from_vars(prefix, std::env::vars())
    }

    /// Same as [`RetryOptions::from_env`] over an explicit key/value source
    pub fn from_vars<I, K, V>(prefix: &str, vars: I) -> TransferResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Self::default().with_overrides(prefix, vars)
    }

    /// Apply overrides from any key/value source, e.g. `DOG_TRANSFER__RETRY__MAX_TRIES=6`
    pub fn with_overrides<I, K, V>(mut self, prefix: &str, vars: I) -> TransferResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(prefix) else {
                continue;
            };
            let value = value.as_ref().trim();
            match name {
                "MAX_TRIES" => self.max_tries = parse_number(name, value)?,
                "TRY_TIMEOUT_SECS" => {
                    self.try_timeout = Duration::from_secs(parse_number(name, value)?)
                }
                "RETRY_DELAY_MS" => {
                    self.retry_delay = Duration::from_millis(parse_number(name, value)?)
                }
                "MAX_RETRY_DELAY_MS" => {
                    self.max_retry_delay = Duration::from_millis(parse_number(name, value)?)
                }
                "POLICY" => self.policy = value.parse()?,
                "SECONDARY_HOST" => {
                    self.retry_reads_from_secondary_host =
                        (!value.is_empty()).then(|| value.to_string())
                }
                _ => {}
            }
        }
        Ok(self)
    }
}

/// Multiplicative jitter in `[0.8, 1.3)`
pub(crate) fn jitter() -> f64 {
    rand::thread_rng().gen_range(0.8..1.3)
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> TransferResult<T> {
    value
        .parse()
        .map_err(|_| TransferError::invalid(format!("{name} must be a number, got {value:?}")))
}

/// Severity of a request log entry; `None` disables logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    None,
    Error,
    Warning,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    /// Whether an entry at `level` passes this minimum
    pub fn allows(self, level: LogLevel) -> bool {
        self != LogLevel::None && level != LogLevel::None && level <= self
    }
}

/// Request logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestLogOptions {
    /// Most verbose level that is logged
    pub min_level: LogLevel,

    /// Tries slower than this are logged as warnings; `None` disables the check
    pub slow_threshold: Option<Duration>,

    /// 4xx statuses the service returns in normal operation; logged at info
    pub expected_statuses: Vec<u16>,

    /// Emit warnings and errors even when `min_level` filters them out
    pub force_log: bool,
}

impl Default for RequestLogOptions {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            slow_threshold: Some(Duration::from_secs(3)),
            expected_statuses: vec![404, 409, 412, 416],
            force_log: true,
        }
    }
}

impl RequestLogOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    pub fn with_slow_threshold(mut self, threshold: Option<Duration>) -> Self {
        self.slow_threshold = threshold;
        self
    }

    pub fn with_expected_statuses<I: IntoIterator<Item = u16>>(mut self, statuses: I) -> Self {
        self.expected_statuses = statuses.into_iter().collect();
        self
    }

    pub fn without_force_log(mut self) -> Self {
        self.force_log = false;
        self
    }
}

/// Telemetry configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryOptions {
    /// Prepended to every User-Agent, e.g. an application id
    pub value: String,
}

impl TelemetryOptions {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Self {
            value: value.into(),
        }
    }
}

/// Everything needed to assemble the default policy chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    pub retry: RetryOptions,
    pub request_log: RequestLogOptions,
    pub telemetry: TelemetryOptions,
    pub unique_request_id: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            retry: RetryOptions::default(),
            request_log: RequestLogOptions::default(),
            telemetry: TelemetryOptions::default(),
            unique_request_id: true,
        }
    }
}

/// Receives the cumulative number of bytes staged so far
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Options for a chunked upload
#[derive(Clone)]
pub struct UploadOptions {
    /// Bytes per staged block; the last block may be shorter
    pub block_size: usize,

    /// Concurrent stage calls; memory use is about `(max_concurrency + 1) * block_size`
    pub max_concurrency: usize,

    /// Total size when known up front, used to reject uploads needing too many blocks
    pub size_hint: Option<u64>,

    pub metadata: Metadata,
    pub http_headers: BlobHttpHeaders,
    pub access_conditions: BlobAccessConditions,
    pub progress: Option<ProgressFn>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_concurrency: 1,
            size_hint: None,
            metadata: Metadata::new(),
            http_headers: BlobHttpHeaders::default(),
            access_conditions: BlobAccessConditions::default(),
            progress: None,
        }
    }
}

impl fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadOptions")
            .field("block_size", &self.block_size)
            .field("max_concurrency", &self.max_concurrency)
            .field("size_hint", &self.size_hint)
            .field("metadata", &self.metadata)
            .field("http_headers", &self.http_headers)
            .field("access_conditions", &self.access_conditions)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl UploadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    pub fn with_max_concurrency(mut self, workers: usize) -> Self {
        self.max_concurrency = workers;
        self
    }

    pub fn with_size_hint(mut self, size: u64) -> Self {
        self.size_hint = Some(size);
        self
    }

    pub fn with_metadata<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_http_headers(mut self, headers: BlobHttpHeaders) -> Self {
        self.http_headers = headers;
        self
    }

    pub fn with_access_conditions(mut self, conditions: BlobAccessConditions) -> Self {
        self.access_conditions = conditions;
        self
    }

    pub fn with_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(progress));
        self
    }

    pub fn validate(&self) -> TransferResult<()> {
        if self.block_size == 0 || self.block_size > MAX_STAGE_BLOCK_BYTES {
            return Err(TransferError::invalid(format!(
                "block_size must be > 0 and <= {MAX_STAGE_BLOCK_BYTES}, got {}",
                self.block_size
            )));
        }
        if self.max_concurrency == 0 {
            return Err(TransferError::invalid("max_concurrency must be at least 1"));
        }
        if let Some(size) = self.size_hint {
            let blocks = size.div_ceil(self.block_size as u64);
            if blocks > u64::from(MAX_BLOCKS) {
                return Err(TransferError::invalid(format!(
                    "{size} bytes need {blocks} blocks of {} bytes; at most {MAX_BLOCKS} are allowed",
                    self.block_size
                )));
            }
        }
        Ok(())
    }
}

/// Details handed to [`RetryReaderOptions::on_failed_read`] for every failed body read
#[derive(Debug)]
pub struct FailedRead<'a> {
    /// 1-based count of failures within the current read call
    pub failure_count: usize,
    pub error: &'a std::io::Error,
    pub offset: u64,
    pub count: Option<u64>,
    pub will_retry: bool,
}

pub type FailedReadFn = Arc<dyn Fn(&FailedRead<'_>) + Send + Sync>;

/// Options for a [`crate::RetryReader`]
#[derive(Clone, Default)]
pub struct RetryReaderOptions {
    /// Extra GET requests allowed per read call; zero disables resumption
    pub max_retry_requests: usize,

    /// Diagnostic hook called after every failed body read
    pub on_failed_read: Option<FailedReadFn>,
}

impl fmt::Debug for RetryReaderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryReaderOptions")
            .field("max_retry_requests", &self.max_retry_requests)
            .field("on_failed_read", &self.on_failed_read.is_some())
            .finish()
    }
}

impl RetryReaderOptions {
    pub fn new(max_retry_requests: usize) -> Self {
        Self {
            max_retry_requests,
            on_failed_read: None,
        }
    }

    pub fn with_failed_read_notifier<F>(mut self, notify: F) -> Self
    where
        F: Fn(&FailedRead<'_>) + Send + Sync + 'static,
    {
        self.on_failed_read = Some(Arc::new(notify));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_per_policy() {
        let exp = RetryOptions::exponential().validated().unwrap();
        assert_eq!(exp.max_tries, DEFAULT_MAX_TRIES);
        assert_eq!(exp.try_timeout, Duration::from_secs(30));
        assert_eq!(exp.retry_delay, Duration::from_secs(4));
        assert_eq!(exp.max_retry_delay, Duration::from_secs(120));

        let fixed = RetryOptions::fixed().validated().unwrap();
        assert_eq!(fixed.retry_delay, Duration::from_secs(30));
    }

    #[test]
    fn delay_pair_must_be_set_together() {
        let only_delay = RetryOptions::new().with_retry_delay(Duration::from_secs(1), Duration::ZERO);
        assert!(matches!(only_delay.validated(), Err(TransferError::Invalid { .. })));

        let only_max = RetryOptions::new().with_retry_delay(Duration::ZERO, Duration::from_secs(1));
        assert!(only_max.validated().is_err());

        let inverted = RetryOptions::new()
            .with_retry_delay(Duration::from_secs(10), Duration::from_secs(1));
        assert!(inverted.validated().is_err());
    }

    #[test]
    fn exponential_base_delay_follows_power_curve() {
        let d = Duration::from_millis(100);
        let options = RetryOptions::exponential()
            .with_retry_delay(d, Duration::from_secs(3600))
            .validated()
            .unwrap();
        for n in 1..=10u32 {
            assert_eq!(options.base_delay(n), d * (2u32.pow(n - 1) - 1));
        }
        assert_eq!(options.base_delay(64), d.saturating_mul(u32::MAX));
    }

    #[test]
    fn fixed_base_delay_is_zero_then_constant() {
        let d = Duration::from_secs(2);
        let options = RetryOptions::fixed()
            .with_retry_delay(d, Duration::from_secs(10))
            .validated()
            .unwrap();
        assert_eq!(options.base_delay(1), Duration::ZERO);
        assert_eq!(options.base_delay(2), d);
        assert_eq!(options.base_delay(9), d);
    }

    #[test]
    fn jittered_delays_stay_within_bounds() {
        let max = Duration::from_secs(5);
        let options = RetryOptions::exponential()
            .with_retry_delay(Duration::from_millis(300), max)
            .validated()
            .unwrap();
        for n in 1..40 {
            let delay = options.calc_delay(n);
            assert!(delay <= max, "try {n} produced {delay:?}");
        }
        assert_eq!(options.delay_with_jitter(1, 1.29), Duration::ZERO);
        assert_eq!(options.delay_with_jitter(3, 1.0), Duration::from_millis(900));
        assert_eq!(options.delay_with_jitter(30, 0.8), max);
    }

    #[test]
    fn env_overrides_apply_with_prefix() {
        let vars = [
            ("DOG_TRANSFER__RETRY__MAX_TRIES", "6"),
            ("DOG_TRANSFER__RETRY__POLICY", "fixed"),
            ("DOG_TRANSFER__RETRY__RETRY_DELAY_MS", "250"),
            ("DOG_TRANSFER__RETRY__MAX_RETRY_DELAY_MS", "1000"),
            ("DOG_TRANSFER__RETRY__SECONDARY_HOST", "account-secondary.example.net"),
            ("UNRELATED", "x"),
        ];
        let options = RetryOptions::default()
            .with_overrides("DOG_TRANSFER__RETRY__", vars)
            .unwrap();
        assert_eq!(options.max_tries, 6);
        assert_eq!(options.policy, RetryPolicyKind::Fixed);
        assert_eq!(options.retry_delay, Duration::from_millis(250));
        assert_eq!(
            options.retry_reads_from_secondary_host.as_deref(),
            Some("account-secondary.example.net")
        );

        let bad = RetryOptions::default().with_overrides("P_", [("P_MAX_TRIES", "many")]);
        assert!(bad.is_err());
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: RetryOptions =
            serde_json::from_str(r#"{"policy":"fixed","max_tries":2}"#).unwrap();
        assert_eq!(options.policy, RetryPolicyKind::Fixed);
        assert_eq!(options.max_tries, 2);
        assert_eq!(options.try_timeout, Duration::ZERO);

        let log: RequestLogOptions = serde_json::from_str(r#"{"min_level":"warning"}"#).unwrap();
        assert_eq!(log.min_level, LogLevel::Warning);
        assert_eq!(log.expected_statuses, vec![404, 409, 412, 416]);
    }

    #[test]
    fn log_level_gating() {
        assert!(LogLevel::Info.allows(LogLevel::Error));
        assert!(LogLevel::Info.allows(LogLevel::Info));
        assert!(!LogLevel::Warning.allows(LogLevel::Info));
        assert!(!LogLevel::None.allows(LogLevel::Error));
    }

    #[test]
    fn upload_options_validation() {
        assert!(UploadOptions::new().validate().is_ok());
        assert!(UploadOptions::new().with_block_size(0).validate().is_err());
        assert!(UploadOptions::new().with_max_concurrency(0).validate().is_err());
        let too_many = UploadOptions::new()
            .with_block_size(1)
            .with_size_hint(u64::from(MAX_BLOCKS) + 1);
        assert!(too_many.validate().is_err());
        let at_limit = UploadOptions::new()
            .with_block_size(1)
            .with_size_hint(u64::from(MAX_BLOCKS));
        assert!(at_limit.validate().is_ok());
    }
}
