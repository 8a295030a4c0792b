use super::health::HealthState;
use super::timeout::{sleep_or_cancel, TimeoutExt};
use crate::client::{ApiRequest, ApiResponse, Transport};
use crate::error::ErrorCategory;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Retry configuration for a single logical request
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Deadline for each individual attempt
    pub timeout: Duration,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Total number of attempts, including the first
    pub max_attempts: u32,
    /// Maximum jitter as a fraction of the delay
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::initial_load()
    }
}

impl RetryConfig {
    /// Large budget for the first fetch of a feed, when an empty screen is worse than waiting
    #[must_use]
    pub const fn initial_load() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            jitter: 0.0,
        }
    }

    /// Smaller budget for steady-state polling; the next tick retries anyway
    #[must_use]
    pub const fn polling() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            jitter: 0.0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::invalid("max_attempts", "must be at least 1"));
        }
        if self.base_delay > self.max_delay {
            return Err(Error::invalid(
                "base_delay",
                format!(
                    "{:?} exceeds max_delay {:?}",
                    self.base_delay, self.max_delay
                ),
            ));
        }
        if self.timeout.is_zero() {
            return Err(Error::invalid("timeout", "must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::invalid("jitter", "must be between 0.0 and 1.0"));
        }
        Ok(())
    }

    /// Backoff after the zero-based `attempt` failed: `min(base * 2^attempt, max)`
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    fn delay_with_jitter(&self, attempt: u32) -> Duration {
        add_jitter(self.delay_for_attempt(attempt), self.jitter).min(self.max_delay)
    }
}

/// Add jitter to delay
fn add_jitter(delay: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return delay;
    }

    use rand::Rng;
    let mut rng = rand::thread_rng();
    let jitter_ms = (delay.as_millis() as f64 * jitter_factor) as u64;
    let jitter = rng.gen_range(0..=jitter_ms);

    delay + Duration::from_millis(jitter)
}

/// Classified result of one attempt
#[derive(Debug)]
pub enum AttemptOutcome {
    Success(ApiResponse),
    /// Timeout, network error or server-side status; worth another try
    RetryableFailure(Error),
    /// Client error; retrying would not help
    FatalFailure(Error),
}

impl AttemptOutcome {
    /// Classify what one timed attempt produced
    #[must_use]
    pub fn classify(result: Result<ApiResponse>, request: &ApiRequest) -> Self {
        match result {
            Ok(response) if response.is_success() => Self::Success(response),
            Ok(response) => {
                let error = Error::from_status(response.status.as_u16(), request.url.as_str());
                Self::from_error(error)
            }
            Err(error) => Self::from_error(error),
        }
    }

    fn from_error(error: Error) -> Self {
        match error.category() {
            ErrorCategory::Transient => Self::RetryableFailure(error),
            ErrorCategory::Permanent | ErrorCategory::Cancelled => Self::FatalFailure(error),
        }
    }
}

/// Runs requests with per-attempt timeouts and capped exponential backoff.
///
/// The first retryable failure of each call asks the shared [`HealthState`]
/// to enter the transition state, so the indicator can appear before the
/// monitor's own probe notices anything.
#[derive(Clone)]
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    state: Arc<HealthState>,
}

impl RequestExecutor {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, state: Arc<HealthState>) -> Self {
        Self { transport, state }
    }

    #[must_use]
    pub fn state(&self) -> &Arc<HealthState> {
        &self.state
    }

    /// Execute `request`, retrying retryable failures up to `config.max_attempts`.
    ///
    /// Returns the first 2xx response, the first 4xx as
    /// [`Error::ClientStatus`], or [`Error::RetriesExhausted`] wrapping the
    /// last failure. Cancelling `cancel` aborts the in-flight attempt or
    /// backoff wait with [`Error::Cancelled`].
    pub async fn execute(
        &self,
        request: &ApiRequest,
        config: &RetryConfig,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse> {
        config.validate()?;

        let mut attempt: u32 = 0;
        let mut transition_requested = false;

        loop {
            debug!(
                "Executing {} {} (attempt {}/{})",
                request.method,
                request.url,
                attempt + 1,
                config.max_attempts
            );

            let timed = self
                .transport
                .send(request)
                .with_timeout_or_cancel(config.timeout, cancel)
                .await;
            let result = match timed {
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Ok(result) => result,
                Err(timeout) => Err(timeout),
            };

            let error = match AttemptOutcome::classify(result, request) {
                AttemptOutcome::Success(response) => {
                    if attempt > 0 {
                        debug!("{} succeeded after {} attempts", request.url, attempt + 1);
                    }
                    return Ok(response);
                }
                AttemptOutcome::FatalFailure(error) => {
                    debug!("{} failed with non-retryable error: {}", request.url, error);
                    return Err(error);
                }
                AttemptOutcome::RetryableFailure(error) => error,
            };

            if !transition_requested {
                transition_requested = true;
                self.state.request_transition();
            }

            attempt += 1;
            if attempt >= config.max_attempts {
                error!(
                    "All {} attempts for {} failed: {}",
                    attempt, request.url, error
                );
                return Err(Error::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(error),
                });
            }

            let delay = config.delay_with_jitter(attempt - 1);
            warn!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Attempt {}/{} for {} failed, retrying: {}",
                attempt,
                config.max_attempts,
                request.url,
                error
            );

            sleep_or_cancel(delay, cancel).await?;
        }
    }
}
