pub mod health;
pub mod indicator;
pub mod probe;
pub mod retry;
pub mod timeout;


pub use health::{HealthMonitor, HealthState, MonitorConfig, ProbeOutcome};
pub use indicator::{LogIndicator, NoopIndicator, TransitionIndicator};
pub use probe::{HttpProbe, Probe};
pub use retry::{AttemptOutcome, RequestExecutor, RetryConfig};
pub use timeout::TimeoutExt;
