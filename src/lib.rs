pub mod client;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod logging;
pub mod resilience;

pub use client::{ApiRequest, ApiResponse, ReqwestTransport, Transport};
pub use config::{Config, ConfigOverrides};
pub use dashboard::{Dashboard, FeedPoller, FeedSnapshot};
pub use error::{Error, ErrorCategory, Result};
pub use resilience::{
    HealthMonitor, HealthState, HttpProbe, MonitorConfig, Probe, RequestExecutor, RetryConfig,
    TimeoutExt, TransitionIndicator,
};
