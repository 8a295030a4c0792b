//! Dashboard wiring: one shared health state, one monitor, and a poller per feed.

pub mod feed;

pub use feed::{FeedPoller, FeedSnapshot, FetchStatus};

use crate::client::Transport;
use crate::config::Config;
use crate::resilience::{HealthMonitor, HealthState, HttpProbe, RequestExecutor, TransitionIndicator};
use crate::Result;
use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct Dashboard {
    state: Arc<HealthState>,
    monitor: Arc<HealthMonitor>,
    executor: RequestExecutor,
    pollers: Vec<Arc<FeedPoller>>,
}

impl Dashboard {
    /// Build every component from a validated configuration
    pub fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        indicator: Arc<dyn TransitionIndicator>,
    ) -> Result<Self> {
        config.validate()?;
        let base_url = config.base_url()?;

        let state = Arc::new(HealthState::new(config.monitor.failure_threshold)?);
        let probe = Arc::new(HttpProbe::new(transport.clone(), &base_url)?);
        let monitor = HealthMonitor::new(state.clone(), probe, indicator, config.monitor_config())?;
        let executor = RequestExecutor::new(transport, state.clone());

        let pollers = config
            .polling
            .feeds
            .iter()
            .map(|feed| FeedPoller::new(feed.clone(), &base_url, executor.clone()).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            state,
            monitor,
            executor,
            pollers,
        })
    }

    #[must_use]
    pub const fn state(&self) -> &Arc<HealthState> {
        &self.state
    }

    #[must_use]
    pub const fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    #[must_use]
    pub const fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    #[must_use]
    pub fn pollers(&self) -> &[Arc<FeedPoller>] {
        &self.pollers
    }

    pub async fn snapshots(&self) -> Vec<FeedSnapshot> {
        join_all(self.pollers.iter().map(|poller| poller.snapshot())).await
    }

    /// Start the monitor and every poller, returning once `cancel` fires and all loops exit
    pub async fn run(&self, cancel: CancellationToken) {
        info!(feeds = self.pollers.len(), "Starting dashboard");
        self.monitor.start();

        join_all(
            self.pollers
                .iter()
                .map(|poller| poller.run(cancel.child_token())),
        )
        .await;

        self.monitor.stop();
        info!("Dashboard stopped");
    }
}
