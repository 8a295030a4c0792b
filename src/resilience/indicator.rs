use tracing::{info, warn};

/// Presentation of the cluster-transition state.
///
/// The monitor calls `show` once when `transitioning` becomes true and
/// `hide` once when it clears.
pub trait TransitionIndicator: Send + Sync {
    fn show(&self);
    fn hide(&self);
}

/// Indicator that reports transitions as log events
#[derive(Debug, Default, Clone, Copy)]
pub struct LogIndicator;

impl TransitionIndicator for LogIndicator {
    fn show(&self) {
        warn!("Cluster transition in progress, waiting for GSLB to redirect traffic");
    }

    fn hide(&self) {
        info!("Cluster transition completed, service restored");
    }
}

/// Indicator that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIndicator;

impl TransitionIndicator for NoopIndicator {
    fn show(&self) {}

    fn hide(&self) {}
}
