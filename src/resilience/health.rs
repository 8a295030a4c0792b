//! Cluster health monitoring and the shared transition state.
//!
//! [`HealthState`] is the one piece of state shared between the request
//! executor and the [`HealthMonitor`]. Either side may set `transitioning`,
//! but only a successful liveness probe clears it. The clearing writers are
//! private to this module, so the executor cannot hide the indicator just
//! because one of its own fetches happened to succeed.

use super::indicator::TransitionIndicator;
use super::probe::Probe;
use super::timeout::TimeoutExt;
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default number of consecutive probe failures before a transition is declared
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 2;

/// Process-wide health state shared by the executor and the monitor
#[derive(Debug)]
pub struct HealthState {
    failure_threshold: u32,
    consecutive_failures: AtomicU32,
    checking: AtomicBool,
    transition_requests: AtomicU64,
    transitioning: watch::Sender<bool>,
}

impl HealthState {
    pub fn new(failure_threshold: u32) -> Result<Self> {
        if failure_threshold == 0 {
            return Err(Error::invalid(
                "failure_threshold",
                "must be at least 1",
            ));
        }

        Ok(Self::with_threshold(failure_threshold))
    }

    /// `failure_threshold` must already be known to be non-zero
    fn with_threshold(failure_threshold: u32) -> Self {
        let (transitioning, _) = watch::channel(false);
        Self {
            failure_threshold,
            consecutive_failures: AtomicU32::new(0),
            checking: AtomicBool::new(false),
            transition_requests: AtomicU64::new(0),
            transitioning,
        }
    }

    /// Whether the client currently believes a cluster transition is underway.
    ///
    /// Pollers check this before surfacing fetch errors.
    #[must_use]
    pub fn is_transitioning(&self) -> bool {
        *self.transitioning.borrow()
    }

    /// Subscribe to changes of the `transitioning` flag
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.transitioning.subscribe()
    }

    /// Ask for the transition state to be entered.
    ///
    /// Idempotent: returns `true` only for the call that flipped the flag.
    /// Never touches the probe failure counter.
    pub fn request_transition(&self) -> bool {
        self.transition_requests.fetch_add(1, Ordering::Relaxed);
        let flipped = self.set_transitioning();
        if flipped {
            warn!("Request failures reported, entering cluster transition state");
        }
        flipped
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Number of transition requests received from executors
    #[must_use]
    pub fn transition_requests(&self) -> u64 {
        self.transition_requests.load(Ordering::Relaxed)
    }

    fn set_transitioning(&self) -> bool {
        self.transitioning.send_if_modified(|transitioning| {
            if *transitioning {
                false
            } else {
                *transitioning = true;
                true
            }
        })
    }

    fn try_begin_check(&self) -> Option<CheckGuard<'_>> {
        self.checking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CheckGuard {
                checking: &self.checking,
            })
    }

    /// Returns `true` when this success ended a transition
    fn record_probe_success(&self) -> bool {
        self.consecutive_failures.store(0, Ordering::Release);
        self.transitioning.send_if_modified(|transitioning| {
            if *transitioning {
                *transitioning = false;
                true
            } else {
                false
            }
        })
    }

    /// Returns the new failure count and whether this failure started a transition
    fn record_probe_failure(&self) -> (u32, bool) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let started = failures >= self.failure_threshold && self.set_transitioning();
        (failures, started)
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::with_threshold(DEFAULT_FAILURE_THRESHOLD)
    }
}

/// Releases the `checking` flag when the probe finishes or is dropped
struct CheckGuard<'a> {
    checking: &'a AtomicBool,
}

impl Drop for CheckGuard<'_> {
    fn drop(&mut self) {
        self.checking.store(false, Ordering::Release);
    }
}

/// Health monitor timing configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Period between probes
    pub check_interval: Duration,
    /// Grace delay before the first probe, so page load does not trip it
    pub initial_delay: Duration,
    /// Deadline for a single probe
    pub probe_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            initial_delay: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.check_interval.is_zero() {
            return Err(Error::invalid("check_interval", "must be greater than zero"));
        }
        if self.probe_timeout.is_zero() {
            return Err(Error::invalid("probe_timeout", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Result of a single probe tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// A previous probe was still in flight, so this tick did nothing
    Skipped,
    /// Probe succeeded; `recovered` is set when this ended a transition
    Healthy { recovered: bool },
    /// Probe failed
    Degraded {
        consecutive_failures: u32,
        transition_started: bool,
    },
    /// Monitor was stopped while the probe was in flight
    Cancelled,
}

/// Periodic liveness prober that owns the transition indicator
pub struct HealthMonitor {
    state: Arc<HealthState>,
    probe: Arc<dyn Probe>,
    indicator: Arc<dyn TransitionIndicator>,
    config: MonitorConfig,
    indicator_visible: Mutex<bool>,
    run: Mutex<Option<CancellationToken>>,
}

impl HealthMonitor {
    pub fn new(
        state: Arc<HealthState>,
        probe: Arc<dyn Probe>,
        indicator: Arc<dyn TransitionIndicator>,
        config: MonitorConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            state,
            probe,
            indicator,
            config,
            indicator_visible: Mutex::new(false),
            run: Mutex::new(None),
        }))
    }

    #[must_use]
    pub fn state(&self) -> &Arc<HealthState> {
        &self.state
    }

    #[must_use]
    pub const fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Run one probe unless another one is still in flight
    pub async fn probe_once(&self, cancel: &CancellationToken) -> ProbeOutcome {
        let Some(_guard) = self.state.try_begin_check() else {
            debug!("Previous health probe still in flight, skipping tick");
            return ProbeOutcome::Skipped;
        };

        let result = self
            .probe
            .check()
            .with_timeout_or_cancel(self.config.probe_timeout, cancel)
            .await;

        let outcome = match result {
            Err(Error::Cancelled) => {
                debug!("Health probe '{}' cancelled", self.probe.name());
                return ProbeOutcome::Cancelled;
            }
            Ok(Ok(())) => {
                let recovered = self.state.record_probe_success();
                if recovered {
                    info!("Cluster transition completed, health probe passing again");
                } else {
                    debug!("Cluster healthy");
                }
                ProbeOutcome::Healthy { recovered }
            }
            Ok(Err(error)) | Err(error) => {
                let (failures, started) = self.state.record_probe_failure();
                warn!(
                    "Health probe '{}' failed ({}/{}): {}",
                    self.probe.name(),
                    failures,
                    self.state.failure_threshold(),
                    error
                );
                if started {
                    warn!("Cluster transition detected after {} consecutive probe failures", failures);
                }
                ProbeOutcome::Degraded {
                    consecutive_failures: failures,
                    transition_started: started,
                }
            }
        };

        self.sync_indicator();
        outcome
    }

    /// Start periodic probing. No-op if already running.
    pub fn start(self: &Arc<Self>) {
        let token = {
            let mut run = self.run.lock().unwrap_or_else(PoisonError::into_inner);
            if run.is_some() {
                debug!("Health monitor already running");
                return;
            }
            let token = CancellationToken::new();
            *run = Some(token.clone());
            token
        };

        info!(
            "Starting health monitor (interval {:?}, threshold {}, first probe in {:?})",
            self.config.check_interval,
            self.state.failure_threshold(),
            self.config.initial_delay
        );

        let monitor = Arc::clone(self);
        tokio::spawn(async move { monitor.schedule(token).await });
    }

    /// Cancel the scheduler and any in-flight probe. Safe to call at any time.
    pub fn stop(&self) {
        let token = self
            .run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
            info!("Health monitor stopped");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    async fn schedule(self: Arc<Self>, token: CancellationToken) {
        let mut transitions = self.state.subscribe();
        self.sync_indicator();

        let first = Instant::now() + self.config.initial_delay;
        let mut ticker = interval_at(first, self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    // Each tick runs on its own task so a slow probe never delays
                    // the timer; overlapping ticks are dropped by the check guard.
                    let monitor = Arc::clone(&self);
                    let probe_token = token.child_token();
                    tokio::spawn(async move {
                        monitor.probe_once(&probe_token).await;
                    });
                }
                changed = transitions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.sync_indicator();
                }
            }
        }

        debug!("Health monitor scheduler exited");
    }

    /// Project `transitioning` onto the indicator, calling it only on change
    fn sync_indicator(&self) {
        // Read the flag under the lock so the last caller projects the latest value
        let mut visible = self
            .indicator_visible
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let transitioning = self.state.is_transitioning();
        if *visible == transitioning {
            return;
        }
        *visible = transitioning;
        if transitioning {
            self.indicator.show();
        } else {
            self.indicator.hide();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    struct ScriptedProbe {
        script: Mutex<VecDeque<bool>>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(script: &[bool]) -> Self {
            Self {
                script: Mutex::new(script.iter().copied().collect()),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn check(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            // An exhausted script keeps succeeding
            let healthy = self.script.lock().unwrap().pop_front().unwrap_or(true);
            if healthy {
                Ok(())
            } else {
                Err(Error::UpstreamStatus {
                    status: 503,
                    url: "/health".to_string(),
                })
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    #[derive(Default)]
    struct RecordingIndicator {
        shows: AtomicUsize,
        hides: AtomicUsize,
    }

    impl RecordingIndicator {
        fn visible(&self) -> bool {
            self.shows.load(Ordering::SeqCst) > self.hides.load(Ordering::SeqCst)
        }
    }

    impl TransitionIndicator for RecordingIndicator {
        fn show(&self) {
            self.shows.fetch_add(1, Ordering::SeqCst);
        }

        fn hide(&self) {
            self.hides.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn monitor_with(
        probe: Arc<ScriptedProbe>,
        config: MonitorConfig,
    ) -> (Arc<HealthMonitor>, Arc<RecordingIndicator>) {
        let indicator = Arc::new(RecordingIndicator::default());
        let state = Arc::new(HealthState::default());
        let monitor = HealthMonitor::new(state, probe, indicator.clone(), config).unwrap();
        (monitor, indicator)
    }

    #[tokio::test]
    async fn test_fail_fail_succeed_scenario() {
        let probe = Arc::new(ScriptedProbe::new(&[false, false, true]));
        let (monitor, indicator) = monitor_with(probe, MonitorConfig::default());
        let cancel = CancellationToken::new();
        let state = monitor.state().clone();

        assert!(!state.is_transitioning());

        let outcome = monitor.probe_once(&cancel).await;
        assert_eq!(
            outcome,
            ProbeOutcome::Degraded {
                consecutive_failures: 1,
                transition_started: false
            }
        );
        assert!(!state.is_transitioning());

        let outcome = monitor.probe_once(&cancel).await;
        assert_eq!(
            outcome,
            ProbeOutcome::Degraded {
                consecutive_failures: 2,
                transition_started: true
            }
        );
        assert!(state.is_transitioning());
        assert_eq!(indicator.shows.load(Ordering::SeqCst), 1);

        let outcome = monitor.probe_once(&cancel).await;
        assert_eq!(outcome, ProbeOutcome::Healthy { recovered: true });
        assert!(!state.is_transitioning());
        assert_eq!(state.consecutive_failures(), 0);
        assert_eq!(indicator.hides.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_further_failures_do_not_reshow_indicator() {
        let probe = Arc::new(ScriptedProbe::new(&[false, false, false, false]));
        let (monitor, indicator) = monitor_with(probe, MonitorConfig::default());
        let cancel = CancellationToken::new();

        for _ in 0..4 {
            monitor.probe_once(&cancel).await;
        }

        assert_eq!(monitor.state().consecutive_failures(), 4);
        assert!(monitor.state().is_transitioning());
        assert_eq!(indicator.shows.load(Ordering::SeqCst), 1);
        assert_eq!(indicator.hides.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_probe_is_skipped() {
        let probe = Arc::new(ScriptedProbe::new(&[true, true]).with_delay(Duration::from_secs(1)));
        let (monitor, _) = monitor_with(probe.clone(), MonitorConfig::default());
        let cancel = CancellationToken::new();

        let (first, second) = tokio::join!(monitor.probe_once(&cancel), monitor.probe_once(&cancel));

        assert_eq!(first, ProbeOutcome::Healthy { recovered: false });
        assert_eq!(second, ProbeOutcome::Skipped);
        assert_eq!(probe.calls(), 1);

        // Guard is released once the probe completes
        assert_eq!(
            monitor.probe_once(&cancel).await,
            ProbeOutcome::Healthy { recovered: false }
        );
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_deadline_counts_as_failure() {
        let probe = Arc::new(ScriptedProbe::new(&[true]).with_delay(Duration::from_secs(10)));
        let (monitor, _) = monitor_with(probe, MonitorConfig::default());

        let outcome = monitor.probe_once(&CancellationToken::new()).await;
        assert_eq!(
            outcome,
            ProbeOutcome::Degraded {
                consecutive_failures: 1,
                transition_started: false
            }
        );
    }

    #[test]
    fn test_request_transition_is_idempotent_and_leaves_counter() {
        let state = HealthState::default();

        assert!(state.request_transition());
        assert!(!state.request_transition());
        assert!(state.is_transitioning());
        assert_eq!(state.transition_requests(), 2);
        assert_eq!(state.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_only_probe_success_clears_requested_transition() {
        let probe = Arc::new(ScriptedProbe::new(&[false, true]));
        let (monitor, indicator) = monitor_with(probe, MonitorConfig::default());
        let cancel = CancellationToken::new();
        let state = monitor.state().clone();

        state.request_transition();

        // A failing probe below threshold leaves the requested transition alone
        monitor.probe_once(&cancel).await;
        assert!(state.is_transitioning());
        assert_eq!(indicator.shows.load(Ordering::SeqCst), 1);

        assert_eq!(
            monitor.probe_once(&cancel).await,
            ProbeOutcome::Healthy { recovered: true }
        );
        assert!(!state.is_transitioning());
        assert_eq!(indicator.hides.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_threshold_rejected() {
        assert!(matches!(
            HealthState::new(0),
            Err(Error::InvalidInput { .. })
        ));
        assert_eq!(HealthState::new(3).unwrap().failure_threshold(), 3);

        let state = HealthState::default();
        assert_eq!(state.failure_threshold(), DEFAULT_FAILURE_THRESHOLD);
        assert!(!state.is_transitioning());
        assert_eq!(state.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_safe() {
        let probe = Arc::new(ScriptedProbe::new(&[]));
        let (monitor, _) = monitor_with(probe, MonitorConfig::default());

        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_waits_grace_delay_then_probes_periodically() {
        let probe = Arc::new(ScriptedProbe::new(&[]));
        let (monitor, _) = monitor_with(probe.clone(), MonitorConfig::default());

        monitor.start();
        monitor.start();
        assert!(monitor.is_running());

        sleep(Duration::from_millis(4_900)).await;
        assert_eq!(probe.calls(), 0);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(probe.calls(), 1);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(probe.calls(), 2);

        monitor.stop();
        sleep(Duration::from_secs(30)).await;
        assert_eq!(probe.calls(), 2);
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_in_flight_probe() {
        let probe = Arc::new(ScriptedProbe::new(&[false]).with_delay(Duration::from_secs(2)));
        let config = MonitorConfig {
            initial_delay: Duration::ZERO,
            ..MonitorConfig::default()
        };
        let (monitor, _) = monitor_with(probe.clone(), config);

        monitor.start();
        sleep(Duration::from_millis(500)).await;
        assert_eq!(probe.calls(), 1);

        monitor.stop();
        sleep(Duration::from_millis(10)).await;

        // Cancelled probe was not counted and released the guard
        assert_eq!(monitor.state().consecutive_failures(), 0);
        assert_ne!(
            monitor.probe_once(&CancellationToken::new()).await,
            ProbeOutcome::Skipped
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_requested_transition_shows_indicator_while_running() {
        let probe = Arc::new(ScriptedProbe::new(&[]));
        let config = MonitorConfig {
            initial_delay: Duration::from_secs(60),
            ..MonitorConfig::default()
        };
        let (monitor, indicator) = monitor_with(probe, config);

        monitor.start();
        sleep(Duration::from_millis(10)).await;
        monitor.state().request_transition();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(indicator.shows.load(Ordering::SeqCst), 1);
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_during_slow_check_are_dropped() {
        let probe = Arc::new(ScriptedProbe::new(&[]).with_delay(Duration::from_secs(7)));
        let config = MonitorConfig {
            initial_delay: Duration::ZERO,
            probe_timeout: Duration::from_secs(10),
            ..MonitorConfig::default()
        };
        let (monitor, _) = monitor_with(probe.clone(), config);

        monitor.start();

        // Probe started at 0s is still running at the 5s tick
        sleep(Duration::from_secs(6)).await;
        assert_eq!(probe.calls(), 1);

        // 5s and 15s ticks were dropped, not queued behind the running probe
        sleep(Duration::from_millis(14_500)).await;
        assert_eq!(probe.calls(), 3);
        assert_eq!(monitor.state().consecutive_failures(), 0);

        monitor.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_indicator_follows_flag_under_concurrent_updates() {
        let probe = Arc::new(ScriptedProbe::new(&[]));
        let config = MonitorConfig {
            initial_delay: Duration::from_secs(3600),
            ..MonitorConfig::default()
        };
        let (monitor, indicator) = monitor_with(probe, config);
        let state = monitor.state().clone();
        monitor.start();

        for _ in 0..200 {
            state.request_transition();

            let clearing = {
                let monitor = monitor.clone();
                tokio::spawn(async move { monitor.probe_once(&CancellationToken::new()).await })
            };
            let raising = {
                let state = state.clone();
                tokio::spawn(async move { state.request_transition() })
            };
            clearing.await.unwrap();
            raising.await.unwrap();

            let settled = tokio::time::timeout(Duration::from_secs(1), async {
                while indicator.visible() != state.is_transitioning() {
                    sleep(Duration::from_millis(1)).await;
                }
            })
            .await;
            assert!(settled.is_ok(), "indicator out of sync with transition flag");
        }

        monitor.stop();
    }
}
