//! Backend connectivity monitor.
//!
//! A mounted monitor waits out a grace period, then runs one probe cycle and
//! repeats it on a fixed period measured from the mount instant. Within a
//! cycle failed attempts are retried after a fixed delay until the retry
//! budget runs out, at which point the backend is reported as disconnected.
//!
//! A cycle always runs to its end; ticks that pass meanwhile are skipped. A
//! request still pending when a tick fires is cut off, counted as a failed
//! attempt, and the tick's attempt is made straight away.

use crate::config::MonitorConfig;
use crate::network::{HealthProbe, HealthReport, ProbeError};
use crate::scheduler::{Scheduler, TokioScheduler};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Reachability of the backend as seen by the view layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectivityState {
    #[default]
    Unknown,
    Connected,
    Disconnected,
}

/// Where the detector is within a probe cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Probing,
    RetryWait,
    Settled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Probe again after `delay`. `retry` counts from 1.
    Retry { retry: u32, delay: Duration },
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl From<&MonitorConfig> for RetryPolicy {
    fn from(cfg: &MonitorConfig) -> Self {
        RetryPolicy {
            max_retries: cfg.max_retries,
            retry_delay: cfg.retry_delay(),
        }
    }
}

/// Timer-free state machine behind the monitor.
#[derive(Debug, Clone)]
pub struct Detector {
    policy: RetryPolicy,
    phase: Phase,
    retries: u32,
    state: ConnectivityState,
}

impl Detector {
    pub fn new(policy: RetryPolicy) -> Self {
        Detector {
            policy,
            phase: Phase::Idle,
            retries: 0,
            state: ConnectivityState::Unknown,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn begin_cycle(&mut self) {
        self.retries = 0;
        self.phase = Phase::Probing;
    }

    pub fn on_success(&mut self) -> ConnectivityState {
        self.retries = 0;
        self.phase = Phase::Settled;
        self.state = ConnectivityState::Connected;
        self.state
    }

    /// Records a failed attempt. The visible state only changes once the
    /// retry budget is spent.
    pub fn on_failure(&mut self) -> RetryDecision {
        if self.retries < self.policy.max_retries {
            self.retries += 1;
            self.phase = Phase::RetryWait;
            RetryDecision::Retry {
                retry: self.retries,
                delay: self.policy.retry_delay,
            }
        } else {
            self.phase = Phase::Settled;
            self.state = ConnectivityState::Disconnected;
            RetryDecision::GiveUp
        }
    }

    /// Leaves `RetryWait` for the next attempt.
    pub fn resume(&mut self) {
        if self.phase == Phase::RetryWait {
            self.phase = Phase::Probing;
        }
    }
}

/// Receives every state the monitor settles on.
pub trait StateSink: Send + Sync {
    fn publish(&self, state: ConnectivityState);
}

impl StateSink for watch::Sender<ConnectivityState> {
    fn publish(&self, state: ConnectivityState) {
        self.send_replace(state);
    }
}

/// Forwards to the sink only while the monitor is mounted. The flag is held
/// across check-and-publish so nothing reaches the sink once `close` returns.
struct MountGate {
    mounted: Mutex<bool>,
    sink: Arc<dyn StateSink>,
}

impl MountGate {
    fn new(sink: Arc<dyn StateSink>) -> Self {
        MountGate {
            mounted: Mutex::new(true),
            sink,
        }
    }

    fn publish(&self, state: ConnectivityState) -> bool {
        let mounted = self.mounted.lock().unwrap_or_else(|e| e.into_inner());
        if !*mounted {
            return false;
        }
        self.sink.publish(state);
        true
    }

    fn close(&self) {
        *self.mounted.lock().unwrap_or_else(|e| e.into_inner()) = false;
    }
}

/// Result of a single attempt.
enum Attempt {
    Finished(Result<HealthReport, ProbeError>),
    /// The periodic tick fired while the request was still pending.
    CutOff,
}

pub struct ConnectivityMonitor {
    config: MonitorConfig,
    probe: Arc<dyn HealthProbe>,
    scheduler: Arc<dyn Scheduler>,
    gate: Arc<MountGate>,
    detector: Detector,
}

impl ConnectivityMonitor {
    pub fn new(
        config: MonitorConfig,
        probe: Arc<dyn HealthProbe>,
        sink: Arc<dyn StateSink>,
    ) -> Self {
        let detector = Detector::new(RetryPolicy::from(&config));
        ConnectivityMonitor {
            config,
            probe,
            scheduler: Arc::new(TokioScheduler),
            gate: Arc::new(MountGate::new(sink)),
            detector,
        }
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn state(&self) -> ConnectivityState {
        self.detector.state()
    }

    /// Starts the monitor on the current tokio runtime.
    pub fn mount(self) -> MonitorHandle {
        let gate = self.gate.clone();
        let task = tokio::spawn(self.run());
        MonitorHandle {
            gate,
            task: Some(task),
        }
    }

    /// Runs a single probe cycle right away, skipping the grace period.
    pub async fn check_now(&mut self) -> ConnectivityState {
        self.run_cycle(None).await
    }

    async fn run(mut self) {
        let mounted_at = self.scheduler.now();
        let period = self.config.poll_interval();
        debug!(
            "connectivity monitor mounted: grace={:?}, period={:?}, retries={}",
            self.config.grace_period(),
            period,
            self.config.max_retries
        );

        self.scheduler.sleep(self.config.grace_period()).await;

        let mut next_tick = mounted_at + period;
        loop {
            self.run_cycle(Some(&mut next_tick)).await;

            let now = self.scheduler.now();
            let mut skipped = 0;
            while next_tick < now {
                next_tick += period;
                skipped += 1;
            }
            if skipped > 0 {
                debug!("probe cycle overran {} tick(s)", skipped);
            }
            self.scheduler.sleep_until(next_tick).await;
        }
    }

    /// With `next_tick` set, a tick falling on an attempt's start belongs to
    /// that attempt and is consumed. A later tick cuts the attempt off and is
    /// left for whichever attempt comes next, in this cycle or a new one.
    async fn attempt(&self, next_tick: Option<&mut Instant>) -> Attempt {
        let Some(tick) = next_tick else {
            return Attempt::Finished(self.probe.probe().await);
        };

        let started = self.scheduler.now();
        let period = self.config.poll_interval();
        while *tick <= started {
            *tick += period;
        }

        let cutoff = self.scheduler.sleep_until(*tick);
        tokio::select! {
            biased;
            result = self.probe.probe() => Attempt::Finished(result),
            _ = cutoff => Attempt::CutOff,
        }
    }

    async fn run_cycle(&mut self, mut next_tick: Option<&mut Instant>) -> ConnectivityState {
        let previous = self.detector.state();
        self.detector.begin_cycle();

        loop {
            let (reason, wait) = match self.attempt(next_tick.as_deref_mut()).await {
                Attempt::Finished(Ok(report)) => {
                    let state = self.detector.on_success();
                    debug!(
                        "health probe ok: status={:?}, mongodb={:?}",
                        report.status, report.mongodb
                    );
                    self.settle(previous, state);
                    return state;
                }
                Attempt::Finished(Err(e)) => (e.to_string(), true),
                Attempt::CutOff => ("request still pending at next tick".to_string(), false),
            };

            match self.detector.on_failure() {
                RetryDecision::Retry { retry, delay } => {
                    let max = self.config.max_retries;
                    if wait {
                        debug!(
                            "health probe failed ({}), retry {}/{} in {:?}",
                            reason, retry, max, delay
                        );
                        self.scheduler.sleep(delay).await;
                    } else {
                        warn!("health probe failed ({}), retry {}/{} now", reason, retry, max);
                    }
                    self.detector.resume();
                }
                RetryDecision::GiveUp => {
                    warn!("health probe failed ({}), retries exhausted", reason);
                    let state = self.detector.state();
                    self.settle(previous, state);
                    return state;
                }
            }
        }
    }

    fn settle(&self, previous: ConnectivityState, state: ConnectivityState) {
        if !self.gate.publish(state) {
            debug!("monitor torn down, dropping {:?}", state);
            return;
        }
        if previous != state {
            info!("backend connectivity: {:?} -> {:?}", previous, state);
        }
    }
}

/// Owner of a mounted monitor. Dropping it tears the monitor down.
pub struct MonitorHandle {
    gate: Arc<MountGate>,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn teardown(mut self) {
        self.shutdown();
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn is_mounted(&self) -> bool {
        self.task.is_some()
    }

    fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            self.gate.close();
            task.abort();
            debug!("connectivity monitor torn down");
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
