//! Periodic sweep and peak-count sampling.
//!
//! Both run as tokio tasks holding only a weak reference to the registry and
//! stop on cancellation or once the registry is dropped.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ConnectionRegistry, TransportCounts};
use crate::connection::now_millis;
use crate::error::Result;

struct TaskHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    async fn shutdown(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

#[derive(Default)]
pub(super) struct Maintenance {
    sweep: Option<TaskHandle>,
    sampler: Option<TaskHandle>,
}

/// Tracks per-transport peaks over a window of samples
#[derive(Debug, Clone)]
pub struct ConnectionSampler {
    peak: TransportCounts,
    samples: u32,
    notification_interval: u32,
}

impl ConnectionSampler {
    pub fn new(notification_interval: u32) -> Self {
        Self {
            peak: TransportCounts::default(),
            samples: 0,
            notification_interval: notification_interval.max(1),
        }
    }

    /// Records one sample; returns the window's peaks when the window is full
    pub fn record(&mut self, counts: TransportCounts) -> Option<TransportCounts> {
        self.peak = self.peak.max(&counts);
        self.samples += 1;
        if self.samples < self.notification_interval {
            return None;
        }
        let peak = self.peak;
        self.peak = TransportCounts::default();
        self.samples = 0;
        Some(peak)
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn spawn_sweep(registry: Weak<ConnectionRegistry>, period: Duration) -> TaskHandle {
    let token = CancellationToken::new();
    let cancelled = token.clone();
    let handle = tokio::spawn(async move {
        let mut ticker = ticker(period);
        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(registry) = registry.upgrade() else { break };
                    let evicted = registry.sweep(now_millis()).await;
                    if evicted > 0 {
                        debug!("Swept {} idle connections", evicted);
                    }
                }
            }
        }
        debug!("Connection sweep task stopped");
    });
    TaskHandle { token, handle }
}

fn spawn_sampler(registry: Weak<ConnectionRegistry>, period: Duration, notification_interval: u32) -> TaskHandle {
    let token = CancellationToken::new();
    let cancelled = token.clone();
    let handle = tokio::spawn(async move {
        let mut ticker = ticker(period);
        let mut sampler = ConnectionSampler::new(notification_interval);
        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(registry) = registry.upgrade() else { break };
                    if let Some(peak) = sampler.record(registry.counts()) {
                        info!(
                            udp = peak.udp,
                            tcp = peak.tcp,
                            tls = peak.tls,
                            multicast = peak.multicast,
                            "Peak connection counts"
                        );
                        registry.record_peak(peak);
                    }
                }
            }
        }
        debug!("Connection sampling task stopped");
    });
    TaskHandle { token, handle }
}

impl ConnectionRegistry {
    /// Starts the sweep and sampling tasks if they are not running
    pub fn start_maintenance(self: &Arc<Self>) {
        let mut maintenance = self.maintenance.lock();
        if maintenance.sweep.is_none() {
            maintenance.sweep = Some(spawn_sweep(Arc::downgrade(self), self.cleanup_interval()));
            info!("Connection sweep every {:?}", self.cleanup_interval());
        }
        if maintenance.sampler.is_none() {
            maintenance.sampler = Some(spawn_sampler(
                Arc::downgrade(self),
                self.sampling_interval,
                self.notification_interval,
            ));
        }
    }

    /// Changes the sweep period, rescheduling a running sweep task
    pub fn set_cleanup_interval(self: &Arc<Self>, interval: Duration) -> Result<()> {
        Self::validate_interval(interval)?;
        self.cleanup_interval_secs
            .store(interval.as_secs(), std::sync::atomic::Ordering::Relaxed);

        let mut maintenance = self.maintenance.lock();
        if let Some(previous) = maintenance.sweep.take() {
            previous.token.cancel();
            maintenance.sweep = Some(spawn_sweep(Arc::downgrade(self), interval));
        }
        info!("Connection cleanup interval set to {:?}", interval);
        Ok(())
    }

    pub fn is_maintenance_running(&self) -> bool {
        self.maintenance.lock().sweep.is_some()
    }

    /// Cancels the maintenance tasks and waits for them to finish
    pub async fn stop_maintenance(&self) {
        let (sweep, sampler) = {
            let mut maintenance = self.maintenance.lock();
            (maintenance.sweep.take(), maintenance.sampler.take())
        };
        if let Some(task) = sweep {
            task.shutdown().await;
        }
        if let Some(task) = sampler {
            task.shutdown().await;
        }
    }
}
