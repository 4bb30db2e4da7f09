//! Liveness checker
//!
//! Uses the queue itself as a heartbeat: every pulse interval an internal
//! `LIVENESS_PULSE` row is enqueued, rides the trigger/notification/dequeue
//! path like any other change, and is measured on the way back. When pulses
//! stop returning, the health status degrades from healthy through unhealthy
//! to dead, and the dispatcher reacts by reconnecting or shutting down.

use crate::bus::EventBus;
use crate::config::LivenessOptions;
use crate::error::Result;
use crate::event::InternalOp;
use crate::queue::EventQueue;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Round-trip health of the queue path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Dead,
}

impl HealthStatus {
    /// The bus key this status is emitted under.
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Dead => "dead",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by the liveness checker.
#[derive(Debug, Clone)]
pub enum HealthEvent {
    /// A pulse completed its round trip.
    Heartbeat {
        pulsed_at: DateTime<Utc>,
        pulse_lag: chrono::Duration,
    },
    /// Status after a pulse send: exactly one per pulse.
    Status {
        status: HealthStatus,
        last_heartbeat_at: DateTime<Utc>,
    },
}

/// Classify elapsed time since the last heartbeat.
///
/// Healthy within `pulse_interval * max_missed_pulses`, unhealthy within
/// three times that window, dead beyond it.
fn classify(elapsed_ms: i64, pulse_interval_ms: i64, max_missed_pulses: i64) -> HealthStatus {
    let window = pulse_interval_ms * max_missed_pulses;
    if elapsed_ms <= window {
        HealthStatus::Healthy
    } else if elapsed_ms <= window * 3 {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Dead
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Periodically enqueues internal heartbeats and tracks their round trip.
pub struct LivenessChecker {
    queue: Arc<EventQueue>,
    options: LivenessOptions,
    bus: Arc<EventBus<HealthEvent>>,
    last_heartbeat_ms: Arc<AtomicI64>,
    wired: AtomicBool,
    pulse_task: Mutex<Option<JoinHandle<()>>>,
}

impl LivenessChecker {
    pub fn new(queue: Arc<EventQueue>, options: LivenessOptions) -> Self {
        Self {
            queue,
            options,
            bus: Arc::new(EventBus::new()),
            last_heartbeat_ms: Arc::new(AtomicI64::new(0)),
            wired: AtomicBool::new(false),
            pulse_task: Mutex::new(None),
        }
    }

    /// The health bus, keyed `heartbeat` / `healthy` / `unhealthy` / `dead`.
    pub(crate) fn bus(&self) -> &Arc<EventBus<HealthEvent>> {
        &self.bus
    }

    /// When the last heartbeat returned. Never decreases.
    pub fn last_heartbeat_at(&self) -> DateTime<Utc> {
        millis_to_datetime(self.last_heartbeat_ms.load(Ordering::SeqCst))
    }

    /// Subscribe to returning pulses and start the pulse timer.
    pub async fn start(&self) -> Result<()> {
        if !self.wired.swap(true, Ordering::SeqCst) {
            let queue = self.queue.clone();
            let bus = self.bus.clone();
            let last_heartbeat = self.last_heartbeat_ms.clone();
            self.queue
                .bus()
                .subscribe(
                    format!("internal:{}", InternalOp::LivenessPulse),
                    move |row_id: i64| {
                        let queue = queue.clone();
                        let bus = bus.clone();
                        let last_heartbeat = last_heartbeat.clone();
                        async move {
                            queue
                                .dequeue(row_id, |row| async move {
                                    let now = Utc::now();
                                    let pulse_lag = now - row.queued_at;
                                    last_heartbeat
                                        .fetch_max(now.timestamp_millis(), Ordering::SeqCst);
                                    debug!(
                                        row_id = row.id,
                                        lag_ms = pulse_lag.num_milliseconds(),
                                        "liveness pulse returned"
                                    );
                                    bus.emit_sync(
                                        "heartbeat",
                                        HealthEvent::Heartbeat {
                                            pulsed_at: row.queued_at,
                                            pulse_lag,
                                        },
                                    )
                                    .await;
                                    Ok(())
                                })
                                .await?;
                            Ok(())
                        }
                    },
                )
                .await;
        }

        // a fresh start counts as a heartbeat, otherwise the very first
        // status computation would report dead
        self.last_heartbeat_ms
            .fetch_max(Utc::now().timestamp_millis(), Ordering::SeqCst);

        let queue = self.queue.clone();
        let bus = self.bus.clone();
        let last_heartbeat = self.last_heartbeat_ms.clone();
        let interval = self.options.pulse_interval;
        let max_missed = i64::from(self.options.max_missed_pulses);

        // replace any running pulse timer rather than leaking it
        self.stop();

        let task = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;

                let pulsed_at = Utc::now();
                if let Err(e) = queue
                    .queue_internal(
                        InternalOp::LivenessPulse,
                        json!({ "pulsed_at": pulsed_at.to_rfc3339() }),
                    )
                    .await
                {
                    warn!("failed to enqueue liveness pulse: {e}");
                }

                let last_ms = last_heartbeat.load(Ordering::SeqCst);
                let elapsed_ms = Utc::now().timestamp_millis() - last_ms;
                let status =
                    classify(elapsed_ms, interval.as_millis() as i64, max_missed);
                bus.emit_sync(
                    status.as_str(),
                    HealthEvent::Status {
                        status,
                        last_heartbeat_at: millis_to_datetime(last_ms),
                    },
                )
                .await;
            }
        });
        *self.pulse_task.lock().expect("pulse task lock poisoned") = Some(task);

        info!(interval = ?self.options.pulse_interval, "liveness checker started");
        Ok(())
    }

    /// Stop the pulse timer.
    pub fn stop(&self) {
        let task = self.pulse_task.lock().expect("pulse task lock poisoned").take();
        if let Some(task) = task {
            task.abort();
            info!("liveness checker stopped");
        }
    }
}

impl Drop for LivenessChecker {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.pulse_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL_MS: i64 = 10_000;
    const MAX_MISSED: i64 = 3;

    #[test]
    fn test_classify_healthy_within_window() {
        assert_eq!(
            classify(0, INTERVAL_MS, MAX_MISSED),
            HealthStatus::Healthy
        );
        assert_eq!(
            classify(30_000, INTERVAL_MS, MAX_MISSED),
            HealthStatus::Healthy
        );
    }

    #[test]
    fn test_classify_unhealthy_within_triple_window() {
        assert_eq!(
            classify(30_001, INTERVAL_MS, MAX_MISSED),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            classify(90_000, INTERVAL_MS, MAX_MISSED),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_classify_dead_beyond_triple_window() {
        assert_eq!(
            classify(90_001, INTERVAL_MS, MAX_MISSED),
            HealthStatus::Dead
        );
    }

    #[test]
    fn test_status_keys() {
        assert_eq!(HealthStatus::Healthy.as_str(), "healthy");
        assert_eq!(HealthStatus::Unhealthy.as_str(), "unhealthy");
        assert_eq!(HealthStatus::Dead.as_str(), "dead");
    }

    #[test]
    fn test_last_heartbeat_is_monotonic() {
        let last = AtomicI64::new(0);
        last.fetch_max(1_000, Ordering::SeqCst);
        last.fetch_max(500, Ordering::SeqCst); // stale update must not regress
        assert_eq!(last.load(Ordering::SeqCst), 1_000);
        last.fetch_max(2_000, Ordering::SeqCst);
        assert_eq!(last.load(Ordering::SeqCst), 2_000);
    }

    #[test]
    fn test_millis_round_trip() {
        let now = Utc::now();
        let restored = millis_to_datetime(now.timestamp_millis());
        assert!((now - restored).num_milliseconds().abs() < 1);
    }
}
