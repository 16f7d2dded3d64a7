//! Per-session progress monitoring.
//!
//! Each active session runs one monitor loop that samples the task once per
//! tick, folds the observation into the session record, publishes a snapshot,
//! and watches for two anomalies the engine will not report on its own:
//!
//! * **Hangs**: a transfer that sits at or above the hang threshold with no
//!   forward progress for the grace period (or that lingers above the
//!   threshold past the hard deadline) is forcibly completed. Some swarms
//!   never deliver the last pieces of a padded payload, and the audio files
//!   are complete long before the torrent is.
//! * **Network loss**: zero speed and zero peers below the threshold for the
//!   configured window signals a network error to the supervisor, throttled
//!   to one signal per window.
//!
//! The loop exits when the session reaches a terminal state, disappears from
//! the table, or the task fails fatally.

use std::sync::Arc;

use audiotome_events::SessionStatus;
use audiotome_torrent::{TaskEvent, TorrentTask};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::error::DownloadError;
use crate::orchestrator::{MonitorSignal, Shared};

/// Outcome of one monitor tick's anomaly assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickVerdict {
    /// Nothing notable; keep monitoring.
    Continue,
    /// The transfer is done; `forced` marks hang-forced completion.
    Complete {
        /// Whether completion was forced by hang detection.
        forced: bool,
    },
    /// Prolonged zero-speed, zero-peer state; signal a network error.
    NetworkLoss,
}

/// Pure anomaly-detection state for one session.
///
/// Separated from the loop so the thresholds can be tested against a
/// controlled clock.
pub(crate) struct TickTracker {
    last_percent: f64,
    last_progress_at: Instant,
    stalled_since: Option<Instant>,
    hang_window_started: Option<Instant>,
    last_anomaly_at: Option<Instant>,
    paused: bool,
}

impl TickTracker {
    pub(crate) const fn new(now: Instant) -> Self {
        Self {
            last_percent: 0.0,
            last_progress_at: now,
            stalled_since: None,
            hang_window_started: None,
            last_anomaly_at: None,
            paused: false,
        }
    }

    /// Record a paused tick; the idle and hang clocks restart on resume so
    /// time spent paused never counts toward an anomaly.
    pub(crate) fn note_paused(&mut self) {
        self.paused = true;
    }

    /// Assess one successful snapshot read.
    pub(crate) fn assess(
        &mut self,
        now: Instant,
        percent: f64,
        speed_bps: u64,
        peer_count: u64,
        config: &MonitorConfig,
    ) -> TickVerdict {
        if self.paused {
            self.paused = false;
            self.last_progress_at = now;
            self.stalled_since = None;
            self.hang_window_started = None;
        }
        if percent >= 100.0 {
            return TickVerdict::Complete { forced: false };
        }

        let progressed = percent > self.last_percent;
        if progressed {
            self.last_progress_at = now;
        }
        self.last_percent = self.last_percent.max(percent);

        if percent >= config.hang_progress_pct {
            if self.hang_window_started.is_none() {
                self.hang_window_started = Some(now);
            }
            if speed_bps == 0 || !progressed {
                let since = *self.stalled_since.get_or_insert(now);
                if now.duration_since(since) >= config.hang_grace {
                    return TickVerdict::Complete { forced: true };
                }
            } else {
                self.stalled_since = None;
            }
            if let Some(window) = self.hang_window_started
                && now.duration_since(window) >= config.hang_deadline
            {
                return TickVerdict::Complete { forced: true };
            }
        } else if speed_bps == 0
            && peer_count == 0
            && now.duration_since(self.last_progress_at) >= config.network_loss_window
            && self.anomaly_due(now, config)
        {
            self.last_anomaly_at = Some(now);
            return TickVerdict::NetworkLoss;
        }

        TickVerdict::Continue
    }

    /// Throttle check for snapshot read failures: at most one network-error
    /// signal per network-loss window.
    pub(crate) fn network_error_due(&mut self, now: Instant, config: &MonitorConfig) -> bool {
        if self.anomaly_due(now, config) {
            self.last_anomaly_at = Some(now);
            true
        } else {
            false
        }
    }

    fn anomaly_due(&self, now: Instant, config: &MonitorConfig) -> bool {
        self.last_anomaly_at
            .is_none_or(|at| now.duration_since(at) >= config.network_loss_window)
    }
}

enum TickFlow {
    Continue,
    Stop,
}

/// Run the monitor loop for one session until it terminates.
pub(crate) async fn run(shared: Arc<Shared>, session_id: Uuid, task: Arc<dyn TorrentTask>) {
    let config = shared.config().monitor.clone();
    let mut interval = tokio::time::interval(config.tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut events = task.events();
    let mut events_open = true;
    let mut tracker = TickTracker::new(Instant::now());
    let mut last_persist = Instant::now();

    debug!(%session_id, "progress monitor started");
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let flow = tick(
                    &shared,
                    session_id,
                    task.as_ref(),
                    &mut tracker,
                    &config,
                    &mut last_persist,
                )
                .await;
                if matches!(flow, TickFlow::Stop) {
                    break;
                }
            }
            event = events.recv(), if events_open => match event {
                Ok(TaskEvent::AllComplete) => {
                    complete(&shared, session_id, false).await;
                    break;
                }
                Ok(TaskEvent::Started) => {
                    debug!(%session_id, "task reported started");
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(%session_id, skipped, "monitor lagged on task events");
                }
                Err(RecvError::Closed) => {
                    events_open = false;
                }
            },
        }
    }
    debug!(%session_id, "progress monitor stopped");
}

async fn tick(
    shared: &Arc<Shared>,
    session_id: Uuid,
    task: &dyn TorrentTask,
    tracker: &mut TickTracker,
    config: &MonitorConfig,
    last_persist: &mut Instant,
) -> TickFlow {
    let now = Instant::now();
    let Some(status) = shared.session_status(session_id) else {
        return TickFlow::Stop;
    };
    if status.is_terminal() {
        return TickFlow::Stop;
    }
    if status == SessionStatus::Paused {
        tracker.note_paused();
        if let Some(snapshot) = shared.update_session(session_id, |session| {
            session.download_speed_bps = 0;
            session.upload_speed_bps = 0;
        }) {
            shared.publish(snapshot);
        }
        return TickFlow::Continue;
    }

    match task.snapshot() {
        Err(err) => {
            let cause = err.message().to_owned();
            let error = if err.is_network() {
                DownloadError::NetworkError {
                    message: cause.clone(),
                }
            } else {
                DownloadError::task_operation("snapshot", err.into())
            };
            if error.is_retryable() {
                if tracker.network_error_due(now, config) {
                    warn!(%session_id, %cause, "task state read failed; signalling network error");
                    shared.send_signal(MonitorSignal::NetworkError { session_id, cause });
                }
                TickFlow::Continue
            } else {
                error!(%session_id, %cause, "task state read failed fatally");
                shared.send_signal(MonitorSignal::Fatal {
                    session_id,
                    message: cause,
                });
                TickFlow::Stop
            }
        }
        Ok(observed) => {
            let verdict = tracker.assess(
                now,
                observed.percent_complete(),
                observed.download_speed_bps,
                observed.peer_count,
                config,
            );
            let snapshot = shared.update_session(session_id, |session| {
                session.record_progress(&observed);
                if observed.download_speed_bps > 0 {
                    session.reset_retry_state();
                }
            });

            match verdict {
                TickVerdict::Complete { forced } => {
                    complete(shared, session_id, forced).await;
                    return TickFlow::Stop;
                }
                TickVerdict::NetworkLoss => {
                    warn!(%session_id, "no transfer activity; signalling network loss");
                    shared.send_signal(MonitorSignal::NetworkError {
                        session_id,
                        cause: "network connection lost".to_owned(),
                    });
                }
                TickVerdict::Continue => {}
            }

            if let Some(snapshot) = snapshot {
                shared.notify_progress(&snapshot).await;
                shared.publish(snapshot);
            }
            if now.duration_since(*last_persist) >= shared.config().persist_interval {
                *last_persist = now;
                shared.persist_session(session_id).await;
            }
            TickFlow::Continue
        }
    }
}

async fn complete(shared: &Arc<Shared>, session_id: Uuid, forced: bool) {
    if forced {
        info!(%session_id, "forcing completion of stalled near-complete transfer");
    } else {
        info!(%session_id, "transfer complete");
    }
    if let Some(snapshot) = shared.update_session(session_id, crate::model::Session::mark_completed)
    {
        shared.publish(snapshot);
    }
    shared.persist_session(session_id).await;
    shared.send_signal(MonitorSignal::Completed { session_id });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::advance;

    fn config() -> MonitorConfig {
        MonitorConfig::default()
    }

    #[tokio::test(start_paused = true)]
    async fn full_progress_completes_naturally() {
        let mut tracker = TickTracker::new(Instant::now());
        let verdict = tracker.assess(Instant::now(), 100.0, 0, 0, &config());
        assert_eq!(verdict, TickVerdict::Complete { forced: false });
    }

    #[tokio::test(start_paused = true)]
    async fn stall_above_threshold_forces_completion_after_grace() {
        let config = config();
        let mut tracker = TickTracker::new(Instant::now());
        for second in 0..20 {
            let verdict = tracker.assess(Instant::now(), 99.2, 0, 3, &config);
            assert_eq!(verdict, TickVerdict::Continue, "tick {second}");
            advance(Duration::from_secs(1)).await;
        }
        let verdict = tracker.assess(Instant::now(), 99.2, 0, 3, &config);
        assert_eq!(verdict, TickVerdict::Complete { forced: true });
    }

    #[tokio::test(start_paused = true)]
    async fn progress_above_threshold_restarts_the_grace_clock() {
        let config = config();
        let mut tracker = TickTracker::new(Instant::now());
        let mut percent = 99.0;
        // Alternate 15s stalls with one progressing tick; the grace period
        // never elapses even though the transfer crawls.
        for _ in 0..4 {
            for _ in 0..15 {
                let verdict = tracker.assess(Instant::now(), percent, 0, 3, &config);
                assert_eq!(verdict, TickVerdict::Continue);
                advance(Duration::from_secs(1)).await;
            }
            percent += 0.1;
            let verdict = tracker.assess(Instant::now(), percent, 200, 3, &config);
            assert_eq!(verdict, TickVerdict::Continue);
            advance(Duration::from_secs(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hang_deadline_fires_even_with_trickling_progress() {
        let config = config();
        let mut tracker = TickTracker::new(Instant::now());
        let mut percent: f64 = 99.0;
        let mut forced = false;
        for _ in 0..181 {
            percent = (percent + 0.001).min(99.9);
            let verdict = tracker.assess(Instant::now(), percent, 100, 3, &config);
            if verdict == (TickVerdict::Complete { forced: true }) {
                forced = true;
                break;
            }
            assert_eq!(verdict, TickVerdict::Continue);
            advance(Duration::from_secs(1)).await;
        }
        assert!(forced, "deadline should force completion");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_transfer_below_threshold_signals_network_loss_once_per_window() {
        let config = config();
        let mut tracker = TickTracker::new(Instant::now());
        let mut signals = 0;
        for _ in 0..260 {
            let verdict = tracker.assess(Instant::now(), 40.0, 0, 0, &config);
            if verdict == TickVerdict::NetworkLoss {
                signals += 1;
            } else {
                assert_eq!(verdict, TickVerdict::Continue);
            }
            advance(Duration::from_secs(1)).await;
        }
        assert_eq!(signals, 2, "one signal per 120s window over 260s");
    }

    #[tokio::test(start_paused = true)]
    async fn connected_idle_transfer_is_not_network_loss() {
        let config = config();
        let mut tracker = TickTracker::new(Instant::now());
        for _ in 0..200 {
            let verdict = tracker.assess(Instant::now(), 40.0, 0, 5, &config);
            assert_eq!(verdict, TickVerdict::Continue);
            advance(Duration::from_secs(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn progress_resets_the_network_loss_window() {
        let config = config();
        let mut tracker = TickTracker::new(Instant::now());
        for _ in 0..100 {
            assert_eq!(
                tracker.assess(Instant::now(), 40.0, 0, 0, &config),
                TickVerdict::Continue
            );
            advance(Duration::from_secs(1)).await;
        }
        // Forward progress restarts the idle clock.
        assert_eq!(
            tracker.assess(Instant::now(), 41.0, 512, 2, &config),
            TickVerdict::Continue
        );
        advance(Duration::from_secs(1)).await;
        for _ in 0..119 {
            assert_eq!(
                tracker.assess(Instant::now(), 41.0, 0, 0, &config),
                TickVerdict::Continue
            );
            advance(Duration::from_secs(1)).await;
        }
        assert_eq!(
            tracker.assess(Instant::now(), 41.0, 0, 0, &config),
            TickVerdict::NetworkLoss
        );
    }

    #[tokio::test(start_paused = true)]
    async fn paused_time_does_not_count_toward_network_loss() {
        let config = config();
        let mut tracker = TickTracker::new(Instant::now());
        for _ in 0..100 {
            assert_eq!(
                tracker.assess(Instant::now(), 40.0, 0, 0, &config),
                TickVerdict::Continue
            );
            advance(Duration::from_secs(1)).await;
        }
        // A long pause restarts the idle clock at the next assessed tick.
        tracker.note_paused();
        advance(Duration::from_secs(600)).await;
        for _ in 0..120 {
            assert_eq!(
                tracker.assess(Instant::now(), 40.0, 0, 0, &config),
                TickVerdict::Continue
            );
            advance(Duration::from_secs(1)).await;
        }
        assert_eq!(
            tracker.assess(Instant::now(), 40.0, 0, 0, &config),
            TickVerdict::NetworkLoss
        );
    }

    #[tokio::test(start_paused = true)]
    async fn read_failures_are_throttled() {
        let config = config();
        let mut tracker = TickTracker::new(Instant::now());
        assert!(tracker.network_error_due(Instant::now(), &config));
        for _ in 0..119 {
            advance(Duration::from_secs(1)).await;
            assert!(!tracker.network_error_due(Instant::now(), &config));
        }
        advance(Duration::from_secs(1)).await;
        assert!(tracker.network_error_due(Instant::now(), &config));
    }
}
