// src/scheduler.rs
//
// =============================================================================
// RAILYARD: MASTER BACKGROUND LOOPS
// =============================================================================
//
// Three small, independently cancellable loops, each owning exactly one
// concern against the job store: reclaiming stale nodes, sweeping expired
// terminal jobs, and promoting pending jobs onto their queue. Each takes a
// `CancellationToken` constructed in `main` rather than reading an
// ambient shutdown flag, so the binary can `.await` every loop finishing
// before it exits.

use crate::store::JobStore;
use chrono::{Duration as ChronoDuration, NaiveTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub reclaim_interval: Duration,
    pub stale_threshold: ChronoDuration,
    /// Wall-clock time of day the retention sweep fires at (default 00:00
    /// UTC), not a bare interval — a process that starts at 23:55 and a
    /// process that starts at 00:05 should still both sweep at midnight.
    pub sweep_at: NaiveTime,
    pub retention: ChronoDuration,
    pub promote_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reclaim_interval: Duration::from_secs(30),
            stale_threshold: ChronoDuration::seconds(90),
            sweep_at: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            retention: ChronoDuration::days(7),
            promote_interval: Duration::from_secs(5),
        }
    }
}

/// Spawns the three background loops and returns their join handles so the
/// caller can await them at shutdown.
pub fn spawn_background_loops(
    store: Arc<JobStore>,
    config: SchedulerConfig,
    cancel: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    vec![
        tokio::spawn(reclaim_loop(store.clone(), config.clone(), cancel.clone())),
        tokio::spawn(sweep_loop(store.clone(), config.clone(), cancel.clone())),
        tokio::spawn(promote_loop(store, config, cancel)),
    ]
}

async fn reclaim_loop(store: Arc<JobStore>, config: SchedulerConfig, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(config.reclaim_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("reclaim loop shutting down");
                return;
            }
            _ = ticker.tick() => {
                match store.reclaim_stale_nodes(config.stale_threshold) {
                    Ok(0) => {}
                    Ok(n) => log::info!("reclaimed {n} stale node(s)"),
                    Err(e) => log::warn!("reclaim pass failed: {e}"),
                }
            }
        }
    }
}

async fn sweep_loop(store: Arc<JobStore>, config: SchedulerConfig, cancel: CancellationToken) {
    // First sweep runs 5 minutes after startup rather than waiting for the
    // next wall-clock target, so a freshly started master doesn't carry a
    // week of terminal jobs before its first cleanup.
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(Duration::from_secs(5 * 60)) => {}
    }

    let mut tick_count: u64 = 0;

    loop {
        match store.sweep_terminal_jobs(config.retention) {
            Ok(n) => log::info!("swept {n} expired job(s)"),
            Err(e) => log::warn!("sweep pass failed: {e}"),
        }

        tick_count += 1;
        if tick_count % 7 == 0 {
            if let Err(e) = store.vacuum() {
                log::warn!("weekly vacuum failed: {e}");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("sweep loop shutting down");
                return;
            }
            _ = tokio::time::sleep(duration_until(config.sweep_at)) => {}
        }
    }
}

/// Duration from now until the next occurrence of `target` wall-clock time,
/// today if it hasn't passed yet, otherwise tomorrow.
fn duration_until(target: NaiveTime) -> Duration {
    let now = Utc::now();
    let today_target = now.date_naive().and_time(target).and_utc();
    let next = if today_target > now { today_target } else { today_target + ChronoDuration::days(1) };
    (next - now).to_std().unwrap_or(Duration::from_secs(60))
}

async fn promote_loop(store: Arc<JobStore>, config: SchedulerConfig, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(config.promote_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("promote loop shutting down");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = promote_pending(&store) {
                    log::warn!("promote pass failed: {e}");
                }
            }
        }
    }
}

fn promote_pending(store: &JobStore) -> Result<(), crate::error::StoreError> {
    let pending = store.list_jobs(Some(crate::core::JobStatus::Pending), 256)?;
    for job in pending {
        store.enqueue(job.id)?;
    }
    Ok(())
}
