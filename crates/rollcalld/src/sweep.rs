//! Background sweep for session timeouts.
//!
//! Sessions abandoned in Active (a teacher closes the laptop mid-class)
//! must not accumulate forever; a periodic scan ends them with the exact
//! same semantics as an explicit `end`.

use crate::sessions::SessionManager;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub fn spawn_sweep(
    manager: Arc<SessionManager>,
    max_session_secs: u64,
    sweep_interval_secs: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(sweep_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let cutoff = Utc::now() - ChronoDuration::seconds(max_session_secs as i64);
            for id in manager.sessions_active_since(cutoff).await {
                tracing::info!(session = %id, "auto-ending session past maximum duration");
                match manager.end_session(id).await {
                    Ok(summary) => tracing::info!(
                        session = %id,
                        present = summary.present,
                        absent = summary.absent,
                        "session auto-ended"
                    ),
                    // A concurrent explicit end can win the race; that is fine.
                    Err(err) => tracing::warn!(session = %id, error = %err, "auto-end failed"),
                }
            }
        }
    })
}
