//! Background maintenance.
//!
//! Every minute: prune expired sticky bindings, clear elapsed temporary
//! unschedulable deadlines, and flush the batched last-used queue.

use std::time::Duration;

use chrono::Utc;

use crate::state::AppState;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub fn spawn(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("watchdog: started (interval={}s)", SWEEP_INTERVAL.as_secs());

        loop {
            tokio::time::sleep(SWEEP_INTERVAL).await;

            state.cache.prune_expired().await;

            match state.accounts.clear_expired_unschedulable(Utc::now()).await {
                Ok(0) => {}
                Ok(cleared) => {
                    tracing::info!(cleared, "watchdog: cleared expired unschedulable deadlines")
                }
                Err(e) => tracing::warn!(error = %e, "watchdog: unschedulable sweep failed"),
            }

            state.touch.flush(&state.accounts).await;
        }
    })
}
