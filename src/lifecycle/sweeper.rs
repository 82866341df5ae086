//! Periodic memory-bounding sweep over the defense components.
//!
//! Expiry is always evaluated lazily on lookup, so correctness never depends
//! on this task running.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::security::DefenseStack;

pub fn spawn_sweeper(
    stack: DefenseStack,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        tracing::info!(interval_secs = interval.as_secs(), "Sweeper started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = stack.sweep();
                    let removed = report.rate_limiter
                        + report.abuse_detector
                        + report.incident_identities
                        + report.sessions.sessions_reaped;
                    if removed > 0 {
                        tracing::info!(removed, "Sweeper evicted idle state");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Sweeper stopping");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ShieldConfig;
    use crate::lifecycle::Shutdown;
    use crate::security::InboundRequest;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_and_stops() {
        let clock = Arc::new(ManualClock::new(0));
        let stack = DefenseStack::from_config(&ShieldConfig::default(), clock.clone()).unwrap();
        stack.inspect(&InboundRequest::new("idle", "10.0.0.1", "hello"));
        clock.advance(Duration::from_secs(3 * 60 * 60));

        let shutdown = Shutdown::new();
        let handle = spawn_sweeper(stack.clone(), Duration::from_secs(60), shutdown.subscribe());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(stack.limiter().tracked_identities(), 0);

        shutdown.trigger();
        handle.await.unwrap();
    }
}
