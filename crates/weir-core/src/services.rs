//! Supervised repeating loops.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::math::clamped_poisson_interval;

/// Run `workload` forever on a jittered interval until cancelled.
///
/// A failing tick is logged and the loop resumes on its next tick; the loop
/// itself never fails. With `jitter_range = Some(cf)` each sleep is a
/// clamped Poisson draw around `interval` (clamping factor `cf`), so
/// multiple runners polling the same backend de-synchronize.
pub async fn critical_service_loop<W, Fut>(
    workload: W,
    interval: Duration,
    jitter_range: Option<f64>,
    cancel: CancellationToken,
) where
    W: Fn() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        if cancel.is_cancelled() {
            return;
        }

        if let Err(error) = workload().await {
            tracing::warn!(error = %error, "service loop workload failed; retrying on the next tick");
        }

        let sleep_seconds = match jitter_range {
            Some(clamping_factor) => {
                clamped_poisson_interval(interval.as_secs_f64(), clamping_factor)
            }
            None => interval.as_secs_f64(),
        };

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(sleep_seconds)) => {}
            _ = cancel.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn loop_survives_workload_failures() {
        let ticks = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let counter = Arc::clone(&ticks);
        let token = cancel.clone();
        let handle = tokio::spawn(critical_service_loop(
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    let tick = counter.fetch_add(1, Ordering::SeqCst);
                    if tick % 2 == 0 {
                        anyhow::bail!("transient failure on tick {tick}");
                    }
                    Ok(())
                }
            },
            Duration::from_millis(5),
            None,
            token,
        ));

        while ticks.load(Ordering::SeqCst) < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        assert!(ticks.load(Ordering::SeqCst) >= 5);
    }

    #[tokio::test]
    async fn cancelled_loop_stops_promptly() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(critical_service_loop(
            || async { Ok(()) },
            Duration::from_secs(3600),
            Some(0.3),
            token,
        ));

        // Give the first tick a moment, then cancel mid-sleep.
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not stop after cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn pre_cancelled_loop_never_runs_workload() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ran = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&ran);
        critical_service_loop(
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            Duration::from_millis(1),
            None,
            cancel,
        )
        .await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
