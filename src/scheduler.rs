use eyre::{Context, Result};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A job run on a fixed period until stopped. A slow run delays the next
/// tick instead of overlapping it.
pub struct RepeatingTask {
    handle: Option<JoinHandle<()>>,
    cancel_token: CancellationToken,
}

impl RepeatingTask {
    pub fn start<F, Fut>(period: Duration, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => job().await,
                    _ = token.cancelled() => {
                        debug!("repeating task cancelled");
                        break;
                    }
                }
            }
        });

        Self {
            handle: Some(handle),
            cancel_token,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancel and wait for an in-flight run to finish.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel_token.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await.wrap_err("repeating task failed to join")?;
        }
        Ok(())
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn runs_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let mut task = RepeatingTask::start(Duration::from_millis(1000), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(task.is_running());
        task.stop().await.unwrap();
        assert!(!task.is_running());

        let ran = count.load(Ordering::SeqCst);
        // Ticks at 0, 1000, 2000 and 3000 ms.
        assert!((3..=4).contains(&ran), "ran {ran} times");

        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(count.load(Ordering::SeqCst), ran);
    }
}
