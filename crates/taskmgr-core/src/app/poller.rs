//! TaskPoller - the single timer that drives work in this process.
//!
//! spawn したループが次のどれかを待つ:
//! - poll interval
//! - `attempt_work()` (schedule 直後など)
//! - shutdown
//!
//! work は最後まで実行してから次を待つので tick が重なることはない。
//! 失敗した tick はログに出すだけでタイマーは止めない。

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::domain::Result;
use crate::store::TaskStore;

pub type PollFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// One poll cycle; invoked once per tick.
pub type PollWork = Arc<dyn Fn() -> PollFuture + Send + Sync>;

pub struct TaskPoller {
    store: Arc<TaskStore>,
    poll_interval: Duration,
    work: PollWork,
    wake: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskPoller {
    pub fn new(store: Arc<TaskStore>, poll_interval: Duration, work: PollWork) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            poll_interval,
            work,
            wake: Arc::new(Notify::new()),
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Initialize the store if needed, then start the timer.
    ///
    /// Only the initialization can fail; calling `start` on a running poller
    /// is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        self.store.ensure_initialized().await?;

        let mut slot = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            self.shutdown_tx.send_replace(false);
            *slot = Some(tokio::spawn(poll_loop(
                self.poll_interval,
                Arc::clone(&self.work),
                Arc::clone(&self.wake),
                self.shutdown_tx.subscribe(),
            )));
            info!(poll_interval_ms = self.poll_interval.as_millis() as u64, "task poller started");
        }
        Ok(())
    }

    /// Run a tick now instead of waiting for the timer.
    pub fn attempt_work(&self) {
        self.wake.notify_one();
    }

    /// Stop the timer and wait for the current tick to finish.
    pub async fn stop(&self) {
        // ignore send error: the loop may already be gone
        let _ = self.shutdown_tx.send(true);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(error = %err, "task poller exited abnormally");
            }
            info!("task poller stopped");
        }
    }
}

async fn poll_loop(
    poll_interval: Duration,
    work: PollWork,
    wake: Arc<Notify>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
            _ = wake.notified() => {}
        }

        debug!("polling for available tasks");
        if let Err(err) = work().await {
            error!(error = %err, "task poll failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::runner::tests::harness;
    use crate::domain::TaskManagerError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_work(counter: Arc<AtomicUsize>, fail: bool) -> PollWork {
        Arc::new(move || -> PollFuture {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(TaskManagerError::StoreUnavailable("down".into()))
                } else {
                    Ok(())
                }
            })
        })
    }

    async fn wait_for(counter: &AtomicUsize, at_least: usize) {
        while counter.load(Ordering::SeqCst) < at_least {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn start_initializes_the_store_and_ticks() {
        let h = harness(&["report"]);
        let ticks = Arc::new(AtomicUsize::new(0));
        let poller = TaskPoller::new(
            Arc::clone(&h.store),
            Duration::from_millis(5),
            counting_work(Arc::clone(&ticks), false),
        );

        poller.start().await.unwrap();
        assert!(h.store.is_initialized());

        wait_for(&ticks, 3).await;
        poller.stop().await;
        assert!(!poller.is_running());
    }

    #[tokio::test]
    async fn failing_ticks_keep_the_timer_alive() {
        let h = harness(&["report"]);
        let ticks = Arc::new(AtomicUsize::new(0));
        let poller = TaskPoller::new(
            Arc::clone(&h.store),
            Duration::from_millis(5),
            counting_work(Arc::clone(&ticks), true),
        );

        poller.start().await.unwrap();
        wait_for(&ticks, 3).await;
        poller.stop().await;
    }

    #[tokio::test]
    async fn attempt_work_runs_an_out_of_band_tick() {
        let h = harness(&["report"]);
        let ticks = Arc::new(AtomicUsize::new(0));
        let poller = TaskPoller::new(
            Arc::clone(&h.store),
            Duration::from_secs(3600),
            counting_work(Arc::clone(&ticks), false),
        );

        poller.start().await.unwrap();
        // the interval fires once immediately
        wait_for(&ticks, 1).await;

        poller.attempt_work();
        wait_for(&ticks, 2).await;
        poller.stop().await;
    }

    #[tokio::test]
    async fn start_fails_while_the_store_is_down() {
        let h = harness(&["report"]);
        h.docs.set_unavailable(Some("connection refused")).await;
        let poller = TaskPoller::new(
            Arc::clone(&h.store),
            Duration::from_millis(5),
            counting_work(Arc::new(AtomicUsize::new(0)), false),
        );

        assert!(matches!(
            poller.start().await,
            Err(TaskManagerError::StoreUnavailable(_))
        ));
        assert!(!poller.is_running());
    }
}
