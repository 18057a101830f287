//! Per-shard cooperative scheduler.
//!
//! All work touching a shard's push state (ingest, receive, transfer) is
//! submitted as an action and executed strictly in submission order by one
//! task. That makes the push DAG effectively single-threaded per shard and
//! sets the batching boundary: one action builds and proposes one write
//! batch. The queue is bounded; submitters wait when it fills.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use rill_common::{Error, Result};

/// Actions queued per shard. Each submission may grow by the bounded queue
/// depth before backpressure reaches the submitter.
const ACTION_QUEUE_CAP: usize = 1024;

type Action = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct ShardScheduler {
    shard_id: u64,
    tx: mpsc::Sender<Action>,
}

impl ShardScheduler {
    pub fn new(shard_id: u64) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<Action>(ACTION_QUEUE_CAP);
        tokio::spawn(async move {
            while let Some(action) = rx.recv().await {
                action.await;
            }
        });
        Arc::new(Self { shard_id, tx })
    }

    pub fn shard_id(&self) -> u64 {
        self.shard_id
    }

    /// Run `fut` on the shard's queue and wait for its result.
    pub async fn schedule<R, F>(&self, fut: F) -> Result<R>
    where
        R: Send + 'static,
        F: Future<Output = Result<R>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let action: Action = Box::pin(async move {
            let _ = tx.send(fut.await);
        });
        self.tx
            .send(action)
            .await
            .map_err(|_| Error::Transient("shard scheduler stopped".into()))?;
        rx.await
            .map_err(|_| Error::Transient("shard scheduler stopped".into()))?
    }

    /// Queue `fut` without waiting; failures are logged. Safe to call from
    /// non-async contexts (listener callbacks).
    pub fn schedule_fire_and_forget<F>(&self, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let shard_id = self.shard_id;
        let action: Action = Box::pin(async move {
            if let Err(err) = fut.await {
                tracing::warn!(shard = shard_id, error = %err, "scheduled action failed");
            }
        });
        match self.tx.try_send(action) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(action)) => {
                // Queue is saturated; hand the submission to a task so the
                // caller does not block.
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(action).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(shard = shard_id, "action dropped, scheduler stopped");
            }
        }
    }

    /// Resolves once every action queued before it has completed.
    pub async fn barrier(&self) -> Result<()> {
        self.schedule(async { Ok(()) }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[tokio::test]
    async fn actions_run_in_submission_order() {
        let sched = ShardScheduler::new(16);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20usize {
            let order = order.clone();
            sched.schedule_fire_and_forget(async move {
                // Yield so out-of-order execution would be observable.
                tokio::task::yield_now().await;
                order.lock().unwrap().push(i);
                Ok(())
            });
        }
        sched.barrier().await.unwrap();
        let seen = order.lock().unwrap().clone();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn schedule_returns_action_result() {
        let sched = ShardScheduler::new(17);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let got = sched
            .schedule(async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(41 + 1)
            })
            .await
            .unwrap();
        assert_eq!(got, 42);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn barrier_waits_for_prior_actions() {
        let sched = ShardScheduler::new(18);
        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        sched.schedule_fire_and_forget(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            d.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        sched.barrier().await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
