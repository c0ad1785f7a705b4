//! Bounded-concurrency task queue for second-tier fetches.
//!
//! Some records need a follow-up request (contract line items, for example).
//! Those jobs are keyed by record id: enqueueing an id that is already pending
//! is a no-op, and at most `limit` jobs run at once.

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, warn};

type Job = (i64, BoxFuture<'static, ()>);

struct Pending {
  ids: Mutex<HashSet<i64>>,
  drained: Notify,
}

impl Pending {
  fn ids(&self) -> MutexGuard<'_, HashSet<i64>> {
    self.ids.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn finish(&self, id: i64) {
    let mut ids = self.ids();
    ids.remove(&id);
    if ids.is_empty() {
      self.drained.notify_waiters();
    }
  }
}

/// Queue of follow-up fetches keyed by record id.
pub struct SecondaryQueue {
  name: String,
  pending: Arc<Pending>,
  tx: mpsc::UnboundedSender<Job>,
}

impl SecondaryQueue {
  /// Create the queue and spawn its worker on the current runtime.
  pub fn spawn(name: impl Into<String>, limit: usize) -> Self {
    let name = name.into();
    let (tx, rx) = mpsc::unbounded_channel::<Job>();
    let pending = Arc::new(Pending {
      ids: Mutex::new(HashSet::new()),
      drained: Notify::new(),
    });

    let worker_pending = pending.clone();
    let worker_name = name.clone();
    tokio::spawn(async move {
      futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|job| (job, rx)) })
        .map(|(id, job)| {
          let pending = worker_pending.clone();
          let name = worker_name.clone();
          async move {
            // A panicking job must still leave the pending set.
            if AssertUnwindSafe(job).catch_unwind().await.is_err() {
              error!(queue = %name, id, "Secondary job panicked");
            }
            pending.finish(id);
          }
        })
        .buffer_unordered(limit.max(1))
        .for_each(|_| async {})
        .boxed()
        .await;
      debug!(queue = %worker_name, "Secondary queue worker stopped");
    });

    Self { name, pending, tx }
  }

  /// Queue a job for `id`. Returns `false` if one is already pending.
  pub fn enqueue<F>(&self, id: i64, job: F) -> bool
  where
    F: Future<Output = ()> + Send + 'static,
  {
    if !self.pending.ids().insert(id) {
      return false;
    }

    if self.tx.send((id, Box::pin(job))).is_err() {
      warn!(queue = %self.name, id, "Secondary queue is closed, dropping job");
      self.pending.finish(id);
      return false;
    }
    true
  }

  pub fn is_pending(&self, id: i64) -> bool {
    self.pending.ids().contains(&id)
  }

  pub fn pending_len(&self) -> usize {
    self.pending.ids().len()
  }

  /// Wait until every queued job has finished.
  pub async fn idle(&self) {
    loop {
      let drained = self.pending.drained.notified();
      if self.pending.ids().is_empty() {
        return;
      }
      drained.await;
    }
  }
}
