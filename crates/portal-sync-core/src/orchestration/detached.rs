use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;

/// Set of fire-and-forget tasks the process can still drain on shutdown.
#[derive(Clone, Default)]
pub struct DetachedTasks {
    set: Arc<Mutex<JoinSet<()>>>,
}

impl DetachedTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(&self, label: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = self.lock();
        reap_finished(&mut set);
        set.spawn(future);
        tracing::trace!(label, in_flight = set.len(), "spawned detached task");
    }

    pub fn in_flight(&self) -> usize {
        let mut set = self.lock();
        reap_finished(&mut set);
        set.len()
    }

    /// Awaits every tracked task, giving up after `grace`. Returns how many
    /// tasks were still running when the grace period ran out; those are
    /// aborted.
    pub async fn drain(&self, grace: Duration) -> usize {
        let deadline = Instant::now() + grace;
        let mut set = std::mem::take(&mut *self.lock());

        while !set.is_empty() {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Err(join_error))) if join_error.is_panic() => {
                    tracing::error!(error = %join_error, "detached task panicked");
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    let remaining = set.len();
                    tracing::warn!(remaining, "detached tasks still running after grace period");
                    set.abort_all();
                    return remaining;
                }
            }
        }
        0
    }

    fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.set.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn reap_finished(set: &mut JoinSet<()>) {
    while let Some(result) = set.try_join_next() {
        if let Err(join_error) = result
            && join_error.is_panic()
        {
            tracing::error!(error = %join_error, "detached task panicked");
        }
    }
}
