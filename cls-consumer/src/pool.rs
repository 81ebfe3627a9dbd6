// Copyright ⓒ 2025 Peter Morgan <peter.james.morgan@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::sync::Arc;

use tokio::{sync::Semaphore, task::JoinHandle};
use tokio_util::task::TaskTracker;
use tracing::{Instrument as _, debug};

use crate::{Error, Result};

/// Bounded pool of partition work.
///
/// At most `size` submitted futures run at once, the rest wait for a permit.
/// Clones share the same bound, so one pool may serve several coordinators.
#[derive(Clone, Debug)]
pub struct ExecutionPool {
    size: usize,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl ExecutionPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);

        Self {
            size,
            permits: Arc::new(Semaphore::new(size)),
            tracker: TaskTracker::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// submit work to the pool without waiting for it to run
    pub fn spawn<F, T>(&self, future: F) -> JoinHandle<Result<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let permits = self.permits.clone();

        self.tracker.spawn(
            async move {
                let _permit = permits.acquire_owned().await.map_err(|_| Error::PoolClosed)?;
                future.await
            }
            .in_current_span(),
        )
    }

    /// reject queued work and wait for running work to complete
    pub async fn close(&self) {
        debug!(size = self.size, tasks = self.tracker.len());

        self.permits.close();
        _ = self.tracker.close();
        self.tracker.wait().await
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn bounded_concurrency() -> Result<()> {
        let pool = ExecutionPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles = (0..6)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();

                pool.spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    _ = peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(100)).await;
                    _ = running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.await??;
        }

        assert_eq!(2, peak.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn close_waits_for_running_work() -> Result<()> {
        let pool = ExecutionPool::new(1);
        let completed = Arc::new(AtomicUsize::new(0));

        let running = {
            let completed = completed.clone();
            pool.spawn(async move {
                sleep(Duration::from_secs(1)).await;
                _ = completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };

        tokio::task::yield_now().await;
        pool.close().await;

        assert!(pool.is_closed());
        assert_eq!(1, completed.load(Ordering::SeqCst));
        running.await??;

        Ok(())
    }

    #[tokio::test]
    async fn closed_pool_rejects_work() -> Result<()> {
        let pool = ExecutionPool::new(1);
        pool.close().await;

        assert!(matches!(
            pool.spawn(async { Ok(()) }).await?,
            Err(Error::PoolClosed)
        ));

        Ok(())
    }

    #[test]
    fn size_is_at_least_one() {
        assert_eq!(1, ExecutionPool::new(0).size());
    }
}
