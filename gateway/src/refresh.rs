use std::{
    collections::VecDeque,
    future::Future,
    sync::{Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Why a refresh cycle ended without a new access token.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct RefreshFailure {
    pub reason: String,
}

impl RefreshFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

pub type RefreshOutcome = Result<String, RefreshFailure>;

#[derive(Default)]
struct CycleState {
    refreshing: bool,
    waiters: VecDeque<oneshot::Sender<RefreshOutcome>>,
    cycles: u64,
}

/// Makes sure at most one token refresh is outstanding.
///
/// The first caller of [`RefreshCoordinator::run`] while idle leads the cycle and runs
/// the refresh. Callers arriving while it is pending queue up and get the leader's
/// outcome, in arrival order, without calling the backend themselves. Waiters are
/// always drained before the coordinator goes back to idle.
#[derive(Default)]
pub struct RefreshCoordinator {
    state: Mutex<CycleState>,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_refreshing(&self) -> bool {
        self.lock().refreshing
    }

    pub fn waiter_count(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Number of cycles started so far, i.e. refresh calls actually made.
    pub fn cycle_count(&self) -> u64 {
        self.lock().cycles
    }

    pub async fn run<F, Fut>(&self, refresh: F) -> RefreshOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RefreshOutcome>,
    {
        let waiter = {
            let mut state = self.lock();
            if state.refreshing {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                debug!(position = state.waiters.len(), "waiting on in-flight refresh");
                Some(rx)
            } else {
                state.refreshing = true;
                state.cycles += 1;
                None
            }
        };

        if let Some(rx) = waiter {
            return rx
                .await
                .unwrap_or_else(|_| Err(RefreshFailure::new("refresh cycle was abandoned")));
        }

        let guard = CycleGuard {
            coordinator: self,
            settled: false,
        };
        let outcome = refresh().await;
        guard.settle(outcome.clone());
        outcome
    }

    fn finish(&self, outcome: RefreshOutcome) {
        let waiters = {
            let mut state = self.lock();
            state.refreshing = false;
            std::mem::take(&mut state.waiters)
        };

        debug!(
            waiters = waiters.len(),
            success = outcome.is_ok(),
            "refresh cycle settled"
        );
        for waiter in waiters {
            // A waiter whose caller went away is fine to skip.
            let _ = waiter.send(outcome.clone());
        }
    }

    fn lock(&self) -> MutexGuard<'_, CycleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held by the leader for the length of the refresh call. If the leader's future is
/// dropped before the refresh settles, the waiters are failed and the cycle reset.
struct CycleGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl CycleGuard<'_> {
    fn settle(mut self, outcome: RefreshOutcome) {
        self.settled = true;
        self.coordinator.finish(outcome);
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!("refresh leader dropped mid-cycle, failing waiters");
            self.coordinator
                .finish(Err(RefreshFailure::new("refresh cycle was abandoned")));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use tokio::sync::Notify;

    use super::*;

    async fn wait_until(condition: impl Fn() -> bool) {
        while !condition() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_single_caller_runs_refresh() {
        let coordinator = RefreshCoordinator::new();

        let outcome = coordinator.run(|| async { Ok("new".to_string()) }).await;

        assert_eq!(outcome, Ok("new".to_string()));
        assert!(!coordinator.is_refreshing());
        assert_eq!(coordinator.cycle_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let coordinator = Arc::new(RefreshCoordinator::new());
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            let task_coordinator = coordinator.clone();
            let gate = gate.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                task_coordinator
                    .run(|| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Ok(format!("token-from-{i}"))
                    })
                    .await
            }));
            if i == 0 {
                let coordinator = coordinator.clone();
                wait_until(move || coordinator.is_refreshing()).await;
            }
        }

        let watched = coordinator.clone();
        wait_until(move || watched.waiter_count() == 3).await;
        gate.notify_one();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok("token-from-0".to_string()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.cycle_count(), 1);
        assert!(!coordinator.is_refreshing());
        assert_eq!(coordinator.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_waiters_resolve_in_arrival_order() {
        let coordinator = Arc::new(RefreshCoordinator::new());
        let gate = Arc::new(Notify::new());
        let resolved = Arc::new(Mutex::new(Vec::new()));

        let leader = {
            let coordinator = coordinator.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                coordinator
                    .run(|| async move {
                        gate.notified().await;
                        Ok("fresh".to_string())
                    })
                    .await
            })
        };
        let watched = coordinator.clone();
        wait_until(move || watched.is_refreshing()).await;

        let mut waiters = Vec::new();
        for i in 0..5 {
            let task_coordinator = coordinator.clone();
            let resolved = resolved.clone();
            waiters.push(tokio::spawn(async move {
                let outcome = task_coordinator
                    .run(|| async { Ok("waiters never refresh".to_string()) })
                    .await;
                resolved.lock().unwrap().push(i);
                outcome
            }));
            let watched = coordinator.clone();
            wait_until(move || watched.waiter_count() == i + 1).await;
        }

        gate.notify_one();
        assert_eq!(leader.await.unwrap(), Ok("fresh".to_string()));
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Ok("fresh".to_string()));
        }

        assert_eq!(*resolved.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_failure_reaches_every_waiter() {
        let coordinator = Arc::new(RefreshCoordinator::new());
        let gate = Arc::new(Notify::new());

        let leader = {
            let coordinator = coordinator.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                coordinator
                    .run(|| async move {
                        gate.notified().await;
                        Err(RefreshFailure::new("refresh token revoked"))
                    })
                    .await
            })
        };
        let watched = coordinator.clone();
        wait_until(move || watched.is_refreshing()).await;

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .run(|| async { Ok("waiters never refresh".to_string()) })
                    .await
            })
        };
        let watched = coordinator.clone();
        wait_until(move || watched.waiter_count() == 1).await;
        gate.notify_one();

        let failure = Err(RefreshFailure::new("refresh token revoked"));
        assert_eq!(leader.await.unwrap(), failure);
        assert_eq!(waiter.await.unwrap(), failure);
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_dropped_leader_fails_waiters_and_resets() {
        let coordinator = Arc::new(RefreshCoordinator::new());

        let leader = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .run(|| std::future::pending::<RefreshOutcome>())
                    .await
            })
        };
        let watched = coordinator.clone();
        wait_until(move || watched.is_refreshing()).await;

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run(|| async { Ok("unused".to_string()) }).await })
        };
        let watched = coordinator.clone();
        wait_until(move || watched.waiter_count() == 1).await;

        leader.abort();
        assert!(leader.await.unwrap_err().is_cancelled());

        assert!(waiter.await.unwrap().is_err());
        assert!(!coordinator.is_refreshing());

        let outcome = coordinator.run(|| async { Ok("next".to_string()) }).await;
        assert_eq!(outcome, Ok("next".to_string()));
        assert_eq!(coordinator.cycle_count(), 2);
    }
}
