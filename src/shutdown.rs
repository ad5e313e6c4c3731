//! Process-wide graceful termination (spec §4.11).
//!
//! Hooks register with an integer priority; on termination, hooks are
//! grouped by equal priority, groups execute serially ascending, and
//! members within a group run in parallel. A global deadline bounds the
//! whole pipeline; timed-out groups are logged and the coordinator moves on
//! best-effort rather than hanging the process.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

type HookFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Hook {
    name: String,
    priority: i32,
    run: Box<dyn Fn() -> HookFuture + Send + Sync>,
}

/// Process-scoped shutdown pipeline. Constructed explicitly by whatever
/// assembles the runtime (an Invoker builder, a test harness, `main`); never
/// reached for through hidden global state (spec §9).
pub struct ShutdownCoordinator {
    hooks: Mutex<Vec<Hook>>,
    shutting_down: Arc<AtomicBool>,
    deadline: Duration,
}

impl ShutdownCoordinator {
    pub fn new(deadline: Duration) -> Self {
        Self {
            hooks: Mutex::new(Vec::new()),
            shutting_down: Arc::new(AtomicBool::new(false)),
            deadline,
        }
    }

    /// Readable by any component so new work can be refused once shutdown
    /// has begun (spec §4.11).
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutting_down)
    }

    /// Register a hook. Lower `priority` runs earlier.
    pub fn register<F, Fut>(&self, name: impl Into<String>, priority: i32, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hooks.lock().push(Hook {
            name: name.into(),
            priority,
            run: Box::new(move || Box::pin(hook())),
        });
    }

    /// Run the shutdown pipeline to completion (or deadline). Idempotent:
    /// a second call returns immediately since `shutting_down` is already set
    /// and the hook list has already been drained by `std::mem::take`.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut hooks = std::mem::take(&mut *self.hooks.lock());
        hooks.sort_by_key(|h| h.priority);

        let overall_deadline = tokio::time::Instant::now() + self.deadline;

        let mut idx = 0;
        while idx < hooks.len() {
            let current_priority = hooks[idx].priority;
            let mut group = Vec::new();
            while idx < hooks.len() && hooks[idx].priority == current_priority {
                group.push(hooks.remove(idx));
            }

            let names: Vec<String> = group.iter().map(|h| h.name.clone()).collect();
            tracing::info!(priority = current_priority, hooks = ?names, "running shutdown group");

            let remaining = overall_deadline.saturating_duration_since(tokio::time::Instant::now());
            let futures = group.iter().map(|h| (h.run)());
            let joined = futures::future::join_all(futures);

            match tokio::time::timeout(remaining, joined).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!(priority = current_priority, hooks = ?names, "shutdown group timed out, proceeding best-effort");
                }
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    #[tokio::test]
    async fn lower_priority_groups_complete_before_higher_ones_start() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let order = Arc::new(Mutex::new(Vec::<i32>::new()));

        for priority in [2, 2, 0, 1] {
            let order = Arc::clone(&order);
            coordinator.register(format!("hook-{priority}"), priority, move || {
                let order = Arc::clone(&order);
                async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    order.lock().push(priority);
                }
            });
        }

        coordinator.shutdown().await;
        let recorded = order.lock().clone();

        let pos0 = recorded.iter().position(|&p| p == 0).unwrap();
        let pos1 = recorded.iter().position(|&p| p == 1).unwrap();
        let pos2_first = recorded.iter().position(|&p| p == 2).unwrap();
        assert!(pos0 < pos1);
        assert!(pos1 < pos2_first);
    }

    #[tokio::test]
    async fn second_shutdown_call_is_a_noop() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        coordinator.register("once", 0, move || {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });

        coordinator.shutdown().await;
        coordinator.shutdown().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deadline_is_enforced_best_effort() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(20));
        coordinator.register("slow", 0, || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let start = Instant::now();
        coordinator.shutdown().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
