//! Cleanup registry for unwinding partially completed work.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), String>> + Send>;

/// A cleanup step that failed or timed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    /// Name the step was registered under.
    pub name: String,
    /// What went wrong.
    pub error: String,
}

/// Registry for async cleanup steps executed in LIFO order.
///
/// Steps registered while starting units are run in reverse on failure, so
/// the last thing started is the first thing stopped.
#[derive(Default)]
pub struct CleanupRegistry {
    steps: Mutex<Vec<(String, CleanupFn)>>,
}

impl CleanupRegistry {
    /// Creates a new cleanup registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a cleanup step.
    pub fn register<F, Fut>(&self, name: impl Into<String>, step: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let boxed: CleanupFn = Box::new(move || Box::pin(step()));
        self.steps.lock().push((name.into(), boxed));
    }

    /// Runs every step in LIFO order and clears the registry.
    ///
    /// Each step gets an equal share of `timeout`. Failures are collected but
    /// don't stop later steps from running.
    pub async fn run_all(&self, timeout: Duration) -> Vec<CleanupFailure> {
        let steps = std::mem::take(&mut *self.steps.lock());
        if steps.is_empty() {
            return Vec::new();
        }

        let count = u32::try_from(steps.len()).unwrap_or(u32::MAX);
        let per_step = (timeout / count).max(Duration::from_millis(10));
        let mut failures = Vec::new();

        for (name, step) in steps.into_iter().rev() {
            let error = match tokio::time::timeout(per_step, step()).await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(_) => format!("timed out after {per_step:?}"),
            };
            warn!(step = %name, error = %error, "Cleanup step failed");
            failures.push(CleanupFailure { name, error });
        }

        failures
    }

    /// Drops every registered step without running it.
    pub fn disarm(&self) {
        self.steps.lock().clear();
    }

    /// Returns the number of pending cleanup steps.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.steps.lock().len()
    }
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("pending_count", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_lifo_order() {
        let registry = CleanupRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 1..=3 {
            let order = order.clone();
            registry.register(format!("step{i}"), move || async move {
                order.lock().push(i);
                Ok(())
            });
        }

        let failures = registry.run_all(Duration::from_secs(1)).await;

        assert!(failures.is_empty());
        assert_eq!(*order.lock(), vec![3, 2, 1]);
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_continues_past_failures_and_timeouts() {
        let registry = CleanupRegistry::new();
        let ran = Arc::new(Mutex::new(0));

        let counter = ran.clone();
        registry.register("first", move || async move {
            *counter.lock() += 1;
            Ok(())
        });
        registry.register("fails", || async { Err("boom".to_string()) });
        registry.register("hangs", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });

        let failures = registry.run_all(Duration::from_millis(90)).await;

        assert_eq!(*ran.lock(), 1);
        let names: Vec<_> = failures.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["hangs", "fails"]);
    }

    #[tokio::test]
    async fn test_disarm_skips_steps() {
        let registry = CleanupRegistry::new();
        registry.register("never", || async { Err("should not run".to_string()) });
        registry.disarm();

        assert!(registry.run_all(Duration::from_secs(1)).await.is_empty());
    }
}
