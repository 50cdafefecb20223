//! Scoped activation of the batching engine.
//!
//! Entering a scope publishes the engine into a process-global stack the
//! interception hook reads; exiting pops it and closes the engine. A
//! global (rather than a task-local) is used deliberately: requests issued
//! from tasks spawned inside the scope, including by library code several
//! layers down, must observe the same active engine, and task-locals do
//! not cross `tokio::spawn`. Nested scopes shadow the outer engine and
//! restore it on exit.

use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::BatchConfig;
use crate::engine::Engine;
use crate::error::{BatchlingError, Result};

static ACTIVE: RwLock<Vec<Arc<Engine>>> = RwLock::new(Vec::new());

/// The scope stack is process-global, so unit tests that depend on its
/// state (entering scopes, or asserting none is active) take turns.
#[cfg(test)]
pub(crate) static TEST_SCOPE_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// The innermost active engine, if any. Read by the hook on every request.
pub(crate) fn current() -> Option<Arc<Engine>> {
    ACTIVE.read().last().cloned()
}

/// Pops its engine from the stack on drop, so the outer scope (or none)
/// is restored even when the scoped future errors.
struct ScopeGuard {
    engine: Arc<Engine>,
}

fn enter(engine: Arc<Engine>) -> ScopeGuard {
    ACTIVE.write().push(engine.clone());
    ScopeGuard { engine }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let mut stack = ACTIVE.write();
        if let Some(position) = stack.iter().rposition(|e| Arc::ptr_eq(e, &self.engine)) {
            stack.remove(position);
        }
    }
}

/// Run a future under an active batching scope.
///
/// While the future runs, requests issued through the batchling HTTP
/// client that match a known provider's batchable endpoint are grouped,
/// submitted through the provider's batch API, and resolved with
/// per-request responses shaped like the synchronous endpoint's. All other
/// requests pass through untouched.
///
/// On exit the engine is closed: queues are flushed, outstanding pollers
/// finish, timers are cancelled. With `deferred` enabled the future races
/// the engine's idle signal and the scope resolves with
/// [`BatchlingError::DeferredExit`] once only polling work remains; a
/// later run with the same cache re-attaches to the outstanding batches.
///
/// # Example
/// ```no_run
/// use batchling::{batched, BatchConfig};
///
/// #[tokio::main]
/// async fn main() -> batchling::Result<()> {
///     batched(BatchConfig::default(), async {
///         // Requests issued in here (directly or from spawned tasks)
///         // are intercepted and batched.
///     })
///     .await
/// }
/// ```
pub async fn batched<F, T>(config: BatchConfig, future: F) -> Result<T>
where
    F: Future<Output = T>,
{
    let engine = Engine::new(config).await?;
    crate::hook::install();

    let guard = enter(engine.clone());
    let deferred = engine.deferred_signal();

    tokio::pin!(future);
    let outcome = tokio::select! {
        output = &mut future => Ok(output),
        _ = deferred.cancelled() => Err(BatchlingError::DeferredExit),
    };

    match &outcome {
        Ok(_) => engine.clone().close().await,
        Err(_) => engine.clone().abort().await,
    }
    drop(guard);

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scope_is_visible_inside_and_gone_after() {
        let _serial = TEST_SCOPE_LOCK.lock().await;
        let config = BatchConfig {
            cache: false,
            ..BatchConfig::default()
        };

        assert!(current().is_none());
        batched(config, async {
            assert!(current().is_some());
        })
        .await
        .unwrap();
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn nested_scopes_restore_the_outer_engine() {
        let _serial = TEST_SCOPE_LOCK.lock().await;
        let config = || BatchConfig {
            cache: false,
            ..BatchConfig::default()
        };

        batched(config(), async {
            let outer = current().unwrap();
            batched(config(), async {
                let inner = current().unwrap();
                assert!(!Arc::ptr_eq(&outer, &inner));
            })
            .await
            .unwrap();
            assert!(Arc::ptr_eq(&outer, &current().unwrap()));
        })
        .await
        .unwrap();
    }
}
