//! Per-session cancellation controllers
//!
//! At most one generation runs per session. Starting a generation cancels
//! whatever was registered for the session before, and the run lock makes
//! the new generation wait until the cancelled one has unwound.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Controller {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct State {
    active: HashMap<String, Controller>,
    run_locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

/// Registry of the in-flight generation of every session.
///
/// Cloning is cheap; clones share state.
#[derive(Clone, Default)]
pub struct Controllers {
    state: Arc<Mutex<State>>,
    next: Arc<AtomicU64>,
}

impl Controllers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new generation for `session_id`, cancelling the previous one
    pub fn start(&self, session_id: &str) -> Generation {
        let generation = self.next.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let run_lock = {
            let mut state = self.state.lock();
            let previous = state.active.insert(
                session_id.to_string(),
                Controller {
                    generation,
                    cancel: cancel.clone(),
                },
            );
            if let Some(previous) = previous {
                debug!(session = session_id, generation = previous.generation, "superseding generation");
                previous.cancel.cancel();
            }
            state
                .run_locks
                .entry(session_id.to_string())
                .or_default()
                .clone()
        };
        Generation {
            session_id: session_id.to_string(),
            generation,
            cancel,
            run_lock,
            controllers: self.clone(),
        }
    }

    /// Cancel the session's generation, if any. Idempotent.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.state.lock().active.remove(session_id) {
            Some(controller) => {
                controller.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether a generation is registered for the session
    pub fn is_running(&self, session_id: &str) -> bool {
        self.state.lock().active.contains_key(session_id)
    }

    /// Number of sessions holding a run lock
    pub fn tracked(&self) -> usize {
        self.state.lock().run_locks.len()
    }

    fn release(&self, session_id: &str, generation: u64, run_lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut state = self.state.lock();
        if state
            .active
            .get(session_id)
            .is_some_and(|c| c.generation == generation)
        {
            state.active.remove(session_id);
        }
        // The map and the releasing generation hold the only references
        if !state.active.contains_key(session_id) && Arc::strong_count(run_lock) == 2 {
            state.run_locks.remove(session_id);
        }
    }
}

/// One registered generation. Unregisters itself when dropped, unless a
/// newer generation has replaced it.
pub struct Generation {
    session_id: String,
    generation: u64,
    cancel: CancellationToken,
    run_lock: Arc<tokio::sync::Mutex<()>>,
    controllers: Controllers,
}

impl Generation {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait for earlier generations of the session to finish
    pub async fn lock(&self) -> OwnedMutexGuard<()> {
        self.run_lock.clone().lock_owned().await
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        self.controllers
            .release(&self.session_id, self.generation, &self.run_lock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_supersedes_previous() {
        let controllers = Controllers::new();
        let first = controllers.start("ses_1");
        let second = controllers.start("ses_1");
        assert!(first.token().is_cancelled());
        assert!(!second.token().is_cancelled());

        // The stale generation must not unregister the live one
        drop(first);
        assert!(controllers.is_running("ses_1"));
        drop(second);
        assert!(!controllers.is_running("ses_1"));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let controllers = Controllers::new();
        let generation = controllers.start("ses_1");
        assert!(controllers.cancel("ses_1"));
        assert!(generation.token().is_cancelled());
        assert!(!controllers.cancel("ses_1"));
        assert!(!controllers.cancel("ses_unknown"));
    }

    #[test]
    fn test_sessions_are_independent() {
        let controllers = Controllers::new();
        let a = controllers.start("ses_a");
        let b = controllers.start("ses_b");
        controllers.cancel("ses_a");
        assert!(a.token().is_cancelled());
        assert!(!b.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_run_lock_dropped_with_last_generation() {
        let controllers = Controllers::new();
        let first = controllers.start("ses_1");
        let guard = first.lock().await;
        let second = controllers.start("ses_1");
        drop(first);
        // The superseded run still holds the lock
        assert_eq!(controllers.tracked(), 1);
        drop(guard);
        drop(second);
        assert_eq!(controllers.tracked(), 0);

        for i in 0..10 {
            let generation = controllers.start(&format!("ses_{i}"));
            let _guard = generation.lock().await;
        }
        assert_eq!(controllers.tracked(), 0);
    }

    #[tokio::test]
    async fn test_run_lock_serializes_generations() {
        let controllers = Controllers::new();
        let first = controllers.start("ses_1");
        let guard = first.lock().await;

        let second = controllers.start("ses_1");
        let waiting = tokio::spawn(async move {
            let _guard = second.lock().await;
        });
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        drop(guard);
        waiting.await.unwrap();
    }
}
