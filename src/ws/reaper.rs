use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::ws::registry::SessionRegistry;
use crate::ws::session::Session;

/// Cancel handle for a scheduled teardown
#[derive(Debug)]
pub struct TeardownHandle {
    task: AbortHandle,
}

impl TeardownHandle {
    pub fn cancel(self) {
        self.task.abort();
    }
}

/// Arm the idle timer of `session`. Any earlier timer is cancelled.
///
/// Must be called with the registry map locked so the check-and-arm cannot
/// interleave with a join.
pub(crate) fn schedule(registry: Weak<SessionRegistry>, session: &Arc<Session>, grace: Duration) {
    let mut state = session.state();
    if state.closed || !state.subscribers.is_empty() {
        return;
    }
    state.generation += 1;
    let generation = state.generation;
    if let Some(previous) = state.teardown.take() {
        previous.cancel();
    }

    let name = session.name().to_string();
    debug!("Session {} idle since {}, teardown in {:?}", name, state.last_activity, grace);
    let task = tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        if let Some(registry) = registry.upgrade() {
            reap(registry, name, generation).await;
        }
    });
    state.teardown = Some(TeardownHandle { task: task.abort_handle() });
}

/// Flush and evict a session that stayed idle for the whole grace period
async fn reap(registry: Arc<SessionRegistry>, name: String, generation: u64) {
    let Some(session) = registry.live_session(&name) else {
        return;
    };

    // Detach our own handle so a rejoin during the save does not abort it
    let (revision, snapshot) = {
        let mut state = session.state();
        if state.closed || !state.subscribers.is_empty() || state.generation != generation {
            debug!("Teardown of {} superseded", name);
            return;
        }
        state.teardown = None;
        (state.revision, state.doc.snapshot())
    };

    if let Err(e) = session.writer().flush().await {
        warn!("Pending updates for {} not flushed before save: {}", name, e);
    }

    let saved = match snapshot {
        Ok(snapshot) => registry.adapter().save(&name, snapshot, session.watermark()).await,
        Err(e) => Err(e),
    };

    match saved {
        Ok(()) => {
            if registry.release(&name, &session, generation, revision) {
                info!("Session {} closed after idle grace period", name);
            } else {
                debug!("Session {} saved but became active again", name);
            }
        }
        Err(e) => {
            // Keep the model; the next idle period or a rejoin retries
            error!("Keeping {} in memory, save failed: {}", name, e);
            registry.rearm(&session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::testing::{client_update, conn, registry, text_of, FlakyStore};
    use std::sync::atomic::Ordering;

    const GRACE: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn idle_session_saved_once_and_evicted() {
        let store = Arc::new(FlakyStore::new());
        let registry = registry(store.clone(), GRACE);
        let alice = conn("doc1");

        let session = registry.join("doc1", &alice).await.unwrap();
        session.apply_local(alice.id, &client_update("bye")).unwrap();
        registry.leave("doc1", alice.id);

        tokio::time::sleep(GRACE + Duration::from_secs(1)).await;

        assert_eq!(store.save_calls.load(Ordering::SeqCst), 1);
        assert!(registry.live_session("doc1").is_none());
        let saved = store.saved_snapshot("doc1").unwrap();
        assert_eq!(text_of(&saved), "bye");
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_within_grace_cancels_teardown() {
        let store = Arc::new(FlakyStore::new());
        let registry = registry(store.clone(), GRACE);
        let alice = conn("doc1");

        let first = registry.join("doc1", &alice).await.unwrap();
        registry.leave("doc1", alice.id);
        tokio::time::sleep(GRACE / 2).await;

        let again = conn("doc1");
        let second = registry.join("doc1", &again).await.unwrap();
        tokio::time::sleep(GRACE * 2).await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.load_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.save_calls.load(Ordering::SeqCst), 0);
        assert!(registry.live_session("doc1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_save_keeps_state_and_retries_later() {
        let store = Arc::new(FlakyStore::new());
        // Exhausts the first teardown's retry budget of three attempts
        store.fail_saves.store(3, Ordering::SeqCst);
        let registry = registry(store.clone(), GRACE);
        let alice = conn("doc1");

        let session = registry.join("doc1", &alice).await.unwrap();
        session.apply_local(alice.id, &client_update("precious")).unwrap();
        registry.leave("doc1", alice.id);

        tokio::time::sleep(GRACE + Duration::from_secs(5)).await;
        let kept = registry.live_session("doc1").expect("state must be kept");
        assert!(Arc::ptr_eq(&kept, &session));
        assert!(kept.is_dirty());
        assert!(store.saved_snapshot("doc1").is_none());

        tokio::time::sleep(GRACE + Duration::from_secs(5)).await;
        assert!(registry.live_session("doc1").is_none());
        assert!(store.saved_snapshot("doc1").is_some());
        assert_eq!(store.save_calls.load(Ordering::SeqCst), 4);
    }
}
