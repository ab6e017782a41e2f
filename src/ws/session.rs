use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::models::lorodoc::{SharedDoc, UpdateOrigin};
use crate::models::GatewayError;
use crate::services::persistence::{LoadedDoc, PersistenceAdapter, RemoteSubscription, UpdateWriter};
use crate::ws::broadcaster::Outbound;
use crate::ws::connctx::ConnId;
use crate::ws::reaper::TeardownHandle;

pub(crate) struct SessionState {
    pub(crate) doc: SharedDoc,
    pub(crate) subscribers: HashSet<ConnId>,
    pub(crate) dirty: bool,
    pub(crate) last_activity: DateTime<Utc>,
    /// Bumped on every change to the document
    pub(crate) revision: u64,
    /// Bumped on every join and every scheduled teardown; a teardown only
    /// proceeds if nothing happened since it was scheduled.
    pub(crate) generation: u64,
    pub(crate) teardown: Option<TeardownHandle>,
    pub(crate) closed: bool,
}

/// Live binding of a document name to its model and subscribers
pub struct Session {
    name: String,
    state: Mutex<SessionState>,
    tx: broadcast::Sender<Outbound>,
    watermark: i64,
    writer: UpdateWriter,
    _remote: RemoteSubscription,
}

impl Session {
    pub fn create(name: &str, loaded: LoadedDoc, adapter: &PersistenceAdapter, capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Arc::new_cyclic(|weak: &Weak<Session>| {
            let writer = adapter.register_update_handler(name, &loaded.doc);
            let session = weak.clone();
            let remote = adapter.subscribe_remote_updates(name, move |update| {
                if let Some(session) = session.upgrade() {
                    session.apply_remote(&update);
                }
            });
            Session {
                name: name.to_string(),
                state: Mutex::new(SessionState {
                    doc: loaded.doc,
                    subscribers: HashSet::new(),
                    dirty: false,
                    last_activity: Utc::now(),
                    revision: 0,
                    generation: 0,
                    teardown: None,
                    closed: false,
                }),
                tx,
                watermark: loaded.watermark,
                writer,
                _remote: remote,
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Recovering poisoned session lock for {}", self.name);
            poisoned.into_inner()
        })
    }

    pub(crate) fn writer(&self) -> &UpdateWriter {
        &self.writer
    }

    pub(crate) fn watermark(&self) -> i64 {
        self.watermark
    }

    /// Receiver for everything broadcast on this session from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.tx.subscribe()
    }

    /// Add a subscriber and cancel any pending teardown
    pub(crate) fn add_subscriber(&self, conn: ConnId) {
        let mut state = self.state();
        state.subscribers.insert(conn);
        state.generation += 1;
        state.last_activity = Utc::now();
        if let Some(handle) = state.teardown.take() {
            debug!("Rejoin on {} cancels pending teardown", self.name);
            handle.cancel();
        }
    }

    /// Remove a subscriber. Returns the remaining count if `conn` was attached.
    pub(crate) fn remove_subscriber(&self, conn: ConnId) -> Option<usize> {
        let mut state = self.state();
        if !state.subscribers.remove(&conn) {
            return None;
        }
        state.last_activity = Utc::now();
        Some(state.subscribers.len())
    }

    pub fn subscriber_count(&self) -> usize {
        self.state().subscribers.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.state().dirty
    }

    /// Encoded version vector of the live document
    pub fn version(&self) -> Vec<u8> {
        self.state().doc.version()
    }

    pub fn updates_since(&self, version: &[u8]) -> Result<Vec<u8>, GatewayError> {
        self.state().doc.updates_since(version)
    }

    pub fn snapshot(&self) -> Result<Vec<u8>, GatewayError> {
        self.state().doc.snapshot()
    }

    /// Merge an edit from `conn` and relay it to every other subscriber
    pub fn apply_local(&self, conn: ConnId, update: &[u8]) -> Result<bool, GatewayError> {
        self.apply(UpdateOrigin::Connection(conn), update)
    }

    /// Merge an update written by another process and relay it to all subscribers
    pub fn apply_remote(&self, update: &[u8]) {
        if let Err(e) = self.apply(UpdateOrigin::Remote, update) {
            warn!("Dropping remote update for {}: {}", self.name, e);
        }
    }

    /// Relay an ephemeral payload to the other subscribers
    pub fn relay_presence(&self, conn: ConnId, payload: Vec<u8>) {
        let mut state = self.state();
        state.last_activity = Utc::now();
        let _ = self.tx.send(Outbound::Presence { origin: conn, payload: Arc::new(payload) });
    }

    fn apply(&self, origin: UpdateOrigin, update: &[u8]) -> Result<bool, GatewayError> {
        let mut state = self.state();
        if state.closed {
            return Err(GatewayError::Backend(format!("session {} is closed", self.name)));
        }
        // Broadcast under the lock so every receiver sees updates in model order
        let delta = match state.doc.apply_update(origin, update)? {
            Some(delta) => delta,
            None => return Ok(false),
        };
        state.dirty = true;
        state.revision += 1;
        state.last_activity = Utc::now();
        let from = match origin {
            UpdateOrigin::Connection(conn) => Some(conn),
            UpdateOrigin::Remote => None,
        };
        let _ = self.tx.send(Outbound::Update { origin: from, update: Arc::new(delta) });
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memstore::MemoryStore;
    use crate::services::persistence::RetryPolicy;
    use crate::ws::testing::client_update;
    use std::time::Duration;

    fn adapter() -> PersistenceAdapter {
        PersistenceAdapter::new(
            Arc::new(MemoryStore::new()),
            Duration::from_millis(10),
            RetryPolicy { max_attempts: 1, backoff: Duration::from_millis(1) },
        )
    }

    #[tokio::test]
    async fn local_update_marks_dirty_and_broadcasts_with_origin() {
        let adapter = adapter();
        let session = Session::create("doc", adapter.load("doc").await.unwrap(), &adapter, 16);
        let mut rx = session.subscribe();

        assert!(!session.is_dirty());
        assert!(session.apply_local(7, &client_update("hi")).unwrap());
        assert!(session.is_dirty());

        match rx.recv().await.unwrap() {
            Outbound::Update { origin, update } => {
                assert_eq!(origin, Some(7));
                assert!(!update.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn duplicate_update_is_not_rebroadcast() {
        let adapter = adapter();
        let session = Session::create("doc", adapter.load("doc").await.unwrap(), &adapter, 16);
        let update = client_update("x");
        let mut rx = session.subscribe();

        assert!(session.apply_local(1, &update).unwrap());
        assert!(!session.apply_local(2, &update).unwrap());
        rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscriber_count_tracks_set() {
        let adapter = adapter();
        let session = Session::create("doc", adapter.load("doc").await.unwrap(), &adapter, 16);

        session.add_subscriber(1);
        session.add_subscriber(2);
        assert_eq!(session.subscriber_count(), 2);
        assert_eq!(session.remove_subscriber(1), Some(1));
        assert_eq!(session.remove_subscriber(1), None);
        assert_eq!(session.remove_subscriber(2), Some(0));
        assert_eq!(session.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn remote_update_has_no_origin() {
        let adapter = adapter();
        let session = Session::create("doc", adapter.load("doc").await.unwrap(), &adapter, 16);
        let mut rx = session.subscribe();

        session.apply_remote(&client_update("from afar"));
        match rx.recv().await.unwrap() {
            Outbound::Update { origin, .. } => assert_eq!(origin, None),
            other => panic!("unexpected {:?}", other),
        }
    }
}
