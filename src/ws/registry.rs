use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::models::GatewayError;
use crate::services::persistence::PersistenceAdapter;
use crate::ws::connctx::{ConnCtx, ConnId};
use crate::ws::reaper;
use crate::ws::session::Session;

type PendingLoad = Shared<BoxFuture<'static, Result<Arc<Session>, GatewayError>>>;

enum Slot {
    /// A load is in flight; every joiner awaits the same future
    Loading(PendingLoad),
    Live(Arc<Session>),
}

#[derive(Clone, Copy, Debug)]
pub struct RegistrySettings {
    pub idle_grace: Duration,
    pub broadcast_capacity: usize,
}

impl RegistrySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            idle_grace: config.idle_grace(),
            broadcast_capacity: config.broadcast_capacity,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub sessions: usize,
    pub loading: usize,
    pub connections: usize,
    pub dirty: usize,
}

/// Process-wide table of live document sessions.
///
/// The map lock is only held for lookups and installs, never across I/O.
/// Lock order is map, then session.
pub struct SessionRegistry {
    slots: Mutex<HashMap<String, Slot>>,
    adapter: Arc<PersistenceAdapter>,
    settings: RegistrySettings,
    me: Weak<SessionRegistry>,
    closing: watch::Sender<bool>,
}

impl SessionRegistry {
    pub fn new(adapter: Arc<PersistenceAdapter>, settings: RegistrySettings) -> Arc<Self> {
        let (closing, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            slots: Mutex::new(HashMap::new()),
            adapter,
            settings,
            me: me.clone(),
            closing,
        })
    }

    pub(crate) fn adapter(&self) -> &PersistenceAdapter {
        &self.adapter
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| {
            warn!("Recovering poisoned registry lock");
            poisoned.into_inner()
        })
    }

    /// Attach `conn` to the session for `doc_name`, loading it on first use
    pub async fn join(&self, doc_name: &str, conn: &ConnCtx) -> Result<Arc<Session>, GatewayError> {
        loop {
            let pending = {
                let mut slots = self.slots();
                match slots.get(doc_name) {
                    Some(Slot::Live(session)) => {
                        session.add_subscriber(conn.id);
                        info!("Connection {} ({}) joined {}", conn.id, conn.uid, doc_name);
                        return Ok(session.clone());
                    }
                    Some(Slot::Loading(pending)) => pending.clone(),
                    None => {
                        if self.is_closing() {
                            return Err(GatewayError::LoadFailure("gateway is shutting down".to_string()));
                        }
                        let pending = self.load_session(doc_name.to_string()).boxed().shared();
                        slots.insert(doc_name.to_string(), Slot::Loading(pending.clone()));
                        pending
                    }
                }
            };
            // Loop back to attach under the map lock once the session is live
            pending.await?;
        }
    }

    fn load_session(&self, doc_name: String) -> impl std::future::Future<Output = Result<Arc<Session>, GatewayError>> + Send + 'static {
        let me = self.me.clone();
        let adapter = self.adapter.clone();
        let settings = self.settings;
        async move {
            info!("Loading session for {}", doc_name);
            let opened = open_session(&adapter, &doc_name, settings.broadcast_capacity).await;
            let Some(registry) = me.upgrade() else {
                return Err(GatewayError::LoadFailure("registry dropped".to_string()));
            };

            let mut slots = registry.slots();
            let session = match opened {
                Ok(session) if registry.is_closing() => {
                    // Shutdown already drained the map and would never flush this one
                    warn!("Discarding session for {} loaded during shutdown", doc_name);
                    session.state().closed = true;
                    slots.remove(&doc_name);
                    return Err(GatewayError::LoadFailure("gateway is shutting down".to_string()));
                }
                Ok(session) => session,
                Err(e) => {
                    error!("Failed to load {}: {}", doc_name, e);
                    slots.remove(&doc_name);
                    return Err(e);
                }
            };
            slots.insert(doc_name.clone(), Slot::Live(session.clone()));
            // Idle until someone attaches; evicted if no joiner ever does
            reaper::schedule(me, &session, settings.idle_grace);
            Ok(session)
        }
    }

    /// Detach `conn`; the last one out hands the session to the idle reaper
    pub fn leave(&self, doc_name: &str, conn: ConnId) {
        let slots = self.slots();
        if let Some(Slot::Live(session)) = slots.get(doc_name) {
            match session.remove_subscriber(conn) {
                Some(0) => {
                    info!("Connection {} left {}, no subscribers remain", conn, doc_name);
                    reaper::schedule(self.me.clone(), session, self.settings.idle_grace);
                }
                Some(remaining) => info!("Connection {} left {} ({} remain)", conn, doc_name, remaining),
                None => {}
            }
        }
    }

    pub fn live_session(&self, doc_name: &str) -> Option<Arc<Session>> {
        match self.slots().get(doc_name) {
            Some(Slot::Live(session)) => Some(session.clone()),
            _ => None,
        }
    }

    /// Evict `session` if nothing happened since `generation`. Returns whether it was removed.
    pub(crate) fn release(&self, doc_name: &str, session: &Arc<Session>, generation: u64, revision: u64) -> bool {
        let mut slots = self.slots();
        match slots.get(doc_name) {
            Some(Slot::Live(current)) if Arc::ptr_eq(current, session) => {}
            _ => return false,
        }
        let mut state = session.state();
        if state.revision == revision {
            state.dirty = false;
        }
        if !state.subscribers.is_empty() || state.generation != generation {
            return false;
        }
        state.closed = true;
        drop(state);
        slots.remove(doc_name);
        true
    }

    /// Re-arm the idle timer after a failed teardown
    pub(crate) fn rearm(&self, session: &Arc<Session>) {
        let slots = self.slots();
        if let Some(Slot::Live(current)) = slots.get(session.name()) {
            if Arc::ptr_eq(current, session) {
                reaper::schedule(self.me.clone(), session, self.settings.idle_grace);
            }
        }
    }

    pub fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Flips to true once shutdown has begun
    pub fn closing(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    /// Save and release every session. Sessions whose save fails are logged
    /// and dropped; the update log still holds their edits.
    pub async fn shutdown(&self) {
        self.closing.send_replace(true);
        let sessions: Vec<Arc<Session>> = {
            let mut slots = self.slots();
            slots
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Live(session) => Some(session),
                    Slot::Loading(_) => None,
                })
                .collect()
        };
        info!("Flushing {} sessions before shutdown", sessions.len());

        for session in sessions {
            let snapshot = {
                let mut state = session.state();
                state.closed = true;
                if let Some(handle) = state.teardown.take() {
                    handle.cancel();
                }
                state.doc.snapshot()
            };
            if let Err(e) = session.writer().flush().await {
                warn!("Pending updates for {} not flushed: {}", session.name(), e);
            }
            let saved = match snapshot {
                Ok(snapshot) => self.adapter.save(session.name(), snapshot, session.watermark()).await,
                Err(e) => Err(e),
            };
            if let Err(e) = saved {
                error!("Lost final snapshot of {} at shutdown: {}", session.name(), e);
            }
        }
    }

    pub fn stats(&self) -> RegistryStats {
        let slots = self.slots();
        let mut stats = RegistryStats::default();
        for slot in slots.values() {
            match slot {
                Slot::Loading(_) => stats.loading += 1,
                Slot::Live(session) => {
                    stats.sessions += 1;
                    stats.connections += session.subscriber_count();
                    if session.is_dirty() {
                        stats.dirty += 1;
                    }
                }
            }
        }
        stats
    }
}

/// Load `doc_name` and bind it to a new session
async fn open_session(adapter: &PersistenceAdapter, doc_name: &str, capacity: usize) -> Result<Arc<Session>, GatewayError> {
    let loaded = adapter.load(doc_name).await?;
    let watermark = loaded.watermark;
    let session = Session::create(doc_name, loaded, adapter, capacity);
    // Writes from other processes that landed between the load and the remote
    // subscription were announced to nobody
    for update in adapter.updates_after(doc_name, watermark).await? {
        session.apply_remote(&update);
    }
    Ok(session)
}
