//! Fixtures shared by the gateway tests

use futures_util::future::{BoxFuture, FutureExt};
use loro::{ExportMode, LoroDoc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::db::memstore::MemoryStore;
use crate::db::store::{DocStore, PersistedDoc, StoreError, StoreResult, UpdateNotice};
use crate::services::auth_service::{Identity, TokenVerifier};
use crate::services::persistence::{PersistenceAdapter, RetryPolicy};
use crate::ws::connctx::ConnCtx;
use crate::ws::registry::{RegistrySettings, SessionRegistry};
use crate::AppState;

pub const SECRET: &str = "test-secret";

/// Signed token for `uid` expiring `ttl_secs` from now (negative for the past)
pub fn token_for(uid: &str, roles: &[&str], ttl_secs: i64) -> String {
    let claims = serde_json::json!({
        "sub": uid,
        "roles": roles,
        "exp": chrono::Utc::now().timestamp() + ttl_secs,
    });
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

/// An update a fresh client would send after typing `text`
pub fn client_update(text: &str) -> Vec<u8> {
    let client = LoroDoc::new();
    client.get_text("text").insert(0, text).unwrap();
    client.commit();
    client.export(ExportMode::all_updates()).unwrap()
}

/// Text content of an encoded snapshot or update
pub fn text_of(bytes: &[u8]) -> String {
    let doc = LoroDoc::new();
    doc.import(bytes).unwrap();
    doc.get_text("text").to_string()
}

pub fn conn(doc_name: &str) -> ConnCtx {
    let identity = Identity {
        uid: "tester".to_string(),
        prpls: Vec::new(),
        expires_at: i64::MAX,
    };
    ConnCtx::new(&identity, doc_name)
}

pub fn registry<S: DocStore>(store: Arc<S>, idle_grace: Duration) -> Arc<SessionRegistry> {
    let adapter = PersistenceAdapter::new(
        store,
        Duration::from_millis(50),
        RetryPolicy { max_attempts: 3, backoff: Duration::from_millis(10) },
    );
    SessionRegistry::new(
        Arc::new(adapter),
        RegistrySettings { idle_grace, broadcast_capacity: 64 },
    )
}

/// Application state over an in-memory store, verifying tokens signed with `SECRET`
pub fn app_state() -> AppState {
    AppState {
        registry: registry(Arc::new(MemoryStore::new()), Duration::from_secs(30)),
        verifier: TokenVerifier::new(Some(SECRET.to_string()), "auth_token"),
    }
}

/// In-memory store that counts calls and fails on demand
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    load_delay: Duration,
    pub load_calls: AtomicUsize,
    pub save_calls: AtomicUsize,
    pub append_calls: AtomicUsize,
    /// Number of upcoming loads to fail
    pub fail_loads: AtomicUsize,
    /// Number of upcoming saves to fail
    pub fail_saves: AtomicUsize,
    saved: Mutex<HashMap<String, Vec<u8>>>,
    /// Written to the log by another instance right after the next load reads
    write_after_load: Mutex<Option<(Uuid, Vec<u8>)>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_load_delay(delay: Duration) -> Self {
        Self { load_delay: delay, ..Self::default() }
    }

    /// Have `origin` append `update` as soon as the next load has read the store
    pub fn write_after_load(&self, origin: Uuid, update: Vec<u8>) {
        *self.write_after_load.lock().unwrap() = Some((origin, update));
    }

    /// Last snapshot successfully saved for `doc`
    pub fn saved_snapshot(&self, doc: &str) -> Option<Vec<u8>> {
        self.saved.lock().unwrap().get(doc).cloned()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl DocStore for FlakyStore {
    fn load<'a>(&'a self, doc: &'a str) -> BoxFuture<'a, StoreResult<Option<PersistedDoc>>> {
        async move {
            self.load_calls.fetch_add(1, Ordering::SeqCst);
            if !self.load_delay.is_zero() {
                tokio::time::sleep(self.load_delay).await;
            }
            if Self::take_failure(&self.fail_loads) {
                return Err(StoreError::Unavailable("injected load failure".to_string()));
            }
            let loaded = self.inner.load(doc).await?;
            let concurrent = self.write_after_load.lock().unwrap().take();
            if let Some((origin, update)) = concurrent {
                self.inner.append_updates(doc, origin, vec![update]).await?;
            }
            Ok(loaded)
        }
        .boxed()
    }

    fn append_updates<'a>(&'a self, doc: &'a str, origin: Uuid, updates: Vec<Vec<u8>>) -> BoxFuture<'a, StoreResult<Vec<i64>>> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.append_updates(doc, origin, updates)
    }

    fn save_snapshot<'a>(&'a self, doc: &'a str, snapshot: Vec<u8>, version: i64) -> BoxFuture<'a, StoreResult<bool>> {
        async move {
            self.save_calls.fetch_add(1, Ordering::SeqCst);
            if Self::take_failure(&self.fail_saves) {
                return Err(StoreError::Unavailable("injected save failure".to_string()));
            }
            let applied = self.inner.save_snapshot(doc, snapshot.clone(), version).await?;
            if applied {
                self.saved.lock().unwrap().insert(doc.to_string(), snapshot);
            }
            Ok(applied)
        }
        .boxed()
    }

    fn fetch_update<'a>(&'a self, doc: &'a str, seq: i64) -> BoxFuture<'a, StoreResult<Option<Vec<u8>>>> {
        self.inner.fetch_update(doc, seq)
    }

    fn updates_after<'a>(&'a self, doc: &'a str, seq: i64) -> BoxFuture<'a, StoreResult<Vec<(i64, Vec<u8>)>>> {
        self.inner.updates_after(doc, seq)
    }

    fn listen(&self) -> BoxFuture<'_, StoreResult<mpsc::Receiver<UpdateNotice>>> {
        self.inner.listen()
    }
}
