use futures_util::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use super::store::{DocStore, PersistedDoc, StoreError, StoreResult, UpdateNotice};

const LISTENER_CAPACITY: usize = 1024;

#[derive(Default)]
struct MemDoc {
    snapshot: Option<Vec<u8>>,
    version: i64,
    log: Vec<(i64, Vec<u8>)>,
}

#[derive(Default)]
struct MemState {
    docs: HashMap<String, MemDoc>,
    seq: i64,
    listeners: Vec<mpsc::Sender<UpdateNotice>>,
}

/// Process-local backend. Used when no database is configured; documents
/// survive disconnects but not restarts.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        info!("Using in-memory document store");
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemState) -> T) -> StoreResult<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))?;
        Ok(f(&mut state))
    }
}

impl DocStore for MemoryStore {
    fn load<'a>(&'a self, doc: &'a str) -> BoxFuture<'a, StoreResult<Option<PersistedDoc>>> {
        let result = self.with_state(|state| {
            state.docs.get(doc).map(|mem| PersistedDoc {
                snapshot: mem.snapshot.clone(),
                version: mem.version,
                updates: mem.log.iter().map(|(_, u)| u.clone()).collect(),
                head: mem.log.last().map(|(seq, _)| *seq).unwrap_or(mem.version),
            })
        });
        async move { result }.boxed()
    }

    fn append_updates<'a>(&'a self, doc: &'a str, origin: Uuid, updates: Vec<Vec<u8>>) -> BoxFuture<'a, StoreResult<Vec<i64>>> {
        let result = self.with_state(|state| {
            let mut seqs = Vec::with_capacity(updates.len());
            for update in updates {
                state.seq += 1;
                let seq = state.seq;
                state.docs.entry(doc.to_string()).or_default().log.push((seq, update));
                seqs.push(seq);
            }
            state.listeners.retain(|tx| !tx.is_closed());
            for seq in &seqs {
                let notice = UpdateNotice { doc: doc.to_string(), seq: *seq, origin };
                for tx in &state.listeners {
                    if tx.try_send(notice.clone()).is_err() {
                        debug!("Dropping notice for a full listener");
                    }
                }
            }
            seqs
        });
        async move { result }.boxed()
    }

    fn save_snapshot<'a>(&'a self, doc: &'a str, snapshot: Vec<u8>, version: i64) -> BoxFuture<'a, StoreResult<bool>> {
        let result = self.with_state(|state| {
            let mem = state.docs.entry(doc.to_string()).or_default();
            let applied = mem.snapshot.is_none() || version >= mem.version;
            if applied {
                mem.snapshot = Some(snapshot);
                mem.version = version;
            }
            mem.log.retain(|(seq, _)| *seq > version);
            applied
        });
        async move { result }.boxed()
    }

    fn fetch_update<'a>(&'a self, doc: &'a str, seq: i64) -> BoxFuture<'a, StoreResult<Option<Vec<u8>>>> {
        let result = self.with_state(|state| {
            state
                .docs
                .get(doc)
                .and_then(|mem| mem.log.iter().find(|(s, _)| *s == seq))
                .map(|(_, u)| u.clone())
        });
        async move { result }.boxed()
    }

    fn updates_after<'a>(&'a self, doc: &'a str, seq: i64) -> BoxFuture<'a, StoreResult<Vec<(i64, Vec<u8>)>>> {
        let result = self.with_state(|state| {
            state
                .docs
                .get(doc)
                .map(|mem| mem.log.iter().filter(|(s, _)| *s > seq).cloned().collect())
                .unwrap_or_default()
        });
        async move { result }.boxed()
    }

    fn listen(&self) -> BoxFuture<'_, StoreResult<mpsc::Receiver<UpdateNotice>>> {
        let result = self.with_state(|state| {
            let (tx, rx) = mpsc::channel(LISTENER_CAPACITY);
            state.listeners.push(tx);
            rx
        });
        async move { result }.boxed()
    }
}
