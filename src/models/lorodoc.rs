use loro::{ExportMode, LoroDoc, VersionVector};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

use crate::models::GatewayError;

/// Where an update applied to a live document came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Edit sent by a connection attached to this process
    Connection(u64),
    /// Update persisted by another gateway process
    Remote,
}

/// The effective change produced by applying an update
#[derive(Debug)]
pub struct DocUpdate<'a> {
    pub origin: UpdateOrigin,
    pub bytes: &'a [u8],
}

type UpdateHandler = Box<dyn Fn(&DocUpdate<'_>) + Send + Sync>;
type HandlerTable = Mutex<HashMap<u64, UpdateHandler>>;

/// Live CRDT document of a session.
///
/// Wraps a `LoroDoc` and turns every import into an explicit incremental
/// update: the bytes handed to the registered handlers are exactly what
/// changed, so duplicates produce nothing and handlers are never re-entered.
pub struct SharedDoc {
    doc: LoroDoc,
    handlers: Arc<HandlerTable>,
    next_handler: Mutex<u64>,
}

impl SharedDoc {
    pub fn new() -> Self {
        Self {
            doc: LoroDoc::new(),
            handlers: Arc::new(Mutex::new(HashMap::new())),
            next_handler: Mutex::new(0),
        }
    }

    /// Rebuild a document from a persisted snapshot and the update log written after it
    pub fn from_persisted(snapshot: Option<&[u8]>, updates: &[Vec<u8>]) -> Result<Self, GatewayError> {
        let shared = Self::new();
        if let Some(snapshot) = snapshot {
            shared
                .doc
                .import(snapshot)
                .map_err(|e| GatewayError::LoadFailure(format!("corrupt snapshot: {}", e)))?;
        }
        for (idx, update) in updates.iter().enumerate() {
            shared
                .doc
                .import(update)
                .map_err(|e| GatewayError::LoadFailure(format!("corrupt update #{}: {}", idx, e)))?;
        }
        Ok(shared)
    }

    /// Merge an update into the document.
    ///
    /// Returns the effective incremental update, or `None` when the update
    /// carried nothing new. Handlers run before this returns.
    pub fn apply_update(&self, origin: UpdateOrigin, bytes: &[u8]) -> Result<Option<Vec<u8>>, GatewayError> {
        let before = self.doc.oplog_vv();
        self.doc
            .import(bytes)
            .map_err(|e| GatewayError::ProtocolViolation(format!("invalid update: {}", e)))?;
        let after = self.doc.oplog_vv();
        if before == after {
            debug!("Update from {:?} carried no new operations", origin);
            return Ok(None);
        }

        let delta = self
            .doc
            .export(ExportMode::updates(&before))
            .map_err(|e| GatewayError::Backend(format!("failed to export update: {}", e)))?;
        self.emit(&DocUpdate { origin, bytes: &delta });
        Ok(Some(delta))
    }

    /// Encoded version vector of everything this document has seen
    pub fn version(&self) -> Vec<u8> {
        self.doc.oplog_vv().encode()
    }

    /// Everything a peer at `version` is missing. An empty version means the peer has nothing.
    pub fn updates_since(&self, version: &[u8]) -> Result<Vec<u8>, GatewayError> {
        if version.is_empty() {
            return self.snapshot();
        }
        let vv = VersionVector::decode(version)
            .map_err(|e| GatewayError::ProtocolViolation(format!("invalid version vector: {}", e)))?;
        self.doc
            .export(ExportMode::updates(&vv))
            .map_err(|e| GatewayError::Backend(format!("failed to export updates: {}", e)))
    }

    pub fn snapshot(&self) -> Result<Vec<u8>, GatewayError> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| GatewayError::Backend(format!("failed to export snapshot: {}", e)))
    }

    /// Register a handler for every effective update. Dropping the returned
    /// subscription unregisters it.
    pub fn on_update<F>(&self, handler: F) -> UpdateSubscription
    where
        F: Fn(&DocUpdate<'_>) + Send + Sync + 'static,
    {
        let id = {
            let mut next = lock(&self.next_handler);
            *next += 1;
            *next
        };
        lock(&self.handlers).insert(id, Box::new(handler));
        UpdateSubscription {
            handlers: Arc::downgrade(&self.handlers),
            id,
        }
    }

    fn emit(&self, update: &DocUpdate<'_>) {
        let handlers = lock(&self.handlers);
        for handler in handlers.values() {
            handler(update);
        }
    }
}

impl Default for SharedDoc {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation token for an update handler
pub struct UpdateSubscription {
    handlers: Weak<HandlerTable>,
    id: u64,
}

impl Drop for UpdateSubscription {
    fn drop(&mut self) {
        if let Some(handlers) = self.handlers.upgrade() {
            lock(&handlers).remove(&self.id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("Recovering poisoned document lock");
        poisoned.into_inner()
    })
}
