use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::store::{DocStore, StoreError};
use crate::models::lorodoc::{SharedDoc, UpdateOrigin, UpdateSubscription};
use crate::models::GatewayError;

/// Bounded exponential backoff for backend writes
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < attempts => {
                    warn!("{} failed (attempt {}/{}): {}. Retrying in {:?}", what, attempt, attempts, e, delay);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    error!("{} failed after {} attempts: {}", what, attempts, e);
                    return Err(e);
                }
            }
        }
    }
}

/// A freshly loaded document and the log position it is known to contain
pub struct LoadedDoc {
    pub doc: SharedDoc,
    pub watermark: i64,
}

type RemoteCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;
type RemoteTable = Mutex<HashMap<String, (u64, RemoteCallback)>>;

/// Binds live documents to the durable store.
///
/// One instance per process, created at start and shut down after the
/// session registry flushed its sessions.
pub struct PersistenceAdapter {
    store: Arc<dyn DocStore>,
    instance: Uuid,
    debounce: Duration,
    retry: RetryPolicy,
    remote: Arc<RemoteTable>,
    next_remote: Mutex<u64>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceAdapter {
    pub fn new(store: Arc<dyn DocStore>, debounce: Duration, retry: RetryPolicy) -> Self {
        let instance = Uuid::new_v4();
        info!("Persistence adapter created (instance {})", instance);
        Self {
            store,
            instance,
            debounce,
            retry,
            remote: Arc::new(Mutex::new(HashMap::new())),
            next_remote: Mutex::new(0),
            pump: Mutex::new(None),
        }
    }

    pub fn from_config(store: Arc<dyn DocStore>, config: &Config) -> Self {
        Self::new(
            store,
            config.persist_debounce(),
            RetryPolicy {
                max_attempts: config.save_max_attempts,
                backoff: config.save_backoff(),
            },
        )
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance
    }

    /// Start relaying change notices from other processes to subscribed sessions
    pub async fn start(&self) -> Result<(), GatewayError> {
        let mut notices = self
            .store
            .listen()
            .await
            .map_err(|e| GatewayError::Backend(format!("failed to listen for changes: {}", e)))?;

        let store = self.store.clone();
        let remote = self.remote.clone();
        let instance = self.instance;
        let handle = tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                if notice.origin == instance {
                    continue;
                }
                let callback = match lock(&remote).get(&notice.doc) {
                    Some((_, cb)) => cb.clone(),
                    None => continue,
                };
                match store.fetch_update(&notice.doc, notice.seq).await {
                    Ok(Some(update)) => {
                        debug!("Relaying remote update #{} for {}", notice.seq, notice.doc);
                        callback(update);
                    }
                    // Compacted into a snapshot already; the peer that saved it had it merged
                    Ok(None) => debug!("Remote update #{} for {} no longer in the log", notice.seq, notice.doc),
                    Err(e) => error!("Failed to fetch remote update #{} for {}: {}", notice.seq, notice.doc, e),
                }
            }
            info!("Change notice stream closed");
        });
        *lock(&self.pump) = Some(handle);
        Ok(())
    }

    pub fn shutdown(&self) {
        if let Some(handle) = lock(&self.pump).take() {
            handle.abort();
        }
        info!("Persistence adapter stopped");
    }

    /// Fetch the latest record for `doc_name`; an empty document if there is none
    pub async fn load(&self, doc_name: &str) -> Result<LoadedDoc, GatewayError> {
        let persisted = self
            .store
            .load(doc_name)
            .await
            .map_err(|e| GatewayError::LoadFailure(e.to_string()))?;

        match persisted {
            Some(record) => {
                let doc = SharedDoc::from_persisted(record.snapshot.as_deref(), &record.updates)?;
                info!(
                    "Loaded document {} (snapshot at {}: {}, {} log entries, head {})",
                    doc_name,
                    record.version,
                    record.snapshot.is_some(),
                    record.updates.len(),
                    record.head
                );
                Ok(LoadedDoc { doc, watermark: record.head })
            }
            None => {
                info!("Document {} not found, starting empty", doc_name);
                Ok(LoadedDoc { doc: SharedDoc::new(), watermark: 0 })
            }
        }
    }

    /// Route every local mutation of `doc` to a coalescing writer for `doc_name`
    pub fn register_update_handler(&self, doc_name: &str, doc: &SharedDoc) -> UpdateWriter {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler_tx = tx.clone();
        let subscription = doc.on_update(move |update| {
            if let UpdateOrigin::Connection(_) = update.origin {
                let _ = handler_tx.send(WriterCommand::Append(update.bytes.to_vec()));
            }
        });

        tokio::spawn(run_writer(
            self.store.clone(),
            self.instance,
            doc_name.to_string(),
            self.debounce,
            self.retry,
            rx,
        ));

        UpdateWriter {
            _subscription: subscription,
            commands: tx,
        }
    }

    /// Write the full state of `doc_name`, retrying with backoff
    pub async fn save(&self, doc_name: &str, snapshot: Vec<u8>, watermark: i64) -> Result<(), GatewayError> {
        let what = format!("Saving {}", doc_name);
        let applied = self
            .retry
            .run(&what, || self.store.save_snapshot(doc_name, snapshot.clone(), watermark))
            .await
            .map_err(|e| GatewayError::SaveFailure(e.to_string()))?;
        if applied {
            info!("Document {} saved ({} bytes)", doc_name, snapshot.len());
        } else {
            // Our edits past the stored version are still in the log
            warn!("Snapshot of {} at {} is older than the stored one, kept the stored one", doc_name, watermark);
        }
        Ok(())
    }

    /// Log entries past `watermark`, for a session catching up on writes it
    /// could not have been notified of yet
    pub async fn updates_after(&self, doc_name: &str, watermark: i64) -> Result<Vec<Vec<u8>>, GatewayError> {
        let entries = self
            .store
            .updates_after(doc_name, watermark)
            .await
            .map_err(|e| GatewayError::LoadFailure(e.to_string()))?;
        if let Some((last, _)) = entries.last() {
            debug!("Catching {} up on {} log entries (through #{})", doc_name, entries.len(), last);
        }
        Ok(entries.into_iter().map(|(_, update)| update).collect())
    }

    /// Deliver updates other processes write for `doc_name` to `callback`
    pub fn subscribe_remote_updates<F>(&self, doc_name: &str, callback: F) -> RemoteSubscription
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        let id = {
            let mut next = lock(&self.next_remote);
            *next += 1;
            *next
        };
        lock(&self.remote).insert(doc_name.to_string(), (id, Arc::new(callback)));
        RemoteSubscription {
            table: Arc::downgrade(&self.remote),
            doc: doc_name.to_string(),
            id,
        }
    }
}

/// Cancellation token for a remote update callback
pub struct RemoteSubscription {
    table: std::sync::Weak<RemoteTable>,
    doc: String,
    id: u64,
}

impl Drop for RemoteSubscription {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            let mut table = lock(&table);
            if matches!(table.get(&self.doc), Some((id, _)) if *id == self.id) {
                table.remove(&self.doc);
            }
        }
    }
}

enum WriterCommand {
    Append(Vec<u8>),
    Flush(oneshot::Sender<Result<(), GatewayError>>),
}

/// Handle on a session's background log writer.
///
/// Dropping it cancels the update handler and closes the queue; the writer
/// task appends whatever is still queued and exits.
pub struct UpdateWriter {
    _subscription: UpdateSubscription,
    commands: mpsc::UnboundedSender<WriterCommand>,
}

impl UpdateWriter {
    /// Write out everything queued so far
    pub async fn flush(&self) -> Result<(), GatewayError> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(WriterCommand::Flush(ack))
            .map_err(|_| GatewayError::SaveFailure("update writer stopped".to_string()))?;
        done.await
            .map_err(|_| GatewayError::SaveFailure("update writer stopped".to_string()))?
    }
}

async fn run_writer(
    store: Arc<dyn DocStore>,
    instance: Uuid,
    doc_name: String,
    debounce: Duration,
    retry: RetryPolicy,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
) {
    let mut batch: Vec<Vec<u8>> = Vec::new();
    let mut closed = false;

    while !closed {
        let mut acks = Vec::new();
        match rx.recv().await {
            Some(WriterCommand::Append(update)) => {
                batch.push(update);
                let window = tokio::time::sleep(debounce);
                tokio::pin!(window);
                loop {
                    tokio::select! {
                        _ = &mut window => break,
                        cmd = rx.recv() => match cmd {
                            Some(WriterCommand::Append(update)) => batch.push(update),
                            Some(WriterCommand::Flush(ack)) => {
                                acks.push(ack);
                                break;
                            }
                            None => {
                                closed = true;
                                break;
                            }
                        },
                    }
                }
            }
            Some(WriterCommand::Flush(ack)) => acks.push(ack),
            None => closed = true,
        }

        let result = write_batch(&store, instance, &doc_name, retry, &mut batch).await;
        for ack in acks {
            let _ = ack.send(result.clone());
        }
    }
    debug!("Update writer for {} stopped", doc_name);
}

/// Appends the batch; on failure the batch is kept for the next round
async fn write_batch(
    store: &Arc<dyn DocStore>,
    instance: Uuid,
    doc_name: &str,
    retry: RetryPolicy,
    batch: &mut Vec<Vec<u8>>,
) -> Result<(), GatewayError> {
    if batch.is_empty() {
        return Ok(());
    }
    let what = format!("Appending {} updates to {}", batch.len(), doc_name);
    match retry
        .run(&what, || store.append_updates(doc_name, instance, batch.clone()))
        .await
    {
        Ok(seqs) => {
            debug!("Appended {} updates to {} (last seq {:?})", seqs.len(), doc_name, seqs.last());
            batch.clear();
            Ok(())
        }
        Err(e) => Err(GatewayError::SaveFailure(e.to_string())),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
