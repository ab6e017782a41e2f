use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Durable state of one document as read from the backend
#[derive(Debug, Clone, Default)]
pub struct PersistedDoc {
    pub snapshot: Option<Vec<u8>>,
    /// Highest log sequence folded into `snapshot`
    pub version: i64,
    /// Log entries written after the snapshot, in sequence order
    pub updates: Vec<Vec<u8>>,
    /// Highest sequence present in the log for this document
    pub head: i64,
}

/// Change notification published by a gateway process after appending to the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateNotice {
    pub doc: String,
    pub seq: i64,
    pub origin: Uuid,
}

#[derive(Debug)]
pub enum StoreError {
    Unavailable(String),
    Query(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {}", e),
            StoreError::Query(e) => write!(f, "Store query failed: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

pub type StoreResult<T> = Result<T, StoreError>;

/// Backend holding snapshots, the update log and the change channel.
pub trait DocStore: Send + Sync + 'static {
    /// Snapshot plus every log entry after it. `None` if the document was never written.
    fn load<'a>(&'a self, doc: &'a str) -> BoxFuture<'a, StoreResult<Option<PersistedDoc>>>;

    /// Append updates to the log and publish one notice per entry
    fn append_updates<'a>(&'a self, doc: &'a str, origin: Uuid, updates: Vec<Vec<u8>>) -> BoxFuture<'a, StoreResult<Vec<i64>>>;

    /// Replace the snapshot and drop log entries up to and including `version`.
    /// Returns false if a snapshot at a newer version was kept instead.
    fn save_snapshot<'a>(&'a self, doc: &'a str, snapshot: Vec<u8>, version: i64) -> BoxFuture<'a, StoreResult<bool>>;

    /// Fetch a single log entry referenced by a notice
    fn fetch_update<'a>(&'a self, doc: &'a str, seq: i64) -> BoxFuture<'a, StoreResult<Option<Vec<u8>>>>;

    /// Log entries with a sequence above `seq`, in order
    fn updates_after<'a>(&'a self, doc: &'a str, seq: i64) -> BoxFuture<'a, StoreResult<Vec<(i64, Vec<u8>)>>>;

    /// Start receiving change notices from every process
    fn listen(&self) -> BoxFuture<'_, StoreResult<mpsc::Receiver<UpdateNotice>>>;
}
