use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgListener, PgPool, PgPoolOptions};
use sqlx::{Error as SqlxError, Row};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::store::{DocStore, PersistedDoc, StoreError, StoreResult, UpdateNotice};

/// Channel carrying `NotifyPayload` JSON for every appended log entry
pub const NOTIFY_CHANNEL: &str = "colab_doc_updates";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS doc_snapshots (
        name TEXT PRIMARY KEY,
        snapshot BYTEA NOT NULL,
        version BIGINT NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS doc_updates (
        seq BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        payload BYTEA NOT NULL,
        origin UUID NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS doc_updates_name_seq ON doc_updates (name, seq)",
];

#[derive(Debug, Serialize, Deserialize)]
struct NotifyPayload {
    doc: String,
    seq: i64,
    origin: Uuid,
}

/// Postgres backend: snapshots, the update log and LISTEN/NOTIFY fan-out
pub struct PgDocStore {
    pool: PgPool,
}

impl PgDocStore {
    /// Create a new connection pool and make sure the schema exists
    pub async fn connect(options: PgConnectOptions) -> Result<Self, SqlxError> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect_with(options)
            .await?;

        info!("Database connection pool created successfully");

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), SqlxError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn load_doc(&self, doc: &str) -> Result<Option<PersistedDoc>, SqlxError> {
        let pool_idle = self.pool.num_idle() as u32;
        let pool_size = self.pool.size();
        info!(
            "Loading document {}. Pool connections: {} idle, {} in use",
            doc,
            pool_idle,
            pool_size.saturating_sub(pool_idle)
        );

        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                error!(
                    "Failed to acquire connection from pool for document {}: {}. Pool state: {} idle, {} total",
                    doc,
                    e,
                    self.pool.num_idle(),
                    self.pool.size()
                );
                return Err(e);
            }
        };

        // Serializes loads and saves of the same document across processes
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(doc)
            .execute(&mut *tx)
            .await?;

        let snapshot_row = sqlx::query("SELECT snapshot, version FROM doc_snapshots WHERE name = $1")
            .bind(doc)
            .fetch_optional(&mut *tx)
            .await?;
        let (snapshot, version) = match snapshot_row {
            Some(row) => (Some(row.try_get::<Vec<u8>, _>("snapshot")?), row.try_get::<i64, _>("version")?),
            None => (None, 0),
        };

        let update_rows = sqlx::query("SELECT seq, payload FROM doc_updates WHERE name = $1 AND seq > $2 ORDER BY seq")
            .bind(doc)
            .bind(version)
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;

        if snapshot.is_none() && update_rows.is_empty() {
            return Ok(None);
        }

        let mut head = version;
        let mut updates = Vec::with_capacity(update_rows.len());
        for row in update_rows {
            head = head.max(row.try_get::<i64, _>("seq")?);
            updates.push(row.try_get::<Vec<u8>, _>("payload")?);
        }

        Ok(Some(PersistedDoc { snapshot, version, updates, head }))
    }

    async fn append(&self, doc: &str, origin: Uuid, updates: Vec<Vec<u8>>) -> Result<Vec<i64>, SqlxError> {
        let mut tx = self.pool.begin().await?;
        let mut seqs = Vec::with_capacity(updates.len());
        for update in updates {
            let row = sqlx::query("INSERT INTO doc_updates (name, payload, origin) VALUES ($1, $2, $3) RETURNING seq")
                .bind(doc)
                .bind(update)
                .bind(origin)
                .fetch_one(&mut *tx)
                .await?;
            let seq: i64 = row.try_get("seq")?;

            // Delivered on commit only
            let payload = serde_json::to_string(&NotifyPayload { doc: doc.to_string(), seq, origin })
                .map_err(|e| SqlxError::Protocol(format!("failed to encode notice: {}", e)))?;
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(NOTIFY_CHANNEL)
                .bind(payload)
                .execute(&mut *tx)
                .await?;
            seqs.push(seq);
        }
        tx.commit().await?;
        Ok(seqs)
    }

    async fn save(&self, doc: &str, snapshot: Vec<u8>, version: i64) -> Result<bool, SqlxError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(doc)
            .execute(&mut *tx)
            .await?;

        // A snapshot built on an older base never replaces a newer one; its
        // edits are still in the log past the newer version.
        let upserted = sqlx::query(
            r#"
            INSERT INTO doc_snapshots (name, snapshot, version, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (name) DO UPDATE
            SET snapshot = EXCLUDED.snapshot,
                version = EXCLUDED.version,
                updated_at = NOW()
            WHERE doc_snapshots.version <= EXCLUDED.version
            "#,
        )
        .bind(doc)
        .bind(snapshot)
        .bind(version)
        .execute(&mut *tx)
        .await?;

        let compacted = sqlx::query("DELETE FROM doc_updates WHERE name = $1 AND seq <= $2")
            .bind(doc)
            .bind(version)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        let applied = upserted.rows_affected() > 0;
        if applied {
            info!(
                "Snapshot saved for {} at version {} ({} log entries compacted)",
                doc,
                version,
                compacted.rows_affected()
            );
        } else {
            warn!(
                "Discarded snapshot of {} at version {}: a newer one is stored ({} log entries compacted)",
                doc,
                version,
                compacted.rows_affected()
            );
        }
        Ok(applied)
    }

    async fn log_after(&self, doc: &str, seq: i64) -> Result<Vec<(i64, Vec<u8>)>, SqlxError> {
        let rows = sqlx::query("SELECT seq, payload FROM doc_updates WHERE name = $1 AND seq > $2 ORDER BY seq")
            .bind(doc)
            .bind(seq)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| Ok((row.try_get::<i64, _>("seq")?, row.try_get::<Vec<u8>, _>("payload")?)))
            .collect()
    }

    async fn fetch(&self, doc: &str, seq: i64) -> Result<Option<Vec<u8>>, SqlxError> {
        let row = sqlx::query("SELECT payload FROM doc_updates WHERE name = $1 AND seq = $2")
            .bind(doc)
            .bind(seq)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.try_get::<Vec<u8>, _>("payload")).transpose()
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<UpdateNotice>, SqlxError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(NOTIFY_CHANNEL).await?;
        info!("Listening for document changes on '{}'", NOTIFY_CHANNEL);

        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(async move {
            loop {
                // PgListener reconnects on its own; an error here is logged and we keep going
                let notification = match listener.recv().await {
                    Ok(n) => n,
                    Err(e) => {
                        warn!("Notification listener error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                let payload: NotifyPayload = match serde_json::from_str(notification.payload()) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("Ignoring malformed notification '{}': {}", notification.payload(), e);
                        continue;
                    }
                };
                let notice = UpdateNotice { doc: payload.doc, seq: payload.seq, origin: payload.origin };
                if tx.send(notice).await.is_err() {
                    info!("Notification receiver dropped, stopping listener");
                    break;
                }
            }
        });
        Ok(rx)
    }
}

fn query_error(e: SqlxError) -> StoreError {
    match e {
        SqlxError::PoolTimedOut | SqlxError::PoolClosed | SqlxError::Io(_) => StoreError::Unavailable(e.to_string()),
        other => StoreError::Query(other.to_string()),
    }
}

impl DocStore for PgDocStore {
    fn load<'a>(&'a self, doc: &'a str) -> BoxFuture<'a, StoreResult<Option<PersistedDoc>>> {
        async move { self.load_doc(doc).await.map_err(query_error) }.boxed()
    }

    fn append_updates<'a>(&'a self, doc: &'a str, origin: Uuid, updates: Vec<Vec<u8>>) -> BoxFuture<'a, StoreResult<Vec<i64>>> {
        async move { self.append(doc, origin, updates).await.map_err(query_error) }.boxed()
    }

    fn save_snapshot<'a>(&'a self, doc: &'a str, snapshot: Vec<u8>, version: i64) -> BoxFuture<'a, StoreResult<bool>> {
        async move { self.save(doc, snapshot, version).await.map_err(query_error) }.boxed()
    }

    fn fetch_update<'a>(&'a self, doc: &'a str, seq: i64) -> BoxFuture<'a, StoreResult<Option<Vec<u8>>>> {
        async move { self.fetch(doc, seq).await.map_err(query_error) }.boxed()
    }

    fn updates_after<'a>(&'a self, doc: &'a str, seq: i64) -> BoxFuture<'a, StoreResult<Vec<(i64, Vec<u8>)>>> {
        async move { self.log_after(doc, seq).await.map_err(query_error) }.boxed()
    }

    fn listen(&self) -> BoxFuture<'_, StoreResult<mpsc::Receiver<UpdateNotice>>> {
        async move { self.subscribe().await.map_err(query_error) }.boxed()
    }
}
