//! SQLite-backed provider with transactional ack.
//!
//! Every mutating operation that must be atomic (claiming a batch,
//! committing a turn) runs inside one transaction, so a crash between
//! statements can never leave a half-committed turn behind. Queue rows
//! are peek-locked via a `lock_token` column; instance leases carry a
//! `locked_until` deadline so a dead worker's claim expires instead of
//! wedging the instance.

use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::{
    ExecutionMetadata, InstanceSnapshot, InstanceStatus, OrchestrationItem, Provider, ProviderError, WorkItem,
    now_millis,
};
use crate::Event;
use async_trait::async_trait;

const DEFAULT_LOCK_TIMEOUT_MS: i64 = 30_000;

/// Durable provider on a SQLite database (file or in-memory).
pub struct SqliteProvider {
    pool: SqlitePool,
    lock_timeout_ms: i64,
    token_seq: AtomicU64,
}

impl SqliteProvider {
    /// Open (and bootstrap) a database at `url`, e.g.
    /// `sqlite:/var/lib/app/state.db`. The file is created when missing.
    pub async fn new(url: &str) -> Result<Self, ProviderError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| Self::map_err("connect", e))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| Self::map_err("connect", e))?;
        Self::from_pool(pool).await
    }

    /// Private in-memory database; a single pooled connection keeps it
    /// alive for the provider's lifetime.
    pub async fn new_in_memory() -> Result<Self, ProviderError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| Self::map_err("connect", e))?
            .journal_mode(SqliteJournalMode::Memory);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| Self::map_err("connect", e))?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, ProviderError> {
        let provider = Self {
            pool,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            token_seq: AtomicU64::new(0),
        };
        provider.create_schema().await?;
        Ok(provider)
    }

    /// Override the instance lease duration (tests use short leases).
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout_ms = lock_timeout.as_millis().min(i64::MAX as u128) as i64;
        self
    }

    fn map_err(operation: &str, e: sqlx::Error) -> ProviderError {
        let message = e.to_string();
        if message.contains("database is locked") || message.contains("SQLITE_BUSY") {
            return ProviderError::retryable(operation, message);
        }
        if message.contains("UNIQUE constraint") || message.contains("PRIMARY KEY") {
            return ProviderError::permanent(operation, message);
        }
        // Conservative default: connection-ish failures deserve a retry.
        ProviderError::retryable(operation, message)
    }

    fn next_token(&self, prefix: &str) -> String {
        let seq = self.token_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{prefix}:{}:{}", now_millis(), seq)
    }

    async fn create_schema(&self) -> Result<(), ProviderError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance TEXT PRIMARY KEY,
                orchestration TEXT NOT NULL,
                status TEXT NOT NULL,
                output TEXT,
                custom_status TEXT,
                custom_status_version INTEGER NOT NULL DEFAULT 0,
                lock_token TEXT,
                locked_until INTEGER NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS history (
                instance TEXT NOT NULL,
                seq INTEGER NOT NULL,
                event TEXT NOT NULL,
                PRIMARY KEY (instance, seq)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS orchestrator_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance TEXT NOT NULL,
                work_item TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                lock_token TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS worker_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                work_item TEXT NOT NULL,
                lock_token TEXT,
                locked_until INTEGER NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS timer_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                work_item TEXT NOT NULL,
                lock_token TEXT,
                locked_until INTEGER NOT NULL DEFAULT 0
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_orch_visible ON orchestrator_queue(visible_at, lock_token)",
            "CREATE INDEX IF NOT EXISTS idx_orch_instance ON orchestrator_queue(instance)",
        ];
        for stmt in statements {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| Self::map_err("create_schema", e))?;
        }
        Ok(())
    }

    fn encode_item(operation: &str, item: &WorkItem) -> Result<String, ProviderError> {
        serde_json::to_string(item).map_err(|e| ProviderError::permanent(operation, format!("encode work item: {e}")))
    }

    fn decode_item(operation: &str, raw: &str) -> Result<WorkItem, ProviderError> {
        serde_json::from_str(raw).map_err(|e| ProviderError::permanent(operation, format!("decode work item: {e}")))
    }

    fn decode_event(operation: &str, raw: &str) -> Result<Event, ProviderError> {
        serde_json::from_str(raw).map_err(|e| ProviderError::permanent(operation, format!("decode event: {e}")))
    }

    async fn dequeue_simple(&self, table: &str, prefix: &str) -> Option<(WorkItem, String)> {
        let now = now_millis() as i64;
        let mut tx = self.pool.begin().await.ok()?;
        // Expired locks are claimable again; the stale token's ack then
        // deletes nothing, leaving at-least-once delivery for the runtime's
        // history-level dedupe to absorb.
        let row = sqlx::query(&format!(
            "SELECT id, work_item FROM {table} \
             WHERE lock_token IS NULL OR locked_until < ? ORDER BY id LIMIT 1"
        ))
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .ok()??;
        let id: i64 = row.get("id");
        let raw: String = row.get("work_item");
        let token = self.next_token(prefix);
        sqlx::query(&format!("UPDATE {table} SET lock_token = ?, locked_until = ? WHERE id = ?"))
            .bind(&token)
            .bind(now + self.lock_timeout_ms)
            .bind(id)
            .execute(&mut *tx)
            .await
            .ok()?;
        tx.commit().await.ok()?;
        let item = Self::decode_item("dequeue_peek_lock", &raw).ok()?;
        Some((item, token))
    }

    async fn ack_simple(&self, table: &str, token: &str) -> Result<(), ProviderError> {
        sqlx::query(&format!("DELETE FROM {table} WHERE lock_token = ?"))
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::map_err("ack", e))?;
        Ok(())
    }

    async fn abandon_simple(&self, table: &str, token: &str) -> Result<(), ProviderError> {
        sqlx::query(&format!("UPDATE {table} SET lock_token = NULL WHERE lock_token = ?"))
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::map_err("abandon", e))?;
        Ok(())
    }
}

#[async_trait]
impl Provider for SqliteProvider {
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let rows = sqlx::query("SELECT event FROM history WHERE instance = ? ORDER BY seq")
            .bind(instance)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::map_err("read", e))?;
        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.get("event");
            events.push(Self::decode_event("read", &raw)?);
        }
        Ok(events)
    }

    async fn get_instance(&self, instance: &str) -> Result<Option<InstanceSnapshot>, ProviderError> {
        let row = sqlx::query(
            "SELECT orchestration, status, output, custom_status, custom_status_version \
             FROM instances WHERE instance = ?",
        )
        .bind(instance)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::map_err("get_instance", e))?;
        let Some(row) = row else { return Ok(None) };
        let status_raw: String = row.get("status");
        let status = InstanceStatus::parse(&status_raw)
            .ok_or_else(|| ProviderError::permanent("get_instance", format!("bad status: {status_raw}")))?;
        Ok(Some(InstanceSnapshot {
            instance: instance.to_string(),
            orchestration: row.get("orchestration"),
            status,
            output: row.get("output"),
            custom_status: row.get("custom_status"),
            custom_status_version: row.get::<i64, _>("custom_status_version").max(0) as u64,
        }))
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let rows = sqlx::query("SELECT instance FROM instances ORDER BY instance")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::map_err("list_instances", e))?;
        Ok(rows.iter().map(|r| r.get("instance")).collect())
    }

    async fn enqueue_orchestrator_work(
        &self,
        item: WorkItem,
        visible_in: Option<Duration>,
    ) -> Result<(), ProviderError> {
        let op = "enqueue_orchestrator_work";
        let payload = Self::encode_item(op, &item)?;
        let visible_at =
            now_millis() as i64 + visible_in.map(|d| d.as_millis().min(i64::MAX as u128) as i64).unwrap_or(0);

        let mut tx = self.pool.begin().await.map_err(|e| Self::map_err(op, e))?;
        if let WorkItem::StartOrchestration { instance, orchestration, .. } = &item {
            let existing = sqlx::query("SELECT instance FROM instances WHERE instance = ?")
                .bind(instance)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| Self::map_err(op, e))?;
            if existing.is_some() {
                return Err(ProviderError::permanent(op, format!("instance already exists: {instance}")));
            }
            sqlx::query("INSERT INTO instances (instance, orchestration, status) VALUES (?, ?, 'Pending')")
                .bind(instance)
                .bind(orchestration)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::map_err(op, e))?;
        }
        sqlx::query("INSERT INTO orchestrator_queue (instance, work_item, visible_at) VALUES (?, ?, ?)")
            .bind(item.instance())
            .bind(&payload)
            .bind(visible_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::map_err(op, e))?;
        tx.commit().await.map_err(|e| Self::map_err(op, e))
    }

    async fn fetch_orchestration_item(&self) -> Option<OrchestrationItem> {
        let now = now_millis() as i64;
        let mut tx = self.pool.begin().await.ok()?;

        // Expired leases: free the queue rows first, then the instances.
        sqlx::query(
            "UPDATE orchestrator_queue SET lock_token = NULL, visible_at = ? \
             WHERE lock_token IN (SELECT lock_token FROM instances \
                                  WHERE lock_token IS NOT NULL AND locked_until < ?)",
        )
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .ok()?;
        sqlx::query("UPDATE instances SET lock_token = NULL, locked_until = 0 \
                     WHERE lock_token IS NOT NULL AND locked_until < ?")
            .bind(now)
            .execute(&mut *tx)
            .await
            .ok()?;

        let chosen = sqlx::query(
            "SELECT q.instance AS instance FROM orchestrator_queue q \
             JOIN instances i ON i.instance = q.instance \
             WHERE q.visible_at <= ? AND q.lock_token IS NULL AND i.lock_token IS NULL \
             ORDER BY q.id LIMIT 1",
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .ok()??;
        let instance: String = chosen.get("instance");

        let token = self.next_token("orch");
        sqlx::query(
            "UPDATE orchestrator_queue SET lock_token = ? \
             WHERE instance = ? AND visible_at <= ? AND lock_token IS NULL",
        )
        .bind(&token)
        .bind(&instance)
        .bind(now)
        .execute(&mut *tx)
        .await
        .ok()?;
        sqlx::query(
            "UPDATE instances SET lock_token = ?, locked_until = ?, \
             status = CASE WHEN status IN ('Completed','Failed') THEN status ELSE 'Running' END \
             WHERE instance = ?",
        )
        .bind(&token)
        .bind(now + self.lock_timeout_ms)
        .bind(&instance)
        .execute(&mut *tx)
        .await
        .ok()?;

        let message_rows = sqlx::query("SELECT work_item FROM orchestrator_queue WHERE lock_token = ? ORDER BY id")
            .bind(&token)
            .fetch_all(&mut *tx)
            .await
            .ok()?;
        let history_rows = sqlx::query("SELECT event FROM history WHERE instance = ? ORDER BY seq")
            .bind(&instance)
            .fetch_all(&mut *tx)
            .await
            .ok()?;
        tx.commit().await.ok()?;

        let mut messages = Vec::with_capacity(message_rows.len());
        for row in &message_rows {
            let raw: String = row.get("work_item");
            messages.push(Self::decode_item("fetch_orchestration_item", &raw).ok()?);
        }
        let mut history = Vec::with_capacity(history_rows.len());
        for row in &history_rows {
            let raw: String = row.get("event");
            history.push(Self::decode_event("fetch_orchestration_item", &raw).ok()?);
        }

        Some(OrchestrationItem {
            instance,
            history,
            messages,
            lock_token: token,
        })
    }

    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) -> Result<(), ProviderError> {
        let op = "ack_orchestration_item";
        let mut tx = self.pool.begin().await.map_err(|e| Self::map_err(op, e))?;

        let row = sqlx::query("SELECT instance FROM instances WHERE lock_token = ?")
            .bind(lock_token)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Self::map_err(op, e))?;
        let Some(row) = row else {
            return Err(ProviderError::permanent(op, format!("stale or unknown lock token: {lock_token}")));
        };
        let instance: String = row.get("instance");

        let max_seq: i64 = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS s FROM history WHERE instance = ?")
            .bind(&instance)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| Self::map_err(op, e))?
            .get("s");
        for (i, event) in history_delta.iter().enumerate() {
            let raw = serde_json::to_string(event)
                .map_err(|e| ProviderError::permanent(op, format!("encode event: {e}")))?;
            sqlx::query("INSERT INTO history (instance, seq, event) VALUES (?, ?, ?)")
                .bind(&instance)
                .bind(max_seq + 1 + i as i64)
                .bind(raw)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::map_err(op, e))?;
        }

        if let Some(status) = metadata.status {
            sqlx::query(
                "UPDATE instances SET status = \
                 CASE WHEN status IN ('Completed','Failed') THEN status ELSE ? END \
                 WHERE instance = ?",
            )
            .bind(status.as_str())
            .bind(&instance)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::map_err(op, e))?;
        }
        if let Some(output) = &metadata.output {
            sqlx::query("UPDATE instances SET output = ? WHERE instance = ?")
                .bind(output)
                .bind(&instance)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::map_err(op, e))?;
        }
        if let Some(view) = &metadata.custom_status {
            sqlx::query("UPDATE instances SET custom_status = ? WHERE instance = ?")
                .bind(view.as_deref())
                .bind(&instance)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::map_err(op, e))?;
        }
        if metadata.custom_status_bumps > 0 {
            sqlx::query("UPDATE instances SET custom_status_version = custom_status_version + ? WHERE instance = ?")
                .bind(metadata.custom_status_bumps.min(i64::MAX as u64) as i64)
                .bind(&instance)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::map_err(op, e))?;
        }

        sqlx::query("DELETE FROM orchestrator_queue WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::map_err(op, e))?;
        sqlx::query("UPDATE instances SET lock_token = NULL, locked_until = 0 WHERE instance = ?")
            .bind(&instance)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::map_err(op, e))?;

        for item in &worker_items {
            sqlx::query("INSERT INTO worker_queue (work_item) VALUES (?)")
                .bind(Self::encode_item(op, item)?)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::map_err(op, e))?;
        }
        for item in &timer_items {
            sqlx::query("INSERT INTO timer_queue (work_item) VALUES (?)")
                .bind(Self::encode_item(op, item)?)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::map_err(op, e))?;
        }

        tx.commit().await.map_err(|e| Self::map_err(op, e))
    }

    async fn abandon_orchestration_item(
        &self,
        lock_token: &str,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError> {
        let op = "abandon_orchestration_item";
        let visible_at =
            now_millis() as i64 + delay.map(|d| d.as_millis().min(i64::MAX as u128) as i64).unwrap_or(0);
        let mut tx = self.pool.begin().await.map_err(|e| Self::map_err(op, e))?;
        sqlx::query("UPDATE orchestrator_queue SET lock_token = NULL, visible_at = ? WHERE lock_token = ?")
            .bind(visible_at)
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::map_err(op, e))?;
        sqlx::query(
            "UPDATE instances SET lock_token = NULL, locked_until = 0, \
             status = CASE WHEN status = 'Running' THEN 'Suspended' ELSE status END \
             WHERE lock_token = ?",
        )
        .bind(lock_token)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::map_err(op, e))?;
        tx.commit().await.map_err(|e| Self::map_err(op, e))
    }

    async fn dequeue_worker_peek_lock(&self) -> Option<(WorkItem, String)> {
        self.dequeue_simple("worker_queue", "work").await
    }

    async fn ack_worker(&self, token: &str) -> Result<(), ProviderError> {
        self.ack_simple("worker_queue", token).await
    }

    async fn abandon_worker(&self, token: &str) -> Result<(), ProviderError> {
        self.abandon_simple("worker_queue", token).await
    }

    async fn dequeue_timer_peek_lock(&self) -> Option<(WorkItem, String)> {
        self.dequeue_simple("timer_queue", "timer").await
    }

    async fn ack_timer(&self, token: &str) -> Result<(), ProviderError> {
        self.ack_simple("timer_queue", token).await
    }

    async fn abandon_timer(&self, token: &str) -> Result<(), ProviderError> {
        self.abandon_simple("timer_queue", token).await
    }
}
