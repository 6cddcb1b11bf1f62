//! SQLite message store

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use relay_common::{BatchStatus, Message, MessageBatch, MessageStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use super::sql::{self, MessageRow, SqlArg};
use super::{MessageQuery, MessageStore, StoreTransaction};
use crate::error::StoreError;

pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open the database at `url`, creating the file if it does not exist yet
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self::new(pool))
    }

    /// Get the pool reference
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTransaction { tx }))
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in sql::SCHEMA_SQLITE {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("SQLite relay schema initialized");
        Ok(())
    }
}

pub struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
}

fn bind_args<'q>(
    mut q: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    args: &[SqlArg],
) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for arg in args {
        q = match arg {
            SqlArg::Int(v) => q.bind(*v),
            SqlArg::Text(s) => q.bind(*s),
        };
    }
    q
}

fn parse_row(row: &SqliteRow) -> Result<Message, StoreError> {
    MessageRow {
        id: row.try_get("id")?,
        direction: row.try_get("direction")?,
        status: row.try_get("status")?,
        priority: row.try_get("priority")?,
        text: row.try_get("text")?,
        batch_id: row.try_get("batch_id")?,
        updated_at: row.try_get("updated_at")?,
        identity: row.try_get("identity")?,
        backend: row.try_get("backend")?,
    }
    .into_message()
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn queued_batches(&mut self) -> Result<Vec<MessageBatch>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, status FROM message_batches WHERE status = ? ORDER BY id ASC",
        )
        .bind(BatchStatus::Queued.code())
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter()
            .map(|row| {
                let id: i64 = row.try_get("id")?;
                let code: String = row.try_get("status")?;
                let status = BatchStatus::from_code(&code).ok_or_else(|| {
                    StoreError::Corrupt(format!("batch {} has status '{}'", id, code))
                })?;
                Ok(MessageBatch {
                    id,
                    name: row.try_get("name")?,
                    status,
                })
            })
            .collect()
    }

    async fn find_messages(&mut self, query: &MessageQuery) -> Result<Vec<Message>, StoreError> {
        if query.is_empty_selection() {
            return Ok(Vec::new());
        }

        let (sql, args) = sql::select_messages(query, sql::sqlite_placeholder);
        let rows = bind_args(sqlx::query(&sql), &args)
            .fetch_all(&mut *self.tx)
            .await?;

        let messages = rows.iter().map(parse_row).collect::<Result<Vec<_>, _>>()?;
        debug!(count = messages.len(), "Fetched messages");
        Ok(messages)
    }

    async fn count_messages(&mut self, query: &MessageQuery) -> Result<u64, StoreError> {
        if query.is_empty_selection() {
            return Ok(0);
        }

        let (sql, args) = sql::count_messages(query, sql::sqlite_placeholder);
        let row = bind_args(sqlx::query(&sql), &args)
            .fetch_one(&mut *self.tx)
            .await?;
        let total: i64 = row.try_get("total")?;
        Ok(total as u64)
    }

    async fn update_status(&mut self, ids: &[i64], status: MessageStatus) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let now = Utc::now().timestamp_millis();
        let in_clause = sql::build_in_clause(ids.len(), 3, sql::sqlite_placeholder);
        let query = format!(
            "UPDATE messages SET status = ?, updated_at = ? WHERE id IN ({})",
            in_clause
        );

        let mut q = sqlx::query(&query).bind(status.code()).bind(now);
        for id in ids {
            q = q.bind(*id);
        }
        let result = q.execute(&mut *self.tx).await?;

        debug!(status = %status, count = ids.len(), "Updated message status");
        Ok(result.rows_affected())
    }

    async fn set_batch_status(&mut self, batch_id: i64, status: BatchStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE message_batches SET status = ? WHERE id = ?")
            .bind(status.code())
            .bind(batch_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.tx.rollback().await?;
        Ok(())
    }
}
