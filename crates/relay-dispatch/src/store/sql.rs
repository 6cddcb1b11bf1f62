//! SQL shared by the sqlite and postgres stores

use relay_common::{Connection, Direction, Message, MessageStatus};

use super::{MessageOrder, MessageQuery};
use crate::error::StoreError;

pub(crate) const SCHEMA_SQLITE: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS backends (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS connections (
        id INTEGER PRIMARY KEY,
        backend_id INTEGER NOT NULL REFERENCES backends(id),
        identity TEXT NOT NULL,
        UNIQUE (backend_id, identity)
    )",
    "CREATE TABLE IF NOT EXISTS message_batches (
        id INTEGER PRIMARY KEY,
        name TEXT,
        status TEXT NOT NULL DEFAULT 'Q'
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY,
        direction TEXT NOT NULL,
        status TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 10,
        text TEXT NOT NULL,
        connection_id INTEGER NOT NULL REFERENCES connections(id),
        batch_id INTEGER REFERENCES message_batches(id),
        created_at INTEGER NOT NULL,
        updated_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_direction_status ON messages (direction, status)",
    "CREATE INDEX IF NOT EXISTS idx_messages_batch ON messages (batch_id)",
    "CREATE INDEX IF NOT EXISTS idx_batches_status ON message_batches (status)",
];

pub(crate) const SCHEMA_POSTGRES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS backends (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS connections (
        id BIGSERIAL PRIMARY KEY,
        backend_id BIGINT NOT NULL REFERENCES backends(id),
        identity TEXT NOT NULL,
        UNIQUE (backend_id, identity)
    )",
    "CREATE TABLE IF NOT EXISTS message_batches (
        id BIGSERIAL PRIMARY KEY,
        name TEXT,
        status TEXT NOT NULL DEFAULT 'Q'
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id BIGSERIAL PRIMARY KEY,
        direction TEXT NOT NULL,
        status TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 10,
        text TEXT NOT NULL,
        connection_id BIGINT NOT NULL REFERENCES connections(id),
        batch_id BIGINT REFERENCES message_batches(id),
        created_at BIGINT NOT NULL,
        updated_at BIGINT
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_direction_status ON messages (direction, status)",
    "CREATE INDEX IF NOT EXISTS idx_messages_batch ON messages (batch_id)",
    "CREATE INDEX IF NOT EXISTS idx_batches_status ON message_batches (status)",
];

const MESSAGE_COLUMNS: &str = "m.id, m.direction, m.status, m.priority, m.text, m.batch_id, \
     m.updated_at, c.identity, b.name AS backend";

const MESSAGE_JOIN: &str = "FROM messages m \
     JOIN connections c ON c.id = m.connection_id \
     JOIN backends b ON b.id = c.backend_id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SqlArg {
    Int(i64),
    Text(&'static str),
}

/// `?` for sqlite, `$n` for postgres (1-based)
pub(crate) type Placeholder = fn(usize) -> String;

pub(crate) fn sqlite_placeholder(_: usize) -> String {
    "?".to_string()
}

pub(crate) fn postgres_placeholder(n: usize) -> String {
    format!("${}", n)
}

/// Build a comma separated placeholder list starting at `first`
pub(crate) fn build_in_clause(count: usize, first: usize, placeholder: Placeholder) -> String {
    (first..first + count)
        .map(placeholder)
        .collect::<Vec<_>>()
        .join(", ")
}

fn where_clause(query: &MessageQuery, placeholder: Placeholder, args: &mut Vec<SqlArg>) -> String {
    let mut conditions = Vec::new();

    if let Some(batch_id) = query.batch_id {
        args.push(SqlArg::Int(batch_id));
        conditions.push(format!("m.batch_id = {}", placeholder(args.len())));
    }
    if let Some(ids) = &query.ids {
        let in_clause = build_in_clause(ids.len(), args.len() + 1, placeholder);
        args.extend(ids.iter().map(|id| SqlArg::Int(*id)));
        conditions.push(format!("m.id IN ({})", in_clause));
    }
    if let Some(direction) = query.direction {
        args.push(SqlArg::Text(direction.code()));
        conditions.push(format!("m.direction = {}", placeholder(args.len())));
    }
    if !query.statuses.is_empty() {
        let in_clause = build_in_clause(query.statuses.len(), args.len() + 1, placeholder);
        args.extend(query.statuses.iter().map(|s| SqlArg::Text(s.code())));
        conditions.push(format!("m.status IN ({})", in_clause));
    }

    if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    }
}

pub(crate) fn select_messages(query: &MessageQuery, placeholder: Placeholder) -> (String, Vec<SqlArg>) {
    let mut args = Vec::new();
    let mut sql = format!(
        "SELECT {} {}{}",
        MESSAGE_COLUMNS,
        MESSAGE_JOIN,
        where_clause(query, placeholder, &mut args)
    );

    match query.order {
        MessageOrder::Dispatch => {
            sql.push_str(" ORDER BY m.priority ASC, m.status ASC, b.name ASC, m.text ASC, m.id ASC")
        }
        MessageOrder::Id => sql.push_str(" ORDER BY m.id ASC"),
    }
    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    (sql, args)
}

pub(crate) fn count_messages(query: &MessageQuery, placeholder: Placeholder) -> (String, Vec<SqlArg>) {
    let mut args = Vec::new();
    let sql = format!(
        "SELECT COUNT(*) AS total {}{}",
        MESSAGE_JOIN,
        where_clause(query, placeholder, &mut args)
    );
    (sql, args)
}

/// Raw column values of one message row
pub(crate) struct MessageRow {
    pub id: i64,
    pub direction: String,
    pub status: String,
    pub priority: i32,
    pub text: String,
    pub batch_id: Option<i64>,
    pub updated_at: Option<i64>,
    pub identity: String,
    pub backend: String,
}

impl MessageRow {
    pub fn into_message(self) -> Result<Message, StoreError> {
        let direction = Direction::from_code(&self.direction).ok_or_else(|| {
            StoreError::Corrupt(format!("message {} has direction '{}'", self.id, self.direction))
        })?;
        let status = MessageStatus::from_code(&self.status).ok_or_else(|| {
            StoreError::Corrupt(format!("message {} has status '{}'", self.id, self.status))
        })?;

        Ok(Message {
            id: self.id,
            direction,
            status,
            priority: self.priority,
            text: self.text,
            connection: Connection::new(self.identity, self.backend),
            batch_id: self.batch_id,
            updated_at: self.updated_at.and_then(chrono::DateTime::from_timestamp_millis),
        })
    }
}
