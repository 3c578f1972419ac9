//! SQLite implementation of the repository traits over the
//! `t_chat_message` / `t_session` / `t_user` schema.
//!
//! Rows are soft-deleted via `is_deleted`; `ext` is stored as a JSON blob;
//! `ts` is the Unix-millisecond integer. Every query races the caller's
//! cancellation token.

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{MessageRepository, SessionRepository, UserRepository};
use crate::error::ChatError;
use crate::model::{
    ContentType, Message, MsgStatus, MsgType, Session, SessionStatus, StringTimestamp, User,
    UserRole, UserStatus,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS t_chat_message (
    msg_id         TEXT PRIMARY KEY,
    session_id     TEXT NOT NULL,
    sub_session_id TEXT NOT NULL DEFAULT '',
    msg_type       INTEGER NOT NULL,
    src            TEXT NOT NULL,
    dst            TEXT NOT NULL,
    content        TEXT NOT NULL DEFAULT '',
    content_type   INTEGER NOT NULL,
    ts             INTEGER NOT NULL,
    status         INTEGER NOT NULL,
    ext            TEXT NOT NULL DEFAULT '{}',
    is_deleted     INTEGER NOT NULL DEFAULT 0,
    created_at     DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at     DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_chat_message_session ON t_chat_message (session_id, ts);
CREATE INDEX IF NOT EXISTS idx_chat_message_dst_status ON t_chat_message (dst, status);

CREATE TABLE IF NOT EXISTS t_session (
    session_id     TEXT PRIMARY KEY,
    sub_session_id TEXT NOT NULL DEFAULT '',
    user_id        TEXT NOT NULL,
    agent_id       TEXT NOT NULL DEFAULT '',
    status         TEXT NOT NULL,
    is_deleted     INTEGER NOT NULL DEFAULT 0,
    created_at     DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at     DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_session_user ON t_session (user_id, status);

CREATE TABLE IF NOT EXISTS t_user (
    id          TEXT PRIMARY KEY,
    username    TEXT NOT NULL,
    role        TEXT NOT NULL,
    status      TEXT NOT NULL,
    last_active DATETIME NOT NULL,
    is_deleted  INTEGER NOT NULL DEFAULT 0,
    created_at  DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at  DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#;

/// Shared SQLite handle backing all three repositories.
#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    /// Open (creating if absent) the database and bootstrap the schema.
    pub async fn connect(path: &str) -> Result<Self, ChatError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))
            .map_err(|e| ChatError::Persistence(e.to_string()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&pool).await?;
        }
        info!(path, "sqlite repository ready");
        Ok(SqliteRepository { pool })
    }
}

/// Race a query against the caller's cancellation token.
async fn run<T, F>(ctx: &CancellationToken, fut: F) -> Result<T, ChatError>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(ChatError::Cancelled),
        result = fut => result.map_err(ChatError::from),
    }
}

fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Message, ChatError> {
    let msg_type: i64 = row.try_get("msg_type")?;
    let content_type: i64 = row.try_get("content_type")?;
    let status: i64 = row.try_get("status")?;
    let ext_raw: String = row.try_get("ext")?;
    let ext: HashMap<String, serde_json::Value> =
        serde_json::from_str(&ext_raw).unwrap_or_default();

    Ok(Message {
        msg_type: MsgType::from_u8(msg_type as u8)
            .ok_or_else(|| ChatError::Persistence(format!("bad msg_type {msg_type}")))?,
        session_id: row.try_get("session_id")?,
        sub_session_id: row.try_get("sub_session_id")?,
        msg_id: row.try_get("msg_id")?,
        src: row.try_get("src")?,
        dst: row.try_get("dst")?,
        content: row.try_get("content")?,
        content_type: ContentType::from_u8(content_type as u8)
            .ok_or_else(|| ChatError::Persistence(format!("bad content_type {content_type}")))?,
        ts: StringTimestamp(row.try_get::<i64, _>("ts")?),
        status: MsgStatus::from_u8(status as u8)
            .ok_or_else(|| ChatError::Persistence(format!("bad status {status}")))?,
        ext,
    })
}

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Session, ChatError> {
    let status: String = row.try_get("status")?;
    Ok(Session {
        id: row.try_get("session_id")?,
        sub_session_id: row.try_get("sub_session_id")?,
        user_id: row.try_get("user_id")?,
        agent_id: row.try_get("agent_id")?,
        status: SessionStatus::parse(&status)
            .ok_or_else(|| ChatError::Persistence(format!("bad session status {status}")))?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<User, ChatError> {
    let role: String = row.try_get("role")?;
    let status: String = row.try_get("status")?;
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        role: UserRole::parse(&role)
            .ok_or_else(|| ChatError::Persistence(format!("bad role {role}")))?,
        status: UserStatus::parse(&status)
            .ok_or_else(|| ChatError::Persistence(format!("bad user status {status}")))?,
        last_active: row.try_get::<DateTime<Utc>, _>("last_active")?,
    })
}

#[async_trait]
impl MessageRepository for SqliteRepository {
    async fn create(&self, ctx: &CancellationToken, message: &Message) -> Result<(), ChatError> {
        let ext = serde_json::to_string(&message.ext)
            .map_err(|e| ChatError::Persistence(e.to_string()))?;
        let query = sqlx::query(
            "INSERT INTO t_chat_message \
             (msg_id, session_id, sub_session_id, msg_type, src, dst, content, content_type, ts, status, ext) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (msg_id) DO NOTHING",
        )
        .bind(&message.msg_id)
        .bind(&message.session_id)
        .bind(&message.sub_session_id)
        .bind(message.msg_type.as_u8() as i64)
        .bind(&message.src)
        .bind(&message.dst)
        .bind(&message.content)
        .bind(message.content_type.as_u8() as i64)
        .bind(message.ts.0)
        .bind(message.status.as_u8() as i64)
        .bind(ext)
        .execute(&self.pool);

        run(ctx, query).await?;
        Ok(())
    }

    async fn get_by_id(
        &self,
        ctx: &CancellationToken,
        msg_id: &str,
    ) -> Result<Message, ChatError> {
        let query = sqlx::query(
            "SELECT msg_id, session_id, sub_session_id, msg_type, src, dst, content, \
             content_type, ts, status, ext \
             FROM t_chat_message WHERE msg_id = ? AND is_deleted = 0",
        )
        .bind(msg_id)
        .fetch_optional(&self.pool);

        let row = run(ctx, query)
            .await?
            .ok_or_else(|| ChatError::NotFound(msg_id.to_string()))?;
        message_from_row(&row)
    }

    async fn list_by_session(
        &self,
        ctx: &CancellationToken,
        session_id: &str,
    ) -> Result<Vec<Message>, ChatError> {
        let query = sqlx::query(
            "SELECT msg_id, session_id, sub_session_id, msg_type, src, dst, content, \
             content_type, ts, status, ext \
             FROM t_chat_message WHERE session_id = ? AND is_deleted = 0 ORDER BY ts ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool);

        let rows = run(ctx, query).await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn list_offline(
        &self,
        ctx: &CancellationToken,
        user_id: &str,
    ) -> Result<Vec<Message>, ChatError> {
        // The stored dst carries its address tag, so match every tagged form
        // of the bare recipient id.
        let query = sqlx::query(
            "SELECT msg_id, session_id, sub_session_id, msg_type, src, dst, content, \
             content_type, ts, status, ext \
             FROM t_chat_message \
             WHERE status = ? AND is_deleted = 0 \
               AND dst IN ('U:' || ?, 'A:' || ?, 'S:' || ?, 'UA:' || ?, ?) \
             ORDER BY ts ASC",
        )
        .bind(MsgStatus::Offline.as_u8() as i64)
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool);

        let rows = run(ctx, query).await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn update_status(
        &self,
        ctx: &CancellationToken,
        msg_id: &str,
        status: MsgStatus,
    ) -> Result<(), ChatError> {
        let query = sqlx::query(
            "UPDATE t_chat_message SET status = ?, updated_at = CURRENT_TIMESTAMP \
             WHERE msg_id = ? AND is_deleted = 0",
        )
        .bind(status.as_u8() as i64)
        .bind(msg_id)
        .execute(&self.pool);

        let result = run(ctx, query).await?;
        if result.rows_affected() == 0 {
            return Err(ChatError::NotFound(msg_id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionRepository for SqliteRepository {
    async fn create(&self, ctx: &CancellationToken, session: &Session) -> Result<(), ChatError> {
        let query = sqlx::query(
            "INSERT INTO t_session \
             (session_id, sub_session_id, user_id, agent_id, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.sub_session_id)
        .bind(&session.user_id)
        .bind(&session.agent_id)
        .bind(session.status.as_str())
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool);

        run(ctx, query).await?;
        Ok(())
    }

    async fn get_by_id(&self, ctx: &CancellationToken, id: &str) -> Result<Session, ChatError> {
        let query = sqlx::query(
            "SELECT session_id, sub_session_id, user_id, agent_id, status, created_at, updated_at \
             FROM t_session WHERE session_id = ? AND is_deleted = 0",
        )
        .bind(id)
        .fetch_optional(&self.pool);

        let row = run(ctx, query)
            .await?
            .ok_or_else(|| ChatError::NotFound(id.to_string()))?;
        session_from_row(&row)
    }

    async fn update_status(
        &self,
        ctx: &CancellationToken,
        id: &str,
        status: SessionStatus,
    ) -> Result<(), ChatError> {
        let query = sqlx::query(
            "UPDATE t_session SET status = ?, updated_at = CURRENT_TIMESTAMP \
             WHERE session_id = ? AND is_deleted = 0",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool);

        let result = run(ctx, query).await?;
        if result.rows_affected() == 0 {
            return Err(ChatError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list_active(&self, ctx: &CancellationToken) -> Result<Vec<Session>, ChatError> {
        let query = sqlx::query(
            "SELECT session_id, sub_session_id, user_id, agent_id, status, created_at, updated_at \
             FROM t_session WHERE status = 'active' AND is_deleted = 0",
        )
        .fetch_all(&self.pool);

        let rows = run(ctx, query).await?;
        rows.iter().map(session_from_row).collect()
    }
}

#[async_trait]
impl UserRepository for SqliteRepository {
    async fn upsert(&self, ctx: &CancellationToken, user: &User) -> Result<(), ChatError> {
        let query = sqlx::query(
            "INSERT INTO t_user (id, username, role, status, last_active) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET \
               username = excluded.username, \
               status = excluded.status, \
               last_active = excluded.last_active, \
               updated_at = CURRENT_TIMESTAMP",
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(user.role.as_str())
        .bind(user.status.as_str())
        .bind(user.last_active)
        .execute(&self.pool);

        run(ctx, query).await?;
        Ok(())
    }

    async fn get_by_id(&self, ctx: &CancellationToken, id: &str) -> Result<User, ChatError> {
        let query = sqlx::query(
            "SELECT id, username, role, status, last_active \
             FROM t_user WHERE id = ? AND is_deleted = 0",
        )
        .bind(id)
        .fetch_optional(&self.pool);

        let row = run(ctx, query)
            .await?
            .ok_or_else(|| ChatError::NotFound(id.to_string()))?;
        user_from_row(&row)
    }

    async fn update_status(
        &self,
        ctx: &CancellationToken,
        id: &str,
        status: UserStatus,
    ) -> Result<(), ChatError> {
        let query = sqlx::query(
            "UPDATE t_user SET status = ?, last_active = ?, updated_at = CURRENT_TIMESTAMP \
             WHERE id = ? AND is_deleted = 0",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool);

        let result = run(ctx, query).await?;
        if result.rows_affected() == 0 {
            return Err(ChatError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list_agents(&self, ctx: &CancellationToken) -> Result<Vec<User>, ChatError> {
        let query = sqlx::query(
            "SELECT id, username, role, status, last_active \
             FROM t_user WHERE role = 'agent' AND is_deleted = 0 ORDER BY id",
        )
        .fetch_all(&self.pool);

        let rows = run(ctx, query).await?;
        rows.iter().map(user_from_row).collect()
    }
}
