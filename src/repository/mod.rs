//! Abstract persistence for messages, sessions and users.
//!
//! Every operation takes the caller's cancellation token so that transport
//! shutdown can abort in-flight persistence. Implementations must be safe
//! for concurrent use and report missing rows as [`ChatError::NotFound`].

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ChatError;
use crate::model::{Message, MsgStatus, Session, SessionStatus, User};

pub type SharedMessageRepo = Arc<dyn MessageRepository>;
pub type SharedSessionRepo = Arc<dyn SessionRepository>;
pub type SharedUserRepo = Arc<dyn UserRepository>;

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Persist a message. Re-creation with an id that already exists is
    /// idempotent: the stored message is left untouched.
    async fn create(&self, ctx: &CancellationToken, message: &Message) -> Result<(), ChatError>;

    async fn get_by_id(&self, ctx: &CancellationToken, msg_id: &str)
        -> Result<Message, ChatError>;

    /// All messages of a session, ordered by `ts` ascending.
    async fn list_by_session(
        &self,
        ctx: &CancellationToken,
        session_id: &str,
    ) -> Result<Vec<Message>, ChatError>;

    /// Messages in OFFLINE state whose bare recipient is `user_id`.
    async fn list_offline(
        &self,
        ctx: &CancellationToken,
        user_id: &str,
    ) -> Result<Vec<Message>, ChatError>;

    async fn update_status(
        &self,
        ctx: &CancellationToken,
        msg_id: &str,
        status: MsgStatus,
    ) -> Result<(), ChatError>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create(&self, ctx: &CancellationToken, session: &Session) -> Result<(), ChatError>;

    async fn get_by_id(&self, ctx: &CancellationToken, id: &str) -> Result<Session, ChatError>;

    async fn update_status(
        &self,
        ctx: &CancellationToken,
        id: &str,
        status: SessionStatus,
    ) -> Result<(), ChatError>;

    async fn list_active(&self, ctx: &CancellationToken) -> Result<Vec<Session>, ChatError>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Insert or refresh a user record keyed by id.
    async fn upsert(&self, ctx: &CancellationToken, user: &User) -> Result<(), ChatError>;

    async fn get_by_id(&self, ctx: &CancellationToken, id: &str) -> Result<User, ChatError>;

    async fn update_status(
        &self,
        ctx: &CancellationToken,
        id: &str,
        status: crate::model::UserStatus,
    ) -> Result<(), ChatError>;

    async fn list_agents(&self, ctx: &CancellationToken) -> Result<Vec<User>, ChatError>;
}

pub(crate) fn check_cancelled(ctx: &CancellationToken) -> Result<(), ChatError> {
    if ctx.is_cancelled() {
        return Err(ChatError::Cancelled);
    }
    Ok(())
}
