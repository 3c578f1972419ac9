//! In-memory reference implementation of the repository traits.
//!
//! Map-backed stores behind std RW locks; queries are linear scans. This is
//! the default driver and the one the test suites run against.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use super::{check_cancelled, MessageRepository, SessionRepository, UserRepository};
use crate::error::ChatError;
use crate::model::{Address, Message, MsgStatus, Session, SessionStatus, User, UserStatus};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct MemoryMessageRepository {
    store: RwLock<HashMap<String, Message>>,
}

impl MemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageRepository for MemoryMessageRepository {
    async fn create(&self, ctx: &CancellationToken, message: &Message) -> Result<(), ChatError> {
        check_cancelled(ctx)?;
        let mut store = self.store.write().expect("message store poisoned");
        store
            .entry(message.msg_id.clone())
            .or_insert_with(|| message.clone());
        Ok(())
    }

    async fn get_by_id(
        &self,
        ctx: &CancellationToken,
        msg_id: &str,
    ) -> Result<Message, ChatError> {
        check_cancelled(ctx)?;
        let store = self.store.read().expect("message store poisoned");
        store
            .get(msg_id)
            .cloned()
            .ok_or_else(|| ChatError::NotFound(msg_id.to_string()))
    }

    async fn list_by_session(
        &self,
        ctx: &CancellationToken,
        session_id: &str,
    ) -> Result<Vec<Message>, ChatError> {
        check_cancelled(ctx)?;
        let store = self.store.read().expect("message store poisoned");
        let mut messages: Vec<Message> = store
            .values()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.ts);
        Ok(messages)
    }

    async fn list_offline(
        &self,
        ctx: &CancellationToken,
        user_id: &str,
    ) -> Result<Vec<Message>, ChatError> {
        check_cancelled(ctx)?;
        let store = self.store.read().expect("message store poisoned");
        let mut messages: Vec<Message> = store
            .values()
            .filter(|m| {
                m.status == MsgStatus::Offline
                    && Address::parse(&m.dst).direct_id() == Some(user_id)
            })
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.ts);
        Ok(messages)
    }

    async fn update_status(
        &self,
        ctx: &CancellationToken,
        msg_id: &str,
        status: MsgStatus,
    ) -> Result<(), ChatError> {
        check_cancelled(ctx)?;
        let mut store = self.store.write().expect("message store poisoned");
        let message = store
            .get_mut(msg_id)
            .ok_or_else(|| ChatError::NotFound(msg_id.to_string()))?;
        message.status = status;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySessionRepository {
    store: RwLock<HashMap<String, Session>>,
}

impl MemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn create(&self, ctx: &CancellationToken, session: &Session) -> Result<(), ChatError> {
        check_cancelled(ctx)?;
        let mut store = self.store.write().expect("session store poisoned");
        store.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_by_id(&self, ctx: &CancellationToken, id: &str) -> Result<Session, ChatError> {
        check_cancelled(ctx)?;
        let store = self.store.read().expect("session store poisoned");
        store
            .get(id)
            .cloned()
            .ok_or_else(|| ChatError::NotFound(id.to_string()))
    }

    async fn update_status(
        &self,
        ctx: &CancellationToken,
        id: &str,
        status: SessionStatus,
    ) -> Result<(), ChatError> {
        check_cancelled(ctx)?;
        let mut store = self.store.write().expect("session store poisoned");
        let session = store
            .get_mut(id)
            .ok_or_else(|| ChatError::NotFound(id.to_string()))?;
        session.status = status;
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn list_active(&self, ctx: &CancellationToken) -> Result<Vec<Session>, ChatError> {
        check_cancelled(ctx)?;
        let store = self.store.read().expect("session store poisoned");
        Ok(store
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryUserRepository {
    store: RwLock<HashMap<String, User>>,
}

impl MemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn upsert(&self, ctx: &CancellationToken, user: &User) -> Result<(), ChatError> {
        check_cancelled(ctx)?;
        let mut store = self.store.write().expect("user store poisoned");
        store.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn get_by_id(&self, ctx: &CancellationToken, id: &str) -> Result<User, ChatError> {
        check_cancelled(ctx)?;
        let store = self.store.read().expect("user store poisoned");
        store
            .get(id)
            .cloned()
            .ok_or_else(|| ChatError::NotFound(id.to_string()))
    }

    async fn update_status(
        &self,
        ctx: &CancellationToken,
        id: &str,
        status: UserStatus,
    ) -> Result<(), ChatError> {
        check_cancelled(ctx)?;
        let mut store = self.store.write().expect("user store poisoned");
        let user = store
            .get_mut(id)
            .ok_or_else(|| ChatError::NotFound(id.to_string()))?;
        user.status = status;
        user.last_active = Utc::now();
        Ok(())
    }

    async fn list_agents(&self, ctx: &CancellationToken) -> Result<Vec<User>, ChatError> {
        check_cancelled(ctx)?;
        let store = self.store.read().expect("user store poisoned");
        let mut agents: Vec<User> = store
            .values()
            .filter(|u| u.role == crate::model::UserRole::Agent)
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(agents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContentType, MsgType, StringTimestamp, UserRole};
    use std::collections::HashMap as Map;

    fn message(id: &str, session: &str, dst: &str, status: MsgStatus) -> Message {
        Message {
            msg_type: MsgType::Msg,
            session_id: session.into(),
            sub_session_id: String::new(),
            msg_id: id.into(),
            src: "U:c-a".into(),
            dst: dst.into(),
            content: "hi".into(),
            content_type: ContentType::Text,
            ts: StringTimestamp::now(),
            status,
            ext: Map::new(),
        }
    }

    #[tokio::test]
    async fn create_is_write_once() {
        let repo = MemoryMessageRepository::new();
        let ctx = CancellationToken::new();

        let first = message("m-1", "se-1", "U:c-b", MsgStatus::New);
        repo.create(&ctx, &first).await.unwrap();

        let mut second = first.clone();
        second.content = "overwritten".into();
        repo.create(&ctx, &second).await.unwrap();

        let stored = repo.get_by_id(&ctx, "m-1").await.unwrap();
        assert_eq!(stored.content, "hi");
    }

    #[tokio::test]
    async fn missing_rows_are_not_found() {
        let repo = MemoryMessageRepository::new();
        let ctx = CancellationToken::new();
        assert!(matches!(
            repo.get_by_id(&ctx, "m-none").await,
            Err(ChatError::NotFound(_))
        ));
        assert!(matches!(
            repo.update_status(&ctx, "m-none", MsgStatus::Sent).await,
            Err(ChatError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn offline_listing_matches_bare_recipient() {
        let repo = MemoryMessageRepository::new();
        let ctx = CancellationToken::new();
        repo.create(&ctx, &message("m-1", "se-1", "U:c-b", MsgStatus::Offline))
            .await
            .unwrap();
        repo.create(&ctx, &message("m-2", "se-1", "A:c-b", MsgStatus::Offline))
            .await
            .unwrap();
        repo.create(&ctx, &message("m-3", "se-1", "U:c-b", MsgStatus::Sent))
            .await
            .unwrap();
        repo.create(&ctx, &message("m-4", "se-1", "U:c-z", MsgStatus::Offline))
            .await
            .unwrap();

        let offline = repo.list_offline(&ctx, "c-b").await.unwrap();
        let ids: Vec<&str> = offline.iter().map(|m| m.msg_id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"m-1"));
        assert!(ids.contains(&"m-2"));
    }

    #[tokio::test]
    async fn session_listing_sorted_by_ts() {
        let repo = MemoryMessageRepository::new();
        let ctx = CancellationToken::new();
        let mut early = message("m-1", "se-1", "U:c-b", MsgStatus::Sent);
        early.ts = StringTimestamp(100);
        let mut late = message("m-2", "se-1", "U:c-b", MsgStatus::Sent);
        late.ts = StringTimestamp(200);
        repo.create(&ctx, &late).await.unwrap();
        repo.create(&ctx, &early).await.unwrap();

        let listed = repo.list_by_session(&ctx, "se-1").await.unwrap();
        assert_eq!(listed[0].msg_id, "m-1");
        assert_eq!(listed[1].msg_id, "m-2");
    }

    #[tokio::test]
    async fn cancelled_token_aborts_operations() {
        let repo = MemoryMessageRepository::new();
        let ctx = CancellationToken::new();
        ctx.cancel();
        assert!(matches!(
            repo.get_by_id(&ctx, "m-1").await,
            Err(ChatError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn agents_listed_by_role() {
        let repo = MemoryUserRepository::new();
        let ctx = CancellationToken::new();
        let agent = User {
            id: "a-1".into(),
            username: "agent".into(),
            role: UserRole::Agent,
            status: UserStatus::Online,
            last_active: Utc::now(),
        };
        let customer = User {
            id: "c-1".into(),
            username: "guest".into(),
            role: UserRole::Customer,
            status: UserStatus::Online,
            last_active: Utc::now(),
        };
        repo.upsert(&ctx, &agent).await.unwrap();
        repo.upsert(&ctx, &customer).await.unwrap();

        let agents = repo.list_agents(&ctx).await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].id, "a-1");
    }
}
