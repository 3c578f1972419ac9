//! First-contact orchestration: mint or reuse a client identity, refresh the
//! user record, open the dialogue session and hand back a bearer token.

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::ChatError;
use crate::ids;
use crate::model::{Session, SessionStatus, User, UserRole, UserStatus};
use crate::repository::{SharedSessionRepo, SharedUserRepo};

/// Result of a successful init: everything the client needs to speak to the
/// socket plane.
#[derive(Debug, Clone)]
pub struct InitUserOutcome {
    pub cland_cid: String,
    pub session_id: String,
    pub sub_session_id: String,
    pub token: String,
}

pub struct UserService {
    users: SharedUserRepo,
    sessions: SharedSessionRepo,
}

impl UserService {
    pub fn new(users: SharedUserRepo, sessions: SharedSessionRepo) -> Self {
        UserService { users, sessions }
    }

    /// Mint or reuse a client id, upsert the user, open a fresh active
    /// session and bind a bearer token.
    ///
    /// At most one session per user stays active: any previous active
    /// session is closed before the new one is stored.
    pub async fn init_user(
        &self,
        ctx: &CancellationToken,
        existing_cid: Option<&str>,
    ) -> Result<InitUserOutcome, ChatError> {
        let cland_cid = match existing_cid {
            Some(cid) if ids::is_valid_client_id(cid) => cid.to_string(),
            _ => ids::generate_client_id(),
        };

        let uuid_part = &cland_cid[1..];
        let user = User {
            id: cland_cid.clone(),
            username: format!("guest_{}", &uuid_part[..6]),
            role: UserRole::Customer,
            status: UserStatus::Online,
            last_active: Utc::now(),
        };
        self.users.upsert(ctx, &user).await?;

        for stale in self.sessions.list_active(ctx).await? {
            if stale.user_id == cland_cid {
                self.sessions
                    .update_status(ctx, &stale.id, SessionStatus::Closed)
                    .await?;
            }
        }

        let session_id = ids::generate_session_id();
        let sub_session_id = ids::generate_sub_session_id();
        let now = Utc::now();
        let session = Session {
            id: session_id.clone(),
            sub_session_id: sub_session_id.clone(),
            user_id: cland_cid.clone(),
            agent_id: String::new(),
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
        };
        self.sessions.create(ctx, &session).await?;

        let token = ids::generate_token(&cland_cid);
        info!(%cland_cid, %session_id, "user initialised");

        Ok(InitUserOutcome {
            cland_cid,
            session_id,
            sub_session_id,
            token,
        })
    }

    /// Open a session for an existing user, assigning the first available
    /// agent if any are provisioned.
    pub async fn create_session(
        &self,
        ctx: &CancellationToken,
        user_id: &str,
    ) -> Result<Session, ChatError> {
        let agents = self.users.list_agents(ctx).await?;
        let agent_id = agents
            .first()
            .map(|agent| agent.id.clone())
            .unwrap_or_default();

        let now = Utc::now();
        let session = Session {
            id: ids::generate_session_id(),
            sub_session_id: ids::generate_sub_session_id(),
            user_id: user_id.to_string(),
            agent_id,
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
        };
        self.sessions.create(ctx, &session).await?;
        Ok(session)
    }

    /// Closing is terminal: a single status edit.
    pub async fn close_session(
        &self,
        ctx: &CancellationToken,
        session_id: &str,
    ) -> Result<(), ChatError> {
        self.sessions
            .update_status(ctx, session_id, SessionStatus::Closed)
            .await
    }
}
