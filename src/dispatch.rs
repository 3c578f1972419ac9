//! Message dispatcher: validates inbound messages, drives the delivery
//! status machine, persists through the repositories, pushes to connected
//! recipients and demotes to the offline store otherwise.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ChatError;
use crate::model::{Address, Message, MsgStatus, MsgType, StringTimestamp};
use crate::protocol;
use crate::registry::ConnectionRegistry;
use crate::repository::{SharedMessageRepo, SharedSessionRepo};

/// Event name used for server-pushed chat messages.
pub const EVENT_MESSAGE: &str = "message";

pub struct MessageDispatcher {
    messages: SharedMessageRepo,
    sessions: SharedSessionRepo,
    registry: Arc<ConnectionRegistry>,
}

impl MessageDispatcher {
    pub fn new(
        messages: SharedMessageRepo,
        sessions: SharedSessionRepo,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        MessageDispatcher {
            messages,
            sessions,
            registry,
        }
    }

    /// Single entry point for inbound chat traffic. Side effects are
    /// ordered; a failure between steps surfaces to the caller unchanged.
    pub async fn send(&self, ctx: &CancellationToken, mut msg: Message) -> Result<(), ChatError> {
        if msg.ts.is_zero() {
            msg.ts = StringTimestamp::now();
        }
        msg.validate()?;

        match msg.msg_type {
            MsgType::Msg => {
                msg.status = MsgStatus::New;
                self.messages.create(ctx, &msg).await?;
                self.messages
                    .update_status(ctx, &msg.msg_id, MsgStatus::Sent)
                    .await?;
                msg.status = MsgStatus::Sent;
                self.push(ctx, &msg).await
            }
            MsgType::Ntf => {
                // An "init" notification bootstraps the session, so it is
                // the one write allowed before the session exists.
                if msg.content != "init" {
                    self.sessions
                        .get_by_id(ctx, &msg.session_id)
                        .await
                        .map_err(|err| match err {
                            ChatError::NotFound(_) => {
                                ChatError::SessionNotFound(msg.session_id.clone())
                            }
                            other => other,
                        })?;
                }
                msg.status = MsgStatus::New;
                self.messages.create(ctx, &msg).await
            }
            MsgType::Ack => self.acknowledge(ctx, &msg.msg_id).await,
        }
    }

    /// Advance the acknowledged message to READ along listed edges only.
    ///
    /// NEW and SENT originals pass through DELIVERED on their way to READ
    /// (NEW additionally through SENT); a DELIVERED original goes straight
    /// to READ. Any other state rejects the ack and leaves the store
    /// untouched.
    async fn acknowledge(&self, ctx: &CancellationToken, msg_id: &str) -> Result<(), ChatError> {
        let original = self.messages.get_by_id(ctx, msg_id).await?;

        let chain: &[MsgStatus] = match original.status {
            MsgStatus::New => &[MsgStatus::Sent, MsgStatus::Delivered, MsgStatus::Read],
            MsgStatus::Sent => &[MsgStatus::Delivered, MsgStatus::Read],
            MsgStatus::Delivered => &[MsgStatus::Read],
            other => {
                return Err(ChatError::InvalidTransition {
                    from: other.as_u8(),
                    to: MsgStatus::Read.as_u8(),
                })
            }
        };

        for status in chain {
            self.messages.update_status(ctx, msg_id, *status).await?;
        }
        debug!(msg_id, "message acknowledged");
        Ok(())
    }

    /// Push a stored message to its recipient. The wire copy is marked
    /// DELIVERED; the stored copy is demoted to OFFLINE only when a direct
    /// recipient has no live connection. Room addresses fan out to current
    /// membership and are never demoted.
    async fn push(&self, ctx: &CancellationToken, msg: &Message) -> Result<(), ChatError> {
        let mut wire_copy = msg.clone();
        wire_copy.status = MsgStatus::Delivered;
        let payload = serde_json::to_value(&wire_copy)
            .map_err(|e| ChatError::Persistence(e.to_string()))?;
        let frame = protocol::encode_event(EVENT_MESSAGE, payload);

        match Address::parse(&msg.dst) {
            Address::Room(room_id) => {
                if let Err(err) = self.registry.broadcast_to_room(room_id, &frame) {
                    warn!(room_id, %err, "room fan-out had failed recipients");
                }
                Ok(())
            }
            Address::Direct(recipient) => match self.registry.send(recipient, frame) {
                Ok(()) => Ok(()),
                Err(ChatError::UserNotConnected(_)) => {
                    debug!(recipient, msg_id = %msg.msg_id, "recipient offline, demoting");
                    self.messages
                        .update_status(ctx, &msg.msg_id, MsgStatus::Offline)
                        .await
                }
                Err(other) => Err(other),
            },
        }
    }

    /// Session history with the read-side status rewrite: DELIVERED reads as
    /// READ, NEW and SENT read as HISTORY. The store is not modified.
    pub async fn get_session_messages(
        &self,
        ctx: &CancellationToken,
        session_id: &str,
    ) -> Result<Vec<Message>, ChatError> {
        let mut messages = self.messages.list_by_session(ctx, session_id).await?;
        for message in &mut messages {
            message.status = match message.status {
                MsgStatus::Delivered => MsgStatus::Read,
                MsgStatus::New | MsgStatus::Sent => MsgStatus::History,
                other => other,
            };
        }
        Ok(messages)
    }

    /// Drain the offline inbox: each OFFLINE message for `user_id` is moved
    /// to DELIVERED and returned. Messages whose transition write fails are
    /// skipped silently; the next poll retries them.
    pub async fn get_offline_messages(
        &self,
        ctx: &CancellationToken,
        user_id: &str,
    ) -> Result<Vec<Message>, ChatError> {
        let offline = self.messages.list_offline(ctx, user_id).await?;
        let mut drained = Vec::with_capacity(offline.len());
        for mut message in offline {
            match self
                .messages
                .update_status(ctx, &message.msg_id, MsgStatus::Delivered)
                .await
            {
                Ok(()) => {
                    message.status = MsgStatus::Delivered;
                    drained.push(message);
                }
                Err(err) => {
                    debug!(msg_id = %message.msg_id, %err, "offline drain skipped message");
                }
            }
        }
        Ok(drained)
    }

    /// Admin override: recall a message from any non-terminal state.
    pub async fn recall(&self, ctx: &CancellationToken, msg_id: &str) -> Result<(), ChatError> {
        let original = self.messages.get_by_id(ctx, msg_id).await?;
        if !original.status.can_transition_to(MsgStatus::Recall) {
            return Err(ChatError::InvalidTransition {
                from: original.status.as_u8(),
                to: MsgStatus::Recall.as_u8(),
            });
        }
        self.messages
            .update_status(ctx, msg_id, MsgStatus::Recall)
            .await
    }
}
