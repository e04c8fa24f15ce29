//! Inbound pipeline: records direct messages and hands them to the bot.
//!
//! Flow for one message, always on its session's worker:
//! 1. Filter group, self-echo and empty messages
//! 2. Resolve the conversation, append the message, update the preview
//! 3. Publish `message_received`
//! 4. Evaluate bot rules and schedule the reply, if any

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bot::cache::BotConfigCache;
use crate::bot::responder::BotResponder;
use crate::bot::rules::{self, BotDecision};
use crate::error::DatabaseError;
use crate::events::{EventPublisher, SessionEvent};
use crate::pipeline::preview;
use crate::store::traits::{
    Conversation, ConversationStatus, Database, DeliveryStatus, Direction, NewMessage,
    StoredMessage,
};
use crate::transport::{RawInbound, normalize_address};

/// Why an inbound event was dropped without a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    Group,
    FromSelf,
    EmptyBody,
}

/// Result of processing one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    Discarded(DiscardReason),
    Recorded {
        message: StoredMessage,
        /// Reply scheduled by the bot, if one matched.
        reply: Option<BotDecision>,
    },
}

pub struct InboundPipeline {
    db: Arc<dyn Database>,
    events: Arc<dyn EventPublisher>,
    bot_configs: Arc<BotConfigCache>,
    responder: BotResponder,
}

impl InboundPipeline {
    pub fn new(
        db: Arc<dyn Database>,
        events: Arc<dyn EventPublisher>,
        bot_configs: Arc<BotConfigCache>,
        responder: BotResponder,
    ) -> Self {
        Self {
            db,
            events,
            bot_configs,
            responder,
        }
    }

    /// Process one inbound event.
    ///
    /// A persistence error aborts this message only; the caller keeps the
    /// connection. Bot failures never fail the message.
    /// Inbound traffic never clears `needs-agent`.
    pub async fn process(
        &self,
        tenant_id: &str,
        session_id: &str,
        raw: RawInbound,
        cancel: &CancellationToken,
    ) -> Result<InboundOutcome, DatabaseError> {
        if let Some(reason) = discard_reason(&raw) {
            debug!(session_id, reason = ?reason, "Inbound event discarded");
            return Ok(InboundOutcome::Discarded(reason));
        }

        let address = normalize_address(&raw.counterpart_address);
        let conversation = self
            .db
            .find_or_create_conversation(tenant_id, &address)
            .await?;
        let message = self
            .db
            .append_message(&NewMessage {
                conversation_id: conversation.id,
                tenant_id: tenant_id.to_string(),
                counterpart_address: address.clone(),
                body: raw.body.clone(),
                direction: Direction::Inbound,
                sent_by_automation: false,
                delivery_status: DeliveryStatus::Received,
                read_flag: false,
            })
            .await?;
        self.db
            .update_conversation_preview(conversation.id, &preview(&raw.body), message.created_at)
            .await?;

        info!(
            tenant_id,
            conversation_id = %conversation.id,
            message_id = %message.id,
            "Inbound message recorded"
        );
        self.events.publish(SessionEvent::MessageReceived {
            tenant_id: tenant_id.to_string(),
            conversation_id: conversation.id,
            message: message.clone(),
        });

        let reply = self
            .run_bot(tenant_id, session_id, &conversation, &raw.body, cancel)
            .await;
        Ok(InboundOutcome::Recorded { message, reply })
    }

    async fn run_bot(
        &self,
        tenant_id: &str,
        session_id: &str,
        conversation: &Conversation,
        body: &str,
        cancel: &CancellationToken,
    ) -> Option<BotDecision> {
        let config = match self.bot_configs.get(tenant_id, session_id).await {
            Ok(config) => config,
            Err(e) => {
                warn!(tenant_id, error = %e, "Bot config unavailable, skipping automation");
                return None;
            }
        };
        if !config.enabled {
            return None;
        }
        if conversation.status == ConversationStatus::NeedsAgent {
            debug!(conversation_id = %conversation.id, "Conversation waits for an agent, bot silent");
            return None;
        }

        let decision = rules::evaluate(body, &config)?;
        if decision.handoff {
            match self
                .db
                .set_conversation_status(conversation.id, ConversationStatus::NeedsAgent)
                .await
            {
                Ok(()) => info!(conversation_id = %conversation.id, "Conversation handed off to an agent"),
                Err(e) => warn!(conversation_id = %conversation.id, error = %e, "Failed to flag handoff"),
            }
        }

        self.responder.schedule(
            tenant_id,
            &conversation.counterpart_address,
            decision.clone(),
            Duration::from_secs(config.response_delay_seconds),
            cancel.child_token(),
        );
        Some(decision)
    }
}

fn discard_reason(raw: &RawInbound) -> Option<DiscardReason> {
    if raw.is_group {
        Some(DiscardReason::Group)
    } else if raw.from_self {
        Some(DiscardReason::FromSelf)
    } else if raw.body.trim().is_empty() {
        Some(DiscardReason::EmptyBody)
    } else {
        None
    }
}
