//! Delivers automated replies after the configured pause.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bot::rules::BotDecision;
use crate::pipeline::outbound::OutboundGateway;

pub struct BotResponder {
    gateway: Arc<OutboundGateway>,
}

impl BotResponder {
    pub fn new(gateway: Arc<OutboundGateway>) -> Self {
        Self { gateway }
    }

    /// Send `decision.reply` to `address` once `delay` has passed.
    ///
    /// The pause runs on its own task so the session keeps processing events.
    /// Cancelling `cancel` (session torn down) drops the reply.
    pub fn schedule(
        &self,
        tenant_id: &str,
        address: &str,
        decision: BotDecision,
        delay: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let gateway = Arc::clone(&self.gateway);
        let tenant_id = tenant_id.to_string();
        let address = address.to_string();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(tenant_id = %tenant_id, "Automated reply dropped, session torn down");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match gateway.send(&tenant_id, &address, &decision.reply, true).await {
                Ok(message) => info!(
                    tenant_id = %tenant_id,
                    message_id = %message.id,
                    rule = ?decision.rule,
                    "Automated reply sent"
                ),
                Err(e) => warn!(tenant_id = %tenant_id, error = %e, "Automated reply failed"),
            }
        })
    }
}
