//! Message flow between the transport and the store.
//!
//! - `InboundPipeline`: records direct messages and triggers the bot
//! - `OutboundGateway`: sends through a connected session and records it

pub mod inbound;
pub mod outbound;

pub use inbound::{DiscardReason, InboundOutcome, InboundPipeline};
pub use outbound::OutboundGateway;

/// Characters of a message body kept as the conversation preview.
const PREVIEW_CHARS: usize = 100;

/// Conversation list preview of `body`.
pub(crate) fn preview(body: &str) -> String {
    body.chars().take(PREVIEW_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_on_char_boundaries() {
        let body = "é".repeat(150);
        assert_eq!(preview(&body).chars().count(), 100);
        assert_eq!(preview("short"), "short");
    }
}
