//! Automated-reply rules.
//!
//! Evaluated in strict priority order, first match wins:
//! 1. Handoff keywords → fixed acknowledgement, conversation needs an agent
//! 2. Menu options → exact (trimmed, case-insensitive) match on the body
//! 3. Keyword replies → first entry with a keyword contained in the body
//! 4. Initial message → fallback when configured

use tracing::debug;

use crate::bot::config::{BotConfig, MenuAction};

/// Reply sent when the customer asks for a human.
pub const HANDOFF_ACKNOWLEDGEMENT: &str =
    "Ok! I'm calling a human agent for you. Please wait a moment...";

/// Which rule produced a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchedRule {
    Handoff { keyword: String },
    Menu { trigger: String },
    Keyword { keyword: String },
    Fallback,
}

/// Outcome of evaluating one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotDecision {
    pub reply: String,
    /// The conversation must be flagged `needs-agent`.
    pub handoff: bool,
    pub rule: MatchedRule,
}

/// Evaluate `body` against `config`. Returns `None` when nothing matched.
pub fn evaluate(body: &str, config: &BotConfig) -> Option<BotDecision> {
    let lowered = body.to_lowercase();

    if let Some(keyword) = first_contained(&lowered, &config.handoff_keywords) {
        debug!(keyword = %keyword, "Message matched handoff keyword");
        return Some(BotDecision {
            reply: HANDOFF_ACKNOWLEDGEMENT.to_string(),
            handoff: true,
            rule: MatchedRule::Handoff { keyword },
        });
    }

    let trimmed = lowered.trim();
    if let Some(option) = config
        .menu_options
        .iter()
        .find(|opt| opt.trigger_text.trim().to_lowercase() == trimmed)
    {
        debug!(trigger = %option.trigger_text, action = ?option.action, "Message matched menu option");
        return Some(BotDecision {
            reply: option.reply_text.clone(),
            handoff: option.action == MenuAction::TransferToAgent,
            rule: MatchedRule::Menu {
                trigger: option.trigger_text.clone(),
            },
        });
    }

    for entry in &config.keyword_replies {
        if let Some(keyword) = first_contained(&lowered, &entry.keywords) {
            debug!(keyword = %keyword, "Message matched keyword reply");
            return Some(BotDecision {
                reply: entry.reply_text.clone(),
                handoff: false,
                rule: MatchedRule::Keyword { keyword },
            });
        }
    }

    if !config.initial_message.is_empty() {
        return Some(BotDecision {
            reply: config.initial_message.clone(),
            handoff: false,
            rule: MatchedRule::Fallback,
        });
    }

    None
}

/// First non-blank keyword that is a substring of the already-lowercased body.
fn first_contained(lowered_body: &str, keywords: &[String]) -> Option<String> {
    keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .find(|k| lowered_body.contains(&k.to_lowercase()))
        .map(str::to_string)
}
