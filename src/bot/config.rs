//! Per-tenant automation settings.

use serde::{Deserialize, Serialize};

/// Default pause before an automated reply goes out.
pub const DEFAULT_RESPONSE_DELAY_SECS: u64 = 2;

/// What happens besides replying when a menu option is picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MenuAction {
    #[default]
    Reply,
    /// Reply and flag the conversation for a human agent.
    TransferToAgent,
}

/// A numbered/text menu entry matched exactly against the message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuOption {
    pub trigger_text: String,
    pub reply_text: String,
    #[serde(default)]
    pub action: MenuAction,
}

/// Canned reply triggered by any of its keywords appearing in the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordReply {
    pub keywords: Vec<String>,
    pub reply_text: String,
}

/// Automation rules for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub enabled: bool,
    /// Fallback reply when nothing else matches. Empty disables the fallback.
    pub initial_message: String,
    pub response_delay_seconds: u64,
    pub menu_options: Vec<MenuOption>,
    pub keyword_replies: Vec<KeywordReply>,
    pub handoff_keywords: Vec<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_message: String::new(),
            response_delay_seconds: DEFAULT_RESPONSE_DELAY_SECS,
            menu_options: Vec::new(),
            keyword_replies: Vec::new(),
            handoff_keywords: Vec::new(),
        }
    }
}
