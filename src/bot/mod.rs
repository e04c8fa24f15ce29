//! Automated replies: per-tenant configuration, rule evaluation and delivery.

pub mod cache;
pub mod config;
pub mod responder;
pub mod rules;

pub use cache::BotConfigCache;
pub use config::{BotConfig, KeywordReply, MenuAction, MenuOption};
pub use responder::BotResponder;
pub use rules::{BotDecision, HANDOFF_ACKNOWLEDGEMENT, MatchedRule, evaluate};
