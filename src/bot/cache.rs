//! In-memory bot configuration, keyed by session id.
//!
//! Loaded when a session connects and replaced on explicit update. Briefly
//! stale reads are acceptable.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::bot::config::BotConfig;
use crate::error::DatabaseError;
use crate::store::traits::Database;

/// Read a tenant's config, persisting the default on first access.
pub async fn load_or_init(db: &dyn Database, tenant_id: &str) -> Result<BotConfig, DatabaseError> {
    if let Some(config) = db.get_bot_config(tenant_id).await? {
        return Ok(config);
    }
    let config = BotConfig::default();
    db.save_bot_config(tenant_id, &config).await?;
    info!(tenant_id, "Default bot config created");
    Ok(config)
}

pub struct BotConfigCache {
    db: Arc<dyn Database>,
    configs: RwLock<HashMap<String, BotConfig>>,
}

impl BotConfigCache {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            configs: RwLock::new(HashMap::new()),
        }
    }

    /// Re-read the config from the store.
    pub async fn reload(&self, tenant_id: &str, session_id: &str) -> Result<BotConfig, DatabaseError> {
        let config = load_or_init(self.db.as_ref(), tenant_id).await?;
        debug!(session_id, enabled = config.enabled, "Bot config loaded");
        self.configs
            .write()
            .await
            .insert(session_id.to_string(), config.clone());
        Ok(config)
    }

    /// Cached config, loading it on a miss.
    pub async fn get(&self, tenant_id: &str, session_id: &str) -> Result<BotConfig, DatabaseError> {
        if let Some(config) = self.configs.read().await.get(session_id) {
            return Ok(config.clone());
        }
        self.reload(tenant_id, session_id).await
    }

    /// Replace the cached config after an explicit update.
    pub async fn put(&self, session_id: &str, config: BotConfig) {
        self.configs
            .write()
            .await
            .insert(session_id.to_string(), config);
    }

    /// Forget a torn-down session's config.
    pub async fn evict(&self, session_id: &str) {
        if self.configs.write().await.remove(session_id).is_some() {
            debug!(session_id, "Bot config evicted");
        }
    }

    pub async fn is_cached(&self, session_id: &str) -> bool {
        self.configs.read().await.contains_key(session_id)
    }
}
