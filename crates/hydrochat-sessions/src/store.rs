//! In-memory conversation store.
//!
//! Maps opaque conversation ids to entries coupling the state with a
//! per-conversation `tokio::sync::Mutex`. The map lock is held only for
//! lookup/insert/evict; turn execution locks the entry mutex instead, so
//! concurrent requests for the same conversation queue in arrival order.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use hydrochat_core::config::{ConfigSnapshot, StoreConfig};

use crate::state::ConversationState;

pub struct ConversationEntry {
    /// Held for the duration of a turn — `tokio::sync::Mutex` because the
    /// turn awaits REST and LLM calls while holding it.
    pub state: tokio::sync::Mutex<ConversationState>,
    last_activity: std::sync::Mutex<DateTime<Utc>>,
}

impl ConversationEntry {
    fn new(state: ConversationState) -> Self {
        Self {
            state: tokio::sync::Mutex::new(state),
            last_activity: std::sync::Mutex::new(Utc::now()),
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Utc::now();
    }

    fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock().unwrap()
    }
}

/// Counts reported by `get_stats`. Expired entries are evicted before the
/// counts are taken, so they are never reported.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub active_conversations: usize,
    pub max_conversations: usize,
    pub ttl_seconds: u64,
}

pub struct ConversationStore {
    entries: DashMap<String, Arc<ConversationEntry>>,
    config_snapshot: ConfigSnapshot,
    ttl: Duration,
    max_conversations: usize,
}

impl ConversationStore {
    pub fn new(store_config: &StoreConfig, config_snapshot: ConfigSnapshot) -> Self {
        Self {
            entries: DashMap::new(),
            config_snapshot,
            ttl: Duration::seconds(store_config.ttl_seconds as i64),
            max_conversations: store_config.max_conversations.max(1),
        }
    }

    /// Look up a conversation, creating one (with a fresh id) when `id` is
    /// absent or unknown. Returns the effective id and the entry.
    pub fn get_or_create(&self, id: Option<&str>) -> (String, Arc<ConversationEntry>) {
        self.evict_expired();

        if let Some(id) = id {
            if let Some(entry) = self.entries.get(id) {
                entry.touch();
                return (id.to_string(), Arc::clone(entry.value()));
            }
        }

        let new_id = id
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let entry = Arc::new(ConversationEntry::new(ConversationState::new(
            self.config_snapshot.clone(),
        )));
        self.entries.insert(new_id.clone(), Arc::clone(&entry));
        self.enforce_capacity(&new_id);
        debug!(conversation_id = %new_id, "created conversation state");
        (new_id, entry)
    }

    /// Drop entries idle past the TTL.
    pub fn evict_expired(&self) {
        let cutoff = Utc::now() - self.ttl;
        self.entries.retain(|id, entry| {
            let keep = entry.last_activity() > cutoff;
            if !keep {
                debug!(conversation_id = %id, "evicting expired conversation");
            }
            keep
        });
    }

    /// Evict least-recently-active entries past the cap, never the one just
    /// inserted.
    fn enforce_capacity(&self, protect_id: &str) {
        while self.entries.len() > self.max_conversations {
            let oldest = self
                .entries
                .iter()
                .filter(|e| e.key().as_str() != protect_id)
                .min_by_key(|e| e.value().last_activity())
                .map(|e| e.key().clone());
            match oldest {
                Some(id) => {
                    debug!(conversation_id = %id, "evicting conversation past LRU cap");
                    self.entries.remove(&id);
                }
                None => break,
            }
        }
    }

    /// Store statistics; evicts expired entries first.
    pub fn get_stats(&self) -> StoreStats {
        self.evict_expired();
        StoreStats {
            active_conversations: self.entries.len(),
            max_conversations: self.max_conversations,
            ttl_seconds: self.ttl.num_seconds() as u64,
        }
    }
}
