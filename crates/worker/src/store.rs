//! Conversation record store
//!
//! Completed exchanges can be persisted for later context lookups. The store
//! sits off the critical path: a failed write never holds back a response.

use chatrelay_common::config::{StoreBackend, StoreConfig};
use chatrelay_common::{RelayError, Result};
use chatrelay_proto::{ChatRequest, ChatResponse};
use mongodb::bson::doc;
use mongodb::{Client, Collection};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// One prompt/reply pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub chat_uuid: String,
    pub socketio_session_id: String,
    pub user_uuid: String,
    pub prompt: String,
    pub reply: String,

    /// Milliseconds since the Unix epoch
    pub created_at_ms: i64,
}

impl ExchangeRecord {
    pub fn new(request: &ChatRequest, response: &ChatResponse) -> Self {
        let created_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();

        Self {
            chat_uuid: response.chat_uuid.clone(),
            socketio_session_id: response.socketio_session_id.clone(),
            user_uuid: response.user_uuid.to_string(),
            prompt: request.message.clone(),
            reply: response.message.clone(),
            created_at_ms,
        }
    }
}

/// MongoDB-backed store
#[derive(Debug, Clone)]
pub struct MongoStore {
    client: Client,
    collection: Collection<ExchangeRecord>,
}

impl MongoStore {
    /// Connect and ping the server; an unreachable server is an error.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let client = Client::with_uri_str(config.uri())
            .await
            .map_err(|e| RelayError::store(format!("invalid store address {}: {}", config.uri(), e)))?;

        let database = client.database(&config.db);
        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| RelayError::store(format!("store unreachable at {}: {}", config.uri(), e)))?;

        info!(uri = %config.uri(), db = %config.db, collection = %config.collection, "Connected to record store");

        Ok(Self {
            collection: database.collection(&config.collection),
            client,
        })
    }

    async fn insert(&self, record: &ExchangeRecord) -> Result<()> {
        self.collection
            .insert_one(record)
            .await
            .map(|_| ())
            .map_err(|e| RelayError::store(e.to_string()))
    }
}

const DEFAULT_MEMORY_HISTORY: usize = 100;

/// Process-local store keeping the latest exchanges of each conversation
#[derive(Debug, Clone)]
pub struct MemoryStore {
    conversations: Arc<Mutex<HashMap<String, VecDeque<ExchangeRecord>>>>,
    history: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_history(DEFAULT_MEMORY_HISTORY)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `history` exchanges per conversation
    pub fn with_history(history: usize) -> Self {
        Self {
            conversations: Arc::new(Mutex::new(HashMap::new())),
            history: history.max(1),
        }
    }

    fn insert(&self, record: &ExchangeRecord) {
        let mut conversations = self.conversations.lock();
        let exchanges = conversations.entry(record.chat_uuid.clone()).or_default();
        if exchanges.len() == self.history {
            exchanges.pop_front();
        }
        exchanges.push_back(record.clone());
    }

    /// Snapshot of everything held, grouped by conversation
    pub fn records(&self) -> Vec<ExchangeRecord> {
        self.conversations
            .lock()
            .values()
            .flat_map(|exchanges| exchanges.iter().cloned())
            .collect()
    }

    /// Exchanges held for one conversation, oldest first
    pub fn conversation(&self, chat_uuid: &str) -> Vec<ExchangeRecord> {
        self.conversations
            .lock()
            .get(chat_uuid)
            .map(|exchanges| exchanges.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Store handle owned by the worker
#[derive(Debug, Clone)]
pub enum RecordStore {
    Mongo(MongoStore),
    Memory(MemoryStore),
    Disabled,
}

impl RecordStore {
    /// Open the configured store, or [`RecordStore::Disabled`] when none is configured
    pub async fn connect(config: Option<&StoreConfig>) -> Result<Self> {
        match config {
            None => Ok(RecordStore::Disabled),
            Some(config) => match config.backend {
                StoreBackend::Mongo => Ok(RecordStore::Mongo(MongoStore::connect(config).await?)),
                StoreBackend::Memory => {
                    info!(history = config.memory_history, "Using in-memory record store");
                    Ok(RecordStore::Memory(MemoryStore::with_history(config.memory_history)))
                }
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, RecordStore::Disabled)
    }

    pub async fn record(&self, record: &ExchangeRecord) -> Result<()> {
        match self {
            RecordStore::Mongo(store) => store.insert(record).await,
            RecordStore::Memory(store) => {
                store.insert(record);
                Ok(())
            }
            RecordStore::Disabled => Ok(()),
        }
    }

    /// Release the underlying client
    pub async fn close(self) {
        if let RecordStore::Mongo(store) = self {
            store.client.shutdown().await;
            info!("Record store closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_proto::default_user_uuid;

    fn exchange(chat: &str, prompt: &str, reply: &str) -> ExchangeRecord {
        let request = ChatRequest {
            chat_uuid: chat.to_string(),
            socketio_session_id: "sess".to_string(),
            message: prompt.to_string(),
        };
        let response = ChatResponse::reply_to(&request, default_user_uuid(), reply);
        ExchangeRecord::new(&request, &response)
    }

    #[test]
    fn test_record_from_exchange() {
        let record = exchange("abc", "hello", "hi there");
        assert_eq!(record.chat_uuid, "abc");
        assert_eq!(record.prompt, "hello");
        assert_eq!(record.reply, "hi there");
        assert_eq!(record.user_uuid, chatrelay_proto::DEFAULT_USER_UUID);
        assert!(record.created_at_ms > 0);
    }

    #[tokio::test]
    async fn test_memory_store_groups_by_conversation() {
        let memory = MemoryStore::new();
        let store = RecordStore::Memory(memory.clone());

        store.record(&exchange("a", "one", "1")).await.unwrap();
        store.record(&exchange("b", "two", "2")).await.unwrap();
        store.record(&exchange("a", "three", "3")).await.unwrap();

        assert_eq!(memory.records().len(), 3);
        let prompts: Vec<_> = memory.conversation("a").into_iter().map(|r| r.prompt).collect();
        assert_eq!(prompts, vec!["one", "three"]);
    }

    #[tokio::test]
    async fn test_unconfigured_store_is_disabled() {
        let store = RecordStore::connect(None).await.unwrap();
        assert!(!store.is_enabled());
        assert!(store.record(&exchange("a", "p", "r")).await.is_ok());
        store.close().await;
    }

    #[tokio::test]
    async fn test_memory_backend_from_config() {
        let config = StoreConfig {
            backend: StoreBackend::Memory,
            host: "localhost".to_string(),
            port: 27017,
            db: "chats".to_string(),
            collection: "exchanges".to_string(),
            record_exchanges: true,
            memory_history: 2,
        };
        let store = RecordStore::connect(Some(&config)).await.unwrap();
        let RecordStore::Memory(memory) = &store else {
            panic!("expected memory backend");
        };
        assert_eq!(memory.history, 2);
    }

    #[tokio::test]
    async fn test_memory_store_keeps_latest_exchanges_per_conversation() {
        let memory = MemoryStore::with_history(2);
        let store = RecordStore::Memory(memory.clone());

        for prompt in ["one", "two", "three", "four"] {
            store.record(&exchange("a", prompt, "r")).await.unwrap();
        }
        store.record(&exchange("b", "other", "r")).await.unwrap();

        let prompts: Vec<_> = memory.conversation("a").into_iter().map(|r| r.prompt).collect();
        assert_eq!(prompts, vec!["three", "four"]);
        assert_eq!(memory.conversation("b").len(), 1);
        assert_eq!(memory.records().len(), 3);
    }
}
