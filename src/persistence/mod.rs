use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{timeout, Duration};
use uuid::Uuid;

use crate::error::GuardError;
use crate::models::{ControlCommand, ExitState, OcoPair, Ticket};

const EXIT_STATES_KEY: &str = "tradeguard:exit_states";
const OCO_PAIRS_KEY: &str = "tradeguard:oco_pairs";
const COMMANDS_KEY: &str = "tradeguard:commands";

/// Durable home of exit states and OCO pairs, plus the inbound command queue
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_exit_state(&self, state: &ExitState) -> Result<(), GuardError>;

    async fn delete_exit_state(&self, ticket: Ticket) -> Result<(), GuardError>;

    async fn load_exit_states(&self) -> Result<Vec<ExitState>, GuardError>;

    async fn save_oco_pair(&self, pair: &OcoPair) -> Result<(), GuardError>;

    async fn delete_oco_pair(&self, group_id: Uuid) -> Result<(), GuardError>;

    async fn load_oco_pairs(&self) -> Result<Vec<OcoPair>, GuardError>;

    /// Append a command for the running service
    async fn push_command(&self, command: &ControlCommand) -> Result<(), GuardError>;

    /// Take every queued command, oldest first
    async fn drain_commands(&self) -> Result<Vec<ControlCommand>, GuardError>;
}

/// Redis persistence: one hash per record type, JSON values
#[derive(Clone)]
pub struct RedisStateStore {
    conn: ConnectionManager,
}

impl RedisStateStore {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self, GuardError> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| GuardError::Persistence("Redis connection timeout after 5 seconds".into()))??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    async fn load_hash<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Vec<T>, GuardError> {
        let mut conn = self.conn.clone();
        let entries: HashMap<String, String> = conn.hgetall(key).await?;

        let mut values = Vec::with_capacity(entries.len());
        for (field, json) in entries {
            match serde_json::from_str(&json) {
                Ok(value) => values.push(value),
                // One corrupt record must not hide the rest
                Err(e) => tracing::error!(key, field = %field, "Skipping unreadable record: {}", e),
            }
        }
        Ok(values)
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn save_exit_state(&self, state: &ExitState) -> Result<(), GuardError> {
        let value = serde_json::to_string(state)?;
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(EXIT_STATES_KEY, state.ticket, value).await?;
        Ok(())
    }

    async fn delete_exit_state(&self, ticket: Ticket) -> Result<(), GuardError> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(EXIT_STATES_KEY, ticket).await?;
        Ok(())
    }

    async fn load_exit_states(&self) -> Result<Vec<ExitState>, GuardError> {
        let mut states: Vec<ExitState> = self.load_hash(EXIT_STATES_KEY).await?;
        states.sort_by_key(|s| s.ticket);
        tracing::info!("Loaded {} exit states from Redis", states.len());
        Ok(states)
    }

    async fn save_oco_pair(&self, pair: &OcoPair) -> Result<(), GuardError> {
        let value = serde_json::to_string(pair)?;
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(OCO_PAIRS_KEY, pair.group_id.to_string(), value)
            .await?;
        Ok(())
    }

    async fn delete_oco_pair(&self, group_id: Uuid) -> Result<(), GuardError> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(OCO_PAIRS_KEY, group_id.to_string()).await?;
        Ok(())
    }

    async fn load_oco_pairs(&self) -> Result<Vec<OcoPair>, GuardError> {
        let mut pairs: Vec<OcoPair> = self.load_hash(OCO_PAIRS_KEY).await?;
        pairs.sort_by_key(|p| p.created_at);
        tracing::info!("Loaded {} OCO pairs from Redis", pairs.len());
        Ok(pairs)
    }

    async fn push_command(&self, command: &ControlCommand) -> Result<(), GuardError> {
        let value = serde_json::to_string(command)?;
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(COMMANDS_KEY, value).await?;
        Ok(())
    }

    async fn drain_commands(&self) -> Result<Vec<ControlCommand>, GuardError> {
        let mut conn = self.conn.clone();
        // Read and clear in one transaction so a concurrent push is never lost
        let (raw,): (Vec<String>,) = redis::pipe()
            .atomic()
            .lrange(COMMANDS_KEY, 0, -1)
            .del(COMMANDS_KEY)
            .ignore()
            .query_async(&mut conn)
            .await?;

        let mut commands = Vec::with_capacity(raw.len());
        for json in raw {
            match serde_json::from_str(&json) {
                Ok(command) => commands.push(command),
                Err(e) => tracing::error!(json = %json, "Dropping unreadable command: {}", e),
            }
        }
        Ok(commands)
    }
}

#[derive(Default)]
struct MemoryState {
    exit_states: HashMap<Ticket, ExitState>,
    oco_pairs: HashMap<Uuid, OcoPair>,
    commands: Vec<ControlCommand>,
}

/// In-process store for tests and runs without Redis
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn exit_state(&self, ticket: Ticket) -> Option<ExitState> {
        self.lock().exit_states.get(&ticket).cloned()
    }

    pub fn oco_pair(&self, group_id: Uuid) -> Option<OcoPair> {
        self.lock().oco_pairs.get(&group_id).cloned()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save_exit_state(&self, state: &ExitState) -> Result<(), GuardError> {
        self.lock().exit_states.insert(state.ticket, state.clone());
        Ok(())
    }

    async fn delete_exit_state(&self, ticket: Ticket) -> Result<(), GuardError> {
        self.lock().exit_states.remove(&ticket);
        Ok(())
    }

    async fn load_exit_states(&self) -> Result<Vec<ExitState>, GuardError> {
        let mut states: Vec<ExitState> = self.lock().exit_states.values().cloned().collect();
        states.sort_by_key(|s| s.ticket);
        Ok(states)
    }

    async fn save_oco_pair(&self, pair: &OcoPair) -> Result<(), GuardError> {
        self.lock().oco_pairs.insert(pair.group_id, pair.clone());
        Ok(())
    }

    async fn delete_oco_pair(&self, group_id: Uuid) -> Result<(), GuardError> {
        self.lock().oco_pairs.remove(&group_id);
        Ok(())
    }

    async fn load_oco_pairs(&self) -> Result<Vec<OcoPair>, GuardError> {
        let mut pairs: Vec<OcoPair> = self.lock().oco_pairs.values().cloned().collect();
        pairs.sort_by_key(|p| p.created_at);
        Ok(pairs)
    }

    async fn push_command(&self, command: &ControlCommand) -> Result<(), GuardError> {
        self.lock().commands.push(command.clone());
        Ok(())
    }

    async fn drain_commands(&self) -> Result<Vec<ControlCommand>, GuardError> {
        Ok(std::mem::take(&mut self.lock().commands))
    }
}
