#![forbid(unsafe_code)]

use crate::domain::VenRecord;
use crate::error::PersistenceError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::BTreeMap;
use std::sync::Mutex;

pub const DEFAULT_BACKUP_KEY: &str = "ven_info";

pub type VenSnapshot = BTreeMap<String, VenRecord>;

/// Durable home of the complete `{ven_id -> VenRecord}` map. Reads and writes are always whole
/// snapshots.
#[async_trait]
pub trait BackupStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns `None` when nothing has been stored under the backup key yet.
    async fn load(&self) -> Result<Option<VenSnapshot>, PersistenceError>;

    async fn store(&self, snapshot: &VenSnapshot) -> Result<(), PersistenceError>;
}

fn decode(key: &str, raw: &str) -> Result<VenSnapshot, PersistenceError> {
    serde_json::from_str(raw).map_err(|source| PersistenceError::Corrupt {
        key: key.to_string(),
        source,
    })
}

fn encode(snapshot: &VenSnapshot) -> Result<String, PersistenceError> {
    serde_json::to_string(snapshot).map_err(PersistenceError::Encode)
}

/// Snapshot kept as a JSON string under one redis key.
pub struct RedisBackupStore {
    connection: ConnectionManager,
    key: String,
}

impl RedisBackupStore {
    pub async fn connect(url: &str, key: impl Into<String>) -> Result<Self, PersistenceError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self {
            connection,
            key: key.into(),
        })
    }
}

#[async_trait]
impl BackupStore for RedisBackupStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn load(&self) -> Result<Option<VenSnapshot>, PersistenceError> {
        let mut connection = self.connection.clone();
        let raw: Option<String> = connection.get(&self.key).await?;
        raw.map(|raw| decode(&self.key, &raw)).transpose()
    }

    async fn store(&self, snapshot: &VenSnapshot) -> Result<(), PersistenceError> {
        let encoded = encode(snapshot)?;
        let mut connection = self.connection.clone();
        connection.set::<_, _, ()>(&self.key, encoded).await?;
        Ok(())
    }
}

/// Process-local store; state is lost on restart.
#[derive(Default)]
pub struct MemoryBackupStore {
    raw: Mutex<Option<String>>,
}

impl MemoryBackupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: &VenSnapshot) -> Result<Self, PersistenceError> {
        Ok(Self {
            raw: Mutex::new(Some(encode(snapshot)?)),
        })
    }

    /// The last JSON document written, exactly as a remote reader would see it.
    pub fn raw(&self) -> Option<String> {
        self.raw.lock().expect("memory backup poisoned").clone()
    }
}

#[async_trait]
impl BackupStore for MemoryBackupStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn load(&self) -> Result<Option<VenSnapshot>, PersistenceError> {
        let raw = self.raw();
        raw.map(|raw| decode(DEFAULT_BACKUP_KEY, &raw)).transpose()
    }

    async fn store(&self, snapshot: &VenSnapshot) -> Result<(), PersistenceError> {
        let encoded = encode(snapshot)?;
        *self.raw.lock().expect("memory backup poisoned") = Some(encoded);
        Ok(())
    }
}
