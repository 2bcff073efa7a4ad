use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::open_connection;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A write observed in the shared store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
    pub writer: String,
    pub revision: u64,
}

/// Durable string key-value store shared by every context. Each handle writes
/// under its own writer id so readers can tell their own writes apart.
pub trait KeyValueStore: Send + Sync {
    fn writer_id(&self) -> &str;
    fn get(&self, key: &str) -> Result<Option<String>, InfraError>;
    fn set(&self, key: &str, value: &str) -> Result<(), InfraError>;
    /// Clears the key; other contexts still observe the removal as a change.
    fn remove(&self, key: &str) -> Result<(), InfraError>;
    fn changes_since(&self, revision: u64) -> Result<Vec<StoreChange>, InfraError>;
    fn latest_revision(&self) -> Result<u64, InfraError>;
}

#[derive(Debug, Clone)]
pub struct SqliteKeyValueStore {
    db_path: PathBuf,
    writer: String,
}

impl SqliteKeyValueStore {
    pub fn new(db_path: impl AsRef<Path>, writer: impl Into<String>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            writer: writer.into(),
        }
    }

    fn write(&self, key: &str, value: Option<&str>) -> Result<(), InfraError> {
        let connection = open_connection(&self.db_path)?;
        connection.execute(
            "INSERT INTO kv_entries (key, value, writer, revision)
             VALUES (?1, ?2, ?3, (SELECT COALESCE(MAX(revision), 0) + 1 FROM kv_entries))
             ON CONFLICT(key) DO UPDATE SET
               value = excluded.value,
               writer = excluded.writer,
               revision = excluded.revision",
            params![key, value, self.writer],
        )?;
        Ok(())
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn writer_id(&self) -> &str {
        &self.writer
    }

    fn get(&self, key: &str) -> Result<Option<String>, InfraError> {
        let connection = open_connection(&self.db_path)?;
        let value: Option<Option<String>> = connection
            .query_row(
                "SELECT value FROM kv_entries WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.flatten())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), InfraError> {
        self.write(key, Some(value))
    }

    fn remove(&self, key: &str) -> Result<(), InfraError> {
        self.write(key, None)
    }

    fn changes_since(&self, revision: u64) -> Result<Vec<StoreChange>, InfraError> {
        let connection = open_connection(&self.db_path)?;
        let mut statement = connection.prepare(
            "SELECT key, writer, revision FROM kv_entries WHERE revision > ?1 ORDER BY revision",
        )?;
        let rows = statement.query_map(params![revision as i64], |row| {
            Ok(StoreChange {
                key: row.get(0)?,
                writer: row.get(1)?,
                revision: row.get::<_, i64>(2)?.max(0) as u64,
            })
        })?;
        let mut changes = Vec::new();
        for row in rows {
            changes.push(row?);
        }
        Ok(changes)
    }

    fn latest_revision(&self) -> Result<u64, InfraError> {
        let connection = open_connection(&self.db_path)?;
        let revision: i64 = connection.query_row(
            "SELECT COALESCE(MAX(revision), 0) FROM kv_entries",
            [],
            |row| row.get(0),
        )?;
        Ok(revision.max(0) as u64)
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Option<String>,
    writer: String,
    revision: u64,
}

#[derive(Debug, Default)]
struct MemoryTable {
    entries: HashMap<String, MemoryEntry>,
    revision: u64,
}

/// Process-local store. Handles created with [`InMemoryKeyValueStore::handle`]
/// share one table, standing in for several contexts on one device.
#[derive(Debug, Clone)]
pub struct InMemoryKeyValueStore {
    table: Arc<Mutex<MemoryTable>>,
    writer: String,
}

impl Default for InMemoryKeyValueStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl InMemoryKeyValueStore {
    pub fn new(writer: impl Into<String>) -> Self {
        Self {
            table: Arc::new(Mutex::new(MemoryTable::default())),
            writer: writer.into(),
        }
    }

    pub fn handle(&self, writer: impl Into<String>) -> Self {
        Self {
            table: Arc::clone(&self.table),
            writer: writer.into(),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryTable>, InfraError> {
        self.table
            .lock()
            .map_err(|error| InfraError::Store(format!("in-memory store lock poisoned: {error}")))
    }

    fn write(&self, key: &str, value: Option<&str>) -> Result<(), InfraError> {
        let mut table = self.lock()?;
        table.revision += 1;
        let revision = table.revision;
        table.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.map(ToOwned::to_owned),
                writer: self.writer.clone(),
                revision,
            },
        );
        Ok(())
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn writer_id(&self) -> &str {
        &self.writer
    }

    fn get(&self, key: &str) -> Result<Option<String>, InfraError> {
        let table = self.lock()?;
        Ok(table.entries.get(key).and_then(|entry| entry.value.clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), InfraError> {
        self.write(key, Some(value))
    }

    fn remove(&self, key: &str) -> Result<(), InfraError> {
        self.write(key, None)
    }

    fn changes_since(&self, revision: u64) -> Result<Vec<StoreChange>, InfraError> {
        let table = self.lock()?;
        let mut changes = table
            .entries
            .iter()
            .filter(|(_, entry)| entry.revision > revision)
            .map(|(key, entry)| StoreChange {
                key: key.clone(),
                writer: entry.writer.clone(),
                revision: entry.revision,
            })
            .collect::<Vec<_>>();
        changes.sort_by_key(|change| change.revision);
        Ok(changes)
    }

    fn latest_revision(&self) -> Result<u64, InfraError> {
        Ok(self.lock()?.revision)
    }
}
