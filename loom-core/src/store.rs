//! Opaque key→bytes store backing certificates, config material and
//! persisted cluster state.
//!
//! Reads are served from an in-memory snapshot and never block on I/O.
//! Writes go through a single-writer lock, land in the snapshot
//! immediately and are persisted asynchronously: a background loop flushes
//! dirty entries every 60 seconds, and shutdown performs one mandatory
//! flush.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::types::unix_ms;

pub const NS_CERT: &str = "cert";
pub const NS_CONFIG: &str = "config";
pub const NS_STATE: &str = "state";

pub const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

pub type DbPool = Pool<SqliteConnectionManager>;

#[async_trait]
pub trait SecureStore: Send + Sync {
    async fn read(&self, namespace: &str, name: &str) -> Result<Option<Vec<u8>>>;
    async fn write(&self, namespace: &str, name: &str, bytes: Vec<u8>) -> Result<()>;
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
    async fn flush(&self) -> Result<()>;
}

/// Helper for async database operations (spawn_blocking wrapper).
pub async fn execute_async<F, T>(pool: &DbPool, f: F) -> Result<T>
where
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get().context("Failed to get database connection")?;
        f(&conn)
    })
    .await
    .context("Task join error")?
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(include_str!("../migrations/001_secrets.sql"))
        .context("Failed to run secrets migration")?;
    Ok(())
}

/// Sqlite-backed store with a write-through in-memory snapshot.
pub struct SqliteStore {
    pool: DbPool,
    cache: DashMap<(String, String), Vec<u8>>,
    // Guards writers and owns the set of keys awaiting persistence.
    dirty: Mutex<HashSet<(String, String)>>,
    path: PathBuf,
}

impl SqliteStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Cannot create store directory {:?}", parent))?;
            }
        }

        info!("Opening secure store at {:?}", path);

        let manager = SqliteConnectionManager::file(&path);
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .context("Failed to create store connection pool")?;

        let rows = execute_async(&pool, |conn| {
            run_migrations(conn)?;
            let mut stmt = conn
                .prepare("SELECT namespace, name, bytes FROM secrets")
                .context("Failed to prepare snapshot query")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                })
                .context("Failed to query secrets")?
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("Failed to collect secrets")?;
            Ok(rows)
        })
        .await?;

        let cache = DashMap::new();
        for (namespace, name, bytes) in rows {
            cache.insert((namespace, name), bytes);
        }

        info!("Secure store loaded: {} entries", cache.len());

        Ok(Arc::new(Self {
            pool,
            cache,
            dirty: Mutex::new(HashSet::new()),
            path,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SecureStore for SqliteStore {
    async fn read(&self, namespace: &str, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .cache
            .get(&(namespace.to_string(), name.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn write(&self, namespace: &str, name: &str, bytes: Vec<u8>) -> Result<()> {
        let key = (namespace.to_string(), name.to_string());
        let mut dirty = self.dirty.lock();
        self.cache.insert(key.clone(), bytes);
        dirty.insert(key);
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let key = (namespace.to_string(), name.to_string());
        let mut dirty = self.dirty.lock();
        self.cache.remove(&key);
        dirty.insert(key);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let pending: Vec<(String, String)> = {
            let mut dirty = self.dirty.lock();
            dirty.drain().collect()
        };
        if pending.is_empty() {
            return Ok(());
        }

        let updates: Vec<((String, String), Option<Vec<u8>>)> = pending
            .into_iter()
            .map(|key| {
                let value = self.cache.get(&key).map(|entry| entry.value().clone());
                (key, value)
            })
            .collect();

        let count = updates.len();
        execute_async(&self.pool, move |conn| {
            for ((namespace, name), value) in updates {
                match value {
                    Some(bytes) => {
                        conn.execute(
                            "INSERT INTO secrets (namespace, name, bytes, updated_at)
                             VALUES (?1, ?2, ?3, ?4)
                             ON CONFLICT (namespace, name)
                             DO UPDATE SET bytes = excluded.bytes, updated_at = excluded.updated_at",
                            rusqlite::params![namespace, name, bytes, unix_ms() as i64],
                        )
                        .context("Failed to upsert secret")?;
                    }
                    None => {
                        conn.execute(
                            "DELETE FROM secrets WHERE namespace = ?1 AND name = ?2",
                            rusqlite::params![namespace, name],
                        )
                        .context("Failed to delete secret")?;
                    }
                }
            }
            Ok(())
        })
        .await?;

        debug!("Flushed {} store entries", count);
        Ok(())
    }
}

/// In-memory store for tests and ephemeral nodes. `flush` is a no-op.
#[derive(Default)]
pub struct MemStore {
    cache: DashMap<(String, String), Vec<u8>>,
    writer: Mutex<()>,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SecureStore for MemStore {
    async fn read(&self, namespace: &str, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .cache
            .get(&(namespace.to_string(), name.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn write(&self, namespace: &str, name: &str, bytes: Vec<u8>) -> Result<()> {
        let _writer = self.writer.lock();
        self.cache
            .insert((namespace.to_string(), name.to_string()), bytes);
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let _writer = self.writer.lock();
        self.cache
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Coalesced background persistence. Runs until `shutdown` flips, then
/// performs the final mandatory flush.
pub async fn flush_loop(store: Arc<dyn SecureStore>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(FLUSH_INTERVAL) => {
                if let Err(e) = store.flush().await {
                    error!("Store flush failed: {e:#}");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    if let Err(e) = store.flush().await {
                        error!("Final store flush failed: {e:#}");
                    }
                    return;
                }
            }
        }
    }
}
