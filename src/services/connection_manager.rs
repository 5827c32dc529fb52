use deadpool_postgres::{Config as PgPoolConfig, ManagerConfig, RecyclingMethod};
use datafusion::prelude::SessionContext;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tokio_postgres::NoTls;

use crate::api::middleware::AppError;
use crate::models::{ConnectionDescriptor, PoolKey};
use crate::services::database::{
    build_connection_url, mask_credentials, ConnectionHandle, EmbeddedHandle, FileBackedHandle, MySqlHandle,
    PostgresHandle, SourceKind, StoreHandle,
};
use crate::services::datafusion::DataFusionSessionManager;

const DEFAULT_MAX_POOLS: usize = 64;
const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(300);

/// What a pool entry hands out handles from
enum PoolBackend {
    Postgres(deadpool_postgres::Pool),
    MySql(mysql_async::Pool),
    Embedded(SessionContext),
    /// Files are loaded per acquire; the entry only bounds concurrency
    File(PathBuf),
}

struct PoolEntry {
    fingerprint: String,
    backend: PoolBackend,
    limiter: Arc<Semaphore>,
    max_size: usize,
    /// Milliseconds since the manager started
    last_used: AtomicU64,
    /// Set once a handle was opened successfully
    opened: AtomicBool,
}

impl PoolEntry {
    fn live(&self) -> usize {
        self.max_size - self.limiter.available_permits()
    }

    fn is_idle(&self) -> bool {
        self.live() == 0
    }

    fn last_used(&self) -> u64 {
        self.last_used.load(AtomicOrdering::Relaxed)
    }

    async fn close(&self) {
        self.limiter.close();
        match &self.backend {
            PoolBackend::Postgres(pool) => pool.close(),
            PoolBackend::MySql(pool) => {
                if let Err(e) = pool.clone().disconnect().await {
                    tracing::warn!("Failed to close MySQL pool ({}): {}", self.fingerprint, e);
                }
            }
            PoolBackend::Embedded(_) | PoolBackend::File(_) => {}
        }
        tracing::info!("Closed pool ({})", self.fingerprint);
    }
}

/// Owns one pool per descriptor.
///
/// A per-pool semaphore bounds the number of live handles; a handle holds
/// its permit until it is dropped. Pools nobody is using are closed after
/// `idle_ttl`, and at most `max_pools` are kept.
pub struct ConnectionManager {
    pools: Arc<RwLock<HashMap<PoolKey, Arc<PoolEntry>>>>,
    max_pool_size: usize,
    connect_retries: u32,
    max_pools: usize,
    idle_ttl: Duration,
    data_root: Option<PathBuf>,
    sessions: DataFusionSessionManager,
    epoch: Instant,
    closed: AtomicBool,
}

impl ConnectionManager {
    /// Create a connection manager with default settings
    pub fn new() -> Self {
        Self::with_config(16, 1)
    }

    pub fn with_config(max_pool_size: usize, connect_retries: u32) -> Self {
        Self {
            pools: Arc::new(RwLock::new(HashMap::new())),
            max_pool_size: max_pool_size.max(1),
            connect_retries,
            max_pools: DEFAULT_MAX_POOLS,
            idle_ttl: DEFAULT_IDLE_TTL,
            data_root: None,
            sessions: DataFusionSessionManager::default_config(),
            epoch: Instant::now(),
            closed: AtomicBool::new(false),
        }
    }

    /// Bound the number of pools and how long an unused one is kept
    pub fn with_eviction(mut self, max_pools: usize, idle_ttl: Duration) -> Self {
        self.max_pools = max_pools.max(1);
        self.idle_ttl = idle_ttl;
        self
    }

    /// Only open file and embedded paths that resolve under `root`
    pub fn with_data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.data_root = Some(root.into());
        self
    }

    /// Check out a live handle for a descriptor.
    ///
    /// Waits for a free slot when `max_pool_size` handles are already live.
    /// Connection errors while opening the handle are retried.
    pub async fn acquire(&self, descriptor: &ConnectionDescriptor) -> Result<ConnectionHandle, AppError> {
        if self.closed.load(AtomicOrdering::Acquire) {
            return Err(AppError::Connection("Connection manager is shut down".to_string()));
        }
        let kind: SourceKind = descriptor.kind.parse()?;
        let key = descriptor.pool_key();
        let entry = self.get_or_create_entry(kind, &key, descriptor).await?;
        let fingerprint = entry.fingerprint.clone();
        self.touch(&entry);

        let permit = entry
            .limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::Connection("Connection pool is closed".to_string()))?;

        let mut attempt = 0;
        let store = loop {
            match Self::open_store(&entry.backend, descriptor).await {
                Ok(store) => break store,
                Err(e) if e.is_transient() && attempt < self.connect_retries => {
                    attempt += 1;
                    tracing::warn!("Retrying {} connection ({}): {}", kind.as_str(), fingerprint, e);
                }
                Err(e) => {
                    tracing::error!("Failed to open {} connection ({}): {}", kind.as_str(), fingerprint, e);
                    drop(permit);
                    self.forget_if_unopened(&key, &entry).await;
                    return Err(e);
                }
            }
        };

        entry.opened.store(true, AtomicOrdering::Release);
        tracing::info!("Acquired {} handle ({})", kind.as_str(), fingerprint);
        Ok(ConnectionHandle::new(kind, fingerprint, store, permit))
    }

    /// Return a handle. Dropping it has the same effect.
    pub fn release(&self, handle: ConnectionHandle) {
        tracing::debug!("Released {} handle ({})", handle.kind().as_str(), handle.fingerprint());
        drop(handle);
    }

    /// Number of handles currently checked out for a descriptor
    pub async fn live_handles(&self, descriptor: &ConnectionDescriptor) -> usize {
        let pools = self.pools.read().await;
        pools
            .get(&descriptor.pool_key())
            .map(|entry| entry.live())
            .unwrap_or(0)
    }

    /// Get the number of pools
    pub async fn pool_count(&self) -> usize {
        let pools = self.pools.read().await;
        pools.len()
    }

    /// Get pool statistics for a descriptor
    pub async fn pool_status(&self, descriptor: &ConnectionDescriptor) -> Option<PoolStatus> {
        let pools = self.pools.read().await;
        pools.get(&descriptor.pool_key()).map(|entry| {
            let live = entry.live();
            let size = match &entry.backend {
                PoolBackend::Postgres(pool) => pool.status().size,
                _ => live,
            };
            PoolStatus {
                size,
                available: entry.limiter.available_permits(),
                max_size: entry.max_size,
                live_handles: live,
            }
        })
    }

    /// Close every pool. Handles still checked out keep working until
    /// dropped; new acquires fail.
    pub async fn shutdown(&self) {
        self.closed.store(true, AtomicOrdering::Release);
        let drained: Vec<Arc<PoolEntry>> = {
            let mut pools = self.pools.write().await;
            pools.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.close().await;
        }
    }

    fn now_millis(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn touch(&self, entry: &PoolEntry) {
        entry.last_used.store(self.now_millis(), AtomicOrdering::Relaxed);
    }

    async fn get_or_create_entry(
        &self,
        kind: SourceKind,
        key: &PoolKey,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Arc<PoolEntry>, AppError> {
        // Fast path: check if pool already exists (read lock)
        {
            let pools = self.pools.read().await;
            if let Some(entry) = pools.get(key) {
                tracing::debug!("Using existing pool ({})", entry.fingerprint);
                return Ok(entry.clone());
            }
        }

        // Slow path: create new pool (write lock)
        let (entry, evicted) = {
            let mut pools = self.pools.write().await;

            // Double-check in case another task created the pool while we were waiting
            if let Some(entry) = pools.get(key) {
                tracing::debug!("Pool created by another task ({})", entry.fingerprint);
                return Ok(entry.clone());
            }

            let evicted = self.evict(&mut pools);
            let backend = self.create_backend(kind, descriptor).await?;
            let entry = Arc::new(PoolEntry {
                fingerprint: descriptor.fingerprint(),
                backend,
                limiter: Arc::new(Semaphore::new(self.max_pool_size)),
                max_size: self.max_pool_size,
                last_used: AtomicU64::new(self.now_millis()),
                opened: AtomicBool::new(false),
            });
            pools.insert(key.clone(), entry.clone());

            tracing::info!(
                "Created {} pool ({}, max_size: {})",
                kind.as_str(),
                entry.fingerprint,
                self.max_pool_size
            );
            (entry, evicted)
        };

        Self::close_evicted(evicted).await;
        Ok(entry)
    }

    /// Drop idle pools past their TTL, then the least recently used idle
    /// pools until there is room for one more
    fn evict(&self, pools: &mut HashMap<PoolKey, Arc<PoolEntry>>) -> Vec<Arc<PoolEntry>> {
        let now = self.now_millis();
        let ttl = u64::try_from(self.idle_ttl.as_millis()).unwrap_or(u64::MAX);
        let mut evicted = Vec::new();

        pools.retain(|_, entry| {
            let expired = entry.is_idle() && now.saturating_sub(entry.last_used()) >= ttl;
            if expired {
                evicted.push(entry.clone());
            }
            !expired
        });

        while pools.len() >= self.max_pools {
            let oldest = pools
                .iter()
                .filter(|(_, entry)| entry.is_idle())
                .min_by_key(|(_, entry)| entry.last_used())
                .map(|(key, _)| key.clone());
            match oldest.and_then(|key| pools.remove(&key)) {
                Some(entry) => evicted.push(entry),
                None => {
                    tracing::warn!("All {} pools are busy; growing past the limit", pools.len());
                    break;
                }
            }
        }
        evicted
    }

    /// Close evicted pools nobody else holds. Entries still referenced by
    /// an in-flight acquire close when that reference goes away.
    async fn close_evicted(evicted: Vec<Arc<PoolEntry>>) {
        for entry in evicted {
            tracing::debug!("Evicting pool ({})", entry.fingerprint);
            if Arc::strong_count(&entry) == 1 {
                entry.close().await;
            }
        }
    }

    /// A pool whose first connection failed is not kept around
    async fn forget_if_unopened(&self, key: &PoolKey, entry: &Arc<PoolEntry>) {
        if entry.opened.load(AtomicOrdering::Acquire) {
            return;
        }
        let removed = {
            let mut pools = self.pools.write().await;
            let unused = pools
                .get(key)
                .is_some_and(|current| Arc::ptr_eq(current, entry) && entry.is_idle());
            if unused {
                pools.remove(key)
            } else {
                None
            }
        };
        if let Some(removed) = removed {
            tracing::debug!("Dropping pool that never connected ({})", removed.fingerprint);
            removed.close().await;
        }
    }

    /// Resolve a descriptor path under the data root.
    ///
    /// Relative paths are taken from the root. Paths that resolve outside it,
    /// through `..` or symlinks, are rejected.
    fn resolve_path(&self, raw: &str) -> Result<PathBuf, AppError> {
        let Some(root) = &self.data_root else {
            return Ok(PathBuf::from(raw));
        };
        let root = root.canonicalize().map_err(|e| {
            AppError::Internal(format!("Data directory {} is not available: {}", root.display(), e))
        })?;
        let outside = || AppError::Validation(format!("Path '{}' is outside the data directory", raw));

        let requested = Path::new(raw);
        match root.join(requested).canonicalize() {
            Ok(resolved) if resolved.starts_with(&root) => Ok(resolved),
            Ok(_) => Err(outside()),
            Err(_) => {
                let escapes = requested.components().any(|c| matches!(c, Component::ParentDir))
                    || (requested.is_absolute() && !requested.starts_with(&root));
                if escapes {
                    Err(outside())
                } else {
                    Err(AppError::Connection(format!("Path not found: {}", raw)))
                }
            }
        }
    }

    async fn create_backend(&self, kind: SourceKind, descriptor: &ConnectionDescriptor) -> Result<PoolBackend, AppError> {
        match kind {
            SourceKind::Postgres => {
                let url = build_connection_url(kind, descriptor)?;
                tracing::info!("Creating PostgreSQL pool for: {}", mask_credentials(&url));

                let mut cfg = PgPoolConfig::new();
                cfg.url = Some(url);
                cfg.manager = Some(ManagerConfig {
                    recycling_method: RecyclingMethod::Fast,
                });
                let pool = cfg
                    .create_pool(Some(deadpool_postgres::Runtime::Tokio1), NoTls)
                    .map_err(|e| {
                        tracing::error!("Failed to create connection pool: {}", e);
                        AppError::Connection(format!("Failed to create connection pool: {}", e))
                    })?;
                pool.resize(self.max_pool_size);
                Ok(PoolBackend::Postgres(pool))
            }
            SourceKind::MySql => {
                let url = build_connection_url(kind, descriptor)?;
                tracing::info!("Creating MySQL pool for: {}", mask_credentials(&url));

                let opts = mysql_async::Opts::from_url(&url)
                    .map_err(|e| AppError::Connection(format!("Invalid MySQL connection URL: {}", e)))?;
                // One connection beyond the handle limit so a timed-out
                // statement can always be killed
                let constraints = mysql_async::PoolConstraints::new(0, self.max_pool_size + 1).unwrap_or_default();
                let builder = mysql_async::OptsBuilder::from_opts(opts)
                    .pool_opts(mysql_async::PoolOpts::default().with_constraints(constraints));
                Ok(PoolBackend::MySql(mysql_async::Pool::new(builder)))
            }
            SourceKind::Embedded => {
                let path = match descriptor.param("path") {
                    Some(raw) => Some(self.resolve_path(&raw)?),
                    None => None,
                };
                let ctx = self
                    .sessions
                    .open(path.as_deref())
                    .await
                    .map_err(|e| AppError::Connection(format!("Failed to open embedded source: {:#}", e)))?;
                Ok(PoolBackend::Embedded(ctx))
            }
            SourceKind::File => {
                let raw = descriptor
                    .param("path")
                    .ok_or_else(|| AppError::Validation("File sources need a 'path' parameter".to_string()))?;
                Ok(PoolBackend::File(self.resolve_path(&raw)?))
            }
        }
    }

    async fn open_store(backend: &PoolBackend, descriptor: &ConnectionDescriptor) -> Result<StoreHandle, AppError> {
        Ok(match backend {
            PoolBackend::Postgres(pool) => StoreHandle::Postgres(PostgresHandle::connect(pool).await?),
            PoolBackend::MySql(pool) => StoreHandle::MySql(MySqlHandle::connect(pool).await?),
            PoolBackend::Embedded(ctx) => StoreHandle::Embedded(EmbeddedHandle::new(ctx.clone())),
            PoolBackend::File(path) => {
                let handle = FileBackedHandle::from_path(
                    path,
                    descriptor.param("format").as_deref(),
                    descriptor.param("table").as_deref(),
                )
                .await?;
                StoreHandle::FileBacked(handle)
            }
        })
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection pool status information
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub size: usize,
    pub available: usize,
    pub max_size: usize,
    pub live_handles: usize,
}
