//! Redis storage backend, single node or cluster.
//!
//! Flow Overview:
//! 1) Single node: a fixed set of `ConnectionManager` slots, filled lazily
//!    (the first `min_idle` eagerly) and handed out round-robin. Each manager
//!    reconnects on its own with exponential backoff.
//! 2) Cluster: one multiplexed cluster connection; keyed commands are routed
//!    by slot, `SCAN` runs against every master and the results are merged.
//! 3) Every command races against the caller's [`Context`].
//!
//! TTLs map to `SET ... PX`; scans use `SCAN MATCH COUNT`, never `KEYS`.

use async_trait::async_trait;
use redis::{
    aio::{ConnectionManager, ConnectionManagerConfig},
    cluster::ClusterClientBuilder,
    cluster_async::ClusterConnection,
    cluster_routing::{RoutingInfo, SingleNodeRoutingInfo},
    Client, Cmd,
};
use std::{
    collections::HashSet,
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use tokio::sync::OnceCell;
use tracing::{debug, info_span, instrument, Instrument};

use super::Storage;
use crate::{
    config::{RedisConfig, RedisTopology},
    context::Context,
    error::StorageError,
};

const SCAN_COUNT: usize = 1000;

pub struct RedisStorage {
    backend: Backend,
}

enum Backend {
    Single(SinglePool),
    Cluster(ClusterConnection),
}

struct SinglePool {
    client: Client,
    slots: Vec<OnceCell<ConnectionManager>>,
    next: AtomicUsize,
    settings: PoolSettings,
}

#[derive(Clone)]
struct PoolSettings {
    max_retries: usize,
    min_backoff: Duration,
    max_backoff: Duration,
    dial_timeout: Duration,
    response_timeout: Duration,
    pool_timeout: Duration,
    client_name: Option<String>,
}

impl RedisStorage {
    /// Connect according to `config`.
    ///
    /// # Errors
    /// Returns `Config` for unusable addresses or credentials and `Redis` when
    /// the eager connections cannot be established.
    #[instrument(skip(config), fields(topology = config.topology().name()))]
    pub async fn connect(config: &RedisConfig) -> Result<Self, StorageError> {
        let urls = config
            .connection_urls()
            .map_err(|err| StorageError::Config(err.to_string()))?;

        let backend = match config.topology() {
            RedisTopology::Single { .. } => {
                let url = urls
                    .into_iter()
                    .next()
                    .ok_or_else(|| StorageError::Config("redis address is required".to_string()))?;
                let pool = SinglePool {
                    client: Client::open(url)?,
                    slots: (0..config.pool_size().max(1))
                        .map(|_| OnceCell::new())
                        .collect(),
                    next: AtomicUsize::new(0),
                    settings: PoolSettings::from(config),
                };
                pool.warm_up(config.min_idle()).await?;
                Backend::Single(pool)
            }
            RedisTopology::Cluster { .. } => {
                if urls.is_empty() {
                    return Err(StorageError::Config(
                        "at least one redis cluster address is required".to_string(),
                    ));
                }
                let client = ClusterClientBuilder::new(urls)
                    .retries(u32::try_from(config.max_retries()).unwrap_or(u32::MAX))
                    .min_retry_wait(duration_millis(config.min_retry_backoff()))
                    .max_retry_wait(duration_millis(config.max_retry_backoff()))
                    .connection_timeout(config.dial_timeout())
                    .response_timeout(config.read_timeout().max(config.write_timeout()))
                    .build()?;
                let connection = tokio::time::timeout(
                    config.pool_timeout(),
                    client.get_async_connection(),
                )
                .await
                .map_err(|_| StorageError::PoolTimeout(config.pool_timeout()))??;
                Backend::Cluster(connection)
            }
        };

        debug!("Redis storage connected");
        Ok(Self { backend })
    }

    async fn query<T>(&self, cmd: &Cmd, operation: &'static str) -> Result<T, StorageError>
    where
        T: redis::FromRedisValue,
    {
        let span = info_span!("redis.command", db.system = "redis", db.operation = operation);
        async {
            match &self.backend {
                Backend::Single(pool) => {
                    let mut conn = pool.connection().await?;
                    let value: T = cmd.query_async(&mut conn).await?;
                    Ok(value)
                }
                Backend::Cluster(connection) => {
                    let mut conn = connection.clone();
                    let value: T = cmd.query_async(&mut conn).await?;
                    Ok(value)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        let span = info_span!("redis.command", db.system = "redis", db.operation = "SCAN");
        async {
            match &self.backend {
                Backend::Single(pool) => {
                    let conn = pool.connection().await?;
                    scan_node(pattern, |cmd| {
                        let mut conn = conn.clone();
                        async move {
                            let page: (u64, Vec<String>) = cmd.query_async(&mut conn).await?;
                            Ok(page)
                        }
                    })
                    .await
                }
                Backend::Cluster(connection) => scan_cluster(connection, pattern).await,
            }
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn set(
        &self,
        ctx: &Context,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let cmd = set_cmd(key, value, ttl);
        ctx.run(self.query::<()>(&cmd, "SET")).await
    }

    async fn set_existing(
        &self,
        ctx: &Context,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let mut cmd = set_cmd(key, value, ttl);
        cmd.arg("XX");
        ctx.run(self.query::<Option<String>>(&cmd, "SET"))
            .await
            .map(|reply| reply.is_some())
    }

    async fn get(&self, ctx: &Context, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        ctx.run(self.query::<Option<Vec<u8>>>(&cmd, "GET")).await
    }

    async fn take(&self, ctx: &Context, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut cmd = redis::cmd("GETDEL");
        cmd.arg(key);
        ctx.run(self.query::<Option<Vec<u8>>>(&cmd, "GETDEL")).await
    }

    async fn delete(&self, ctx: &Context, key: &str) -> Result<(), StorageError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        ctx.run(self.query::<i64>(&cmd, "DEL")).await.map(|_| ())
    }

    async fn exists(&self, ctx: &Context, key: &str) -> Result<bool, StorageError> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        ctx.run(self.query::<i64>(&cmd, "EXISTS"))
            .await
            .map(|count| count > 0)
    }

    async fn scan(&self, ctx: &Context, pattern: &str) -> Result<Vec<String>, StorageError> {
        ctx.run(self.scan_keys(pattern)).await
    }

    fn backend(&self) -> &'static str {
        match self.backend {
            Backend::Single(_) => "redis",
            Backend::Cluster(_) => "redis-cluster",
        }
    }
}

impl fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("RedisStorage");
        match &self.backend {
            Backend::Single(pool) => out
                .field("topology", &"single")
                .field("pool_size", &pool.slots.len())
                .field(
                    "connected",
                    &pool.slots.iter().filter(|slot| slot.initialized()).count(),
                ),
            Backend::Cluster(_) => out.field("topology", &"cluster"),
        }
        .finish()
    }
}

impl SinglePool {
    async fn warm_up(&self, min_idle: usize) -> Result<(), StorageError> {
        for slot in self.slots.iter().take(min_idle) {
            slot.get_or_try_init(|| self.open()).await?;
        }
        Ok(())
    }

    async fn connection(&self) -> Result<ConnectionManager, StorageError> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let slot = &self.slots[index];
        if let Some(conn) = slot.get() {
            return Ok(conn.clone());
        }

        let timeout = self.settings.pool_timeout;
        tokio::time::timeout(timeout, slot.get_or_try_init(|| self.open()))
            .await
            .map_err(|_| StorageError::PoolTimeout(timeout))?
            .cloned()
    }

    async fn open(&self) -> Result<ConnectionManager, StorageError> {
        let settings = &self.settings;
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(settings.max_retries)
            .set_exponent_base(2)
            .set_factor(duration_millis(settings.min_backoff).max(1))
            .set_max_delay(duration_millis(settings.max_backoff))
            .set_connection_timeout(settings.dial_timeout)
            .set_response_timeout(settings.response_timeout);

        let mut conn = self
            .client
            .get_connection_manager_with_config(config)
            .await?;

        if let Some(name) = &settings.client_name {
            let _: () = redis::cmd("CLIENT")
                .arg("SETNAME")
                .arg(name)
                .query_async(&mut conn)
                .await?;
        }
        debug!("Opened redis connection");
        Ok(conn)
    }
}

impl From<&RedisConfig> for PoolSettings {
    fn from(config: &RedisConfig) -> Self {
        Self {
            max_retries: config.max_retries(),
            min_backoff: config.min_retry_backoff(),
            max_backoff: config.max_retry_backoff(),
            dial_timeout: config.dial_timeout(),
            response_timeout: config.read_timeout().max(config.write_timeout()),
            pool_timeout: config.pool_timeout(),
            client_name: config.client_name().map(ToString::to_string),
        }
    }
}

async fn scan_node<F, Fut>(pattern: &str, mut page: F) -> Result<Vec<String>, StorageError>
where
    F: FnMut(Cmd) -> Fut,
    Fut: std::future::Future<Output = Result<(u64, Vec<String>), StorageError>>,
{
    let mut keys = Vec::new();
    let mut cursor = 0u64;
    loop {
        let (next, batch) = page(scan_cmd(cursor, pattern)).await?;
        keys.extend(batch);
        if next == 0 {
            return Ok(keys);
        }
        cursor = next;
    }
}

async fn scan_cluster(
    connection: &ClusterConnection,
    pattern: &str,
) -> Result<Vec<String>, StorageError> {
    let mut cmd = redis::cmd("CLUSTER");
    cmd.arg("NODES");
    let nodes = connection
        .clone()
        .route_command(&cmd, RoutingInfo::SingleNode(SingleNodeRoutingInfo::Random))
        .await?;
    let nodes: String = redis::from_redis_value(&nodes)?;

    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    for (host, port) in master_addresses(&nodes) {
        let batch = scan_node(pattern, |cmd| {
            let mut conn = connection.clone();
            let host = host.clone();
            async move {
                let value = conn
                    .route_command(
                        &cmd,
                        RoutingInfo::SingleNode(SingleNodeRoutingInfo::ByAddress { host, port }),
                    )
                    .await?;
                let page: (u64, Vec<String>) = redis::from_redis_value(&value)?;
                Ok(page)
            }
        })
        .await?;
        for key in batch {
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }
    }
    Ok(keys)
}

/// `SET key value [PX ms]`; sub-millisecond TTLs round up to 1ms.
fn set_cmd(key: &str, value: Vec<u8>, ttl: Duration) -> Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value);
    if !ttl.is_zero() {
        cmd.arg("PX").arg(duration_millis(ttl).max(1));
    }
    cmd
}

fn scan_cmd(cursor: u64, pattern: &str) -> Cmd {
    let mut cmd = redis::cmd("SCAN");
    cmd.arg(cursor)
        .arg("MATCH")
        .arg(pattern)
        .arg("COUNT")
        .arg(SCAN_COUNT);
    cmd
}

/// Healthy masters from `CLUSTER NODES` output.
///
/// Each line reads `<id> <ip:port@cport[,hostname]> <flags> ...`.
fn master_addresses(nodes: &str) -> Vec<(String, u16)> {
    nodes
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _id = fields.next()?;
            let address = fields.next()?;
            let flags = fields.next()?;
            let flags: Vec<&str> = flags.split(',').collect();
            if !flags.contains(&"master") || flags.iter().any(|flag| flag.starts_with("fail")) {
                return None;
            }
            let address = address.split(['@', ',']).next()?;
            let (host, port) = address.rsplit_once(':')?;
            if host.is_empty() {
                return None;
            }
            Some((host.to_string(), port.parse().ok()?))
        })
        .collect()
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
