//! Engine and storage configuration.
//!
//! Values are built once with the `with_*` methods (or [`Config::from_env`])
//! and are immutable once handed to the engine.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::{env, fmt, str::FromStr, sync::Arc, time::Duration};
use url::Url;

use crate::{
    error::Error,
    keys::DEFAULT_KEY_PREFIX,
    permission::RoleProvider,
    storage::memory::DEFAULT_SWEEP_INTERVAL,
    token::{CustomGenerator, TokenFormat},
};

pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_REMEMBER_DAYS: u32 = 7;
pub const DEFAULT_REDIS_ADDR: &str = "127.0.0.1:6379";
pub const DEFAULT_REDIS_POOL_SIZE: usize = 10;
pub const DEFAULT_REDIS_MAX_RETRIES: usize = 3;
pub const DEFAULT_REDIS_MIN_RETRY_BACKOFF: Duration = Duration::from_millis(8);
pub const DEFAULT_REDIS_MAX_RETRY_BACKOFF: Duration = Duration::from_millis(512);
pub const DEFAULT_REDIS_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_REDIS_READ_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_REDIS_WRITE_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_REDIS_POOL_TIMEOUT: Duration = Duration::from_secs(4);

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Concurrent-login policy applied when a user logs in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoginMode {
    /// A new login evicts every existing token of the user.
    Single,
    /// Any number of concurrent tokens.
    #[default]
    Multi,
    /// A new login evicts the user's tokens issued to the same device.
    Mutex,
}

impl FromStr for LoginMode {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "multi" => Ok(Self::Multi),
            "mutex" => Ok(Self::Mutex),
            other => Err(Error::Config(format!("unknown login mode: {other}"))),
        }
    }
}

impl fmt::Display for LoginMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Single => "single",
            Self::Multi => "multi",
            Self::Mutex => "mutex",
        })
    }
}

#[derive(Clone, Debug)]
pub enum StorageConfig {
    Memory { sweep_interval: Duration },
    Redis(RedisConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Memory {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

#[derive(Clone)]
pub struct Config {
    token_ttl: Duration,
    refresh_ttl: Option<Duration>,
    remember_days: u32,
    token_format: TokenFormat,
    custom_generator: Option<CustomGenerator>,
    login_mode: LoginMode,
    auto_renew: bool,
    key_prefix: String,
    storage: StorageConfig,
    role_provider: Option<Arc<dyn RoleProvider>>,
}

impl Config {
    #[must_use]
    pub fn new() -> Self {
        Self {
            token_ttl: DEFAULT_TOKEN_TTL,
            refresh_ttl: Some(DEFAULT_REFRESH_TTL),
            remember_days: DEFAULT_REMEMBER_DAYS,
            token_format: TokenFormat::default(),
            custom_generator: None,
            login_mode: LoginMode::default(),
            auto_renew: true,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            storage: StorageConfig::default(),
            role_provider: None,
        }
    }

    /// Build a configuration from `TESSERA_*` environment variables on top of
    /// the defaults.
    ///
    /// # Errors
    /// Returns `Config` when a variable is set but cannot be parsed, or when
    /// the selected storage is missing its addresses.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::new();

        if let Some(seconds) = parse_env::<u64>("TESSERA_TOKEN_TTL_SECONDS")? {
            config.token_ttl = Duration::from_secs(seconds);
        }
        if let Some(seconds) = parse_env::<u64>("TESSERA_REFRESH_TTL_SECONDS")? {
            config = config.with_refresh_ttl(Duration::from_secs(seconds));
        }
        if let Some(days) = parse_env::<u32>("TESSERA_REMEMBER_DAYS")? {
            config.remember_days = days;
        }
        if let Some(format) = parse_env::<TokenFormat>("TESSERA_TOKEN_FORMAT")? {
            config.token_format = format;
        }
        if let Some(mode) = parse_env::<LoginMode>("TESSERA_LOGIN_MODE")? {
            config.login_mode = mode;
        }
        if let Some(auto_renew) = bool_env("TESSERA_AUTO_RENEW")? {
            config.auto_renew = auto_renew;
        }
        if let Some(prefix) = env_var("TESSERA_KEY_PREFIX") {
            config.key_prefix = prefix;
        }

        let storage = env_var("TESSERA_STORAGE").unwrap_or_else(|| "memory".to_string());
        config.storage = match storage.to_ascii_lowercase().as_str() {
            "memory" => StorageConfig::default(),
            "redis" => StorageConfig::Redis(redis_from_env(RedisConfig::single(
                env_var("TESSERA_REDIS_ADDR").unwrap_or_else(|| DEFAULT_REDIS_ADDR.to_string()),
            ))?),
            "redis-cluster" | "redis_cluster" => {
                let addrs: Vec<String> = env_var("TESSERA_REDIS_ADDRS")
                    .unwrap_or_default()
                    .split(',')
                    .map(str::trim)
                    .filter(|addr| !addr.is_empty())
                    .map(ToString::to_string)
                    .collect();
                if addrs.is_empty() {
                    return Err(Error::Config(
                        "TESSERA_REDIS_ADDRS is required for redis-cluster storage".to_string(),
                    ));
                }
                StorageConfig::Redis(redis_from_env(RedisConfig::cluster(addrs))?)
            }
            other => return Err(Error::Config(format!("unknown storage backend: {other}"))),
        };

        Ok(config)
    }

    /// `Duration::ZERO` disables expiry.
    #[must_use]
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// `Duration::ZERO` unsets the refresh TTL so remember-days applies.
    #[must_use]
    pub fn with_refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_ttl = (!ttl.is_zero()).then_some(ttl);
        self
    }

    #[must_use]
    pub fn without_refresh_ttl(mut self) -> Self {
        self.refresh_ttl = None;
        self
    }

    #[must_use]
    pub fn with_remember_days(mut self, days: u32) -> Self {
        self.remember_days = days;
        self
    }

    #[must_use]
    pub fn with_token_format(mut self, format: TokenFormat) -> Self {
        self.token_format = format;
        self
    }

    #[must_use]
    pub fn with_custom_generator(mut self, generator: CustomGenerator) -> Self {
        self.custom_generator = Some(generator);
        self
    }

    #[must_use]
    pub fn with_login_mode(mut self, mode: LoginMode) -> Self {
        self.login_mode = mode;
        self
    }

    #[must_use]
    pub fn with_auto_renew(mut self, auto_renew: bool) -> Self {
        self.auto_renew = auto_renew;
        self
    }

    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    #[must_use]
    pub fn with_role_provider(mut self, provider: Arc<dyn RoleProvider>) -> Self {
        self.role_provider = Some(provider);
        self
    }

    #[must_use]
    pub fn token_ttl(&self) -> Duration {
        self.token_ttl
    }

    #[must_use]
    pub fn refresh_ttl(&self) -> Option<Duration> {
        self.refresh_ttl
    }

    #[must_use]
    pub fn remember_days(&self) -> u32 {
        self.remember_days
    }

    /// Lifetime of refresh tokens: the refresh TTL when set, otherwise
    /// remember-days × 24h. `None` means no refresh tokens are issued.
    #[must_use]
    pub fn effective_refresh_ttl(&self) -> Option<Duration> {
        self.refresh_ttl.filter(|ttl| !ttl.is_zero()).or_else(|| {
            (self.remember_days > 0)
                .then(|| Duration::from_secs(u64::from(self.remember_days) * SECONDS_PER_DAY))
        })
    }

    #[must_use]
    pub fn token_format(&self) -> TokenFormat {
        self.token_format
    }

    pub(crate) fn custom_generator(&self) -> Option<&CustomGenerator> {
        self.custom_generator.as_ref()
    }

    #[must_use]
    pub fn login_mode(&self) -> LoginMode {
        self.login_mode
    }

    #[must_use]
    pub fn auto_renew(&self) -> bool {
        self.auto_renew
    }

    #[must_use]
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    #[must_use]
    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }

    pub(crate) fn role_provider(&self) -> Option<&Arc<dyn RoleProvider>> {
        self.role_provider.as_ref()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("token_ttl", &self.token_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .field("remember_days", &self.remember_days)
            .field("token_format", &self.token_format)
            .field("custom_generator", &self.custom_generator.is_some())
            .field("login_mode", &self.login_mode)
            .field("auto_renew", &self.auto_renew)
            .field("key_prefix", &self.key_prefix)
            .field("storage", &self.storage)
            .field("role_provider", &self.role_provider.is_some())
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RedisTopology {
    Single { addr: String, db: i64 },
    Cluster { addrs: Vec<String> },
}

impl RedisTopology {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Single { .. } => "single",
            Self::Cluster { .. } => "cluster",
        }
    }
}

/// Connection parameters for the Redis backend. `Debug` never prints the
/// password.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    topology: RedisTopology,
    username: Option<String>,
    password: Option<SecretString>,
    pool_size: usize,
    min_idle: usize,
    max_retries: usize,
    min_retry_backoff: Duration,
    max_retry_backoff: Duration,
    dial_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    pool_timeout: Duration,
    tls: bool,
    tls_skip_verify: bool,
    client_name: Option<String>,
}

impl RedisConfig {
    /// Single node at `addr` (`host:port`), database 0.
    #[must_use]
    pub fn single(addr: impl Into<String>) -> Self {
        Self::with_topology(RedisTopology::Single {
            addr: addr.into(),
            db: 0,
        })
    }

    /// Cluster seeded from `addrs` (`host:port` each).
    #[must_use]
    pub fn cluster<I, S>(addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_topology(RedisTopology::Cluster {
            addrs: addrs.into_iter().map(Into::into).collect(),
        })
    }

    fn with_topology(topology: RedisTopology) -> Self {
        Self {
            topology,
            username: None,
            password: None,
            pool_size: DEFAULT_REDIS_POOL_SIZE,
            min_idle: 0,
            max_retries: DEFAULT_REDIS_MAX_RETRIES,
            min_retry_backoff: DEFAULT_REDIS_MIN_RETRY_BACKOFF,
            max_retry_backoff: DEFAULT_REDIS_MAX_RETRY_BACKOFF,
            dial_timeout: DEFAULT_REDIS_DIAL_TIMEOUT,
            read_timeout: DEFAULT_REDIS_READ_TIMEOUT,
            write_timeout: DEFAULT_REDIS_WRITE_TIMEOUT,
            pool_timeout: DEFAULT_REDIS_POOL_TIMEOUT,
            tls: false,
            tls_skip_verify: false,
            client_name: None,
        }
    }

    /// Ignored in cluster mode, which only has database 0.
    #[must_use]
    pub fn with_db(mut self, db: i64) -> Self {
        if let RedisTopology::Single { db: current, .. } = &mut self.topology {
            *current = db;
        }
        self
    }

    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    #[must_use]
    pub fn with_password(mut self, password: SecretString) -> Self {
        self.password = Some(password);
        self
    }

    /// Single node only; the cluster backend keeps one multiplexed connection.
    #[must_use]
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Single node only, like [`Self::with_pool_size`].
    #[must_use]
    pub fn with_min_idle(mut self, min_idle: usize) -> Self {
        self.min_idle = min_idle;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    #[must_use]
    pub fn with_retry_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_retry_backoff = min;
        self.max_retry_backoff = max.max(min);
        self
    }

    #[must_use]
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_pool_timeout(mut self, timeout: Duration) -> Self {
        self.pool_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Enables TLS without certificate verification.
    #[must_use]
    pub fn with_tls_skip_verify(mut self, skip: bool) -> Self {
        self.tls_skip_verify = skip;
        if skip {
            self.tls = true;
        }
        self
    }

    /// Sent with `CLIENT SETNAME` on single-node connections; ignored in
    /// cluster mode.
    #[must_use]
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn topology(&self) -> &RedisTopology {
        &self.topology
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    #[must_use]
    pub fn min_idle(&self) -> usize {
        self.min_idle
    }

    #[must_use]
    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    #[must_use]
    pub fn min_retry_backoff(&self) -> Duration {
        self.min_retry_backoff
    }

    #[must_use]
    pub fn max_retry_backoff(&self) -> Duration {
        self.max_retry_backoff
    }

    #[must_use]
    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    #[must_use]
    pub fn pool_timeout(&self) -> Duration {
        self.pool_timeout
    }

    #[must_use]
    pub fn tls(&self) -> bool {
        self.tls
    }

    #[must_use]
    pub fn tls_skip_verify(&self) -> bool {
        self.tls_skip_verify
    }

    #[must_use]
    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    /// One connection URL per configured address, credentials included.
    ///
    /// # Errors
    /// Returns `Config` when an address cannot form a valid URL.
    pub(crate) fn connection_urls(&self) -> Result<Vec<String>, Error> {
        match &self.topology {
            RedisTopology::Single { addr, db } => Ok(vec![self.connection_url(addr, Some(*db))?]),
            RedisTopology::Cluster { addrs } => addrs
                .iter()
                .map(|addr| self.connection_url(addr, None))
                .collect(),
        }
    }

    fn connection_url(&self, addr: &str, db: Option<i64>) -> Result<String, Error> {
        let scheme = if self.tls { "rediss" } else { "redis" };
        let mut url = Url::parse(&format!("{scheme}://{addr}"))
            .map_err(|err| Error::Config(format!("invalid redis address {addr}: {err}")))?;
        if url.host_str().map_or(true, str::is_empty) {
            return Err(Error::Config(format!("invalid redis address {addr}")));
        }

        if let Some(username) = &self.username {
            url.set_username(username)
                .map_err(|()| Error::Config("error setting redis username".to_string()))?;
        }
        if let Some(password) = &self.password {
            url.set_password(Some(password.expose_secret()))
                .map_err(|()| Error::Config("error setting redis password".to_string()))?;
        }
        if let Some(db) = db {
            url.set_path(&db.to_string());
        }
        if self.tls && self.tls_skip_verify {
            url.set_fragment(Some("insecure"));
        }
        Ok(url.to_string())
    }
}

fn redis_from_env(mut redis: RedisConfig) -> Result<RedisConfig, Error> {
    if let Some(username) = env_var("TESSERA_REDIS_USERNAME") {
        redis = redis.with_username(username);
    }
    if let Some(password) = env_var("TESSERA_REDIS_PASSWORD") {
        redis = redis.with_password(SecretString::from(password));
    }
    if let Some(db) = parse_env::<i64>("TESSERA_REDIS_DB")? {
        redis = redis.with_db(db);
    }
    if let Some(size) = parse_env::<usize>("TESSERA_REDIS_POOL_SIZE")? {
        redis = redis.with_pool_size(size);
    }
    if let Some(tls) = bool_env("TESSERA_REDIS_TLS")? {
        redis = redis.with_tls(tls);
    }
    Ok(redis)
}

fn env_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_env<T>(name: &str) -> Result<Option<T>, Error>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    env_var(name)
        .map(|value| {
            value
                .parse::<T>()
                .map_err(|err| Error::Config(format!("invalid {name}: {err}")))
        })
        .transpose()
}

fn bool_env(name: &str) -> Result<Option<bool>, Error> {
    env_var(name)
        .map(|value| match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(Error::Config(format!("invalid {name}: {value}"))),
        })
        .transpose()
}
