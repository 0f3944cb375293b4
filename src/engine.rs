//! Session and login engine.
//!
//! Flow Overview:
//! 1) Login applies the login-mode policy, mints an access token (and a
//!    refresh token when a refresh lifetime is configured) and persists the
//!    session unit plus the refresh record.
//! 2) Verify reads the login info, enforces the sliding TTL and, with
//!    auto-renew, pushes `last_access` and the storage TTL forward.
//! 3) Refresh exchanges a refresh token once: the old record is deleted and a
//!    fresh access/refresh pair is issued.
//! 4) Logout deletes a single session; logout-by-user sweeps the user index.
//!
//! Raw tokens are never logged.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::{debug, instrument, warn};

use crate::{
    config::{Config, LoginMode, StorageConfig},
    context::Context,
    error::Error,
    keys::KeyNamespace,
    model::{
        add_ttl, Attributes, LoginInfo, LoginRequest, LoginResponse, Principal, RefreshTokenInfo,
        Session, ATTR_DEVICE, ATTR_IP, ATTR_REFRESH, ATTR_TYPE, ATTR_USER_ID, TOKEN_TYPE_REFRESH,
    },
    permission::{PermissionEvaluator, RoleProvider},
    session::SessionStore,
    storage::{store_json, take_json, MemoryStorage, RedisStorage, Storage},
    token::{TokenFormat, TokenGenerator},
};

#[derive(Debug)]
pub struct Engine {
    config: Config,
    storage: Arc<dyn Storage>,
    keys: KeyNamespace,
    generator: TokenGenerator,
    sessions: SessionStore,
    permissions: PermissionEvaluator,
}

impl Engine {
    /// Build the storage backend selected in `config` and the engine on top.
    ///
    /// # Errors
    /// Returns `Config` for an invalid configuration and `Storage` when the
    /// backend cannot be reached.
    #[instrument(skip(config))]
    pub async fn connect(config: Config) -> Result<Self, Error> {
        let storage: Arc<dyn Storage> = match config.storage() {
            StorageConfig::Memory { sweep_interval } => {
                Arc::new(MemoryStorage::with_sweep_interval(*sweep_interval))
            }
            StorageConfig::Redis(redis) => Arc::new(
                RedisStorage::connect(redis)
                    .await
                    .map_err(Error::storage("connect storage"))?,
            ),
        };
        Self::with_storage(config, storage)
    }

    /// Build an engine over an already constructed backend. The storage
    /// selection inside `config` is ignored.
    ///
    /// # Errors
    /// Returns `Config` when the `custom` token format is selected without a
    /// custom generator.
    pub fn with_storage(config: Config, storage: Arc<dyn Storage>) -> Result<Self, Error> {
        let generator = TokenGenerator::new(config.token_format());
        if let Some(custom) = config.custom_generator() {
            generator.register_custom(Arc::clone(custom));
        }
        if config.token_format() == TokenFormat::Custom && !generator.has_custom() {
            return Err(Error::Config(
                "custom token format requires a custom generator".to_string(),
            ));
        }

        let keys = KeyNamespace::new(config.key_prefix());
        let sessions = SessionStore::new(Arc::clone(&storage), keys.clone(), config.token_ttl());
        let permissions = PermissionEvaluator::new(config.role_provider().cloned());

        debug!(
            backend = storage.backend(),
            login_mode = %config.login_mode(),
            token_format = %config.token_format(),
            "Engine ready"
        );

        Ok(Self {
            config,
            storage,
            keys,
            generator,
            sessions,
            permissions,
        })
    }

    /// Issue a session for an already authenticated user.
    ///
    /// # Errors
    /// `InvalidRequest` for an empty user id, `TokenGeneration`, or `Storage`
    /// naming the step that failed.
    #[instrument(skip(self, ctx, request), fields(user_id = %request.user_id, device = %request.device))]
    pub async fn login(&self, ctx: &Context, request: &LoginRequest) -> Result<LoginResponse, Error> {
        if request.user_id.is_empty() {
            return Err(Error::InvalidRequest("user id is required"));
        }
        ctx.check().map_err(Error::storage("login"))?;

        let evicted = match self.config.login_mode() {
            LoginMode::Single => self.sessions.evict_user(ctx, &request.user_id, None).await?,
            LoginMode::Mutex => {
                self.sessions
                    .evict_user(ctx, &request.user_id, Some(&request.device))
                    .await?
            }
            LoginMode::Multi => 0,
        };
        if evicted > 0 {
            debug!(evicted, "Evicted sessions for login mode");
        }

        let mut attributes = request.extra.clone();
        attributes.insert(ATTR_USER_ID.to_string(), Value::from(request.user_id.as_str()));
        attributes.insert(ATTR_DEVICE.to_string(), Value::from(request.device.as_str()));
        attributes.insert(ATTR_IP.to_string(), Value::from(request.ip.as_str()));
        let token = self.generator.generate(&attributes)?;

        let refresh = match self.config.effective_refresh_ttl() {
            Some(ttl) => Some((self.mint_refresh_token(&request.user_id, &token)?, ttl)),
            None => None,
        };

        let now = Utc::now();
        let session = Session {
            user_id: request.user_id.clone(),
            token: token.clone(),
            device: request.device.clone(),
            ip: request.ip.clone(),
            login_time: now,
            last_access: now,
            extra: request.extra.clone(),
        };
        self.sessions.create(ctx, &session).await?;

        let (refresh_token, refresh_expires_at) = match refresh {
            Some((refresh_token, ttl)) => {
                let info = RefreshTokenInfo {
                    refresh_token,
                    user_id: request.user_id.clone(),
                    device: request.device.clone(),
                    created_at: now,
                    expires_at: add_ttl(now, ttl),
                    extra: request.extra.clone(),
                };
                self.store_refresh(ctx, &info, ttl).await?;
                (Some(info.refresh_token), Some(info.expires_at))
            }
            None => (None, None),
        };

        debug!("User logged in");
        Ok(LoginResponse {
            token,
            refresh_token,
            expires_at: self.token_expiry(now),
            refresh_expires_at,
            principal: Principal {
                id: request.user_id.clone(),
                extra: request.extra.clone(),
            },
        })
    }

    /// Validate `token` and return its owner.
    ///
    /// # Errors
    /// `InvalidRequest`, `LoginInfoNotFound`, `TokenExpired`, or `Storage`
    /// when the login info cannot be read. `SessionNotFound` when the session
    /// was destroyed while being renewed. Other renewal failures are only
    /// logged.
    #[instrument(skip_all)]
    pub async fn verify(&self, ctx: &Context, token: &str) -> Result<Principal, Error> {
        if token.is_empty() {
            return Err(Error::InvalidRequest("token is required"));
        }

        let info = self
            .sessions
            .load_login_info(ctx, token)
            .await?
            .ok_or(Error::LoginInfoNotFound)?;

        let now = Utc::now();
        if info.is_expired(self.config.token_ttl(), now) {
            debug!(user_id = %info.user_id, "Token expired");
            return Err(Error::TokenExpired);
        }

        if self.config.auto_renew() {
            match self.sessions.renew(ctx, &info, now).await {
                Ok(()) => {}
                Err(err @ (Error::SessionNotFound | Error::LoginInfoNotFound)) => {
                    debug!(user_id = %info.user_id, "Session ended during renewal");
                    return Err(err);
                }
                Err(err) => warn!(user_id = %info.user_id, "Failed to renew session: {err}"),
            }
        }

        Ok(Principal {
            id: info.user_id,
            extra: info.extra,
        })
    }

    /// Whether `token` is currently valid. Unlike [`Self::verify`] this never
    /// renews the session.
    ///
    /// # Errors
    /// Returns `Storage` when the login info cannot be read.
    #[instrument(skip_all)]
    pub async fn is_login(&self, ctx: &Context, token: &str) -> Result<bool, Error> {
        if token.is_empty() {
            return Ok(false);
        }
        Ok(self
            .sessions
            .load_login_info(ctx, token)
            .await?
            .is_some_and(|info| !info.is_expired(self.config.token_ttl(), Utc::now())))
    }

    /// # Errors
    /// `InvalidRequest`, `LoginInfoNotFound`, or `Storage`.
    #[instrument(skip_all)]
    pub async fn login_info(&self, ctx: &Context, token: &str) -> Result<LoginInfo, Error> {
        if token.is_empty() {
            return Err(Error::InvalidRequest("token is required"));
        }
        self.sessions
            .load_login_info(ctx, token)
            .await?
            .ok_or(Error::LoginInfoNotFound)
    }

    /// # Errors
    /// `InvalidRequest`, `SessionNotFound`, or `Storage`.
    #[instrument(skip_all)]
    pub async fn session(&self, ctx: &Context, token: &str) -> Result<Session, Error> {
        if token.is_empty() {
            return Err(Error::InvalidRequest("token is required"));
        }
        self.sessions
            .load_session(ctx, token)
            .await?
            .ok_or(Error::SessionNotFound)
    }

    /// End the session of `token`. Logging out twice is not an error.
    ///
    /// # Errors
    /// `InvalidRequest` or `Storage`.
    #[instrument(skip_all)]
    pub async fn logout(&self, ctx: &Context, token: &str) -> Result<(), Error> {
        self.kick_out_token(ctx, token).await.map(|_| ())
    }

    /// Evict a single session. Returns whether it existed.
    ///
    /// # Errors
    /// `InvalidRequest` or `Storage`.
    #[instrument(skip_all)]
    pub async fn kick_out_token(&self, ctx: &Context, token: &str) -> Result<bool, Error> {
        if token.is_empty() {
            return Err(Error::InvalidRequest("token is required"));
        }
        self.sessions.destroy(ctx, token).await
    }

    /// End every session of `user_id`. Returns how many were removed.
    ///
    /// # Errors
    /// `InvalidRequest`, or `Storage` when the user index cannot be scanned.
    #[instrument(skip(self, ctx))]
    pub async fn logout_by_user_id(&self, ctx: &Context, user_id: &str) -> Result<usize, Error> {
        if user_id.is_empty() {
            return Err(Error::InvalidRequest("user id is required"));
        }
        self.sessions.evict_user(ctx, user_id, None).await
    }

    /// Exchange a refresh token for a new access/refresh pair. The presented
    /// refresh token is consumed atomically, so of several concurrent
    /// exchanges at most one succeeds.
    ///
    /// # Errors
    /// `InvalidRequest`, `RefreshTokenNotFound`, `RefreshTokenExpired`,
    /// `TokenGeneration`, or `Storage`.
    #[instrument(skip_all)]
    pub async fn refresh_access_token(
        &self,
        ctx: &Context,
        refresh_token: &str,
    ) -> Result<LoginResponse, Error> {
        if refresh_token.is_empty() {
            return Err(Error::InvalidRequest("refresh token is required"));
        }

        let key = self.keys.refresh_token(refresh_token);
        let stored: RefreshTokenInfo = take_json(self.storage.as_ref(), ctx, &key)
            .await
            .map_err(Error::storage("consume refresh token"))?
            .ok_or(Error::RefreshTokenNotFound)?;

        let now = Utc::now();
        if stored.is_expired(now) {
            return Err(Error::RefreshTokenExpired);
        }

        let (token, next_refresh_token) = match self.mint_token_pair(&stored.user_id) {
            Ok(pair) => pair,
            Err(err) => {
                self.restore_refresh(ctx, &stored, now).await;
                return Err(err);
            }
        };

        let session = Session {
            user_id: stored.user_id.clone(),
            token: token.clone(),
            device: stored.device.clone(),
            ip: String::new(),
            login_time: now,
            last_access: now,
            extra: stored.extra.clone(),
        };
        self.sessions.create(ctx, &session).await?;

        let ttl = self
            .config
            .effective_refresh_ttl()
            .or_else(|| (stored.expires_at - stored.created_at).to_std().ok())
            .filter(|ttl| !ttl.is_zero())
            .unwrap_or(Duration::from_secs(1));
        let info = RefreshTokenInfo {
            refresh_token: next_refresh_token,
            user_id: stored.user_id.clone(),
            device: stored.device,
            created_at: now,
            expires_at: add_ttl(now, ttl),
            extra: stored.extra.clone(),
        };
        self.store_refresh(ctx, &info, ttl).await?;

        debug!(user_id = %stored.user_id, "Refresh token exchanged");
        Ok(LoginResponse {
            token,
            refresh_token: Some(info.refresh_token),
            expires_at: self.token_expiry(now),
            refresh_expires_at: Some(info.expires_at),
            principal: Principal {
                id: stored.user_id,
                extra: stored.extra,
            },
        })
    }

    /// # Errors
    /// See [`PermissionEvaluator::check_permission`].
    pub async fn check_permission(
        &self,
        ctx: &Context,
        user_id: &str,
        permission: &str,
    ) -> Result<bool, Error> {
        self.permissions
            .check_permission(ctx, user_id, permission)
            .await
    }

    /// # Errors
    /// See [`PermissionEvaluator::check_role`].
    pub async fn check_role(&self, ctx: &Context, user_id: &str, role_id: &str) -> Result<bool, Error> {
        self.permissions.check_role(ctx, user_id, role_id).await
    }

    /// # Errors
    /// See [`PermissionEvaluator::check_role_or_permission`].
    pub async fn check_role_or_permission(
        &self,
        ctx: &Context,
        user_id: &str,
        role_ids: &[&str],
        permissions: &[&str],
    ) -> Result<bool, Error> {
        self.permissions
            .check_role_or_permission(ctx, user_id, role_ids, permissions)
            .await
    }

    /// # Errors
    /// `PermissionDenied` when the permission is missing.
    pub async fn require_permission(
        &self,
        ctx: &Context,
        user_id: &str,
        permission: &str,
    ) -> Result<(), Error> {
        self.permissions
            .require_permission(ctx, user_id, permission)
            .await
    }

    /// # Errors
    /// `RoleNotFound` when the role is missing.
    pub async fn require_role(&self, ctx: &Context, user_id: &str, role_id: &str) -> Result<(), Error> {
        self.permissions.require_role(ctx, user_id, role_id).await
    }

    pub fn set_role_provider(&self, provider: Arc<dyn RoleProvider>) {
        self.permissions.set_role_provider(provider);
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    #[must_use]
    pub fn keys(&self) -> &KeyNamespace {
        &self.keys
    }

    #[must_use]
    pub fn token_generator(&self) -> &TokenGenerator {
        &self.generator
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    #[must_use]
    pub fn permissions(&self) -> &PermissionEvaluator {
        &self.permissions
    }

    fn mint_token_pair(&self, user_id: &str) -> Result<(String, String), Error> {
        let mut attributes = Attributes::new();
        attributes.insert(ATTR_USER_ID.to_string(), Value::from(user_id));
        attributes.insert(ATTR_REFRESH.to_string(), Value::Bool(true));
        let token = self.generator.generate(&attributes)?;
        let refresh_token = self.mint_refresh_token(user_id, &token)?;
        Ok((token, refresh_token))
    }

    /// Put back a consumed refresh record whose exchange failed before
    /// anything was issued.
    async fn restore_refresh(
        &self,
        ctx: &Context,
        info: &RefreshTokenInfo,
        now: DateTime<Utc>,
    ) {
        let Ok(remaining) = (info.expires_at - now).to_std() else {
            return;
        };
        if remaining.is_zero() {
            return;
        }
        if let Err(err) = self.store_refresh(ctx, info, remaining).await {
            warn!(user_id = %info.user_id, "Failed to restore refresh token: {err}");
        }
    }

    fn mint_refresh_token(&self, user_id: &str, access_token: &str) -> Result<String, Error> {
        let mut attributes = Attributes::new();
        attributes.insert(ATTR_USER_ID.to_string(), Value::from(user_id));
        attributes.insert(ATTR_TYPE.to_string(), Value::from(TOKEN_TYPE_REFRESH));
        // Never hand out a refresh token usable as (or equal to) the session token.
        self.generator.rotate(access_token, &attributes)
    }

    async fn store_refresh(
        &self,
        ctx: &Context,
        info: &RefreshTokenInfo,
        ttl: Duration,
    ) -> Result<(), Error> {
        store_json(
            self.storage.as_ref(),
            ctx,
            &self.keys.refresh_token(&info.refresh_token),
            info,
            ttl,
        )
        .await
        .map_err(Error::storage("store refresh token"))
    }

    fn token_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ttl = self.config.token_ttl();
        if ttl.is_zero() {
            DateTime::<Utc>::MAX_UTC
        } else {
            add_ttl(now, ttl)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;
    use crate::permission::StaticRoleProvider;
    use crate::storage::load_json;

    fn engine(config: Config) -> Result<Engine, Error> {
        Engine::with_storage(config, Arc::new(MemoryStorage::new()))
    }

    #[tokio::test]
    async fn custom_format_without_generator_is_a_config_error() {
        let result = engine(Config::new().with_token_format(TokenFormat::Custom));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn custom_generator_sees_identity_attributes() -> anyhow::Result<()> {
        let config = Config::new()
            .with_token_format(TokenFormat::Custom)
            .with_custom_generator(Arc::new(|attrs: &Attributes| -> anyhow::Result<String> {
                let user = attrs.get(ATTR_USER_ID).and_then(Value::as_str).unwrap_or("");
                let kind = attrs.get(ATTR_TYPE).and_then(Value::as_str).unwrap_or("access");
                Ok(format!("{kind}-{user}-{}", uuid::Uuid::new_v4().simple()))
            }));
        let engine = engine(config)?;
        let ctx = Context::background();

        let response = engine
            .login(&ctx, &LoginRequest::new("u1").with_extra(ATTR_USER_ID, "spoofed"))
            .await?;
        assert!(response.token.starts_with("access-u1-"));
        assert!(response
            .refresh_token
            .as_deref()
            .is_some_and(|token| token.starts_with("refresh-u1-")));
        Ok(())
    }

    #[tokio::test]
    async fn login_stores_refresh_record_with_device() -> anyhow::Result<()> {
        let engine = engine(Config::new())?;
        let ctx = Context::background();
        let response = engine
            .login(&ctx, &LoginRequest::new("u1").with_device("ios"))
            .await?;

        let Some(refresh_token) = response.refresh_token else {
            anyhow::bail!("refresh token missing");
        };
        let key = engine.keys().refresh_token(&refresh_token);
        let info: Option<RefreshTokenInfo> = load_json(engine.storage().as_ref(), &ctx, &key).await?;
        let Some(info) = info else {
            anyhow::bail!("refresh record missing");
        };
        assert_eq!(info.user_id, "u1");
        assert_eq!(info.device, "ios");
        assert_eq!(Some(info.expires_at), response.refresh_expires_at);
        Ok(())
    }

    #[tokio::test]
    async fn refresh_carries_device_and_clears_origin() -> anyhow::Result<()> {
        let engine = engine(Config::new())?;
        let ctx = Context::background();
        let response = engine
            .login(&ctx, &LoginRequest::new("u1").with_device("ios").with_ip("10.1.1.1"))
            .await?;
        let Some(refresh_token) = response.refresh_token else {
            anyhow::bail!("refresh token missing");
        };

        let refreshed = engine.refresh_access_token(&ctx, &refresh_token).await?;
        let session = engine.session(&ctx, &refreshed.token).await?;
        assert_eq!(session.device, "ios");
        assert!(session.ip.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn expired_refresh_record_is_removed() -> anyhow::Result<()> {
        let engine = engine(Config::new())?;
        let ctx = Context::background();
        let now = Utc::now();
        let info = RefreshTokenInfo {
            refresh_token: "stale".to_string(),
            user_id: "u1".to_string(),
            device: String::new(),
            created_at: now - chrono::TimeDelta::hours(2),
            expires_at: now - chrono::TimeDelta::hours(1),
            extra: Attributes::new(),
        };
        let key = engine.keys().refresh_token("stale");
        store_json(engine.storage().as_ref(), &ctx, &key, &info, Duration::ZERO).await?;

        assert!(matches!(
            engine.refresh_access_token(&ctx, "stale").await,
            Err(Error::RefreshTokenExpired)
        ));
        assert!(!engine.storage().exists(&ctx, &key).await?);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_exchanges_consume_the_refresh_token_once() -> anyhow::Result<()> {
        let engine = Arc::new(engine(Config::new())?);
        let ctx = Context::background();
        let response = engine.login(&ctx, &LoginRequest::new("u1")).await?;
        let Some(refresh_token) = response.refresh_token else {
            anyhow::bail!("refresh token missing");
        };

        let mut exchanges = Vec::new();
        for _ in 0..8 {
            let engine = Arc::clone(&engine);
            let refresh_token = refresh_token.clone();
            exchanges.push(tokio::spawn(async move {
                engine
                    .refresh_access_token(&Context::background(), &refresh_token)
                    .await
            }));
        }

        let mut succeeded = 0;
        for exchange in exchanges {
            match exchange.await? {
                Ok(_) => succeeded += 1,
                Err(err) => assert!(matches!(err, Error::RefreshTokenNotFound)),
            }
        }
        assert_eq!(succeeded, 1);
        Ok(())
    }

    #[tokio::test]
    async fn failed_exchange_keeps_the_refresh_token() -> anyhow::Result<()> {
        let config = Config::new()
            .with_token_format(TokenFormat::Custom)
            .with_custom_generator(Arc::new(|attrs: &Attributes| -> anyhow::Result<String> {
                if attrs.get(ATTR_REFRESH).is_some() {
                    anyhow::bail!("generator offline");
                }
                Ok(uuid::Uuid::new_v4().to_string())
            }));
        let engine = engine(config)?;
        let ctx = Context::background();
        let response = engine.login(&ctx, &LoginRequest::new("u1")).await?;
        let Some(refresh_token) = response.refresh_token else {
            anyhow::bail!("refresh token missing");
        };

        assert!(matches!(
            engine.refresh_access_token(&ctx, &refresh_token).await,
            Err(Error::TokenGeneration(_))
        ));
        let key = engine.keys().refresh_token(&refresh_token);
        assert!(engine.storage().exists(&ctx, &key).await?);
        Ok(())
    }

    #[tokio::test]
    async fn zero_token_ttl_never_expires() -> anyhow::Result<()> {
        let engine = engine(Config::new().with_token_ttl(Duration::ZERO))?;
        let ctx = Context::background();
        let response = engine.login(&ctx, &LoginRequest::new("u1")).await?;
        assert_eq!(response.expires_at, DateTime::<Utc>::MAX_UTC);
        assert_eq!(engine.verify(&ctx, &response.token).await?.id, "u1");
        Ok(())
    }

    #[tokio::test]
    async fn role_provider_can_be_set_later() -> anyhow::Result<()> {
        let engine = engine(Config::new())?;
        let ctx = Context::background();
        assert!(matches!(
            engine.check_role(&ctx, "u1", "admin").await,
            Err(Error::RoleProviderNotConfigured)
        ));

        engine.set_role_provider(Arc::new(
            StaticRoleProvider::new().with_user_roles("u1", vec![Role::new("admin", "Admin")]),
        ));
        assert!(engine.check_role(&ctx, "u1", "admin").await?);
        Ok(())
    }
}
