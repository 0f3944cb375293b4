mod common;

use anyhow::{Context as _, Result};
use secrecy::SecretString;
use std::{env, sync::Arc, time::Duration};
use tessera::{
    Config, Context, Engine, LoginMode, LoginRequest, RedisConfig, RedisStorage, Storage,
    StorageConfig,
};
use tokio::time::sleep;
use url::Url;
use uuid::Uuid;

const REDIS_URL_ENV: &str = "TESSERA_TEST_REDIS_URL";

/// Redis settings from `TESSERA_TEST_REDIS_URL` (`redis://[:password@]host:port[/db]`).
fn redis_config() -> Result<Option<RedisConfig>> {
    let Ok(raw) = env::var(REDIS_URL_ENV) else {
        eprintln!("Skipping test: {REDIS_URL_ENV} is not set");
        return Ok(None);
    };
    let url = Url::parse(&raw).context("invalid redis url")?;
    let host = url.host_str().context("redis url has no host")?;
    let port = url.port().unwrap_or(6379);

    let mut config = RedisConfig::single(format!("{host}:{port}"))
        .with_pool_size(4)
        .with_min_idle(1)
        .with_tls(url.scheme() == "rediss")
        .with_client_name("tessera-tests");
    if !url.username().is_empty() {
        config = config.with_username(url.username());
    }
    if let Some(password) = url.password() {
        config = config.with_password(SecretString::from(password.to_string()));
    }
    if let Some(db) = url.path().trim_start_matches('/').parse::<i64>().ok() {
        config = config.with_db(db);
    }
    Ok(Some(config))
}

/// Key prefix unique to one test run so parallel runs never collide.
fn unique_prefix() -> String {
    format!("tessera-test-{}", Uuid::new_v4().simple())
}

#[tokio::test]
async fn storage_primitives() -> Result<()> {
    common::init_tracing();
    let Some(config) = redis_config()? else {
        return Ok(());
    };
    let storage = RedisStorage::connect(&config).await?;
    let ctx = Context::background();
    let prefix = unique_prefix();
    let key = format!("{prefix}:k");

    storage.set(&ctx, &key, b"value".to_vec(), Duration::ZERO).await?;
    assert_eq!(storage.get(&ctx, &key).await?, Some(b"value".to_vec()));
    assert!(storage.exists(&ctx, &key).await?);

    storage.delete(&ctx, &key).await?;
    assert_eq!(storage.get(&ctx, &key).await?, None);
    storage.delete(&ctx, &key).await?;
    Ok(())
}

#[tokio::test]
async fn conditional_writes_and_take() -> Result<()> {
    common::init_tracing();
    let Some(config) = redis_config()? else {
        return Ok(());
    };
    let storage = RedisStorage::connect(&config).await?;
    let ctx = Context::background();
    let key = format!("{}:k", unique_prefix());

    assert!(!storage.set_existing(&ctx, &key, b"v1".to_vec(), Duration::ZERO).await?);
    assert!(!storage.exists(&ctx, &key).await?);

    storage.set(&ctx, &key, b"v1".to_vec(), Duration::from_secs(60)).await?;
    assert!(storage.set_existing(&ctx, &key, b"v2".to_vec(), Duration::from_secs(60)).await?);

    assert_eq!(storage.take(&ctx, &key).await?, Some(b"v2".to_vec()));
    assert_eq!(storage.take(&ctx, &key).await?, None);
    Ok(())
}

#[tokio::test]
async fn ttl_expires_keys() -> Result<()> {
    common::init_tracing();
    let Some(config) = redis_config()? else {
        return Ok(());
    };
    let storage = RedisStorage::connect(&config).await?;
    let ctx = Context::background();
    let key = format!("{}:short", unique_prefix());

    storage
        .set(&ctx, &key, b"v".to_vec(), Duration::from_millis(200))
        .await?;
    assert!(storage.exists(&ctx, &key).await?);
    sleep(Duration::from_millis(400)).await;
    assert!(!storage.exists(&ctx, &key).await?);
    Ok(())
}

#[tokio::test]
async fn scan_walks_every_matching_key() -> Result<()> {
    common::init_tracing();
    let Some(config) = redis_config()? else {
        return Ok(());
    };
    let storage = RedisStorage::connect(&config).await?;
    let ctx = Context::background();
    let prefix = unique_prefix();

    for i in 0..1500 {
        storage
            .set(
                &ctx,
                &format!("{prefix}:user_session:u1:t{i}"),
                b"1".to_vec(),
                Duration::from_secs(60),
            )
            .await?;
    }
    storage
        .set(
            &ctx,
            &format!("{prefix}:user_session:u2:t0"),
            b"1".to_vec(),
            Duration::from_secs(60),
        )
        .await?;

    let keys = storage
        .scan(&ctx, &format!("{prefix}:user_session:u1:*"))
        .await?;
    assert_eq!(keys.len(), 1500);

    for key in keys {
        storage.delete(&ctx, &key).await?;
    }
    storage
        .delete(&ctx, &format!("{prefix}:user_session:u2:t0"))
        .await?;
    Ok(())
}

#[tokio::test]
async fn engine_lifecycle_on_redis() -> Result<()> {
    common::init_tracing();
    let Some(redis) = redis_config()? else {
        return Ok(());
    };
    let config = Config::new()
        .with_key_prefix(unique_prefix())
        .with_login_mode(LoginMode::Single)
        .with_storage(StorageConfig::Redis(redis));
    let engine = Arc::new(Engine::connect(config).await?);
    let ctx = Context::background();

    let first = engine.login(&ctx, &LoginRequest::new("u1")).await?;
    let second = engine.login(&ctx, &LoginRequest::new("u1")).await?;
    assert!(engine.verify(&ctx, &first.token).await.is_err());
    assert_eq!(engine.verify(&ctx, &second.token).await?.id, "u1");

    let refresh_token = second.refresh_token.context("refresh token missing")?;
    let refreshed = engine.refresh_access_token(&ctx, &refresh_token).await?;
    assert_eq!(engine.verify(&ctx, &refreshed.token).await?.id, "u1");

    assert_eq!(engine.logout_by_user_id(&ctx, "u1").await?, 2);
    assert!(engine.verify(&ctx, &refreshed.token).await.is_err());

    if let Some(next) = refreshed.refresh_token {
        engine
            .storage()
            .delete(&ctx, &engine.keys().refresh_token(&next))
            .await?;
    }
    Ok(())
}
