//! Storage port used by the engine for every piece of shared state.
//!
//! Backends store opaque byte records under string keys with an optional TTL
//! (`Duration::ZERO` means no expiry). The engine encodes its records as JSON
//! through [`store_json`] / [`load_json`].

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStorage;
pub use self::redis::RedisStorage;

use async_trait::async_trait;
use regex::Regex;
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt::Debug, time::Duration};

use crate::{context::Context, error::StorageError};

#[async_trait]
pub trait Storage: Send + Sync + Debug {
    /// Store `value` under `key`, replacing any previous value.
    async fn set(
        &self,
        ctx: &Context,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), StorageError>;

    /// Replace the value of `key` only if it currently exists. Returns whether
    /// the write happened. The check and the write are one atomic step.
    async fn set_existing(
        &self,
        ctx: &Context,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, StorageError>;

    async fn get(&self, ctx: &Context, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Atomically read and remove `key`. Of several concurrent callers at most
    /// one receives the value.
    async fn take(&self, ctx: &Context, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Remove `key`. Deleting an absent key succeeds.
    async fn delete(&self, ctx: &Context, key: &str) -> Result<(), StorageError>;

    async fn exists(&self, ctx: &Context, key: &str) -> Result<bool, StorageError>;

    /// Keys matching the glob `pattern` (`*`, `?`, `[...]`, `\` escapes).
    async fn scan(&self, ctx: &Context, pattern: &str) -> Result<Vec<String>, StorageError>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

/// Encode `value` as JSON and store it.
///
/// # Errors
/// Returns `Serialization` or the backend error.
pub async fn store_json<T>(
    storage: &dyn Storage,
    ctx: &Context,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), StorageError>
where
    T: Serialize + Sync + ?Sized,
{
    let bytes = serde_json::to_vec(value)?;
    storage.set(ctx, key, bytes, ttl).await
}

/// Encode `value` as JSON and overwrite `key` only if it still exists.
///
/// # Errors
/// Returns `Serialization` or the backend error.
pub async fn replace_json<T>(
    storage: &dyn Storage,
    ctx: &Context,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<bool, StorageError>
where
    T: Serialize + Sync + ?Sized,
{
    let bytes = serde_json::to_vec(value)?;
    storage.set_existing(ctx, key, bytes, ttl).await
}

/// Atomically remove a JSON record and decode it.
///
/// # Errors
/// Returns `Serialization` when the removed bytes are not a valid record.
pub async fn take_json<T>(
    storage: &dyn Storage,
    ctx: &Context,
    key: &str,
) -> Result<Option<T>, StorageError>
where
    T: DeserializeOwned,
{
    match storage.take(ctx, key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Load and decode a JSON record. Absent keys yield `None`.
///
/// # Errors
/// Returns `Serialization` when the stored bytes are not a valid record.
pub async fn load_json<T>(
    storage: &dyn Storage,
    ctx: &Context,
    key: &str,
) -> Result<Option<T>, StorageError>
where
    T: DeserializeOwned,
{
    match storage.get(ctx, key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Compile a Redis-style glob into an anchored regex.
pub(crate) fn glob_to_regex(pattern: &str) -> Result<Regex, StorageError> {
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' => match chars.next() {
                Some(escaped) => out.push_str(&regex::escape(&escaped.to_string())),
                None => out.push_str(r"\\"),
            },
            '[' => {
                let mut class = String::new();
                let mut closed = false;
                if chars.peek() == Some(&'^') {
                    chars.next();
                    class.push('^');
                }
                while let Some(inner) = chars.next() {
                    match inner {
                        ']' => {
                            closed = true;
                            break;
                        }
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                class.push_str(&regex::escape(&escaped.to_string()));
                            }
                        }
                        '[' | '&' | '~' => {
                            class.push('\\');
                            class.push(inner);
                        }
                        other => class.push(other),
                    }
                }
                if !closed || class.is_empty() || class == "^" {
                    return Err(StorageError::Config(format!(
                        "invalid scan pattern: {pattern}"
                    )));
                }
                out.push('[');
                out.push_str(&class);
                out.push(']');
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|err| StorageError::Config(format!("invalid scan pattern: {err}")))
}
