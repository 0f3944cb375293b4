//! Session and token lifecycle engine.
//!
//! `tessera` mints opaque session tokens for users that have already been
//! authenticated elsewhere, tracks their sessions in a pluggable key-value
//! store (in-process or Redis), enforces concurrent-login policies and answers
//! role/permission questions through an application-supplied
//! [`RoleProvider`].
//!
//! ```no_run
//! use tessera::{Config, Context, Engine, LoginRequest};
//!
//! # async fn run() -> Result<(), tessera::Error> {
//! let engine = Engine::connect(Config::from_env()?).await?;
//! let ctx = Context::background();
//!
//! let login = engine.login(&ctx, &LoginRequest::new("u1").with_device("web")).await?;
//! let principal = engine.verify(&ctx, &login.token).await?;
//! assert_eq!(principal.id, "u1");
//! engine.logout(&ctx, &login.token).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod keys;
pub mod model;
pub mod permission;
pub mod session;
pub mod storage;
pub mod token;

pub use config::{Config, LoginMode, RedisConfig, RedisTopology, StorageConfig};
pub use context::Context;
pub use engine::Engine;
pub use error::{Error, Result, StorageError};
pub use keys::KeyNamespace;
pub use model::{
    Attributes, LoginInfo, LoginRequest, LoginResponse, Principal, RefreshTokenInfo, Role,
    Session,
};
pub use permission::{PermissionEvaluator, RoleProvider, StaticRoleProvider, WILDCARD_PERMISSION};
pub use storage::{MemoryStorage, RedisStorage, Storage};
pub use token::{CustomGenerator, TokenFormat, TokenGenerator, TokenInfo};
