//! Role and permission checks backed by an application-supplied provider.
//!
//! The engine never stores roles. Each check asks the registered
//! [`RoleProvider`] for the user's roles and evaluates them in memory; nothing
//! is cached between calls.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::{debug, instrument};

use crate::{context::Context, error::Error, model::Role};

/// Permission granting every other permission.
pub const WILDCARD_PERMISSION: &str = "*";

#[async_trait]
pub trait RoleProvider: Send + Sync {
    /// Roles currently held by `user_id`. Unknown users have no roles.
    async fn user_roles(&self, ctx: &Context, user_id: &str) -> anyhow::Result<Vec<Role>>;
}

#[derive(Default)]
pub struct PermissionEvaluator {
    provider: RwLock<Option<Arc<dyn RoleProvider>>>,
}

impl PermissionEvaluator {
    #[must_use]
    pub fn new(provider: Option<Arc<dyn RoleProvider>>) -> Self {
        Self {
            provider: RwLock::new(provider),
        }
    }

    /// Replace the role provider used by subsequent checks.
    pub fn set_role_provider(&self, provider: Arc<dyn RoleProvider>) {
        *self.provider.write() = Some(provider);
    }

    #[must_use]
    pub fn has_role_provider(&self) -> bool {
        self.provider.read().is_some()
    }

    /// # Errors
    /// `InvalidRequest` for empty arguments, `RoleProviderNotConfigured`, or
    /// `RoleProvider` when the lookup fails.
    #[instrument(skip(self, ctx))]
    pub async fn check_permission(
        &self,
        ctx: &Context,
        user_id: &str,
        permission: &str,
    ) -> Result<bool, Error> {
        if user_id.is_empty() {
            return Err(Error::InvalidRequest("user id is required"));
        }
        if permission.is_empty() {
            return Err(Error::InvalidRequest("permission is required"));
        }
        let roles = self.roles(ctx, user_id).await?;
        Ok(grants_permission(&roles, permission))
    }

    /// # Errors
    /// `InvalidRequest` for empty arguments, `RoleProviderNotConfigured`, or
    /// `RoleProvider` when the lookup fails.
    #[instrument(skip(self, ctx))]
    pub async fn check_role(&self, ctx: &Context, user_id: &str, role_id: &str) -> Result<bool, Error> {
        if user_id.is_empty() {
            return Err(Error::InvalidRequest("user id is required"));
        }
        if role_id.is_empty() {
            return Err(Error::InvalidRequest("role id is required"));
        }
        let roles = self.roles(ctx, user_id).await?;
        Ok(has_role(&roles, role_id))
    }

    /// True when the user holds any of `role_ids` or any of `permissions`.
    /// The provider is asked once.
    ///
    /// # Errors
    /// `InvalidRequest` when the user id is empty or both lists are empty.
    #[instrument(skip(self, ctx))]
    pub async fn check_role_or_permission(
        &self,
        ctx: &Context,
        user_id: &str,
        role_ids: &[&str],
        permissions: &[&str],
    ) -> Result<bool, Error> {
        if user_id.is_empty() {
            return Err(Error::InvalidRequest("user id is required"));
        }
        if role_ids.is_empty() && permissions.is_empty() {
            return Err(Error::InvalidRequest("a role or permission is required"));
        }
        let roles = self.roles(ctx, user_id).await?;
        Ok(role_ids.iter().any(|role_id| has_role(&roles, role_id))
            || permissions
                .iter()
                .any(|permission| grants_permission(&roles, permission)))
    }

    /// # Errors
    /// `PermissionDenied` when the permission is missing, otherwise as
    /// [`Self::check_permission`].
    pub async fn require_permission(
        &self,
        ctx: &Context,
        user_id: &str,
        permission: &str,
    ) -> Result<(), Error> {
        if self.check_permission(ctx, user_id, permission).await? {
            Ok(())
        } else {
            Err(Error::PermissionDenied(permission.to_string()))
        }
    }

    /// # Errors
    /// `RoleNotFound` when the role is missing, otherwise as
    /// [`Self::check_role`].
    pub async fn require_role(&self, ctx: &Context, user_id: &str, role_id: &str) -> Result<(), Error> {
        if self.check_role(ctx, user_id, role_id).await? {
            Ok(())
        } else {
            Err(Error::RoleNotFound(role_id.to_string()))
        }
    }

    async fn roles(&self, ctx: &Context, user_id: &str) -> Result<Vec<Role>, Error> {
        // Clone the provider out so the lock is not held across the await.
        let provider = self
            .provider
            .read()
            .clone()
            .ok_or(Error::RoleProviderNotConfigured)?;
        ctx.check().map_err(Error::storage("fetch user roles"))?;

        let roles = provider
            .user_roles(ctx, user_id)
            .await
            .map_err(Error::RoleProvider)?;
        debug!(roles = roles.len(), "Fetched user roles");
        Ok(roles)
    }
}

impl fmt::Debug for PermissionEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionEvaluator")
            .field("role_provider", &self.has_role_provider())
            .finish()
    }
}

fn has_role(roles: &[Role], role_id: &str) -> bool {
    roles.iter().any(|role| role.id == role_id)
}

fn grants_permission(roles: &[Role], permission: &str) -> bool {
    roles
        .iter()
        .flat_map(|role| role.permissions.iter())
        .any(|granted| granted == permission || granted == WILDCARD_PERMISSION)
}

/// In-memory role provider keyed by user id.
#[derive(Debug, Default)]
pub struct StaticRoleProvider {
    roles: RwLock<HashMap<String, Vec<Role>>>,
}

impl StaticRoleProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_user_roles(self, user_id: impl Into<String>, roles: Vec<Role>) -> Self {
        self.set_user_roles(user_id, roles);
        self
    }

    pub fn set_user_roles(&self, user_id: impl Into<String>, roles: Vec<Role>) {
        self.roles.write().insert(user_id.into(), roles);
    }

    pub fn remove_user(&self, user_id: &str) {
        self.roles.write().remove(user_id);
    }
}

#[async_trait]
impl RoleProvider for StaticRoleProvider {
    async fn user_roles(&self, _ctx: &Context, user_id: &str) -> anyhow::Result<Vec<Role>> {
        Ok(self.roles.read().get(user_id).cloned().unwrap_or_default())
    }
}
