//! Session records and the user index.
//!
//! Flow Overview:
//! 1) A login writes three records keyed by the token: the `Session`, its
//!    `LoginInfo` twin and the `user_session` index entry, all with the token
//!    TTL.
//! 2) Renewal rewrites the same three records with a fresh `last_access` and
//!    the full TTL. Each rewrite only lands on a record that still exists, so
//!    a concurrent logout or eviction is never undone.
//! 3) Destruction deletes all three. Absent records are not an error.
//!
//! The writes are not atomic. If one fails midway the records already written
//! stay behind until their TTL lapses.

use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

use crate::{
    context::Context,
    error::Error,
    keys::KeyNamespace,
    model::{LoginInfo, Session},
    storage::{load_json, replace_json, store_json, Storage},
};

#[derive(Clone, Debug)]
pub struct SessionStore {
    storage: Arc<dyn Storage>,
    keys: KeyNamespace,
    ttl: Duration,
}

impl SessionStore {
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, keys: KeyNamespace, ttl: Duration) -> Self {
        Self { storage, keys, ttl }
    }

    /// Write the session, its login info and the index entry.
    ///
    /// # Errors
    /// Stops at the first failed write and names it in the error.
    pub async fn create(&self, ctx: &Context, session: &Session) -> Result<(), Error> {
        self.write(ctx, session).await
    }

    /// # Errors
    /// Returns the storage failure, including undecodable records.
    pub async fn load_session(&self, ctx: &Context, token: &str) -> Result<Option<Session>, Error> {
        load_json(self.storage.as_ref(), ctx, &self.keys.session(token))
            .await
            .map_err(Error::storage("load session"))
    }

    /// # Errors
    /// Returns the storage failure, including undecodable records.
    pub async fn load_login_info(
        &self,
        ctx: &Context,
        token: &str,
    ) -> Result<Option<LoginInfo>, Error> {
        load_json(self.storage.as_ref(), ctx, &self.keys.login_info(token))
            .await
            .map_err(Error::storage("load login info"))
    }

    /// Move `last_access` to `now` on both records and rewrite the unit with
    /// the full TTL.
    ///
    /// # Errors
    /// `SessionNotFound` or `LoginInfoNotFound` when the unit was destroyed
    /// before or during the renewal; nothing is recreated in that case.
    /// Otherwise the first failed read or write.
    pub async fn renew(
        &self,
        ctx: &Context,
        login_info: &LoginInfo,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let token = login_info.token.as_str();
        let mut session = self
            .load_session(ctx, token)
            .await?
            .ok_or(Error::SessionNotFound)?;
        session.last_access = now;

        let mut login_info = login_info.clone();
        login_info.last_access = now;

        let storage = self.storage.as_ref();
        if !replace_json(storage, ctx, &self.keys.session(token), &session, self.ttl)
            .await
            .map_err(Error::storage("renew session"))?
        {
            return Err(Error::SessionNotFound);
        }
        if !replace_json(storage, ctx, &self.keys.login_info(token), &login_info, self.ttl)
            .await
            .map_err(Error::storage("renew login info"))?
        {
            return Err(Error::LoginInfoNotFound);
        }
        let index = self.keys.user_session(&session.user_id, token);
        if !replace_json(storage, ctx, &index, token, self.ttl)
            .await
            .map_err(Error::storage("renew user session index"))?
        {
            debug!(user_id = %session.user_id, "Session index gone during renewal");
        }
        Ok(())
    }

    /// Delete every record of `token`. Returns whether any record was found.
    ///
    /// # Errors
    /// Returns the first failed read or delete.
    pub async fn destroy(&self, ctx: &Context, token: &str) -> Result<bool, Error> {
        let owner = match self.load_login_info(ctx, token).await? {
            Some(info) => Some(info.user_id),
            None => self
                .load_session(ctx, token)
                .await?
                .map(|session| session.user_id),
        };

        self.delete(ctx, &self.keys.session(token), "delete session")
            .await?;
        self.delete(ctx, &self.keys.login_info(token), "delete login info")
            .await?;
        if let Some(user_id) = &owner {
            self.delete(
                ctx,
                &self.keys.user_session(user_id, token),
                "delete user session index",
            )
            .await?;
            debug!(user_id, "Session destroyed");
        }
        Ok(owner.is_some())
    }

    /// Live tokens of `user_id`, recovered from the index keys.
    ///
    /// # Errors
    /// Returns the scan failure.
    pub async fn tokens_for_user(&self, ctx: &Context, user_id: &str) -> Result<Vec<String>, Error> {
        let keys = self
            .storage
            .scan(ctx, &self.keys.user_session_pattern(user_id))
            .await
            .map_err(Error::storage("scan user sessions"))?;
        Ok(keys
            .iter()
            .filter_map(|key| self.keys.token_from_user_session(user_id, key))
            .map(ToString::to_string)
            .collect())
    }

    /// Destroy the sessions of `user_id`, or only those issued to `device`.
    /// Returns how many were removed.
    ///
    /// Failures on individual tokens are logged and skipped; cancellation
    /// aborts the sweep.
    ///
    /// # Errors
    /// Returns the scan failure or the cancellation.
    pub async fn evict_user(
        &self,
        ctx: &Context,
        user_id: &str,
        device: Option<&str>,
    ) -> Result<usize, Error> {
        let tokens = self.tokens_for_user(ctx, user_id).await?;
        let mut removed = 0;

        for token in tokens {
            ctx.check().map_err(Error::storage("evict user sessions"))?;

            if let Some(device) = device {
                match self.device_of(ctx, &token).await {
                    Ok(Some(existing)) if existing == device => {}
                    Ok(_) => continue,
                    Err(err) if err.is_cancelled() => return Err(err),
                    Err(err) => {
                        warn!(user_id, "Skipping session during eviction: {err}");
                        continue;
                    }
                }
            }

            match self.destroy(ctx, &token).await {
                Ok(true) => removed += 1,
                Ok(false) => {
                    // Only the index was left; drop it so later scans skip it.
                    let index = self.keys.user_session(user_id, &token);
                    if let Err(err) = self
                        .delete(ctx, &index, "delete user session index")
                        .await
                    {
                        warn!(user_id, "Failed to drop stale session index: {err}");
                    }
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => warn!(user_id, "Failed to evict session: {err}"),
            }
        }

        debug!(user_id, removed, "Evicted user sessions");
        Ok(removed)
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn device_of(&self, ctx: &Context, token: &str) -> Result<Option<String>, Error> {
        if let Some(info) = self.load_login_info(ctx, token).await? {
            return Ok(Some(info.device));
        }
        Ok(self
            .load_session(ctx, token)
            .await?
            .map(|session| session.device))
    }

    async fn write(&self, ctx: &Context, session: &Session) -> Result<(), Error> {
        let storage = self.storage.as_ref();
        let token = session.token.as_str();

        store_json(storage, ctx, &self.keys.session(token), session, self.ttl)
            .await
            .map_err(Error::storage("store session"))?;
        let login_info = LoginInfo::from(session);
        store_json(storage, ctx, &self.keys.login_info(token), &login_info, self.ttl)
            .await
            .map_err(Error::storage("store login info"))?;
        store_json(
            storage,
            ctx,
            &self.keys.user_session(&session.user_id, token),
            token,
            self.ttl,
        )
        .await
        .map_err(Error::storage("store user session index"))
    }

    async fn delete(&self, ctx: &Context, key: &str, operation: &'static str) -> Result<(), Error> {
        self.storage
            .delete(ctx, key)
            .await
            .map_err(Error::storage(operation))
    }
}
