//! Records persisted by the engine and the request/response shapes of its API.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Open-ended attributes attached to tokens, sessions and refresh records.
pub type Attributes = Map<String, Value>;

pub const ATTR_USER_ID: &str = "user_id";
pub const ATTR_DEVICE: &str = "device";
pub const ATTR_IP: &str = "ip";
pub const ATTR_TYPE: &str = "type";
pub const ATTR_REFRESH: &str = "refresh";
pub const TOKEN_TYPE_REFRESH: &str = "refresh";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Attributes,
}

impl LoginRequest {
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    #[must_use]
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = ip.into();
        self
    }

    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Minimal identity returned by login, refresh and verify.
///
/// Roles and permissions are not resolved here; use the permission evaluator.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Attributes,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_expires_at: Option<DateTime<Utc>>,
    pub principal: Principal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub token: String,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub ip: String,
    pub login_time: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Attributes,
}

/// Login metadata stored beside the [`Session`] under its own key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoginInfo {
    pub user_id: String,
    pub token: String,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub ip: String,
    pub login_time: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Attributes,
}

impl LoginInfo {
    /// True once `now` is past `last_access + ttl`. A zero TTL never expires.
    #[must_use]
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        !ttl.is_zero() && now > add_ttl(self.last_access, ttl)
    }
}

impl From<&Session> for LoginInfo {
    fn from(session: &Session) -> Self {
        Self {
            user_id: session.user_id.clone(),
            token: session.token.clone(),
            device: session.device.clone(),
            ip: session.ip.clone(),
            login_time: session.login_time,
            last_access: session.last_access,
            extra: session.extra.clone(),
        }
    }
}

impl From<&LoginInfo> for Session {
    fn from(info: &LoginInfo) -> Self {
        Self {
            user_id: info.user_id.clone(),
            token: info.token.clone(),
            device: info.device.clone(),
            ip: info.ip.clone(),
            login_time: info.login_time,
            last_access: info.last_access,
            extra: info.extra.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefreshTokenInfo {
    pub refresh_token: String,
    pub user_id: String,
    #[serde(default)]
    pub device: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Attributes,
}

impl RefreshTokenInfo {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// A role as supplied by the embedding application's role provider.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl Role {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            permissions: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.push(permission.into());
        self
    }
}

/// `at + ttl`, saturating at the largest representable instant.
pub(crate) fn add_ttl(at: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
