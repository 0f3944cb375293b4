//! Storage key namespace.
//!
//! Keys have the shape `prefix:category:id[:id...]`. Tokens never contain `:`,
//! which is what makes the `user_session` keys unambiguous.

pub const DEFAULT_KEY_PREFIX: &str = "tessera";

const LOGIN_INFO: &str = "login";
const REFRESH_TOKEN: &str = "refresh";
const SESSION: &str = "session";
const USER_SESSION: &str = "user_session";
const ROLE: &str = "role";
const USER_ROLE: &str = "user_role";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyNamespace {
    prefix: String,
}

impl KeyNamespace {
    /// An empty prefix falls back to [`DEFAULT_KEY_PREFIX`].
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let prefix = if prefix.is_empty() {
            DEFAULT_KEY_PREFIX.to_string()
        } else {
            prefix
        };
        Self { prefix }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn login_info(&self, token: &str) -> String {
        self.custom(LOGIN_INFO, &[token])
    }

    #[must_use]
    pub fn refresh_token(&self, refresh_token: &str) -> String {
        self.custom(REFRESH_TOKEN, &[refresh_token])
    }

    #[must_use]
    pub fn session(&self, token: &str) -> String {
        self.custom(SESSION, &[token])
    }

    #[must_use]
    pub fn user_session(&self, user_id: &str, token: &str) -> String {
        self.custom(USER_SESSION, &[user_id, token])
    }

    /// Scan pattern matching every `user_session` key of `user_id`.
    ///
    /// Glob metacharacters inside the user id are escaped so they match
    /// literally.
    #[must_use]
    pub fn user_session_pattern(&self, user_id: &str) -> String {
        format!(
            "{}:{USER_SESSION}:{}:*",
            escape_glob(&self.prefix),
            escape_glob(user_id)
        )
    }

    /// Recover the token from a `user_session` key of `user_id`.
    ///
    /// Returns `None` for keys of other users, including user ids that merely
    /// share `user_id` as a prefix (`alice` vs `alice:ops`).
    #[must_use]
    pub fn token_from_user_session<'k>(&self, user_id: &str, key: &'k str) -> Option<&'k str> {
        let head = self.user_session(user_id, "");
        let token = key.strip_prefix(head.as_str())?;
        if token.is_empty() || token.contains(':') {
            return None;
        }
        Some(token)
    }

    #[must_use]
    pub fn role(&self, role_id: &str) -> String {
        self.custom(ROLE, &[role_id])
    }

    #[must_use]
    pub fn user_role(&self, user_id: &str) -> String {
        self.custom(USER_ROLE, &[user_id])
    }

    /// Key in an application-defined category.
    #[must_use]
    pub fn custom(&self, category: &str, ids: &[&str]) -> String {
        let mut key = format!("{}:{category}", self.prefix);
        for id in ids {
            key.push(':');
            key.push_str(id);
        }
        key
    }
}

impl Default for KeyNamespace {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
