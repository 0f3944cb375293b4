//! Opaque token generation.
//!
//! Flow Overview:
//! 1) The engine asks the generator for a token, passing the login attributes.
//! 2) The selected [`TokenFormat`] decides how the string is produced. Built-in
//!    formats draw from the OS RNG; `custom` calls the registered function.
//! 3) Custom output is checked before it is handed back, since a token ends up
//!    inside storage keys and must never contain `:`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc};
use uuid::Uuid;

use crate::{error::Error, model::Attributes};

pub const TIK_PREFIX: &str = "tik_";
const TIK_RANDOM_BYTES: usize = 12;
const ROTATE_ATTEMPTS: usize = 8;

/// Caller-supplied generator used by [`TokenFormat::Custom`].
pub type CustomGenerator = Arc<dyn Fn(&Attributes) -> Result<String> + Send + Sync>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenFormat {
    /// Canonical hyphenated UUID v4.
    #[default]
    Uuid,
    /// UUID v4 without hyphens.
    UuidSimple,
    Random32,
    Random64,
    Random128,
    /// `tik_<unix-seconds>_<24 hex chars>`.
    Tik,
    Custom,
}

impl TokenFormat {
    pub const BUILT_IN: [Self; 6] = [
        Self::Uuid,
        Self::UuidSimple,
        Self::Random32,
        Self::Random64,
        Self::Random128,
        Self::Tik,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uuid => "uuid",
            Self::UuidSimple => "uuid-simple",
            Self::Random32 => "random32",
            Self::Random64 => "random64",
            Self::Random128 => "random128",
            Self::Tik => "tik",
            Self::Custom => "custom",
        }
    }

    fn matches(self, token: &str) -> bool {
        match self {
            Self::Uuid => token.len() == 36 && Uuid::try_parse(token).is_ok(),
            Self::UuidSimple => is_hex(token, 32) && Uuid::try_parse(token).is_ok(),
            Self::Random32 => is_hex(token, 32),
            Self::Random64 => is_hex(token, 64),
            Self::Random128 => is_hex(token, 128),
            Self::Tik => tik_timestamp(token).is_some(),
            Self::Custom => false,
        }
    }
}

impl fmt::Display for TokenFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenFormat {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "uuid" => Ok(Self::Uuid),
            "uuid-simple" => Ok(Self::UuidSimple),
            "random32" | "random-32" => Ok(Self::Random32),
            "random64" | "random-64" => Ok(Self::Random64),
            "random128" | "random-128" => Ok(Self::Random128),
            "tik" => Ok(Self::Tik),
            "custom" => Ok(Self::Custom),
            other => Err(Error::Config(format!("unknown token format: {other}"))),
        }
    }
}

/// What can be learned from a token's shape alone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenInfo {
    /// Built-in formats whose shape the token matches. A 32 character hex
    /// token matches both `uuid-simple` and `random32`.
    pub formats: Vec<TokenFormat>,
    /// Issue time embedded in `tik` tokens.
    pub issued_at: Option<DateTime<Utc>>,
}

struct GeneratorState {
    format: TokenFormat,
    custom: Option<CustomGenerator>,
}

pub struct TokenGenerator {
    state: RwLock<GeneratorState>,
}

impl TokenGenerator {
    #[must_use]
    pub fn new(format: TokenFormat) -> Self {
        Self {
            state: RwLock::new(GeneratorState {
                format,
                custom: None,
            }),
        }
    }

    #[must_use]
    pub fn format(&self) -> TokenFormat {
        self.state.read().format
    }

    pub fn set_format(&self, format: TokenFormat) {
        self.state.write().format = format;
    }

    /// Register the function used by [`TokenFormat::Custom`]. Replaces any
    /// previously registered function.
    pub fn register_custom(&self, generator: CustomGenerator) {
        self.state.write().custom = Some(generator);
    }

    #[must_use]
    pub fn has_custom(&self) -> bool {
        self.state.read().custom.is_some()
    }

    /// Produce a new token in the selected format.
    ///
    /// # Errors
    /// Returns `TokenGeneration` if the RNG fails, if `custom` is selected with
    /// no registered function, or if the custom output is unusable.
    pub fn generate(&self, attributes: &Attributes) -> Result<String, Error> {
        let (format, custom) = {
            let state = self.state.read();
            (state.format, state.custom.clone())
        };

        let token = match format {
            TokenFormat::Uuid => Ok(Uuid::new_v4().hyphenated().to_string()),
            TokenFormat::UuidSimple => Ok(Uuid::new_v4().simple().to_string()),
            TokenFormat::Random32 => random_hex(32),
            TokenFormat::Random64 => random_hex(64),
            TokenFormat::Random128 => random_hex(128),
            TokenFormat::Tik => tik(),
            TokenFormat::Custom => {
                let generator = custom.ok_or_else(|| {
                    Error::TokenGeneration("custom token generator is not registered".to_string())
                })?;
                generator(attributes).and_then(validate_custom)
            }
        };

        token.map_err(|err| Error::TokenGeneration(format!("{err:#}")))
    }

    /// Inspect a token's shape. Unknown shapes yield an empty `formats` list.
    #[must_use]
    pub fn resolve(&self, token: &str) -> TokenInfo {
        TokenInfo {
            formats: TokenFormat::BUILT_IN
                .into_iter()
                .filter(|format| format.matches(token))
                .collect(),
            issued_at: tik_timestamp(token).and_then(|secs| DateTime::from_timestamp(secs, 0)),
        }
    }

    /// Generate a replacement for `token` that is guaranteed to differ from it.
    ///
    /// # Errors
    /// Returns `TokenGeneration` if generation fails or keeps producing the
    /// same value.
    pub fn rotate(&self, token: &str, attributes: &Attributes) -> Result<String, Error> {
        for _ in 0..ROTATE_ATTEMPTS {
            let next = self.generate(attributes)?;
            if next != token {
                return Ok(next);
            }
        }
        Err(Error::TokenGeneration(
            "generator keeps returning the rotated token".to_string(),
        ))
    }
}

impl Default for TokenGenerator {
    fn default() -> Self {
        Self::new(TokenFormat::default())
    }
}

impl fmt::Debug for TokenGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("TokenGenerator")
            .field("format", &state.format)
            .field("custom", &state.custom.is_some())
            .finish()
    }
}

fn random_hex(chars: usize) -> Result<String> {
    let mut bytes = vec![0u8; chars / 2];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate random token")?;
    Ok(hex::encode(bytes))
}

fn tik() -> Result<String> {
    let mut bytes = [0u8; TIK_RANDOM_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate tik token")?;
    Ok(format!(
        "{TIK_PREFIX}{}_{}",
        Utc::now().timestamp(),
        hex::encode(bytes)
    ))
}

fn validate_custom(token: String) -> Result<String> {
    if token.is_empty() {
        anyhow::bail!("custom token generator returned an empty token");
    }
    if token.contains(':') {
        anyhow::bail!("custom token must not contain ':'");
    }
    Ok(token)
}

fn is_hex(token: &str, len: usize) -> bool {
    token.len() == len && token.bytes().all(|b| b.is_ascii_hexdigit())
}

fn tik_timestamp(token: &str) -> Option<i64> {
    let rest = token.strip_prefix(TIK_PREFIX)?;
    let (secs, random) = rest.split_once('_')?;
    if secs.is_empty() || !secs.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !is_hex(random, TIK_RANDOM_BYTES * 2) {
        return None;
    }
    secs.parse().ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn built_in_formats_have_expected_shape() -> anyhow::Result<()> {
        let generator = TokenGenerator::default();
        let attrs = Attributes::new();

        let token = generator.generate(&attrs)?;
        assert_eq!(token.len(), 36);
        assert!(Uuid::try_parse(&token).is_ok());

        generator.set_format(TokenFormat::UuidSimple);
        let token = generator.generate(&attrs)?;
        assert_eq!(token.len(), 32);
        assert!(!token.contains('-'));

        for (format, len) in [
            (TokenFormat::Random32, 32),
            (TokenFormat::Random64, 64),
            (TokenFormat::Random128, 128),
        ] {
            generator.set_format(format);
            let token = generator.generate(&attrs)?;
            assert!(is_hex(&token, len), "{format}: {token}");
        }

        generator.set_format(TokenFormat::Tik);
        let token = generator.generate(&attrs)?;
        assert!(token.starts_with(TIK_PREFIX));
        assert!(tik_timestamp(&token).is_some());
        Ok(())
    }

    #[test]
    fn built_in_tokens_never_contain_colons() -> anyhow::Result<()> {
        let generator = TokenGenerator::default();
        for format in TokenFormat::BUILT_IN {
            generator.set_format(format);
            assert!(!generator.generate(&Attributes::new())?.contains(':'));
        }
        Ok(())
    }

    #[test]
    fn custom_without_registration_fails() {
        let generator = TokenGenerator::new(TokenFormat::Custom);
        let err = generator.generate(&Attributes::new()).unwrap_err();
        assert!(matches!(err, Error::TokenGeneration(_)));
    }

    #[test]
    fn custom_generator_receives_attributes() -> anyhow::Result<()> {
        let generator = TokenGenerator::new(TokenFormat::Custom);
        generator.register_custom(Arc::new(|attrs: &Attributes| -> anyhow::Result<String> {
            let user = attrs
                .get("user_id")
                .and_then(|v| v.as_str())
                .unwrap_or("anon");
            Ok(format!("custom_{user}"))
        }));

        let mut attrs = Attributes::new();
        attrs.insert("user_id".to_string(), "u1".into());
        assert_eq!(generator.generate(&attrs)?, "custom_u1");
        Ok(())
    }

    #[test]
    fn custom_tokens_with_colons_or_empty_are_rejected() {
        let generator = TokenGenerator::new(TokenFormat::Custom);
        generator.register_custom(Arc::new(|_: &Attributes| -> anyhow::Result<String> {
            Ok("a:b".to_string())
        }));
        assert!(matches!(
            generator.generate(&Attributes::new()),
            Err(Error::TokenGeneration(_))
        ));

        generator.register_custom(Arc::new(|_: &Attributes| -> anyhow::Result<String> {
            Ok(String::new())
        }));
        assert!(matches!(
            generator.generate(&Attributes::new()),
            Err(Error::TokenGeneration(_))
        ));
    }

    #[test]
    fn custom_generator_errors_surface() {
        let generator = TokenGenerator::new(TokenFormat::Custom);
        generator.register_custom(Arc::new(|_: &Attributes| -> anyhow::Result<String> {
            anyhow::bail!("hsm offline")
        }));
        let err = generator.generate(&Attributes::new()).unwrap_err();
        assert!(err.to_string().contains("hsm offline"));
    }

    #[test]
    fn resolve_reports_matching_formats() -> anyhow::Result<()> {
        let generator = TokenGenerator::new(TokenFormat::Tik);
        let before = Utc::now().timestamp();
        let token = generator.generate(&Attributes::new())?;
        let info = generator.resolve(&token);
        assert_eq!(info.formats, vec![TokenFormat::Tik]);
        assert!(info.issued_at.unwrap().timestamp() >= before);

        generator.set_format(TokenFormat::UuidSimple);
        let info = generator.resolve(&generator.generate(&Attributes::new())?);
        assert_eq!(
            info.formats,
            vec![TokenFormat::UuidSimple, TokenFormat::Random32]
        );

        assert!(generator.resolve("not a token").formats.is_empty());
        assert!(generator.resolve("tik_12_short").formats.is_empty());
        Ok(())
    }

    #[test]
    fn rotate_returns_a_different_token() -> anyhow::Result<()> {
        let generator = TokenGenerator::default();
        let token = generator.generate(&Attributes::new())?;
        let rotated = generator.rotate(&token, &Attributes::new())?;
        assert_ne!(token, rotated);

        generator.set_format(TokenFormat::Custom);
        generator.register_custom(Arc::new(|_: &Attributes| -> anyhow::Result<String> {
            Ok("fixed".to_string())
        }));
        assert!(generator.rotate("fixed", &Attributes::new()).is_err());
        Ok(())
    }

    #[test]
    fn format_names_parse() -> anyhow::Result<()> {
        assert_eq!("uuid".parse::<TokenFormat>()?, TokenFormat::Uuid);
        assert_eq!("uuid_simple".parse::<TokenFormat>()?, TokenFormat::UuidSimple);
        assert_eq!("Random64".parse::<TokenFormat>()?, TokenFormat::Random64);
        assert_eq!("tik".parse::<TokenFormat>()?, TokenFormat::Tik);
        assert!("jwt".parse::<TokenFormat>().is_err());

        for format in TokenFormat::BUILT_IN {
            assert_eq!(format.as_str().parse::<TokenFormat>()?, format);
            let json = serde_json::to_string(&format)?;
            assert_eq!(json, format!("\"{format}\""));
        }
        Ok(())
    }

    #[test]
    fn concurrent_generation_yields_distinct_tokens() {
        const WORKERS: usize = 8;
        const PER_WORKER: usize = 250;

        for format in TokenFormat::BUILT_IN {
            let generator = Arc::new(TokenGenerator::new(format));
            let handles: Vec<_> = (0..WORKERS)
                .map(|_| {
                    let generator = Arc::clone(&generator);
                    thread::spawn(move || {
                        (0..PER_WORKER)
                            .map(|_| generator.generate(&Attributes::new()))
                            .collect::<Result<Vec<_>, _>>()
                    })
                })
                .collect();

            let mut seen = HashSet::new();
            for handle in handles {
                for token in handle.join().unwrap().unwrap() {
                    seen.insert(token);
                }
            }
            assert_eq!(seen.len(), WORKERS * PER_WORKER, "{format}");
        }
    }
}
