//! Typed engine settings with serde defaults, layered loading, and validation.
//!
//! Settings deserialize from a TOML file layered with `SCORTA__`-prefixed
//! environment overrides. Every field has a default except `max_age`, which
//! the integration layer must supply; a missing or unparseable max-age is a
//! configuration error, not a silent fallback.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::CacheError;
use crate::lock::LockBackendKind;
use crate::postload::AuthPolicy;
use crate::store::NotFoundMode;

const DEFAULT_CACHE_ROOT: &str = "cache";
const DEFAULT_NONCE_MAX_AGE: &str = "5m";
const DEFAULT_MEMORY_ENTRY_LIMIT: usize = 256;
const DEFAULT_MEMORY_MAX_BODY_BYTES: usize = 1024 * 1024;
const ENV_PREFIX: &str = "SCORTA";

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Master switch; a disabled engine answers every lookup with a miss and
    /// drops every write.
    pub enabled: bool,
    /// Directory holding the cache tree.
    pub cache_root: PathBuf,
    /// Freshness window as a human-readable duration: `"30s"`, `"5m"`,
    /// `"2h"`, `"1d"`, or bare seconds. Required.
    pub max_age: String,
    /// Stricter freshness window applied to nonce-bearing bodies.
    pub nonce_max_age: String,
    /// Substrings that mark a body as nonce-sensitive.
    pub nonce_markers: Vec<String>,
    /// When false, disk entries never expire by age. Nonce-sensitive bodies
    /// still expire by `nonce_max_age`.
    pub check_freshness: bool,
    /// Site base path; requests for it map to the `index` marker.
    pub base_path: Option<String>,
    /// Operator-supplied salt mixed into every key to force cache variants.
    pub version_salt: String,
    pub memory: MemorySettings,
    pub locking: LockSettings,
    pub not_found: NotFoundSettings,
    pub postload: PostloadSettings,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_root: PathBuf::from(DEFAULT_CACHE_ROOT),
            max_age: String::new(),
            nonce_max_age: DEFAULT_NONCE_MAX_AGE.to_string(),
            nonce_markers: vec!["_nonce".to_string(), "csrf_token".to_string()],
            check_freshness: true,
            base_path: None,
            version_salt: String::new(),
            memory: MemorySettings::default(),
            locking: LockSettings::default(),
            not_found: NotFoundSettings::default(),
            postload: PostloadSettings::default(),
        }
    }
}

impl CacheSettings {
    /// Load settings from an optional TOML file layered with environment
    /// overrides (`SCORTA__MAX_AGE`, `SCORTA__MEMORY__ENABLED`, ...).
    pub fn load(path: Option<&Path>) -> Result<Self, CacheError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

        builder
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|err| {
                CacheError::configuration(format!("failed to load cache settings: {err}"))
            })
    }

    /// Validate everything that must hold before the engine may start.
    pub fn validate(&self) -> Result<(), CacheError> {
        self.max_age()?;
        self.nonce_max_age()?;
        Ok(())
    }

    pub fn max_age(&self) -> Result<Duration, CacheError> {
        parse_age("max_age", &self.max_age)
    }

    pub fn nonce_max_age(&self) -> Result<Duration, CacheError> {
        parse_age("nonce_max_age", &self.nonce_max_age)
    }
}

/// In-memory tier configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    pub enabled: bool,
    /// Maximum entries before LRU eviction.
    pub entry_limit: usize,
    /// Bodies larger than this are never mirrored into memory.
    pub max_body_bytes: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            entry_limit: DEFAULT_MEMORY_ENTRY_LIMIT,
            max_body_bytes: DEFAULT_MEMORY_MAX_BODY_BYTES,
        }
    }
}

impl MemorySettings {
    /// Entry limit clamped to at least one slot.
    pub fn entry_limit_non_zero(&self) -> std::num::NonZeroUsize {
        std::num::NonZeroUsize::new(self.entry_limit).unwrap_or(std::num::NonZeroUsize::MIN)
    }
}

/// Directory-lock configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// Disabling locking makes bulk operations unsafe against concurrent
    /// writers; accepted risk for restrictive hosting environments.
    pub enabled: bool,
    pub backend: LockBackendKind,
    /// Directory for lock files under the file-lock backend; defaults to the
    /// system temp directory.
    pub lock_dir: Option<PathBuf>,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: LockBackendKind::Semaphore,
            lock_dir: None,
        }
    }
}

/// Canonical-404 de-duplication configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotFoundSettings {
    pub mode: NotFoundMode,
}

impl Default for NotFoundSettings {
    fn default() -> Self {
        Self {
            mode: NotFoundMode::Symlink,
        }
    }
}

/// Deferred visitor-variant evaluation configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostloadSettings {
    pub policy: AuthPolicy,
    /// Cookie-name prefixes that flag a request as "might be authenticated".
    pub auth_cookie_prefixes: Vec<String>,
    /// Query parameters that keep an authenticated GET cacheable under the
    /// invalidate-on-mutation policy.
    pub allowed_query_params: Vec<String>,
}

impl Default for PostloadSettings {
    fn default() -> Self {
        Self {
            policy: AuthPolicy::InvalidateOnMutation,
            auth_cookie_prefixes: vec![
                "auth_".to_string(),
                "session_".to_string(),
                "comment_author_".to_string(),
                "postpass_".to_string(),
            ],
            allowed_query_params: vec!["page".to_string(), "p".to_string()],
        }
    }
}

/// Parse a human-readable duration: bare seconds or a number with an `s`,
/// `m`, `h`, or `d` suffix.
fn parse_age(field: &str, value: &str) -> Result<Duration, CacheError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CacheError::configuration(format!("{field} is required")));
    }

    let (digits, multiplier) = match trimmed.chars().last() {
        Some('s') => (&trimmed[..trimmed.len() - 1], 1),
        Some('m') => (&trimmed[..trimmed.len() - 1], 60),
        Some('h') => (&trimmed[..trimmed.len() - 1], 3600),
        Some('d') => (&trimmed[..trimmed.len() - 1], 86_400),
        Some(c) if c.is_ascii_digit() => (trimmed, 1),
        _ => {
            return Err(CacheError::configuration(format!(
                "{field} has an unrecognized duration suffix: {trimmed:?}"
            )));
        }
    };

    let seconds: u64 = digits.trim().parse().map_err(|_| {
        CacheError::configuration(format!("{field} is not a valid duration: {trimmed:?}"))
    })?;

    Ok(Duration::from_secs(seconds * multiplier))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_require_explicit_max_age() {
        let settings = CacheSettings::default();
        assert!(settings.enabled);
        assert!(matches!(
            settings.validate(),
            Err(CacheError::Configuration { .. })
        ));
    }

    #[test]
    fn parse_age_accepts_each_unit() {
        assert_eq!(parse_age("f", "90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_age("f", "30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_age("f", "5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_age("f", "2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_age("f", "1d").unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn parse_age_rejects_garbage() {
        assert!(parse_age("f", "").is_err());
        assert!(parse_age("f", "fast").is_err());
        assert!(parse_age("f", "10w").is_err());
        assert!(parse_age("f", "m").is_err());
    }

    #[test]
    fn validated_settings_expose_durations() {
        let settings = CacheSettings {
            max_age: "30m".to_string(),
            ..Default::default()
        };
        settings.validate().expect("valid settings");
        assert_eq!(settings.max_age().unwrap(), Duration::from_secs(1800));
        assert_eq!(settings.nonce_max_age().unwrap(), Duration::from_secs(300));
    }

    #[test]
    fn memory_entry_limit_clamps_to_one() {
        let memory = MemorySettings {
            entry_limit: 0,
            ..Default::default()
        };
        assert_eq!(memory.entry_limit_non_zero().get(), 1);
    }
}
