//! Deterministic cache-key derivation.
//!
//! A request's identity (scheme, host, path, query, user token, version salt)
//! maps to exactly one filesystem-safe relative path. Identical inputs always
//! produce identical output; distinct identities never collide except through
//! the documented hash truncation at extreme lengths.

use md5::{Digest, Md5};
use regex::Regex;

use crate::error::CacheError;

/// Path segments longer than this are truncated and suffixed with a digest.
pub const MAX_SEGMENT_LEN: usize = 200;
/// Paths longer than this collapse to a single hashed segment.
pub const MAX_PATH_LEN: usize = 2000;
/// Prefix retained from an over-long segment before the digest suffix.
const KEPT_SEGMENT_LEN: usize = 150;
const INDEX_MARKER: &str = "index";
const EXTENSION: &str = ".html";
/// Digest characters appended when truncating an over-long segment.
const SEGMENT_DIGEST_LEN: usize = 12;
/// Digest characters appended when a token needed lossy sanitization.
const TOKEN_DIGEST_LEN: usize = 8;

/// Default suffix fragment for invalidation regexes.
///
/// Clearing a slug also clears its `/index` marker, paginated and
/// comment-page sub-paths, and every query/user/version variant. One rule
/// serves both whole-tree and host-subtree invalidation.
pub const DEFAULT_SUFFIX_FRAGMENT: &str = concat!(
    r"(?:/index)?",
    r"(?:/(?:page/\d+|comment-page-\d+))?",
    r"(?:\.q/[0-9a-f]+)?",
    r"(?:\.u/[a-z0-9-]+)?",
    r"(?:\.v/[a-z0-9-]+)?",
    r"(?:\.html)?",
);

/// Selects which identity components participate in the derived path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyFlags {
    pub include_scheme: bool,
    pub include_host: bool,
    pub include_path: bool,
    /// Append the `index` marker when the path is empty or equals the base path.
    pub index_marker: bool,
    pub include_query: bool,
    pub include_user: bool,
    pub include_version: bool,
    pub include_extension: bool,
    /// Let `*` survive sanitization, for building invalidation fragments.
    pub allow_wildcards: bool,
}

impl KeyFlags {
    pub const DEFAULT: KeyFlags = KeyFlags {
        include_scheme: true,
        include_host: true,
        include_path: true,
        index_marker: true,
        include_query: true,
        include_user: true,
        include_version: true,
        include_extension: true,
        allow_wildcards: false,
    };

    /// Flags for deriving a bare slug fragment to feed into
    /// [`CacheKeyBuilder::build_cache_path_regex`].
    pub const FRAGMENT: KeyFlags = KeyFlags {
        include_query: false,
        include_user: false,
        include_version: false,
        include_extension: false,
        ..Self::DEFAULT
    };
}

impl Default for KeyFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

type DomainResolver = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Converts request identities into normalized relative storage paths.
pub struct CacheKeyBuilder {
    base_path: Option<String>,
    domain_resolver: Option<Box<DomainResolver>>,
}

impl CacheKeyBuilder {
    pub fn new(base_path: Option<String>) -> Self {
        Self {
            base_path,
            domain_resolver: None,
        }
    }

    /// Register a domain-mapping collaborator consulted before the host
    /// segment is assembled.
    pub fn with_domain_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.domain_resolver = Some(Box::new(resolver));
        self
    }

    /// Derive the canonical relative storage path for a request identity.
    ///
    /// Returns an empty string for unparseable URLs, signalling "not
    /// cacheable".
    pub fn build_cache_path(
        &self,
        url: &str,
        user_token: &str,
        version_salt: &str,
        flags: &KeyFlags,
    ) -> String {
        let Ok(parsed) = url::Url::parse(url) else {
            return String::new();
        };
        let Some(host) = parsed.host_str() else {
            return String::new();
        };
        let host = match &self.domain_resolver {
            Some(resolver) => resolver(host).unwrap_or_else(|| host.to_string()),
            None => host.to_string(),
        };

        let mut segments: Vec<String> = Vec::new();
        if flags.include_scheme {
            segments.push(parsed.scheme().to_string());
        }
        if flags.include_host {
            segments.push(host);
        }
        if flags.include_path {
            self.push_path_segments(parsed.path(), flags, &mut segments);
        }

        // Lowercase and swap dots before suffixing so the suffix separators
        // themselves survive.
        let mut key = segments.join("/").to_lowercase().replace('.', "-");

        if flags.include_query
            && let Some(query) = parsed.query().filter(|q| !q.is_empty())
        {
            key.push_str(".q/");
            key.push_str(&md5_hex(query));
        }
        if flags.include_user && !user_token.is_empty() {
            key.push_str(".u/");
            key.push_str(&sanitize_token(user_token));
        }
        if flags.include_version && !version_salt.is_empty() {
            key.push_str(".v/");
            key.push_str(&sanitize_token(version_salt));
        }

        let mut key = sanitize_key(&key, flags.allow_wildcards);
        if key.is_empty() {
            return String::new();
        }
        if flags.include_extension {
            key.push_str(EXTENSION);
        }
        key
    }

    fn push_path_segments(&self, path: &str, flags: &KeyFlags, segments: &mut Vec<String>) {
        let raw: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        if raw.is_empty() || self.is_base_path(path) {
            if flags.index_marker {
                segments.push(INDEX_MARKER.to_string());
            }
            return;
        }

        let clamped: Vec<String> = raw.iter().map(|seg| clamp_segment(seg)).collect();
        let total: usize = clamped.iter().map(|s| s.len() + 1).sum();
        if total > MAX_PATH_LEN {
            segments.push(md5_hex(path));
        } else {
            segments.extend(clamped);
        }
    }

    fn is_base_path(&self, path: &str) -> bool {
        self.base_path
            .as_deref()
            .is_some_and(|base| path.trim_matches('/').eq_ignore_ascii_case(base.trim_matches('/')))
    }

    /// Build an anchored, case-insensitive invalidation regex from a key
    /// fragment. `*` in the fragment matches lazily; everything else is
    /// literal. `suffix` defaults to [`DEFAULT_SUFFIX_FRAGMENT`].
    pub fn build_cache_path_regex(
        &self,
        fragment: &str,
        suffix: Option<&str>,
    ) -> Result<Regex, CacheError> {
        let escaped: String = fragment
            .split('*')
            .map(|part| regex::escape(part))
            .collect::<Vec<_>>()
            .join(".*?");
        let suffix = suffix.unwrap_or(DEFAULT_SUFFIX_FRAGMENT);
        let pattern = format!("(?i)^{escaped}{suffix}$");

        Regex::new(&pattern).map_err(|err| {
            CacheError::configuration(format!("invalid invalidation pattern {pattern:?}: {err}"))
        })
    }
}

/// Truncate an over-long path segment, keeping a readable prefix plus a
/// digest of the original so distinct segments stay distinct.
fn clamp_segment(segment: &str) -> String {
    if segment.chars().count() <= MAX_SEGMENT_LEN {
        return segment.to_string();
    }
    let prefix: String = segment.chars().take(KEPT_SEGMENT_LEN).collect();
    format!("{prefix}-{}", &md5_hex(segment)[..SEGMENT_DIGEST_LEN])
}

/// Sanitize a user token or version salt into `[a-z0-9-]`.
///
/// When sanitization was lossy, a digest of the original is appended so two
/// different tokens can never collapse to the same sanitized form.
pub(crate) fn sanitize_token(token: &str) -> String {
    let lowered = token.to_lowercase().replace('.', "-");
    let filtered: String = lowered
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect();

    if filtered.chars().count() == lowered.chars().count() && !filtered.is_empty() {
        filtered
    } else if filtered.is_empty() {
        md5_hex(token)[..TOKEN_DIGEST_LEN].to_string()
    } else {
        format!("{filtered}-{}", &md5_hex(token)[..TOKEN_DIGEST_LEN])
    }
}

/// Sanitize the directory portion of a host name the same way the key
/// builder does, for locating a host subtree on disk.
pub(crate) fn sanitize_host(host: &str) -> String {
    sanitize_key(&host.to_lowercase().replace('.', "-"), false)
}

/// Strip disallowed characters and collapse repeated separators.
fn sanitize_key(key: &str, allow_wildcards: bool) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        let keep = c.is_ascii_lowercase()
            || c.is_ascii_digit()
            || c == '/'
            || c == '.'
            || c == '-'
            || (allow_wildcards && c == '*');
        if !keep {
            continue;
        }
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    out.trim_matches('/').to_string()
}

pub(crate) fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}
