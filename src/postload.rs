//! Deferred visitor-variant evaluation.
//!
//! At the earliest point the cache is consulted it is not yet known whether
//! the visitor is authenticated. A cheap cookie-name heuristic flags requests
//! that might be, and the real decision runs later with full request context:
//! either invalidate entries touched by a mutation, or serve / capture a
//! per-user cached variant. Correctness wins over hit-rate here: a variant is
//! never served or written unless a concrete user token resolved, so one
//! user's variant cannot leak to another.

use serde::Deserialize;
use tracing::debug;

use bytes::Bytes;

use crate::error::CacheError;
use crate::invalidate::{InvalidationScope, Invalidator};
use crate::key::{CacheKeyBuilder, KeyFlags, sanitize_token};
use crate::settings::PostloadSettings;
use crate::store::{CachedPage, DiskStore, PageContent};

/// What may legally follow a `.u/` token in a derived path: a version
/// suffix, the extension, or nothing. Anchoring here keeps `alice` from
/// matching `alice2`.
const TOKEN_VARIANT_SUFFIX: &str = r"(?:\.v/[a-z0-9-]+)?(?:\.html)?";

/// How authenticated visitors interact with the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPolicy {
    /// Authenticated visitors share the anonymous cache; their mutating
    /// requests invalidate the entries keyed by their token.
    InvalidateOnMutation,
    /// Each authenticated visitor gets a cached variant keyed by their
    /// resolved token.
    PerUserVariant,
}

/// Gate lifecycle. Terminal states are `Served` and `Bypassed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    NotYetEvaluated,
    /// Deferred check under [`AuthPolicy::InvalidateOnMutation`].
    PendingInvalidationCheck,
    /// Deferred variant resolution under [`AuthPolicy::PerUserVariant`],
    /// or a capture awaiting [`PostloadGate::store_captured`].
    PendingObStart,
    /// A cached body was served; the request is finished.
    Served,
    /// Live generation proceeds without touching the cache.
    Bypassed,
}

/// HTTP method, as far as the gate cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Other,
}

impl RequestMethod {
    pub fn parse(method: &str) -> Self {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "PATCH" => Self::Patch,
            "DELETE" => Self::Delete,
            _ => Self::Other,
        }
    }

    fn is_mutating(self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch | Self::Delete)
    }
}

/// What the gate knows about the request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub url: String,
    pub method: RequestMethod,
    /// Cookie (name, value) pairs, order-preserving.
    pub cookies: Vec<(String, String)>,
}

impl RequestContext {
    fn looks_authenticated(&self, prefixes: &[String]) -> bool {
        self.cookies
            .iter()
            .any(|(name, _)| prefixes.iter().any(|prefix| name.starts_with(prefix)))
    }

    /// A GET stays cacheable only when every query parameter is allowed.
    fn has_disallowed_query(&self, allowed: &[String]) -> bool {
        let Ok(parsed) = url::Url::parse(&self.url) else {
            return false;
        };
        parsed
            .query_pairs()
            .any(|(name, _)| !allowed.iter().any(|a| a == name.as_ref()))
    }
}

/// Early-phase verdict, from the cookie heuristic alone.
#[derive(Debug, PartialEq, Eq)]
pub enum EarlyDecision {
    /// Fast anonymous path; the gate is out of the picture.
    Anonymous,
    /// Re-evaluate once full request context is available.
    Deferred,
}

/// Deferred-phase verdict.
#[derive(Debug)]
pub enum DeferredDecision {
    /// Terminate the request with this cached page.
    Serve(CachedPage),
    /// Render live and hand the response to [`PostloadGate::store_captured`].
    CaptureForWrite { cache_path: String },
    /// Render live; nothing is served from or written to the cache.
    Bypass,
}

/// Resolves a concrete user token from full request context: validated auth
/// state, else fallback cookies such as a comment-author identity.
pub trait UserTokenResolver {
    fn resolve(&self, context: &RequestContext) -> Option<String>;
}

/// Per-request gate composing the key builder, store, and invalidator.
pub struct PostloadGate<'a> {
    keys: &'a CacheKeyBuilder,
    store: &'a DiskStore,
    invalidator: &'a Invalidator,
    settings: &'a PostloadSettings,
    version_salt: &'a str,
    resolver: &'a dyn UserTokenResolver,
    state: GateState,
    pending_write: Option<String>,
}

impl<'a> PostloadGate<'a> {
    pub fn new(
        keys: &'a CacheKeyBuilder,
        store: &'a DiskStore,
        invalidator: &'a Invalidator,
        settings: &'a PostloadSettings,
        version_salt: &'a str,
        resolver: &'a dyn UserTokenResolver,
    ) -> Self {
        Self {
            keys,
            store,
            invalidator,
            settings,
            version_salt,
            resolver,
            state: GateState::NotYetEvaluated,
            pending_write: None,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    /// Cheap heuristic, run before the platform has bootstrapped: does any
    /// cookie name carry an auth-ish prefix?
    pub fn evaluate_early(&mut self, context: &RequestContext) -> EarlyDecision {
        if !context.looks_authenticated(&self.settings.auth_cookie_prefixes) {
            self.state = GateState::Bypassed;
            return EarlyDecision::Anonymous;
        }

        self.state = match self.settings.policy {
            AuthPolicy::InvalidateOnMutation => GateState::PendingInvalidationCheck,
            AuthPolicy::PerUserVariant => GateState::PendingObStart,
        };
        EarlyDecision::Deferred
    }

    /// The real decision, once full request context is known.
    pub fn evaluate_deferred(
        &mut self,
        context: &RequestContext,
    ) -> Result<DeferredDecision, CacheError> {
        match self.state {
            GateState::PendingInvalidationCheck => self.check_invalidation(context),
            GateState::PendingObStart => self.resolve_variant(context),
            _ => Ok(DeferredDecision::Bypass),
        }
    }

    /// Persist a captured response and finish in `Served`. Returns the
    /// stored body, or `None` when no capture was pending.
    pub fn store_captured(
        &mut self,
        page: &PageContent,
    ) -> Result<Option<Bytes>, CacheError> {
        let Some(cache_path) = self.pending_write.take() else {
            return Ok(None);
        };
        let body = self.store.write(&cache_path, page)?;
        self.state = GateState::Served;
        Ok(Some(body))
    }

    fn check_invalidation(
        &mut self,
        context: &RequestContext,
    ) -> Result<DeferredDecision, CacheError> {
        let mutating = context.method.is_mutating()
            || (context.method == RequestMethod::Get
                && context.has_disallowed_query(&self.settings.allowed_query_params));

        if mutating {
            self.state = GateState::Bypassed;
            let Some(token) = self.resolver.resolve(context) else {
                debug!(trace = "postload.token_unresolved", "mutation without a resolvable token");
                return Ok(DeferredDecision::Bypass);
            };
            let fragment = format!("*.u/{}", sanitize_token(&token));
            let pattern = self
                .keys
                .build_cache_path_regex(&fragment, Some(TOKEN_VARIANT_SUFFIX))?;
            let removed =
                self.invalidator
                    .delete_matching(&pattern, &InvalidationScope::WholeTree, false)?;
            if removed > 0 {
                self.store.refresh_after_bulk();
            }
            return Ok(DeferredDecision::Bypass);
        }

        // Non-mutating request: authenticated visitors share the anonymous
        // cache under this policy.
        self.serve_or_capture(&context.url, "")
    }

    fn resolve_variant(
        &mut self,
        context: &RequestContext,
    ) -> Result<DeferredDecision, CacheError> {
        let Some(token) = self.resolver.resolve(context) else {
            debug!(
                trace = "postload.token_unresolved",
                "cookie looked authenticated but no token resolved"
            );
            self.state = GateState::Bypassed;
            return Ok(DeferredDecision::Bypass);
        };
        self.serve_or_capture(&context.url, &token)
    }

    fn serve_or_capture(
        &mut self,
        url: &str,
        user_token: &str,
    ) -> Result<DeferredDecision, CacheError> {
        let cache_path =
            self.keys
                .build_cache_path(url, user_token, self.version_salt, &KeyFlags::DEFAULT);
        if cache_path.is_empty() {
            self.state = GateState::Bypassed;
            return Ok(DeferredDecision::Bypass);
        }

        if let Some(page) = self.store.read(&cache_path)? {
            self.state = GateState::Served;
            return Ok(DeferredDecision::Serve(page));
        }

        self.pending_write = Some(cache_path.clone());
        self.state = GateState::PendingObStart;
        Ok(DeferredDecision::CaptureForWrite { cache_path })
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use super::*;
    use crate::lock::CacheLock;
    use crate::settings::CacheSettings;

    struct FixedToken(Option<String>);

    impl UserTokenResolver for FixedToken {
        fn resolve(&self, _context: &RequestContext) -> Option<String> {
            self.0.clone()
        }
    }

    struct Fixture {
        keys: CacheKeyBuilder,
        store: DiskStore,
        invalidator: Invalidator,
        settings: CacheSettings,
    }

    impl Fixture {
        fn new(root: &Path, policy: AuthPolicy) -> Self {
            let mut settings = CacheSettings {
                cache_root: root.to_path_buf(),
                max_age: "1h".to_string(),
                ..Default::default()
            };
            settings.postload.policy = policy;

            let lock = Arc::new(
                CacheLock::new(&settings.locking, &settings.cache_root).expect("lock"),
            );
            Self {
                keys: CacheKeyBuilder::new(None),
                store: DiskStore::new(&settings, Arc::clone(&lock)).expect("store"),
                invalidator: Invalidator::new(&settings, lock).expect("invalidator"),
                settings,
            }
        }

        fn gate<'a>(&'a self, resolver: &'a dyn UserTokenResolver) -> PostloadGate<'a> {
            PostloadGate::new(
                &self.keys,
                &self.store,
                &self.invalidator,
                &self.settings.postload,
                &self.settings.version_salt,
                resolver,
            )
        }
    }

    fn request(url: &str, method: RequestMethod, cookies: &[(&str, &str)]) -> RequestContext {
        RequestContext {
            url: url.to_string(),
            method,
            cookies: cookies
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn page(body: &str) -> PageContent {
        PageContent {
            status: 200,
            headers: vec![("Content-Type".to_string(), "text/html".to_string())],
            body: Bytes::from(body.to_string()),
        }
    }

    #[test]
    fn anonymous_requests_take_the_fast_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fixture = Fixture::new(dir.path(), AuthPolicy::PerUserVariant);
        let resolver = FixedToken(None);
        let mut gate = fixture.gate(&resolver);

        let context = request(
            "http://example.com/",
            RequestMethod::Get,
            &[("tracking", "x")],
        );
        assert_eq!(gate.evaluate_early(&context), EarlyDecision::Anonymous);
        assert_eq!(gate.state(), GateState::Bypassed);
    }

    #[test]
    fn per_user_variant_captures_then_serves() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fixture = Fixture::new(dir.path(), AuthPolicy::PerUserVariant);
        let resolver = FixedToken(Some("alice".to_string()));
        let context = request(
            "http://example.com/dashboard",
            RequestMethod::Get,
            &[("auth_token", "x")],
        );

        let mut gate = fixture.gate(&resolver);
        assert_eq!(gate.evaluate_early(&context), EarlyDecision::Deferred);
        assert_eq!(gate.state(), GateState::PendingObStart);

        let decision = gate.evaluate_deferred(&context).expect("deferred");
        let DeferredDecision::CaptureForWrite { cache_path } = decision else {
            panic!("expected a capture, got {decision:?}");
        };
        assert!(cache_path.contains(".u/alice"), "got {cache_path}");

        let stored = gate.store_captured(&page("alice's view")).expect("store");
        assert_eq!(stored, Some(Bytes::from("alice's view")));
        assert_eq!(gate.state(), GateState::Served);

        let mut second = fixture.gate(&resolver);
        second.evaluate_early(&context);
        match second.evaluate_deferred(&context).expect("deferred") {
            DeferredDecision::Serve(served) => {
                assert_eq!(served.body, Bytes::from("alice's view"));
            }
            other => panic!("expected a serve, got {other:?}"),
        }
        assert_eq!(second.state(), GateState::Served);
    }

    #[test]
    fn unresolved_token_neither_serves_nor_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fixture = Fixture::new(dir.path(), AuthPolicy::PerUserVariant);
        let resolver = FixedToken(None);
        let context = request(
            "http://example.com/dashboard",
            RequestMethod::Get,
            &[("session_id", "looks-valid")],
        );

        let mut gate = fixture.gate(&resolver);
        assert_eq!(gate.evaluate_early(&context), EarlyDecision::Deferred);
        assert!(matches!(
            gate.evaluate_deferred(&context).expect("deferred"),
            DeferredDecision::Bypass
        ));
        assert_eq!(gate.state(), GateState::Bypassed);
        assert_eq!(gate.store_captured(&page("x")).expect("store"), None);
    }

    #[test]
    fn mutation_invalidates_the_users_variants() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fixture = Fixture::new(dir.path(), AuthPolicy::InvalidateOnMutation);
        let resolver = FixedToken(Some("alice".to_string()));

        let variant_path = fixture.keys.build_cache_path(
            "http://example.com/dashboard",
            "alice",
            "",
            &KeyFlags::DEFAULT,
        );
        fixture.store.write(&variant_path, &page("stale view")).expect("seed");
        let shared_path = fixture.keys.build_cache_path(
            "http://example.com/other",
            "",
            "",
            &KeyFlags::DEFAULT,
        );
        fixture.store.write(&shared_path, &page("shared")).expect("seed");

        let context = request(
            "http://example.com/comment",
            RequestMethod::Post,
            &[("auth_token", "x")],
        );
        let mut gate = fixture.gate(&resolver);
        assert_eq!(gate.evaluate_early(&context), EarlyDecision::Deferred);
        assert!(matches!(
            gate.evaluate_deferred(&context).expect("deferred"),
            DeferredDecision::Bypass
        ));
        assert_eq!(gate.state(), GateState::Bypassed);

        assert!(!dir.path().join(&variant_path).exists());
        assert!(dir.path().join(&shared_path).exists());
    }

    #[test]
    fn mutation_spares_tokens_that_merely_share_a_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fixture = Fixture::new(dir.path(), AuthPolicy::InvalidateOnMutation);
        let resolver = FixedToken(Some("alice".to_string()));

        let alice = fixture.keys.build_cache_path(
            "http://example.com/dashboard",
            "alice",
            "",
            &KeyFlags::DEFAULT,
        );
        let alice2 = fixture.keys.build_cache_path(
            "http://example.com/dashboard",
            "alice2",
            "",
            &KeyFlags::DEFAULT,
        );
        fixture.store.write(&alice, &page("alice")).expect("seed");
        fixture.store.write(&alice2, &page("alice2")).expect("seed");

        let context = request(
            "http://example.com/comment",
            RequestMethod::Post,
            &[("auth_token", "x")],
        );
        let mut gate = fixture.gate(&resolver);
        gate.evaluate_early(&context);
        gate.evaluate_deferred(&context).expect("deferred");

        assert!(!dir.path().join(&alice).exists());
        assert!(dir.path().join(&alice2).exists());
    }

    #[test]
    fn disallowed_query_get_counts_as_mutating() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fixture = Fixture::new(dir.path(), AuthPolicy::InvalidateOnMutation);
        let resolver = FixedToken(Some("alice".to_string()));
        let mut gate = fixture.gate(&resolver);

        let context = request(
            "http://example.com/post?preview=1",
            RequestMethod::Get,
            &[("auth_token", "x")],
        );
        gate.evaluate_early(&context);
        assert!(matches!(
            gate.evaluate_deferred(&context).expect("deferred"),
            DeferredDecision::Bypass
        ));
    }

    #[test]
    fn non_mutating_request_shares_the_anonymous_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fixture = Fixture::new(dir.path(), AuthPolicy::InvalidateOnMutation);
        let resolver = FixedToken(Some("alice".to_string()));
        let context = request(
            "http://example.com/blog?page=2",
            RequestMethod::Get,
            &[("auth_token", "x")],
        );

        let mut gate = fixture.gate(&resolver);
        gate.evaluate_early(&context);
        let DeferredDecision::CaptureForWrite { cache_path } =
            gate.evaluate_deferred(&context).expect("deferred")
        else {
            panic!("expected a capture");
        };
        // Shared entry, not a per-user variant.
        assert!(!cache_path.contains(".u/"), "got {cache_path}");
        gate.store_captured(&page("shared body")).expect("store");

        let mut second = fixture.gate(&resolver);
        second.evaluate_early(&context);
        assert!(matches!(
            second.evaluate_deferred(&context).expect("deferred"),
            DeferredDecision::Serve(_)
        ));
    }
}
