//! Scorta — a filesystem-backed full-page response cache engine.
//!
//! For each distinct (site, page, query, visitor-variant) identity the engine
//! serves previously rendered output instead of regenerating it, and
//! transparently rebuilds entries on miss or expiration:
//!
//! - **Key derivation**: deterministic, collision-free mapping from request
//!   identity to a relative storage path.
//! - **Storage**: atomic temp-file-then-rename writes, an optional in-memory
//!   LRU tier, canonical 404 de-duplication.
//! - **Invalidation**: regex-driven bulk deletion over the tree, guarded by a
//!   directory-wide lock.
//! - **Postload gate**: deferred per-visitor decisions once authentication
//!   state is known.
//!
//! ## Configuration
//!
//! Settings deserialize from TOML layered with `SCORTA__`-prefixed
//! environment overrides:
//!
//! ```toml
//! cache_root = "/var/cache/scorta"
//! max_age = "30m"
//! nonce_max_age = "5m"
//!
//! [memory]
//! enabled = true
//! entry_limit = 256
//! # ... see settings.rs for all options
//! ```

mod engine;
mod error;
mod invalidate;
mod key;
mod lock;
mod memo;
mod postload;
mod settings;
mod store;
mod sync;
pub mod telemetry;

pub use engine::{CacheAction, OnClearHook, PageCache};
pub use error::CacheError;
pub use invalidate::{InvalidationScope, Invalidator, MATCH_ALL_PATTERN, match_all};
pub use key::{CacheKeyBuilder, DEFAULT_SUFFIX_FRAGMENT, KeyFlags, MAX_PATH_LEN, MAX_SEGMENT_LEN};
pub use lock::{CacheLock, LockBackendKind, LockGuard};
pub use memo::MemoTable;
pub use postload::{
    AuthPolicy, DeferredDecision, EarlyDecision, GateState, PostloadGate, RequestContext,
    RequestMethod, UserTokenResolver,
};
pub use settings::{
    CacheSettings, LockSettings, MemorySettings, NotFoundSettings, PostloadSettings,
};
pub use store::{
    CachedPage, DiskStore, HEADER_SEPARATOR, NotFoundMode, PageContent, memory::MemoryTier,
};
pub use telemetry::{LogFormat, LoggingSettings};
