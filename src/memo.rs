//! Request-scoped memoization of derived values.
//!
//! Replaces the ambient per-process "already computed" caches of the original
//! design with an explicit table owned by the engine instance, keyed by
//! `(operation, args)` and cleared at the start of each request. Nothing here
//! is shared across unrelated engine instances.

use dashmap::DashMap;

/// Joins argument lists into one owned key. Unit-separator control
/// character, so `["a", "b"]` and `["ab", ""]` stay distinct.
const ARG_SEPARATOR: &str = "\u{1f}";

/// Explicit memoization table keyed by `(operation, args)`.
#[derive(Debug, Default)]
pub struct MemoTable {
    entries: DashMap<(&'static str, String), String>,
}

impl MemoTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Return the memoized value for `(op, args)`, computing and storing it
    /// on first use within the current request.
    pub fn get_or_insert_with<F>(&self, op: &'static str, args: &[&str], compute: F) -> String
    where
        F: FnOnce() -> String,
    {
        let key = (op, args.join(ARG_SEPARATOR));
        if let Some(hit) = self.entries.get(&key) {
            return hit.clone();
        }
        let value = compute();
        self.entries.insert(key, value.clone());
        value
    }

    /// Drop every memoized value. Called at the start of each request.
    pub fn reset(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn second_call_reuses_first_result() {
        let memo = MemoTable::new();
        let calls = AtomicUsize::new(0);

        let compute = || {
            calls.fetch_add(1, Ordering::SeqCst);
            "value".to_string()
        };

        assert_eq!(memo.get_or_insert_with("op", &["args"], compute), "value");
        assert_eq!(
            memo.get_or_insert_with("op", &["args"], || unreachable!()),
            "value"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(memo.len(), 1);
    }

    #[test]
    fn distinct_operations_do_not_collide() {
        let memo = MemoTable::new();
        memo.get_or_insert_with("a", &["args"], || "one".to_string());
        memo.get_or_insert_with("b", &["args"], || "two".to_string());

        assert_eq!(memo.get_or_insert_with("a", &["args"], String::new), "one");
        assert_eq!(memo.get_or_insert_with("b", &["args"], String::new), "two");
    }

    #[test]
    fn distinct_argument_lists_do_not_collide() {
        let memo = MemoTable::new();
        memo.get_or_insert_with("op", &["a", "b"], || "split".to_string());
        memo.get_or_insert_with("op", &["ab", ""], || "joined".to_string());

        assert_eq!(
            memo.get_or_insert_with("op", &["a", "b"], String::new),
            "split"
        );
        assert_eq!(
            memo.get_or_insert_with("op", &["ab", ""], String::new),
            "joined"
        );
        assert_eq!(memo.len(), 2);
    }

    #[test]
    fn reset_clears_the_table() {
        let memo = MemoTable::new();
        memo.get_or_insert_with("op", &["1"], || "stale".to_string());
        memo.reset();

        assert!(memo.is_empty());
        assert_eq!(
            memo.get_or_insert_with("op", &["1"], || "fresh".to_string()),
            "fresh"
        );
    }
}
