//! Identity-keyed memoization owned by a runtime state.

use crate::state::NativeFn;
use std::collections::HashMap;
use tether_core::value::TValue;

/// Stable identity under which a resolved value is cached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// An explicit token, either a constant chosen by the caller or one
    /// handed out by [`IdentityCache::fresh_key`].
    Token(u64),
    /// The address of a native function.
    Function(usize),
}

impl CacheKey {
    pub fn of_fn(f: NativeFn) -> CacheKey {
        CacheKey::Function(f as usize)
    }
}

/// Cached values are collector roots and die with the state.
#[derive(Debug, Default)]
pub struct IdentityCache {
    entries: HashMap<CacheKey, TValue>,
    next_token: u64,
}

/// Tokens handed out by `fresh_key` start here so they never collide with
/// small hand-picked constants.
const FRESH_TOKEN_BASE: u64 = 1 << 48;

impl IdentityCache {
    pub fn get(&self, key: CacheKey) -> Option<TValue> {
        self.entries.get(&key).copied()
    }

    pub fn insert(&mut self, key: CacheKey, value: TValue) {
        if value.is_nil() {
            self.entries.remove(&key);
        } else {
            self.entries.insert(key, value);
        }
    }

    pub fn fresh_key(&mut self) -> CacheKey {
        self.next_token += 1;
        CacheKey::Token(FRESH_TOKEN_BASE + self.next_token)
    }

    pub fn values(&self) -> impl Iterator<Item = TValue> + '_ {
        self.entries.values().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
