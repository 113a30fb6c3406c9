//! Invalidation scopes.
//!
//! A scope names the businesses or servers a change touched. An empty scope
//! means the change affects everyone, so it is represented explicitly as
//! [`ScopeSet::Everyone`] and an `Only` set is never empty.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Set of affected keys, or "everyone".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeSet<T: Ord> {
    /// The change is not limited to particular keys.
    Everyone,
    /// The change is limited to these keys (never empty).
    Only(BTreeSet<T>),
}

impl<T: Ord> Default for ScopeSet<T> {
    fn default() -> Self {
        ScopeSet::Everyone
    }
}

impl<T: Ord> ScopeSet<T> {
    /// Scope covering every key.
    pub fn everyone() -> Self {
        ScopeSet::Everyone
    }

    /// Scope limited to the given keys. An empty iterator yields `Everyone`.
    pub fn only(keys: impl IntoIterator<Item = T>) -> Self {
        let set: BTreeSet<T> = keys.into_iter().collect();
        if set.is_empty() {
            ScopeSet::Everyone
        } else {
            ScopeSet::Only(set)
        }
    }

    /// Scope limited to a single key.
    pub fn single(key: T) -> Self {
        let mut set = BTreeSet::new();
        set.insert(key);
        ScopeSet::Only(set)
    }

    pub fn is_everyone(&self) -> bool {
        matches!(self, ScopeSet::Everyone)
    }

    /// Keys of a limited scope; `None` for `Everyone`.
    pub fn keys(&self) -> Option<&BTreeSet<T>> {
        match self {
            ScopeSet::Everyone => None,
            ScopeSet::Only(keys) => Some(keys),
        }
    }

    /// Union this scope with another. Anything unioned with `Everyone` is `Everyone`.
    pub fn union(&mut self, other: ScopeSet<T>) {
        match other {
            ScopeSet::Everyone => *self = ScopeSet::Everyone,
            ScopeSet::Only(theirs) => {
                if let ScopeSet::Only(mine) = self {
                    mine.extend(theirs);
                }
            }
        }
    }

    /// Whether `key` is covered by this scope.
    pub fn contains(&self, key: &T) -> bool {
        match self {
            ScopeSet::Everyone => true,
            ScopeSet::Only(keys) => keys.contains(key),
        }
    }
}

impl<T: Ord> From<Option<T>> for ScopeSet<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(key) => ScopeSet::single(key),
            None => ScopeSet::Everyone,
        }
    }
}
