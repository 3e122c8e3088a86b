//! Opaque, totally ordered revision tokens.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Version token stamped on every stored value and watch event.
///
/// The encoding belongs to the backing store. Ordering is by length, then by
/// bytes: canonical decimal counters (etcd, the in-memory store, Kubernetes in
/// practice) order numerically without being parsed, and any other string
/// encoding still gets a stable total order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn from_counter(n: u64) -> Self {
        Self(n.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Counter value for stores that encode revisions as decimal integers.
    pub fn as_counter(&self) -> Option<u64> {
        self.0.parse().ok()
    }

    pub fn is_newer_than(&self, other: &Revision) -> bool {
        self > other
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.len().cmp(&other.0.len()).then_with(|| self.0.as_bytes().cmp(other.0.as_bytes()))
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Revision {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Revision {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for Revision {
    fn from(n: u64) -> Self {
        Self::from_counter(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_order_numerically() {
        assert!(Revision::from_counter(10) > Revision::from_counter(9));
        assert!(Revision::from_counter(100) > Revision::from_counter(99));
        assert!(Revision::from("2").is_newer_than(&Revision::from("1")));
        assert!(!Revision::from("1").is_newer_than(&Revision::from("1")));
    }

    #[test]
    fn string_tokens_are_totally_ordered() {
        let mut revs = vec![Revision::from("b"), Revision::from("aa"), Revision::from("a")];
        revs.sort();
        assert_eq!(revs, vec![Revision::from("a"), Revision::from("b"), Revision::from("aa")]);
    }
}
