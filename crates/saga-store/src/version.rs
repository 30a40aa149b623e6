use serde::{Deserialize, Serialize};

/// Concurrency token of a stored saga instance.
///
/// A freshly inserted instance is at version 1; every successful save
/// increments it by one. `Version::initial()` (0) denotes an instance that
/// has never been stored.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the version of an instance that was never stored.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the version assigned on insert.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_ordered() {
        assert!(Version::initial() < Version::first());
        assert_eq!(Version::initial().next(), Version::first());
        assert_eq!(Version::new(41).next().as_i64(), 42);
    }
}
