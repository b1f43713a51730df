use serde::{Deserialize, Serialize};

/// Optimistic-concurrency token carried by every persisted row.
///
/// A freshly created row is stored at [`Version::first`]; each persisted
/// mutation moves it to [`Version::next`]. A write that names a version other
/// than the stored one is rejected as a concurrency conflict.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the version of a row that has not been persisted yet (0).
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the version of a newly inserted row (1).
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
    fn versions_advance_by_one() {
        assert_eq!(Version::initial().next(), Version::first());
        assert_eq!(Version::first().next(), Version::new(2));
    }

    #[test]
    fn versions_order_numerically() {
        assert!(Version::new(3) > Version::new(2));
        assert_eq!(i64::from(Version::new(7)), 7);
    }
}
