use std::cmp::Ordering;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Fixed-width normalized version: a kind tag plus ten signed 32-bit
/// components compared lexicographically. The database wire form is the kind
/// in its own column and the components as an `int4[]` of exactly ten.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct NormalizedVersion {
    pub kind: String,
    pub v: [i32; 10],
}

impl NormalizedVersion {
    pub fn new(kind: impl Into<String>, v: [i32; 10]) -> Self {
        Self { kind: kind.into(), v }
    }

    /// Component-wise ordering. The kind tag is not part of the order;
    /// callers compare versions of the same kind only.
    pub fn cmp_components(&self, other: &Self) -> Ordering {
        self.v.cmp(&other.v)
    }
}

impl Display for NormalizedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.kind)?;
        let mut sep = "";
        for c in &self.v {
            write!(f, "{sep}{c}")?;
            sep = ".";
        }
        Ok(())
    }
}

/// Half-open interval `[lower, upper)` over normalized versions of one kind.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct VersionRange {
    pub lower: NormalizedVersion,
    pub upper: NormalizedVersion,
}

impl VersionRange {
    pub fn contains(&self, version: &NormalizedVersion) -> bool {
        self.lower.kind == version.kind
            && self.lower.cmp_components(version) != Ordering::Greater
            && version.cmp_components(&self.upper) == Ordering::Less
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ver(kind: &str, head: &[i32]) -> NormalizedVersion {
        let mut v = [0i32; 10];
        v[..head.len()].copy_from_slice(head);
        NormalizedVersion::new(kind, v)
    }

    #[rstest]
    #[case(&[1, 2, 3], &[1, 2, 3], Ordering::Equal)]
    #[case(&[1, 2, 3], &[1, 2, 4], Ordering::Less)]
    #[case(&[2], &[1, 9, 9], Ordering::Greater)]
    #[case(&[0], &[0, 0, 1], Ordering::Less)]
    fn component_ordering(#[case] a: &[i32], #[case] b: &[i32], #[case] expected: Ordering) {
        assert_eq!(ver("semver", a).cmp_components(&ver("semver", b)), expected);
    }

    #[test]
    fn range_is_half_open() {
        let range = VersionRange {
            lower: ver("semver", &[1]),
            upper: ver("semver", &[2]),
        };
        assert!(range.contains(&ver("semver", &[1])));
        assert!(range.contains(&ver("semver", &[1, 9, 9])));
        assert!(!range.contains(&ver("semver", &[2])));
        assert!(!range.contains(&ver("semver", &[0, 9])));
    }

    #[test]
    fn range_requires_a_matching_kind() {
        let range = VersionRange {
            lower: ver("semver", &[1]),
            upper: ver("semver", &[2]),
        };
        assert!(!range.contains(&ver("rpm", &[1, 5])));
    }

    #[test]
    fn display_includes_kind_and_all_components() {
        assert_eq!(
            ver("rpm", &[1, 2]).to_string(),
            "rpm:1.2.0.0.0.0.0.0.0.0"
        );
    }
}
