use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity of an artifact producer: a versioned scanner of one kind.
/// Scan bookkeeping is keyed by the full tuple, so bumping the version
/// re-scans every layer.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Scanner {
    pub name: String,
    pub version: String,
    pub kind: ScannerKind,
}

impl Scanner {
    pub fn new(name: impl Into<String>, version: impl Into<String>, kind: ScannerKind) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            kind,
        }
    }
}

impl Display for Scanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.name, self.version, self.kind)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum ScannerKind {
    Package,
    Distribution,
    Repository,
    File,
}

impl ScannerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScannerKind::Package => "package",
            ScannerKind::Distribution => "distribution",
            ScannerKind::Repository => "repository",
            ScannerKind::File => "file",
        }
    }
}

impl Display for ScannerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("unknown scanner kind: {0:?}")]
pub struct UnknownScannerKind(pub String);

impl FromStr for ScannerKind {
    type Err = UnknownScannerKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "package" => ScannerKind::Package,
            "distribution" => ScannerKind::Distribution,
            "repository" => ScannerKind::Repository,
            "file" => ScannerKind::File,
            other => return Err(UnknownScannerKind(other.to_string())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips() {
        for kind in [
            ScannerKind::Package,
            ScannerKind::Distribution,
            ScannerKind::Repository,
            ScannerKind::File,
        ] {
            assert_eq!(kind.as_str().parse::<ScannerKind>().unwrap(), kind);
        }
        assert!("image".parse::<ScannerKind>().is_err());
    }

    #[test]
    fn identity_is_the_full_tuple() {
        let a = Scanner::new("dpkg", "1.0", ScannerKind::Package);
        let b = Scanner::new("dpkg", "1.1", ScannerKind::Package);
        assert_ne!(a, b);
    }
}
