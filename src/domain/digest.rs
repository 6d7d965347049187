use std::fmt::{self, Debug, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Content address of a manifest, layer or report, in `algo:hex` form.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: Algorithm,
    checksum: String,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DigestError {
    #[error("digest is missing the algorithm separator: {0:?}")]
    MissingSeparator(String),

    #[error("unknown digest algorithm: {0:?}")]
    UnknownAlgorithm(String),

    #[error("digest checksum has wrong length for {algorithm}: expected {expected}, got {got}")]
    WrongLength {
        algorithm: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("digest checksum contains a non-hex character: {0:?}")]
    NotHex(char),
}

impl Digest {
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algo, checksum) = s
            .split_once(':')
            .ok_or_else(|| DigestError::MissingSeparator(s.to_string()))?;

        let algorithm = match algo {
            "sha256" => Algorithm::Sha256,
            "sha512" => Algorithm::Sha512,
            other => return Err(DigestError::UnknownAlgorithm(other.to_string())),
        };

        if checksum.len() != algorithm.hex_len() {
            return Err(DigestError::WrongLength {
                algorithm: algorithm.as_str(),
                expected: algorithm.hex_len(),
                got: checksum.len(),
            });
        }

        if let Some(c) = checksum.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(DigestError::NotHex(c));
        }

        Ok(Digest {
            algorithm,
            checksum: checksum.to_ascii_lowercase(),
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.to_string()
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.checksum)
    }
}

impl Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}
