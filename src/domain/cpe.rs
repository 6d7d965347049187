use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A CPE 2.3 formatted-string binding of a well-formed name, e.g.
/// `cpe:2.3:o:redhat:enterprise_linux:8:*:*:*:*:*:*:*`.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cpe(String);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CpeError {
    #[error("CPE must start with the `cpe:2.3:` prefix: {0:?}")]
    MissingPrefix(String),

    #[error("CPE 2.3 formatted string must have 13 components, got {0}")]
    WrongComponentCount(usize),
}

impl Cpe {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Cpe {
    type Err = CpeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.starts_with("cpe:2.3:") {
            return Err(CpeError::MissingPrefix(s.to_string()));
        }
        // Attribute values may contain escaped colons; counting raw
        // separators is enough to reject truncated bindings.
        let components = s.split(':').count();
        if components != 13 {
            return Err(CpeError::WrongComponentCount(components));
        }
        Ok(Cpe(s.to_string()))
    }
}

impl TryFrom<String> for Cpe {
    type Error = CpeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cpe> for String {
    fn from(value: Cpe) -> Self {
        value.0
    }
}

impl Display for Cpe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
