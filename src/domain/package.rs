use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::version::NormalizedVersion;

/// A package discovered in a layer. `id` is assigned by the store and is not
/// part of equality; two packages are the same when their content matches.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Package {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub kind: PackageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_version: Option<NormalizedVersion>,
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Box<Package>>,
    #[serde(default)]
    pub package_db: String,
    #[serde(default)]
    pub repository_hint: String,
    #[serde(default)]
    pub filepath: String,
}

/// The unique tuple the `package` table is content-addressed by.
pub type PackageIdentity<'a> = (&'a str, PackageKind, &'a str, &'a str, &'a str);

impl Package {
    pub fn identity(&self) -> PackageIdentity<'_> {
        (
            &self.name,
            self.kind,
            &self.version,
            &self.module,
            &self.arch,
        )
    }
}

impl PartialEq for Package {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.kind == other.kind
            && self.normalized_version == other.normalized_version
            && self.module == other.module
            && self.arch == other.arch
            && self.source == other.source
            && self.package_db == other.package_db
            && self.repository_hint == other.repository_hint
            && self.filepath == other.filepath
    }
}

impl Eq for Package {}

impl Hash for Package {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.kind.hash(state);
        self.version.hash(state);
        self.module.hash(state);
        self.arch.hash(state);
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub enum PackageKind {
    #[default]
    Binary,
    Source,
}

impl PackageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageKind::Binary => "binary",
            PackageKind::Source => "source",
        }
    }
}

impl Display for PackageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageKind {
    type Err = ();

    /// Anything that is not explicitly a source package is a binary one.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "source" => PackageKind::Source,
            _ => PackageKind::Binary,
        })
    }
}
