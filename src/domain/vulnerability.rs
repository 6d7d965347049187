use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use md5::{Digest as _, Md5};
use serde::{Deserialize, Serialize};

use crate::domain::distribution::Distribution;
use crate::domain::package::Package;
use crate::domain::repository::Repository;
use crate::domain::severity::Severity;
use crate::domain::version::VersionRange;

/// A vulnerability fact published by an updater. Rows are content-addressed
/// by [`Vulnerability::content_digest`]; `id` is assigned by the store and is
/// not part of equality.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Vulnerability {
    #[serde(default)]
    pub id: i64,
    pub updater: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued: Option<DateTime<Utc>>,
    #[serde(default)]
    pub links: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub normalized_severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<Package>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist: Option<Distribution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<Repository>,
    #[serde(default)]
    pub fixed_in_version: String,
    #[serde(default)]
    pub arch_operation: ArchOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<VersionRange>,
}

impl Vulnerability {
    /// Stable MD5 over the canonical concatenation of every content field.
    /// Two calls with identical content yield identical digests across
    /// processes, which is what makes ingest idempotent.
    pub fn content_digest(&self) -> [u8; 16] {
        let mut h = Md5::new();
        let mut part = |s: &str| {
            h.update(s.as_bytes());
            h.update([0u8]);
        };

        part(&self.name);
        part(&self.description);
        part(
            &self
                .issued
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
        );
        part(&self.links);
        part(&self.severity);

        if let Some(p) = &self.package {
            part(&p.name);
            part(p.kind.as_str());
            part(&p.version);
            part(&p.module);
            part(&p.arch);
        } else {
            part("");
        }

        if let Some(d) = &self.dist {
            part(&d.did);
            part(&d.name);
            part(&d.version);
            part(&d.version_code_name);
            part(&d.version_id);
            part(&d.arch);
            part(d.cpe.as_ref().map(|c| c.as_str()).unwrap_or_default());
            part(&d.pretty_name);
        } else {
            part("");
        }

        if let Some(r) = &self.repo {
            part(&r.name);
            part(&r.key);
            part(&r.uri);
        } else {
            part("");
        }

        part(self.arch_operation.as_str());
        part(&self.fixed_in_version);

        if let Some(range) = &self.range {
            part(&range.lower.kind);
            part(&range.lower.to_string());
            part(&range.upper.to_string());
        } else {
            part("");
        }

        h.finalize().into()
    }
}

impl PartialEq for Vulnerability {
    fn eq(&self, other: &Self) -> bool {
        self.updater == other.updater
            && self.name == other.name
            && self.description == other.description
            && self.issued == other.issued
            && self.links == other.links
            && self.severity == other.severity
            && self.normalized_severity == other.normalized_severity
            && self.package == other.package
            && self.dist == other.dist
            && self.repo == other.repo
            && self.fixed_in_version == other.fixed_in_version
            && self.arch_operation == other.arch_operation
            && self.range == other.range
    }
}

impl Eq for Vulnerability {}

impl Hash for Vulnerability {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.updater.hash(state);
        self.name.hash(state);
        self.content_digest().hash(state);
    }
}

/// How a vulnerability's architecture constrains matching.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub enum ArchOperation {
    #[default]
    Equals,
    NotEquals,
    Pattern,
}

impl ArchOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchOperation::Equals => "==",
            ArchOperation::NotEquals => "!=",
            ArchOperation::Pattern => "~",
        }
    }
}

impl Display for ArchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchOperation {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "!=" => ArchOperation::NotEquals,
            "~" => ArchOperation::Pattern,
            _ => ArchOperation::Equals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::version::NormalizedVersion;

    fn cve(name: &str) -> Vulnerability {
        Vulnerability {
            updater: "test-updater".to_string(),
            name: name.to_string(),
            description: "a description".to_string(),
            links: "https://example.com/advisory".to_string(),
            severity: "Important".to_string(),
            normalized_severity: Severity::High,
            package: Some(Package {
                name: "openssl".to_string(),
                version: "3.0.2".to_string(),
                ..Default::default()
            }),
            fixed_in_version: "3.0.3".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn digest_is_stable_for_identical_content() {
        let a = cve("CVE-2024-0001");
        let mut b = cve("CVE-2024-0001");
        b.id = 99;
        assert_eq!(a.content_digest(), b.content_digest());
    }

    #[test]
    fn digest_differs_when_any_field_differs() {
        let base = cve("CVE-2024-0001");

        let mut renamed = base.clone();
        renamed.name = "CVE-2024-0002".to_string();
        assert_ne!(base.content_digest(), renamed.content_digest());

        let mut refixed = base.clone();
        refixed.fixed_in_version = "3.0.4".to_string();
        assert_ne!(base.content_digest(), refixed.content_digest());

        let mut ranged = base.clone();
        ranged.range = Some(VersionRange {
            lower: NormalizedVersion::new("semver", [3, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
            upper: NormalizedVersion::new("semver", [3, 0, 3, 0, 0, 0, 0, 0, 0, 0]),
        });
        assert_ne!(base.content_digest(), ranged.content_digest());
    }

    #[test]
    fn field_boundaries_do_not_collide() {
        // "ab" + "c" must not hash like "a" + "bc".
        let mut a = cve("CVE-1");
        a.description = "ab".to_string();
        a.links = "c".to_string();
        let mut b = cve("CVE-1");
        b.description = "a".to_string();
        b.links = "bc".to_string();
        assert_ne!(a.content_digest(), b.content_digest());
    }

    #[test]
    fn equality_ignores_the_server_assigned_id() {
        let mut a = cve("CVE-2024-0001");
        let b = cve("CVE-2024-0001");
        a.id = 17;
        assert_eq!(a, b);
    }
}
