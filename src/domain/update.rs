use std::fmt::{self, Display};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::vulnerability::Vulnerability;

/// One transactional publication of vulnerability or enrichment facts by a
/// single updater. `ref` is the externally visible identifier; `date` is
/// assigned by the store.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct UpdateOperation {
    #[serde(rename = "ref")]
    pub reference: Uuid,
    pub updater: String,
    pub fingerprint: String,
    pub kind: UpdateKind,
    pub date: DateTime<Utc>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum UpdateKind {
    Vulnerability,
    Enrichment,
}

impl UpdateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateKind::Vulnerability => "vulnerability",
            UpdateKind::Enrichment => "enrichment",
        }
    }
}

impl Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("unknown update kind: {0:?}")]
pub struct UnknownUpdateKind(pub String);

impl FromStr for UpdateKind {
    type Err = UnknownUpdateKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "vulnerability" => UpdateKind::Vulnerability,
            "enrichment" => UpdateKind::Enrichment,
            other => return Err(UnknownUpdateKind(other.to_string())),
        })
    }
}

/// The difference between two published snapshots of one updater.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateDiff {
    pub prev: Option<UpdateOperation>,
    pub cur: UpdateOperation,
    pub added: Vec<Vulnerability>,
    pub removed: Vec<Vulnerability>,
}

/// Last-run bookkeeping for a single updater.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct UpdaterStatus {
    pub updater_name: String,
    pub last_attempt: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
    pub last_run_succeeded: bool,
    #[serde(default)]
    pub last_attempt_fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
