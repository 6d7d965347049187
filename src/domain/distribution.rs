use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::domain::cpe::Cpe;

/// An operating-system distribution a layer was found to belong to, in
/// os-release terms. Identity is the full tuple minus the store-assigned id.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Distribution {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub did: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub version_code_name: String,
    #[serde(default)]
    pub version_id: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpe: Option<Cpe>,
    #[serde(default)]
    pub pretty_name: String,
}

impl PartialEq for Distribution {
    fn eq(&self, other: &Self) -> bool {
        self.did == other.did
            && self.name == other.name
            && self.version == other.version
            && self.version_code_name == other.version_code_name
            && self.version_id == other.version_id
            && self.arch == other.arch
            && self.cpe == other.cpe
            && self.pretty_name == other.pretty_name
    }
}

impl Eq for Distribution {}

impl Hash for Distribution {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.did.hash(state);
        self.name.hash(state);
        self.version.hash(state);
        self.version_code_name.hash(state);
        self.version_id.hash(state);
        self.arch.hash(state);
        self.cpe.hash(state);
        self.pretty_name.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_the_server_assigned_id() {
        let a = Distribution {
            id: 7,
            did: "ubuntu".to_string(),
            name: "Ubuntu".to_string(),
            version: "22.04".to_string(),
            ..Default::default()
        };
        let b = Distribution { id: 0, ..a.clone() };
        assert_eq!(a, b);
    }
}
