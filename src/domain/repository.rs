use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::domain::cpe::Cpe;

/// A package repository (an apt source, a yum repo, a Go module proxy…)
/// packages were installed from.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Repository {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpe: Option<Cpe>,
}

impl PartialEq for Repository {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.key == other.key
            && self.uri == other.uri
            && self.cpe == other.cpe
    }
}

impl Eq for Repository {}

impl Hash for Repository {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.key.hash(state);
        self.uri.hash(state);
        self.cpe.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_the_server_assigned_id() {
        let a = Repository {
            id: 3,
            name: "main".to_string(),
            key: "ubuntu-main".to_string(),
            uri: "http://archive.ubuntu.com/ubuntu".to_string(),
            cpe: None,
        };
        let b = Repository { id: 0, ..a.clone() };
        assert_eq!(a, b);
    }
}
