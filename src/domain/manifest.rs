use serde::{Deserialize, Serialize};

use crate::domain::digest::Digest;

/// A container image: a content-addressed hash owning an ordered list of
/// layer digests. Layers are shared between manifests.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub hash: Digest,
    pub layers: Vec<Digest>,
}

impl Manifest {
    pub fn new(hash: Digest, layers: Vec<Digest>) -> Self {
        Self { hash, layers }
    }
}
