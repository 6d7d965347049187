use md5::{Digest as _, Md5};
use serde::{Deserialize, Serialize};

/// Side-channel metadata an updater attaches to matcher results: a set of
/// tags to join on and an opaque payload handed back verbatim.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    #[serde(default)]
    pub tags: Vec<String>,
    pub enrichment: serde_json::Value,
}

impl EnrichmentRecord {
    /// Stable MD5 over the sorted, NUL-joined tags followed by the raw
    /// payload. Tag order is irrelevant to identity.
    pub fn content_digest(&self) -> [u8; 16] {
        let mut tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();
        tags.sort_unstable();

        let mut h = Md5::new();
        for tag in tags {
            h.update(tag.as_bytes());
            h.update([0u8]);
        }
        h.update(self.enrichment.to_string().as_bytes());
        h.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tag_order_does_not_change_the_digest() {
        let a = EnrichmentRecord {
            tags: vec!["CVE-2024-1".to_string(), "CVE-2024-2".to_string()],
            enrichment: json!({"cvss": 9.8}),
        };
        let b = EnrichmentRecord {
            tags: vec!["CVE-2024-2".to_string(), "CVE-2024-1".to_string()],
            enrichment: json!({"cvss": 9.8}),
        };
        assert_eq!(a.content_digest(), b.content_digest());
    }

    #[test]
    fn payload_changes_the_digest() {
        let a = EnrichmentRecord {
            tags: vec!["CVE-2024-1".to_string()],
            enrichment: json!({"cvss": 9.8}),
        };
        let b = EnrichmentRecord {
            enrichment: json!({"cvss": 5.0}),
            ..a.clone()
        };
        assert_ne!(a.content_digest(), b.content_digest());
    }
}
