pub mod cpe;
pub mod digest;
pub mod distribution;
pub mod enrichment;
pub mod file;
pub mod index_report;
pub mod manifest;
pub mod package;
pub mod repository;
pub mod scanner;
pub mod severity;
pub mod update;
pub mod version;
pub mod vulnerability;

pub use cpe::Cpe;
pub use digest::{Algorithm, Digest, DigestError};
pub use distribution::Distribution;
pub use enrichment::EnrichmentRecord;
pub use file::{File, FileKind};
pub use index_report::{Environment, INDEX_FINISHED, IndexRecord, IndexReport};
pub use manifest::Manifest;
pub use package::{Package, PackageIdentity, PackageKind};
pub use repository::Repository;
pub use scanner::{Scanner, ScannerKind};
pub use severity::Severity;
pub use update::{UpdateDiff, UpdateKind, UpdateOperation, UpdaterStatus};
pub use version::{NormalizedVersion, VersionRange};
pub use vulnerability::{ArchOperation, Vulnerability};
