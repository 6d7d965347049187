use sqlx::postgres::{PgArgumentBuffer, PgRow, PgTypeInfo, PgValueRef};
use sqlx::{Decode, Encode, Postgres, Row, Type};

use crate::domain::{
    ArchOperation, Cpe, Digest, Distribution, File, NormalizedVersion, Package, Repository,
    Vulnerability,
};

use super::observe::MethodError;

// Digest and CPE travel as text.

impl Type<Postgres> for Digest {
    fn type_info() -> PgTypeInfo {
        <String as Type<Postgres>>::type_info()
    }
}

impl Encode<'_, Postgres> for Digest {
    fn encode_by_ref(
        &self,
        buf: &mut PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        <String as Encode<'_, Postgres>>::encode_by_ref(&self.to_string(), buf)
    }
}

impl<'r> Decode<'r, Postgres> for Digest {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let raw = <&str as Decode<'r, Postgres>>::decode(value)?;
        Ok(raw.parse()?)
    }
}

impl Type<Postgres> for Cpe {
    fn type_info() -> PgTypeInfo {
        <String as Type<Postgres>>::type_info()
    }
}

impl Encode<'_, Postgres> for Cpe {
    fn encode_by_ref(
        &self,
        buf: &mut PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        <&str as Encode<'_, Postgres>>::encode_by_ref(&self.as_str(), buf)
    }
}

impl<'r> Decode<'r, Postgres> for Cpe {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let raw = <&str as Decode<'r, Postgres>>::decode(value)?;
        Ok(raw.parse()?)
    }
}

/// The `dist`/`repo`/`vuln` tables keep an empty string for "no CPE"; only
/// well-formed bindings round-trip as values.
pub(crate) fn cpe_to_wire(cpe: &Option<Cpe>) -> &str {
    cpe.as_ref().map(|c| c.as_str()).unwrap_or("")
}

pub(crate) fn cpe_from_wire(raw: &str) -> Result<Option<Cpe>, MethodError> {
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|e| MethodError::Internal(format!("stored CPE failed to decode: {e}")))
}

/// A normalized version travels as a kind column plus an `int4[]` of
/// exactly ten elements; both NULL when absent.
pub(crate) fn version_to_wire(
    version: &Option<NormalizedVersion>,
) -> (Option<&str>, Option<Vec<i32>>) {
    match version {
        Some(v) => (Some(v.kind.as_str()), Some(v.v.to_vec())),
        None => (None, None),
    }
}

pub(crate) fn version_from_wire(
    kind: Option<String>,
    components: Option<Vec<i32>>,
) -> Result<Option<NormalizedVersion>, MethodError> {
    match (kind, components) {
        (Some(kind), Some(components)) => {
            let v: [i32; 10] = components.try_into().map_err(|got: Vec<i32>| {
                MethodError::Internal(format!(
                    "normalized version must have exactly 10 components, got {}",
                    got.len()
                ))
            })?;
            Ok(Some(NormalizedVersion { kind, v }))
        }
        (None, None) => Ok(None),
        _ => Err(MethodError::Internal(
            "normalized version kind and components must be both present or both absent"
                .to_string(),
        )),
    }
}

// Row decoders. Column order is fixed by the templates and is part of the
// wire contract; every reader below indexes positionally.

/// Decodes the eight-column package block starting at `base`:
/// `id, name, kind, version, norm_kind, norm_version, module, arch`.
/// An all-NULL block (a LEFT JOIN miss) decodes to `None`.
pub(crate) fn package_at(row: &PgRow, base: usize) -> Result<Option<Package>, MethodError> {
    let id: Option<i64> = row.try_get(base)?;
    let Some(id) = id else {
        return Ok(None);
    };
    let kind: String = row.try_get(base + 2)?;
    Ok(Some(Package {
        id,
        name: row.try_get(base + 1)?,
        kind: kind.parse().unwrap_or_default(),
        version: row.try_get(base + 3)?,
        normalized_version: version_from_wire(
            row.try_get(base + 4)?,
            row.try_get(base + 5)?,
        )?,
        module: row.try_get(base + 6)?,
        arch: row.try_get(base + 7)?,
        ..Default::default()
    }))
}

/// `id, did, name, version, version_code_name, version_id, arch, cpe,
/// pretty_name`.
pub(crate) fn distribution_from_row(row: &PgRow) -> Result<Distribution, MethodError> {
    let cpe: String = row.try_get(7)?;
    Ok(Distribution {
        id: row.try_get(0)?,
        did: row.try_get(1)?,
        name: row.try_get(2)?,
        version: row.try_get(3)?,
        version_code_name: row.try_get(4)?,
        version_id: row.try_get(5)?,
        arch: row.try_get(6)?,
        cpe: cpe_from_wire(&cpe)?,
        pretty_name: row.try_get(8)?,
    })
}

/// `id, name, key, uri, cpe`.
pub(crate) fn repository_from_row(row: &PgRow) -> Result<Repository, MethodError> {
    let cpe: String = row.try_get(4)?;
    Ok(Repository {
        id: row.try_get(0)?,
        name: row.try_get(1)?,
        key: row.try_get(2)?,
        uri: row.try_get(3)?,
        cpe: cpe_from_wire(&cpe)?,
    })
}

/// `path, kind`.
pub(crate) fn file_from_row(row: &PgRow) -> Result<File, MethodError> {
    let kind: String = row.try_get(1)?;
    Ok(File {
        path: row.try_get(0)?,
        kind: kind
            .parse()
            .map_err(|e| MethodError::Internal(format!("stored file kind failed to decode: {e}")))?,
    })
}

/// Decodes a full vulnerability row in the `get_select` column order.
pub(crate) fn vulnerability_from_row(row: &PgRow) -> Result<Vulnerability, MethodError> {
    let normalized_severity: String = row.try_get(7)?;
    let arch_operation: String = row.try_get(25)?;

    let package_name: String = row.try_get(8)?;
    let package = (!package_name.is_empty()).then(|| -> Result<Package, MethodError> {
        let kind: String = row.try_get(9)?;
        Ok(Package {
            name: package_name.clone(),
            kind: kind.parse().unwrap_or_default(),
            version: row.try_get(10)?,
            module: row.try_get(11)?,
            arch: row.try_get(12)?,
            ..Default::default()
        })
    });

    let did: String = row.try_get(13)?;
    let dist_name: String = row.try_get(14)?;
    let dist_version: String = row.try_get(15)?;
    let dist_version_code_name: String = row.try_get(16)?;
    let dist_version_id: String = row.try_get(17)?;
    let dist_arch: String = row.try_get(18)?;
    let dist_cpe: String = row.try_get(19)?;
    let dist_pretty_name: String = row.try_get(20)?;
    let has_dist = !(did.is_empty()
        && dist_name.is_empty()
        && dist_version.is_empty()
        && dist_version_code_name.is_empty()
        && dist_version_id.is_empty()
        && dist_arch.is_empty()
        && dist_cpe.is_empty()
        && dist_pretty_name.is_empty());
    let dist = has_dist
        .then(|| -> Result<Distribution, MethodError> {
            Ok(Distribution {
                id: 0,
                did,
                name: dist_name,
                version: dist_version,
                version_code_name: dist_version_code_name,
                version_id: dist_version_id,
                arch: dist_arch,
                cpe: cpe_from_wire(&dist_cpe)?,
                pretty_name: dist_pretty_name,
            })
        })
        .transpose()?;

    let repo_name: String = row.try_get(21)?;
    let repo_key: String = row.try_get(22)?;
    let repo_uri: String = row.try_get(23)?;
    let repo = (!(repo_name.is_empty() && repo_key.is_empty() && repo_uri.is_empty())).then(|| {
        Repository {
            name: repo_name,
            key: repo_key,
            uri: repo_uri,
            ..Default::default()
        }
    });

    let lower = version_from_wire(row.try_get(26)?, row.try_get(27)?)?;
    let upper = match &lower {
        Some(l) => version_from_wire(Some(l.kind.clone()), row.try_get(28)?)?,
        None => None,
    };
    let range = lower
        .zip(upper)
        .map(|(lower, upper)| crate::domain::VersionRange { lower, upper });

    Ok(Vulnerability {
        id: row.try_get(0)?,
        updater: row.try_get(1)?,
        name: row.try_get(2)?,
        description: row.try_get(3)?,
        issued: row.try_get(4)?,
        links: row.try_get(5)?,
        severity: row.try_get(6)?,
        normalized_severity: normalized_severity.parse().unwrap_or_default(),
        package: package.transpose()?,
        dist,
        repo,
        fixed_in_version: row.try_get(24)?,
        arch_operation: arch_operation.parse().unwrap_or(ArchOperation::Equals),
        range,
    })
}
