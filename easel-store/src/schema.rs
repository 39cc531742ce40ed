//! Versioned record schema and snapshot migrations.
//!
//! The schema describes the version of every record type the store
//! understands. A serialized [`SchemaDescriptor`] travels with the shared
//! document so peers can detect divergence and upgrade old snapshots
//! before loading them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Current descriptor format. Bumped only if the descriptor layout itself
/// changes shape.
pub const SCHEMA_FORMAT: u32 = 1;

/// Serialized description of the record type system: one version number
/// per record type. This is the body of the shared meta record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub format: u32,
    pub versions: BTreeMap<String, u32>,
}

/// A single record-payload transform, applied to the JSON form of every
/// record of `record_type` persisted before `to_version`.
#[derive(Debug)]
pub struct Migration {
    pub record_type: &'static str,
    pub to_version: u32,
    pub name: &'static str,
    pub apply: fn(&mut serde_json::Value) -> Result<(), String>,
}

/// Schema comparison and migration errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchemaError {
    /// The persisted descriptor uses a format this build does not know.
    UnsupportedFormat { found: u32, supported: u32 },
    /// The persisted data was written by a newer schema than this build.
    FromNewerVersion {
        record_type: String,
        found: u32,
        supported: u32,
    },
    /// The persisted data contains a record type this build does not know.
    UnknownType(String),
    /// A persisted record is not a well-formed keyed entry.
    MalformedRecord(String),
    /// A migration transform reported an error.
    MigrationFailed { migration: String, reason: String },
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedFormat { found, supported } => {
                write!(f, "unsupported schema format {found} (supported: {supported})")
            }
            Self::FromNewerVersion {
                record_type,
                found,
                supported,
            } => write!(
                f,
                "record type '{record_type}' is at version {found}, newer than supported {supported}"
            ),
            Self::UnknownType(ty) => write!(f, "unknown record type '{ty}'"),
            Self::MalformedRecord(detail) => write!(f, "malformed record: {detail}"),
            Self::MigrationFailed { migration, reason } => {
                write!(f, "migration '{migration}' failed: {reason}")
            }
        }
    }
}

impl std::error::Error for SchemaError {}

/// The store's record type system: current versions plus the registry of
/// payload migrations that upgrade older snapshots.
pub struct StoreSchema {
    format: u32,
    versions: BTreeMap<String, u32>,
    migrations: Vec<Migration>,
}

impl StoreSchema {
    /// The schema this build of the store ships with.
    pub fn current() -> Self {
        let mut versions = BTreeMap::new();
        versions.insert("shape".to_string(), 2);
        versions.insert("page".to_string(), 1);
        versions.insert("instance".to_string(), 1);
        versions.insert("presence".to_string(), 1);

        Self {
            format: SCHEMA_FORMAT,
            versions,
            migrations: vec![Migration {
                record_type: "shape",
                to_version: 2,
                name: "shape_add_rotation",
                apply: |value| {
                    let obj = value
                        .as_object_mut()
                        .ok_or_else(|| "shape record is not an object".to_string())?;
                    obj.entry("rotation").or_insert(serde_json::json!(0.0));
                    Ok(())
                },
            }],
        }
    }

    /// Build an explicit schema. Used by tests to simulate older or newer
    /// peers.
    pub fn with_versions(versions: BTreeMap<String, u32>, migrations: Vec<Migration>) -> Self {
        Self {
            format: SCHEMA_FORMAT,
            versions,
            migrations,
        }
    }

    /// Serialize the schema into its shareable descriptor form.
    pub fn serialize(&self) -> SchemaDescriptor {
        SchemaDescriptor {
            format: self.format,
            versions: self.versions.clone(),
        }
    }

    /// The migrations needed to bring data written under `persisted` up to
    /// this schema.
    ///
    /// Returns an error when the comparison itself is impossible: the
    /// persisted descriptor is from a newer build, an unknown format, or
    /// names a record type this build has never heard of. Callers treat
    /// that as fatal: there is no safe way to interpret such data.
    pub fn migrations_since(
        &self,
        persisted: &SchemaDescriptor,
    ) -> Result<Vec<&Migration>, SchemaError> {
        if persisted.format != self.format {
            return Err(SchemaError::UnsupportedFormat {
                found: persisted.format,
                supported: self.format,
            });
        }

        for (record_type, &persisted_version) in &persisted.versions {
            match self.versions.get(record_type) {
                None => return Err(SchemaError::UnknownType(record_type.clone())),
                Some(&current) if persisted_version > current => {
                    return Err(SchemaError::FromNewerVersion {
                        record_type: record_type.clone(),
                        found: persisted_version,
                        supported: current,
                    });
                }
                Some(_) => {}
            }
        }

        let mut pending: Vec<&Migration> = self
            .migrations
            .iter()
            .filter(|m| {
                // Types absent from the persisted descriptor predate the
                // type's first migration: everything applies.
                let persisted_version = persisted.versions.get(m.record_type).copied().unwrap_or(0);
                persisted_version < m.to_version
            })
            .collect();
        pending.sort_by_key(|m| (m.record_type, m.to_version));
        Ok(pending)
    }

    /// Run every pending migration over a snapshot of raw record values,
    /// returning the upgraded snapshot keyed by record id.
    pub fn migrate_snapshot(
        &self,
        persisted: &SchemaDescriptor,
        values: Vec<serde_json::Value>,
    ) -> Result<BTreeMap<String, serde_json::Value>, SchemaError> {
        let pending = self.migrations_since(persisted)?;
        let mut snapshot = BTreeMap::new();

        for mut value in values {
            let record_type = value
                .get("type")
                .and_then(|t| t.as_str())
                .ok_or_else(|| SchemaError::MalformedRecord("missing 'type' field".into()))?
                .to_string();
            if !self.versions.contains_key(&record_type) {
                return Err(SchemaError::UnknownType(record_type));
            }

            for migration in pending.iter().filter(|m| m.record_type == record_type) {
                (migration.apply)(&mut value).map_err(|reason| SchemaError::MigrationFailed {
                    migration: migration.name.to_string(),
                    reason,
                })?;
            }

            let id = value
                .get("id")
                .and_then(|i| i.as_str())
                .ok_or_else(|| SchemaError::MalformedRecord("missing 'id' field".into()))?
                .to_string();
            snapshot.insert(id, value);
        }

        Ok(snapshot)
    }
}

impl Default for StoreSchema {
    fn default() -> Self {
        Self::current()
    }
}
