//! Snapshot archives.
//!
//! A snapshot is a tar holding:
//! - `metadata.json`: producing version, snapshot id and creation time
//! - `security.json`: the key secret values are encrypted with
//! - `tables/<name>.json`: one JSON array of raw records per table
//! - `plugins/<plugin id>.wgn`: the wagon of every plugin

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::debug;

use super::version::ManagerVersion;
use crate::error::{RestoreError, Result};

const METADATA_ENTRY: &str = "metadata.json";
const SECURITY_ENTRY: &str = "security.json";
const TABLES_DIR: &str = "tables/";
const PLUGINS_DIR: &str = "plugins/";
const WAGON_SUFFIX: &str = ".wgn";

/// Snapshot metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Version of the manager that produced the snapshot.
    pub version: ManagerVersion,
    /// Snapshot id.
    pub snapshot_id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct Security {
    #[serde(default)]
    encryption_key: Option<String>,
}

/// Contents of a snapshot archive.
#[derive(Clone, PartialEq)]
pub struct SnapshotDump {
    /// Metadata.
    pub metadata: SnapshotMetadata,
    /// Key secret values are encrypted with, for versions that encrypt.
    pub encryption_key: Option<String>,
    /// Raw records by table name.
    pub tables: BTreeMap<String, Vec<Value>>,
    /// Wagon bytes by plugin id.
    pub plugin_archives: BTreeMap<String, Vec<u8>>,
}

impl std::fmt::Debug for SnapshotDump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rows: BTreeMap<&str, usize> = self
            .tables
            .iter()
            .map(|(name, rows)| (name.as_str(), rows.len()))
            .collect();
        f.debug_struct("SnapshotDump")
            .field("metadata", &self.metadata)
            .field("tables", &rows)
            .field("plugin_archives", &self.plugin_archives.len())
            .finish_non_exhaustive()
    }
}

impl SnapshotDump {
    /// Creates an empty dump.
    #[must_use]
    pub fn new(snapshot_id: &str, version: ManagerVersion) -> Self {
        Self {
            metadata: SnapshotMetadata {
                version,
                snapshot_id: snapshot_id.to_string(),
                created_at: Utc::now(),
            },
            encryption_key: None,
            tables: BTreeMap::new(),
            plugin_archives: BTreeMap::new(),
        }
    }

    /// Producing version.
    #[must_use]
    pub const fn version(&self) -> ManagerVersion {
        self.metadata.version
    }

    /// Raw records of a table; empty if the table is absent.
    #[must_use]
    pub fn table(&self, name: &str) -> &[Value] {
        self.tables.get(name).map_or(&[], Vec::as_slice)
    }

    /// Serializes `rows` into a table.
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be serialized.
    pub fn set_table<T: Serialize>(
        &mut self,
        name: &str,
        rows: impl IntoIterator<Item = T>,
    ) -> Result<()> {
        let rows = rows
            .into_iter()
            .map(|row| serde_json::to_value(row))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| RestoreError::archive(format!("cannot serialize {name}: {e}")))?;
        self.tables.insert(name.to_string(), rows);
        Ok(())
    }

    /// Writes the dump as a tar archive at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive cannot be written.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut builder = tar::Builder::new(File::create(path)?);

        append_json(&mut builder, METADATA_ENTRY, &self.metadata)?;
        append_json(
            &mut builder,
            SECURITY_ENTRY,
            &Security {
                encryption_key: self.encryption_key.clone(),
            },
        )?;
        for (name, rows) in &self.tables {
            append_json(&mut builder, &format!("{TABLES_DIR}{name}.json"), rows)?;
        }
        for (plugin_id, wagon) in &self.plugin_archives {
            append_bytes(&mut builder, &format!("{PLUGINS_DIR}{plugin_id}{WAGON_SUFFIX}"), wagon)?;
        }

        builder.into_inner()?.sync_all()?;
        debug!("Wrote snapshot {} to {}", self.metadata.snapshot_id, path.display());
        Ok(())
    }

    /// Reads a dump from a tar archive.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArchive` if the archive is unreadable or lacks its
    /// metadata.
    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| RestoreError::archive(format!("cannot open {}: {e}", path.display())))?;
        let mut archive = tar::Archive::new(file);

        let mut metadata = None;
        let mut encryption_key = None;
        let mut tables = BTreeMap::new();
        let mut plugin_archives = BTreeMap::new();

        let entries = archive
            .entries()
            .map_err(|e| RestoreError::archive(e.to_string()))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| RestoreError::archive(e.to_string()))?;
            let name = entry
                .path()
                .map_err(|e| RestoreError::archive(e.to_string()))?
                .to_string_lossy()
                .into_owned();
            let mut content = Vec::new();
            entry
                .read_to_end(&mut content)
                .map_err(|e| RestoreError::archive(format!("cannot read {name}: {e}")))?;

            if name == METADATA_ENTRY {
                metadata = Some(parse_json::<SnapshotMetadata>(&name, &content)?);
            } else if name == SECURITY_ENTRY {
                encryption_key = parse_json::<Security>(&name, &content)?.encryption_key;
            } else if let Some(table) = name
                .strip_prefix(TABLES_DIR)
                .and_then(|n| n.strip_suffix(".json"))
            {
                tables.insert(table.to_string(), parse_json::<Vec<Value>>(&name, &content)?);
            } else if let Some(plugin_id) = name
                .strip_prefix(PLUGINS_DIR)
                .and_then(|n| n.strip_suffix(WAGON_SUFFIX))
            {
                plugin_archives.insert(plugin_id.to_string(), content);
            } else {
                debug!("Ignoring unknown snapshot entry {name}");
            }
        }

        let metadata =
            metadata.ok_or_else(|| RestoreError::archive(format!("missing {METADATA_ENTRY}")))?;
        Ok(Self {
            metadata,
            encryption_key,
            tables,
            plugin_archives,
        })
    }
}

fn parse_json<T: DeserializeOwned>(name: &str, content: &[u8]) -> Result<T> {
    serde_json::from_slice(content)
        .map_err(|e| RestoreError::archive(format!("invalid {name}: {e}")).into())
}

fn append_json<T: Serialize + ?Sized>(
    builder: &mut tar::Builder<File>,
    name: &str,
    value: &T,
) -> Result<()> {
    let content = serde_json::to_vec_pretty(value)
        .map_err(|e| RestoreError::archive(format!("cannot serialize {name}: {e}")))?;
    append_bytes(builder, name, &content)
}

fn append_bytes(builder: &mut tar::Builder<File>, name: &str, content: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(u64::try_from(Utc::now().timestamp()).unwrap_or_default());
    header.set_cksum();
    builder.append_data(&mut header, name, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.tar");

        let mut dump = SnapshotDump::new("snap", ManagerVersion::new(4, 6, 0));
        dump.encryption_key = Some(String::from("AGE-SECRET-KEY-TEST"));
        dump.set_table("tenants", [json!({"name": "default_tenant"})]).unwrap();
        dump.plugin_archives.insert(String::from("p1"), b"wagon".to_vec());
        dump.write(&path).unwrap();

        let read = SnapshotDump::read(&path).unwrap();
        assert_eq!(read.version(), ManagerVersion::new(4, 6, 0));
        assert_eq!(read.encryption_key.as_deref(), Some("AGE-SECRET-KEY-TEST"));
        assert_eq!(read.table("tenants").len(), 1);
        assert!(read.table("agents").is_empty());
        assert_eq!(read.plugin_archives["p1"], b"wagon");
    }

    #[test]
    fn test_missing_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.tar");
        let mut builder = tar::Builder::new(File::create(&path).unwrap());
        append_bytes(&mut builder, "tables/tenants.json", b"[]").unwrap();
        builder.finish().unwrap();
        drop(builder);

        let err = SnapshotDump::read(&path).unwrap_err();
        assert!(err.to_string().contains("metadata.json"));
    }

    #[test]
    fn test_not_an_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.tar");
        std::fs::write(&path, b"garbage").unwrap();
        assert!(SnapshotDump::read(&path).is_err());
    }
}
