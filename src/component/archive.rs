//! Plugin archives.
//!
//! A plugin upload is a tar holding a wagon (`*.wgn`) and its plugin yaml.
//! A wagon is itself a tar whose top directory carries a `package.json`
//! with the package name and version.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{ClientError, Result};

/// Name of the plugin yaml inside an upload archive.
pub const PLUGIN_YAML_NAME: &str = "plugin.yaml";

const WAGON_EXTENSION: &str = "wgn";
const PACKAGE_METADATA: &str = "package.json";

/// Package metadata carried by a wagon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WagonInfo {
    /// Package name.
    pub package_name: String,
    /// Package version.
    pub package_version: String,
}

/// Files extracted from an upload archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginPackage {
    /// Extracted wagon.
    pub wagon: PathBuf,
    /// Extracted plugin yaml.
    pub plugin_yaml: PathBuf,
}

fn invalid(message: impl Into<String>) -> crate::error::ManagerError {
    ClientError::BadRequest {
        message: message.into(),
    }
    .into()
}

/// Packs a wagon and its plugin yaml into an upload archive at `dest`.
///
/// # Errors
///
/// Returns an error if a file cannot be read or the archive written.
pub fn pack_plugin(wagon: &Path, plugin_yaml: &Path, dest: &Path) -> Result<()> {
    let wagon_name = wagon
        .file_name()
        .ok_or_else(|| invalid(format!("wagon path {} has no file name", wagon.display())))?;

    let mut builder = tar::Builder::new(File::create(dest)?);
    builder.append_path_with_name(wagon, wagon_name)?;
    builder.append_path_with_name(plugin_yaml, PLUGIN_YAML_NAME)?;
    builder.into_inner()?.sync_all()?;
    Ok(())
}

/// Extracts an upload archive into `dir`.
///
/// # Errors
///
/// Returns `BadRequest` if the archive is unreadable or lacks the wagon or
/// the plugin yaml.
pub fn unpack_plugin(archive: &Path, dir: &Path) -> Result<PluginPackage> {
    let mut reader = tar::Archive::new(File::open(archive)?);
    let mut wagon = None;
    let mut plugin_yaml = None;

    let entries = reader
        .entries()
        .map_err(|e| invalid(format!("unreadable plugin archive: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| invalid(format!("unreadable plugin archive: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| invalid(format!("bad entry name: {e}")))?
            .into_owned();
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };

        let slot = if path.extension().is_some_and(|ext| ext == WAGON_EXTENSION) {
            &mut wagon
        } else if name == PLUGIN_YAML_NAME {
            &mut plugin_yaml
        } else {
            continue;
        };

        let target = dir.join(&name);
        entry
            .unpack(&target)
            .map_err(|e| invalid(format!("cannot extract {name}: {e}")))?;
        *slot = Some(target);
    }

    match (wagon, plugin_yaml) {
        (Some(wagon), Some(plugin_yaml)) => Ok(PluginPackage { wagon, plugin_yaml }),
        (None, _) => Err(invalid("plugin archive holds no wagon")),
        (_, None) => Err(invalid(format!("plugin archive holds no {PLUGIN_YAML_NAME}"))),
    }
}

/// Reads the package metadata of a wagon.
///
/// # Errors
///
/// Returns `BadRequest` if the wagon is not a tar or lacks valid metadata.
pub fn inspect_wagon(wagon: &Path) -> Result<WagonInfo> {
    let mut reader = tar::Archive::new(File::open(wagon)?);
    let entries = reader
        .entries()
        .map_err(|e| invalid(format!("corrupt wagon {}: {e}", wagon.display())))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| invalid(format!("corrupt wagon {}: {e}", wagon.display())))?;
        let is_metadata = entry
            .path()
            .map(|p| p.file_name().is_some_and(|n| n == PACKAGE_METADATA))
            .unwrap_or(false);
        if !is_metadata {
            continue;
        }

        let mut content = String::new();
        entry
            .read_to_string(&mut content)
            .map_err(|e| invalid(format!("corrupt wagon {}: {e}", wagon.display())))?;
        let info: WagonInfo = serde_json::from_str(&content)
            .map_err(|e| invalid(format!("invalid wagon metadata: {e}")))?;
        if info.package_name.is_empty() {
            return Err(invalid("wagon metadata has an empty package_name"));
        }
        return Ok(info);
    }

    Err(invalid(format!(
        "wagon {} has no {PACKAGE_METADATA}",
        wagon.display()
    )))
}

/// Writes a minimal wagon for `package_name` at `dest`.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn build_wagon(dest: &Path, package_name: &str, package_version: &str) -> Result<()> {
    let info = WagonInfo {
        package_name: package_name.to_string(),
        package_version: package_version.to_string(),
    };
    let metadata = serde_json::to_vec_pretty(&info)
        .map_err(|e| crate::error::StateError::serialization(e.to_string()))?;

    let mut header = tar::Header::new_gnu();
    header.set_size(metadata.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();

    let mut builder = tar::Builder::new(File::create(dest)?);
    builder.append_data(
        &mut header,
        format!("{package_name}-{package_version}/{PACKAGE_METADATA}"),
        metadata.as_slice(),
    )?;
    builder.into_inner()?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_and_unpack() {
        let dir = tempfile::tempdir().unwrap();
        let wagon = dir.path().join("base.wgn");
        let yaml = dir.path().join("base.yaml");
        build_wagon(&wagon, "base-plugin", "1.2.0").unwrap();
        std::fs::write(&yaml, "plugins: {base: {}}").unwrap();

        let archive = dir.path().join("upload.tar");
        pack_plugin(&wagon, &yaml, &archive).unwrap();

        let out = tempfile::tempdir().unwrap();
        let package = unpack_plugin(&archive, out.path()).unwrap();
        assert_eq!(package.wagon.file_name().unwrap(), "base.wgn");
        assert_eq!(
            std::fs::read_to_string(&package.plugin_yaml).unwrap(),
            "plugins: {base: {}}"
        );

        let info = inspect_wagon(&package.wagon).unwrap();
        assert_eq!(info.package_name, "base-plugin");
        assert_eq!(info.package_version, "1.2.0");
    }

    #[test]
    fn test_corrupt_wagon() {
        let dir = tempfile::tempdir().unwrap();
        let wagon = dir.path().join("bad.wgn");
        std::fs::write(&wagon, b"definitely not a tar archive").unwrap();
        assert!(inspect_wagon(&wagon).is_err());
    }

    #[test]
    fn test_archive_without_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let wagon = dir.path().join("base.wgn");
        build_wagon(&wagon, "base", "1.0").unwrap();

        let archive = dir.path().join("upload.tar");
        let mut builder = tar::Builder::new(File::create(&archive).unwrap());
        builder.append_path_with_name(&wagon, "base.wgn").unwrap();
        builder.finish().unwrap();
        drop(builder);

        let out = tempfile::tempdir().unwrap();
        let err = unpack_plugin(&archive, out.path()).unwrap_err();
        assert!(err.to_string().contains("plugin.yaml"));
    }
}
