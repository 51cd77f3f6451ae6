//! CLI command implementations.

pub mod dump_log;
pub mod export;
pub mod gc;
pub mod inspect;
pub mod verify;

use crate::types_file;
use graphstore_core::{read_manifest, Config, Database, DirectoryFileProvider, Manifest};
use std::path::Path;

/// Reads the manifest of the database at `path` without opening it.
pub(crate) fn manifest_at(path: &Path) -> Result<Manifest, Box<dyn std::error::Error>> {
    read_manifest(path)?.ok_or_else(|| format!("No database found at {}", path.display()).into())
}

/// Read-only access to the files below `path`.
pub(crate) fn provider_at(path: &Path) -> DirectoryFileProvider {
    DirectoryFileProvider::new(path)
}

/// Opens an existing database with the descriptors from `types`.
pub(crate) fn open_database(path: &Path, types: &Path) -> Result<Database, Box<dyn std::error::Error>> {
    let manifest = manifest_at(path)?;
    let loaded = types_file::load(types)?;
    let mut config = Config::new()
        .create_if_missing(false)
        .channel_count(manifest.channel_count)
        .byte_order(manifest.byte_order)
        .types(loaded.types);
    if let Some(root) = loaded.root {
        config = config.root_type(root);
    }
    Ok(Database::open_with_config(path, config)?)
}
