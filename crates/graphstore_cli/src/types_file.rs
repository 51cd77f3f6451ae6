//! Type descriptor files.
//!
//! ```json
//! {
//!   "root": 1,
//!   "types": [
//!     { "id": 1, "name": "Root", "references": { "fixed": [0] } },
//!     { "id": 2, "name": "Node", "references": { "variable": 8 } },
//!     { "id": 3, "name": "Blob" }
//!   ]
//! }
//! ```

use graphstore_core::{TypeDescriptor, TypeDictionary, TypeId};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Errors reading a type descriptor file.
#[derive(Debug, Error)]
pub enum TypesFileError {
    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// The file.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid JSON of the expected shape.
    #[error("invalid type descriptor file {path}: {source}")]
    Parse {
        /// The file.
        path: String,
        /// Underlying error.
        source: serde_json::Error,
    },
    /// A type id is listed twice.
    #[error("type {0} is described twice")]
    Duplicate(u64),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TypesFile {
    #[serde(default)]
    root: Option<u64>,
    types: Vec<TypeEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TypeEntry {
    id: u64,
    name: String,
    #[serde(default)]
    references: Option<References>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum References {
    Fixed(Vec<usize>),
    Variable(usize),
}

/// Descriptors and root type read from a file.
#[derive(Debug)]
pub struct LoadedTypes {
    /// All described types.
    pub types: TypeDictionary,
    /// The root type, if the file names one.
    pub root: Option<TypeId>,
}

/// Reads a type descriptor file.
pub fn load(path: &Path) -> Result<LoadedTypes, TypesFileError> {
    let display = path.display().to_string();
    let text = fs::read_to_string(path).map_err(|source| TypesFileError::Read {
        path: display.clone(),
        source,
    })?;
    parse(&text).map_err(|err| match err {
        ParseFailure::Json(source) => TypesFileError::Parse {
            path: display,
            source,
        },
        ParseFailure::Duplicate(id) => TypesFileError::Duplicate(id),
    })
}

#[derive(Debug)]
enum ParseFailure {
    Json(serde_json::Error),
    Duplicate(u64),
}

fn parse(text: &str) -> Result<LoadedTypes, ParseFailure> {
    let file: TypesFile = serde_json::from_str(text).map_err(ParseFailure::Json)?;
    let mut types = TypeDictionary::new();
    for entry in file.types {
        let type_id = TypeId(entry.id);
        if types.get(type_id).is_some() {
            return Err(ParseFailure::Duplicate(entry.id));
        }
        let descriptor = match entry.references {
            None => TypeDescriptor::leaf(type_id, entry.name),
            Some(References::Fixed(offsets)) => TypeDescriptor::fixed(type_id, entry.name, offsets),
            Some(References::Variable(offset)) => {
                TypeDescriptor::variable(type_id, entry.name, offset)
            }
        };
        types.register(descriptor);
    }
    Ok(LoadedTypes {
        types,
        root: file.root.map(TypeId),
    })
}
