//! PE images.
//!
//! Windows resolves DLLs from the executable's directory, so nothing is
//! rewritten. Imports are read so the verifier can flag any that were recorded
//! by absolute path.

use object::Object;
use std::path::Path;
use tracing::warn;

use super::{Binary, BinaryFormat, Placement, Relocatable, Rewrite};
use crate::error::{Error, Result};

pub struct PeFormat;

/// Whether an import names a DLL by absolute path rather than by file name.
pub fn is_absolute_import(name: &str) -> bool {
    let bytes = name.as_bytes();
    name.starts_with('/')
        || name.starts_with('\\')
        || (bytes.len() > 2 && bytes[1] == b':' && (bytes[2] == b'\\' || bytes[2] == b'/'))
}

impl Relocatable for PeFormat {
    fn inspect(&self, path: &Path, data: &[u8]) -> Result<Binary> {
        let unsupported = |e: object::read::Error| Error::UnsupportedFormat {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };
        let file = object::File::parse(data).map_err(unsupported)?;
        let mut dependencies: Vec<String> = Vec::new();
        for import in file.imports().map_err(unsupported)? {
            let library = String::from_utf8_lossy(import.library()).into_owned();
            if !dependencies.contains(&library) {
                dependencies.push(library);
            }
        }
        Ok(Binary {
            path: path.to_path_buf(),
            format: BinaryFormat::Pe,
            search_paths: Vec::new(),
            dependencies,
        })
    }

    fn relocate(
        &self,
        binary: &Binary,
        _data: &[u8],
        _placement: &Placement,
    ) -> Result<Option<Rewrite>> {
        for dll in binary.dependencies.iter().filter(|d| is_absolute_import(d)) {
            warn!(path = %binary.path.display(), dll = %dll, "absolute DLL import");
        }
        Ok(None)
    }
}
