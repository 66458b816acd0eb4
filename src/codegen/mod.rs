//! codegen
//! Output generation. Every form is rendered in memory first; files are then
//! written through temporary files in the output directory and renamed into
//! place, so a failed pass leaves no partial output behind.

pub mod c;
pub mod expr;
pub mod info;
pub mod matlab;
pub mod plan;
pub mod tape;

pub use plan::{EmissionPlan, Operand, Output, Routine, Target};
pub use tape::{Compiler, OpCode, Tape, TapeRoutine};

use crate::error::{ModelError, Result};
use log::info;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFile {
    pub path: PathBuf,
    pub contents: Vec<u8>,
}

impl GeneratedFile {
    pub fn new(path: PathBuf, contents: impl Into<Vec<u8>>) -> Self { Self { path, contents: contents.into() } }
}

/// Writes `files` into `directory`, creating it when missing.
pub fn write_files(directory: &Path, files: &[GeneratedFile]) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(directory).map_err(|e| ModelError::io(directory, e))?;

    // 1. Stage every file next to its destination
    let mut staged = Vec::with_capacity(files.len());
    for file in files {
        let mut temp = NamedTempFile::new_in(directory).map_err(|e| ModelError::io(directory, e))?;
        temp.write_all(&file.contents).map_err(|e| ModelError::io(temp.path(), e))?;
        temp.flush().map_err(|e| ModelError::io(temp.path(), e))?;
        staged.push((temp, &file.path));
    }

    // 2. Rename into place
    let mut written = Vec::with_capacity(files.len());
    for (temp, path) in staged {
        temp.persist(path).map_err(|e| ModelError::io(path, e.error))?;
        info!("Wrote {}", path.display());
        written.push(path.clone());
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_files_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested");
        let files = vec![
            GeneratedFile::new(out.join("a.m"), "x = 1;\n"),
            GeneratedFile::new(out.join("b.bin"), vec![1u8, 2, 3]),
        ];
        let written = write_files(&out, &files).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(std::fs::read_to_string(out.join("a.m")).unwrap(), "x = 1;\n");
        assert_eq!(std::fs::read(out.join("b.bin")).unwrap(), vec![1, 2, 3]);
        // Only the two files remain; staged temporaries were renamed
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 2);
    }
}
