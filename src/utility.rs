use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::Result;

/// Collect every file under `dir` with the given extension, sorted so that
/// sharded weight files load in a stable order.
pub fn find_files_with_extension<P: AsRef<Path>>(dir: P, ext: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|e| crate::error::Error::Norm {
            message: e.to_string(),
        })?;
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(ext) {
            files.push(path.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.safetensors"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.safetensors"), b"x").unwrap();
        std::fs::write(dir.path().join("note.txt"), b"x").unwrap();

        let found = find_files_with_extension(dir.path(), "safetensors").unwrap();
        assert_eq!(found.len(), 2);
    }
}
