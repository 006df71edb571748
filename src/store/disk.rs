use super::FileStore;
use crate::error::StoreError;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// [`FileStore`] backed by the real filesystem
#[derive(Debug, Clone, Default)]
pub struct DiskStore;

impl DiskStore {
    pub fn new() -> Self {
        Self
    }
}

fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| StoreError::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
    }
    Ok(())
}

impl FileStore for DiskStore {
    fn list(&self, dir: &Path) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::DirectoryMissing(dir.to_path_buf()))
            }
            Err(e) => {
                return Err(StoreError::List {
                    path: dir.to_path_buf(),
                    source: e,
                })
            }
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::List {
                path: dir.to_path_buf(),
                source: e,
            })?;
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, StoreError> {
        fs::read(path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                StoreError::NotFound(path.to_path_buf())
            } else {
                StoreError::Read {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })
    }

    /// Write to a temp file, then rename over the target
    fn write(&self, path: &Path, contents: &[u8]) -> Result<(), StoreError> {
        ensure_parent(path)?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let temp_path = path.with_file_name(format!(".{}.tmp", file_name));

        fs::write(&temp_path, contents).map_err(|e| StoreError::Write {
            path: temp_path.clone(),
            source: e,
        })?;

        fs::rename(&temp_path, path).map_err(|e| StoreError::Write {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Rename first; fall back to copy + delete for cross-device moves
    fn rename(&self, from: &Path, to: &Path) -> Result<(), StoreError> {
        ensure_parent(to)?;

        if fs::rename(from, to).is_ok() {
            return Ok(());
        }

        fs::copy(from, to).map_err(|e| StoreError::Move {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source: e,
        })?;
        fs::remove_file(from).map_err(|e| StoreError::Move {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source: e,
        })
    }

    fn remove(&self, path: &Path) -> Result<(), StoreError> {
        fs::remove_file(path).map_err(|e| StoreError::Remove {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), StoreError> {
        fs::create_dir_all(path).map_err(|e| StoreError::CreateDirectory {
            path: path.to_path_buf(),
            source: e,
        })
    }
}
