mod disk;
#[cfg(test)]
pub mod memory;

pub use disk::DiskStore;

use crate::error::StoreError;
use std::path::Path;

/// Minimal filesystem surface the pipeline state lives on.
///
/// Every call goes to the backing store; nothing is cached, so a file dropped
/// or moved by hand is visible on the next query.
pub trait FileStore: Send + Sync {
    /// Names of the regular files directly inside `dir`, sorted.
    /// Fails with [`StoreError::DirectoryMissing`] when `dir` does not exist.
    fn list(&self, dir: &Path) -> Result<Vec<String>, StoreError>;

    fn exists(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    fn read(&self, path: &Path) -> Result<Vec<u8>, StoreError>;

    fn read_to_string(&self, path: &Path) -> Result<String, StoreError> {
        let bytes = self.read(path)?;
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    /// Replace `path` with `contents`, creating parent directories
    fn write(&self, path: &Path, contents: &[u8]) -> Result<(), StoreError>;

    /// Move a file, creating the destination's parent directory
    fn rename(&self, from: &Path, to: &Path) -> Result<(), StoreError>;

    fn remove(&self, path: &Path) -> Result<(), StoreError>;

    fn create_dir_all(&self, path: &Path) -> Result<(), StoreError>;
}
