use crate::{FileEntry, FileMetadata, VfsError};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Result of listing one directory: the listing itself can fail, and so can
/// each entry in it.
pub type DirListing = Vec<Result<FileEntry, VfsError>>;

/// Virtual File System trait for abstracting filesystem traversal
///
/// The inventory builder only ever reads through this trait, so a live
/// directory, a mounted share or an in-memory fixture can all be walked
/// the same way. Paths are relative to the VFS root.
pub trait Vfs: Send + Sync {
    /// Uniquely identifies the VFS instance (e.g., "local:/srv/data")
    fn instance_id(&self) -> &str;

    /// Returns the metadata for a specific path, following symbolic links
    fn metadata(&self, path: &Path) -> Result<FileMetadata, VfsError>;

    /// Lists the contents of a directory without following symbolic links
    fn read_dir(&self, path: &Path) -> Result<DirListing, VfsError>;

    /// Opens a file for reading (returns a Read trait object)
    fn open_file(&self, path: &Path) -> Result<Box<dyn Read + Send>, VfsError>;

    /// Stable identity for a directory, used to detect symlink cycles
    fn canonicalize(&self, _path: &Path) -> Option<PathBuf> {
        None
    }

    /// Checks if a path exists
    fn exists(&self, path: &Path) -> bool {
        self.metadata(path).is_ok()
    }
}
