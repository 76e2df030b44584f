use preserve_common::{DirListing, FileEntry, FileMetadata, Vfs, VfsError};
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

/// Local filesystem VFS implementation
pub struct LocalVfs {
    instance_id: String,
    root: PathBuf,
}

impl LocalVfs {
    pub fn new(root: PathBuf) -> Self {
        let instance_id = format!("local:{}", root.display());
        Self { instance_id, root }
    }
}

#[cfg(windows)]
fn hidden_attribute(meta: &fs::Metadata) -> bool {
    use std::os::windows::fs::MetadataExt;
    const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
    meta.file_attributes() & FILE_ATTRIBUTE_HIDDEN != 0
}

#[cfg(not(windows))]
fn hidden_attribute(_meta: &fs::Metadata) -> bool {
    false
}

fn io_error(path: &Path, err: std::io::Error) -> VfsError {
    if err.kind() == ErrorKind::NotFound {
        VfsError::NotFound(path.display().to_string())
    } else {
        VfsError::Io(err)
    }
}

impl Vfs for LocalVfs {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn metadata(&self, path: &Path) -> Result<FileMetadata, VfsError> {
        let full_path = self.root.join(path);
        let meta = fs::metadata(&full_path).map_err(|e| io_error(&full_path, e))?;
        let is_symlink = fs::symlink_metadata(&full_path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);

        Ok(FileMetadata {
            size: meta.len(),
            modified: meta.modified().ok(),
            is_dir: meta.is_dir(),
            is_symlink,
            is_hidden: hidden_attribute(&meta),
        })
    }

    fn read_dir(&self, path: &Path) -> Result<DirListing, VfsError> {
        let full_path = self.root.join(path);

        if !full_path.is_dir() {
            return Err(VfsError::NotADirectory(full_path.display().to_string()));
        }

        let entries = fs::read_dir(&full_path)
            .map_err(|e| io_error(&full_path, e))?
            .map(|entry| -> Result<FileEntry, VfsError> {
                let entry = entry?;
                let rel_path = path.join(entry.file_name());
                let meta = fs::symlink_metadata(entry.path())
                    .map_err(|e| io_error(&entry.path(), e))?;

                Ok(FileEntry {
                    path: rel_path,
                    size: meta.len(),
                    modified: meta.modified().ok(),
                    is_dir: meta.is_dir(),
                    is_symlink: meta.file_type().is_symlink(),
                    is_hidden: hidden_attribute(&meta),
                })
            })
            .collect();

        Ok(entries)
    }

    fn open_file(&self, path: &Path) -> Result<Box<dyn Read + Send>, VfsError> {
        let full_path = self.root.join(path);

        if !full_path.is_file() {
            return Err(VfsError::NotAFile(full_path.display().to_string()));
        }

        let file = fs::File::open(&full_path).map_err(|e| io_error(&full_path, e))?;
        Ok(Box::new(file))
    }

    fn canonicalize(&self, path: &Path) -> Option<PathBuf> {
        fs::canonicalize(self.root.join(path)).ok()
    }
}
