use preserve_common::{DirListing, FileEntry, FileMetadata, Vfs, VfsError};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

#[derive(Debug, Clone)]
struct MemoryFile {
    content: Vec<u8>,
    modified: Option<SystemTime>,
    hidden: bool,
    unreadable: bool,
}

/// In-memory filesystem, for walking synthetic trees
///
/// Files can be marked unreadable to simulate permission failures and
/// removed between listing and reading to simulate vanished files.
pub struct MemoryVfs {
    instance_id: String,
    files: RwLock<BTreeMap<PathBuf, MemoryFile>>,
}

impl MemoryVfs {
    pub fn new(name: &str) -> Self {
        Self {
            instance_id: format!("memory:{}", name),
            files: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn add_file(&self, path: &str, content: &[u8], modified: Option<SystemTime>) {
        self.insert(path, content, modified, false, false);
    }

    pub fn add_hidden_file(&self, path: &str, content: &[u8]) {
        self.insert(path, content, None, true, false);
    }

    pub fn add_unreadable_file(&self, path: &str, content: &[u8]) {
        self.insert(path, content, None, false, true);
    }

    pub fn remove_file(&self, path: &str) {
        if let Ok(mut files) = self.files.write() {
            files.remove(Path::new(path));
        }
    }

    fn insert(&self, path: &str, content: &[u8], modified: Option<SystemTime>, hidden: bool, unreadable: bool) {
        if let Ok(mut files) = self.files.write() {
            files.insert(
                PathBuf::from(path),
                MemoryFile {
                    content: content.to_vec(),
                    modified,
                    hidden,
                    unreadable,
                },
            );
        }
    }

    fn is_dir(files: &BTreeMap<PathBuf, MemoryFile>, path: &Path) -> bool {
        path.as_os_str().is_empty() || files.keys().any(|p| p.starts_with(path) && p != path)
    }
}

impl Vfs for MemoryVfs {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn metadata(&self, path: &Path) -> Result<FileMetadata, VfsError> {
        let files = self.files.read().map_err(|_| VfsError::NotFound(path.display().to_string()))?;
        if let Some(file) = files.get(path) {
            return Ok(FileMetadata {
                size: file.content.len() as u64,
                modified: file.modified,
                is_dir: false,
                is_symlink: false,
                is_hidden: file.hidden,
            });
        }
        if Self::is_dir(&files, path) {
            return Ok(FileMetadata {
                size: 0,
                modified: None,
                is_dir: true,
                is_symlink: false,
                is_hidden: false,
            });
        }
        Err(VfsError::NotFound(path.display().to_string()))
    }

    fn read_dir(&self, path: &Path) -> Result<DirListing, VfsError> {
        let files = self.files.read().map_err(|_| VfsError::NotFound(path.display().to_string()))?;
        if !Self::is_dir(&files, path) {
            return Err(VfsError::NotADirectory(path.display().to_string()));
        }

        let mut children = BTreeSet::new();
        for file_path in files.keys() {
            if let Ok(rest) = file_path.strip_prefix(path) {
                if let Some(first) = rest.components().next() {
                    children.insert(path.join(first.as_os_str()));
                }
            }
        }

        Ok(children
            .into_iter()
            .map(|child| match files.get(&child) {
                Some(file) => Ok(FileEntry {
                    path: child,
                    size: file.content.len() as u64,
                    modified: file.modified,
                    is_dir: false,
                    is_symlink: false,
                    is_hidden: file.hidden,
                }),
                None => Ok(FileEntry {
                    path: child,
                    size: 0,
                    modified: None,
                    is_dir: true,
                    is_symlink: false,
                    is_hidden: false,
                }),
            })
            .collect())
    }

    fn open_file(&self, path: &Path) -> Result<Box<dyn Read + Send>, VfsError> {
        let files = self.files.read().map_err(|_| VfsError::NotFound(path.display().to_string()))?;
        match files.get(path) {
            Some(file) if file.unreadable => Err(VfsError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("permission denied: {}", path.display()),
            ))),
            Some(file) => Ok(Box::new(Cursor::new(file.content.clone()))),
            None => Err(VfsError::NotFound(path.display().to_string())),
        }
    }
}
