//! File storage collaborator
//!
//! The HTTP handler serves and receives files through [`Storage`]. Paths are
//! absolute-style (`/index.html`); implementations map them onto their own
//! namespace and refuse anything that would escape it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Readable file handle plus its length
pub struct StoredFile {
    pub reader: Box<dyn Read + Send>,
    pub len: u64,
}

/// Flat file storage used for web assets, uploads and settings
pub trait Storage: Send {
    /// Whether a file exists at `path`
    fn exists(&self, path: &str) -> bool;

    /// Open `path` for reading
    fn open(&self, path: &str) -> io::Result<StoredFile>;

    /// Create or truncate `path` for writing
    fn create(&self, path: &str) -> io::Result<Box<dyn Write + Send>>;

    /// Delete `path`
    fn remove(&self, path: &str) -> io::Result<()>;

    /// Read a whole file
    fn read_all(&self, path: &str) -> io::Result<Vec<u8>> {
        let mut file = self.open(path)?;
        let mut data = Vec::with_capacity(file.len as usize);
        file.reader.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Replace a whole file
    fn write_all(&self, path: &str, data: &[u8]) -> io::Result<()> {
        let mut file = self.create(path)?;
        file.write_all(data)?;
        file.flush()
    }
}

/// Storage rooted at a directory on the local file system
pub struct DirStorage {
    root: PathBuf,
}

impl DirStorage {
    /// Use `root` as the storage root, creating it if needed
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Storage root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("path escapes storage root: {}", path),
                    ))
                }
            }
        }
        if resolved == self.root {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty path"));
        }
        Ok(resolved)
    }
}

impl Storage for DirStorage {
    fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.is_file()).unwrap_or(false)
    }

    fn open(&self, path: &str) -> io::Result<StoredFile> {
        let file = fs::File::open(self.resolve(path)?)?;
        let metadata = file.metadata()?;
        if metadata.is_dir() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "is a directory"));
        }
        Ok(StoredFile {
            reader: Box::new(file),
            len: metadata.len(),
        })
    }

    fn create(&self, path: &str) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(fs::File::create(self.resolve(path)?)?))
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(path)?)
    }
}

type FileMap = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// In-memory storage; clones share the same files
#[derive(Clone, Default)]
pub struct MemoryStorage {
    files: FileMap,
    capacity: Option<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that fails writes once `bytes` are stored in total
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            capacity: Some(bytes),
            ..Self::default()
        }
    }

    /// Insert or replace a file
    pub fn insert(&self, path: &str, data: impl Into<Vec<u8>>) {
        self.files.lock().insert(path.to_string(), data.into());
    }

    /// Copy of a file's contents
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    /// Number of stored files
    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn exists(&self, path: &str) -> bool {
        self.files.lock().contains_key(path)
    }

    fn open(&self, path: &str) -> io::Result<StoredFile> {
        let data = self
            .get(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))?;
        Ok(StoredFile {
            len: data.len() as u64,
            reader: Box::new(Cursor::new(data)),
        })
    }

    fn create(&self, path: &str) -> io::Result<Box<dyn Write + Send>> {
        self.files.lock().insert(path.to_string(), Vec::new());
        Ok(Box::new(MemoryFile {
            files: self.files.clone(),
            path: path.to_string(),
            capacity: self.capacity,
        }))
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        self.files
            .lock()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))
    }
}

/// Writer that appends straight into the shared map
struct MemoryFile {
    files: FileMap,
    path: String,
    capacity: Option<usize>,
}

impl Write for MemoryFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut files = self.files.lock();
        if let Some(capacity) = self.capacity {
            let used: usize = files.values().map(Vec::len).sum();
            if used + buf.len() > capacity {
                return Err(io::Error::new(io::ErrorKind::Other, "storage full"));
            }
        }
        files.entry(self.path.clone()).or_default().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
