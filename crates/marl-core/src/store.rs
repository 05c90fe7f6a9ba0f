use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::MarlError;

pub const DRV_EXTENSION: &str = ".drv";

/// Whether a file name signals a build description file.
pub fn is_derivation_path(path: &str) -> bool {
    path.ends_with(DRV_EXTENSION)
}

/// Lexically canonicalize a path: make it absolute, collapse `.`, `..` and
/// repeated separators. Does not touch the filesystem.
pub fn canon_path(path: &str) -> String {
    let mut absolute = String::new();
    if !path.starts_with('/') {
        if let Ok(cwd) = std::env::current_dir() {
            absolute.push_str(&cwd.to_string_lossy());
        }
        absolute.push('/');
    }
    absolute.push_str(path);

    let mut parts: Vec<&str> = Vec::new();
    for part in absolute.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    let mut out = String::with_capacity(absolute.len());
    for part in &parts {
        out.push('/');
        out.push_str(part);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// The content-addressed object store the evaluator copies sources into when
/// a path is coerced to a string.
pub trait Store {
    /// Insert `path` into the store, returning the store path.
    fn add_to_store(&self, path: &Path) -> Result<String, MarlError>;

    /// Compute the store path `path` would get, without inserting it.
    fn compute_store_path(&self, path: &Path) -> Result<String, MarlError>;
}

/// Filesystem store rooted at a directory; store paths are
/// `<root>/<hash>-<name>` with a SHA-256 content hash.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn store_path_for(&self, path: &Path) -> Result<String, MarlError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                MarlError::eval(format!("path `{}` has no file name", path.display()))
            })?;
        let mut hasher = Sha256::new();
        hash_path(&mut hasher, path)?;
        let digest = hasher.finalize();
        let mut hash = String::with_capacity(16);
        for byte in digest.iter().take(8) {
            hash.push_str(&format!("{:02x}", byte));
        }
        Ok(format!("{}/{}-{}", self.root.display(), hash, name))
    }
}

impl Store for LocalStore {
    fn add_to_store(&self, path: &Path) -> Result<String, MarlError> {
        let dst = self.store_path_for(path)?;
        let dst_path = PathBuf::from(&dst);
        if !dst_path.exists() {
            fs::create_dir_all(&self.root).map_err(io_error(&self.root))?;
            copy_all(path, &dst_path)?;
        }
        Ok(dst)
    }

    fn compute_store_path(&self, path: &Path) -> Result<String, MarlError> {
        self.store_path_for(path)
    }
}

fn hash_path(hasher: &mut Sha256, path: &Path) -> Result<(), MarlError> {
    let meta = fs::metadata(path).map_err(io_error(path))?;
    if meta.is_dir() {
        hasher.update(b"dir");
        let mut entries: Vec<PathBuf> = fs::read_dir(path)
            .map_err(io_error(path))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        entries.sort();
        for entry in entries {
            if let Some(name) = entry.file_name() {
                hasher.update(name.to_string_lossy().as_bytes());
            }
            hash_path(hasher, &entry)?;
        }
    } else {
        let bytes = fs::read(path).map_err(io_error(path))?;
        hasher.update(b"file");
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
    }
    Ok(())
}

fn copy_all(src: &Path, dst: &Path) -> Result<(), MarlError> {
    let meta = fs::metadata(src).map_err(io_error(src))?;
    if meta.is_dir() {
        fs::create_dir_all(dst).map_err(io_error(dst))?;
        for entry in fs::read_dir(src).map_err(io_error(src))? {
            let entry = entry.map_err(io_error(src))?;
            copy_all(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else {
        fs::copy(src, dst).map_err(io_error(src))?;
    }
    Ok(())
}

fn io_error(path: &Path) -> impl Fn(std::io::Error) -> MarlError + '_ {
    move |err| MarlError::eval(format!("cannot access `{}`: {}", path.display(), err))
}

/// Store for tests: addresses by the path text alone and records every
/// insertion instead of touching the filesystem.
pub struct MemoryStore {
    root: String,
    added: RefCell<Vec<PathBuf>>,
}

impl MemoryStore {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            added: RefCell::new(Vec::new()),
        }
    }

    pub fn added(&self) -> Vec<PathBuf> {
        self.added.borrow().clone()
    }

    fn store_path_for(&self, path: &Path) -> String {
        let text = path.to_string_lossy();
        let digest = Sha256::digest(text.as_bytes());
        let mut hash = String::with_capacity(16);
        for byte in digest.iter().take(8) {
            hash.push_str(&format!("{:02x}", byte));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "source".into());
        format!("{}/{}-{}", self.root, hash, name)
    }
}

impl Store for MemoryStore {
    fn add_to_store(&self, path: &Path) -> Result<String, MarlError> {
        self.added.borrow_mut().push(path.to_path_buf());
        Ok(self.store_path_for(path))
    }

    fn compute_store_path(&self, path: &Path) -> Result<String, MarlError> {
        Ok(self.store_path_for(path))
    }
}
