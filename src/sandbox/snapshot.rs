//! Immutable in-memory copies of a source tree.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Error, Result};

/// An immutable copy of a directory tree, keyed by relative path.
///
/// Only regular files are captured, with their executable bit. Directories
/// exist implicitly through the paths of the files they contain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    files: BTreeMap<PathBuf, Vec<u8>>,
    executable: BTreeSet<PathBuf>,
}

impl Snapshot {
    /// Creates an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a snapshot from `(relative path, contents)` pairs.
    pub fn from_files<I, P, C>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<PathBuf>,
        C: Into<Vec<u8>>,
    {
        Self {
            files: files
                .into_iter()
                .map(|(path, contents)| (path.into(), contents.into()))
                .collect(),
            executable: BTreeSet::new(),
        }
    }

    /// Reads every regular file under `root`, skipping directories whose
    /// name appears in `exclude`.
    pub fn load(root: &Path, exclude: &[String]) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::NotFound(root.to_path_buf()));
        }

        let mut files = BTreeMap::new();
        let mut executable = BTreeSet::new();
        let walker = WalkDir::new(root).follow_links(false).into_iter();
        for entry in walker.filter_entry(|e| e.depth() == 0 || !is_excluded(e, exclude)) {
            let entry = entry.map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|_| Error::PathEscape(entry.path().display().to_string()))?
                .to_path_buf();
            let metadata = entry
                .metadata()
                .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
            if has_exec_bit(&metadata) {
                executable.insert(relative.clone());
            }
            let contents = std::fs::read(entry.path())?;
            files.insert(relative, contents);
        }

        tracing::debug!(
            root = ?root,
            files = files.len(),
            executable = executable.len(),
            "loaded snapshot"
        );
        Ok(Self { files, executable })
    }

    /// Writes every file into `dest`, creating parent directories and
    /// restoring executable bits.
    pub fn materialize(&self, dest: &Path) -> Result<()> {
        for (path, contents) in &self.files {
            let target = dest.join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, contents)?;
            set_executable(&target, self.executable.contains(path))?;
        }
        Ok(())
    }

    /// Returns the contents of a file.
    pub fn get(&self, path: &Path) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    /// Returns true if the file at `path` is executable.
    pub fn is_executable(&self, path: &Path) -> bool {
        self.executable.contains(path)
    }

    /// Returns true if a file exists at `path`.
    pub fn contains(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    /// Returns all files in path order.
    pub fn files(&self) -> &BTreeMap<PathBuf, Vec<u8>> {
        &self.files
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if the snapshot holds no files.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Inserts or replaces a file, returning the updated snapshot.
    pub fn with_file(mut self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.into(), contents.into());
        self
    }

    /// Sets or clears the executable bit of a file, returning the updated
    /// snapshot. Paths with no file are ignored.
    pub fn with_executable(mut self, path: impl Into<PathBuf>, executable: bool) -> Self {
        let path = path.into();
        if executable && self.files.contains_key(&path) {
            self.executable.insert(path);
        } else {
            self.executable.remove(&path);
        }
        self
    }

    /// Removes a file, returning the updated snapshot.
    pub fn without_file(mut self, path: &Path) -> Self {
        self.files.remove(path);
        self.executable.remove(path);
        self
    }
}

fn is_excluded(entry: &walkdir::DirEntry, exclude: &[String]) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|name| exclude.iter().any(|e| e == name))
            .unwrap_or(false)
}

#[cfg(unix)]
fn has_exec_bit(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn has_exec_bit(_metadata: &std::fs::Metadata) -> bool {
    false
}

/// Adds or strips the execute bits of `path`, mirroring its read bits the
/// way `chmod +x` does.
#[cfg(unix)]
pub(crate) fn set_executable(path: &Path, executable: bool) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut permissions = std::fs::metadata(path)?.permissions();
    let mode = permissions.mode();
    let mode = if executable {
        mode | ((mode & 0o444) >> 2)
    } else {
        mode & !0o111
    };
    permissions.set_mode(mode);
    std::fs::set_permissions(path, permissions)
}

#[cfg(not(unix))]
pub(crate) fn set_executable(_path: &Path, _executable: bool) -> std::io::Result<()> {
    Ok(())
}

/// Normalizes a caller-supplied path to a path relative to `workdir`.
///
/// Absolute paths must live under `workdir`. `..` may not climb above the
/// working directory. The empty path denotes the working directory itself.
pub fn normalize_path(workdir: &Path, raw: &str) -> Result<PathBuf> {
    let raw_path = Path::new(raw.trim());
    let relative = if raw_path.is_absolute() {
        raw_path
            .strip_prefix(workdir)
            .map_err(|_| Error::PathEscape(raw.to_string()))?
    } else {
        raw_path
    };

    let mut normalized = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(Error::PathEscape(raw.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathEscape(raw.to_string()));
            }
        }
    }
    Ok(normalized)
}
