use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;

use crate::error::{BenchError, Result};
use crate::matrix::Combination;

pub const CANONICAL_EXT: &str = "log";
pub const STAGED_SUFFIX: &str = ".tmp";

/// Idempotency key of a combination's result. Pure function of
/// (mode, scale, query); the query index plays no part.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ResultKey {
    pub mode: String,
    pub scale: u32,
    pub query: String,
}

impl ResultKey {
    pub fn for_combination(combo: &Combination) -> Self {
        Self {
            mode: combo.mode.clone(),
            scale: combo.scale,
            query: combo.query.clone(),
        }
    }

    /// `<mode>/sf_<scale>/<query>.log`
    pub fn canonical_relative(&self) -> PathBuf {
        self.dir_relative()
            .join(format!("{}.{}", self.query, CANONICAL_EXT))
    }

    /// `<mode>/sf_<scale>/<query>.log.tmp`
    pub fn staged_relative(&self) -> PathBuf {
        self.dir_relative()
            .join(format!("{}.{}{}", self.query, CANONICAL_EXT, STAGED_SUFFIX))
    }

    fn dir_relative(&self) -> PathBuf {
        Path::new(&self.mode).join(format!("sf_{}", self.scale))
    }
}

impl fmt::Display for ResultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/sf_{}/{}", self.mode, self.scale, self.query)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    Committed,
    /// Staged output left by a failed or interrupted run; will be retried.
    Staged,
    Pending,
}

impl CacheState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheState::Committed => "committed",
            CacheState::Staged => "staged",
            CacheState::Pending => "pending",
        }
    }
}

/// Backend for the skip-check / stage / commit protocol.
pub trait ResultStore {
    /// Idempotent preparation before the skip check (directory creation).
    fn prepare(&mut self, key: &ResultKey) -> Result<()>;

    /// Presence of the canonical artifact. Contents are never inspected.
    fn is_committed(&self, key: &ResultKey) -> Result<bool>;

    fn is_staged(&self, key: &ResultKey) -> Result<bool>;

    /// Opens a fresh staged artifact, discarding output of an earlier attempt.
    fn begin_stage(&mut self, key: &ResultKey) -> Result<Box<dyn Write>>;

    fn staged_contains(&self, key: &ResultKey, marker: &str) -> Result<bool>;

    /// Atomically promotes the staged artifact to canonical.
    fn commit(&mut self, key: &ResultKey) -> Result<()>;

    /// Human-readable location of the staged artifact, for diagnostics.
    fn staged_location(&self, key: &ResultKey) -> String;

    fn state(&self, key: &ResultKey) -> Result<CacheState> {
        if self.is_committed(key)? {
            Ok(CacheState::Committed)
        } else if self.is_staged(key)? {
            Ok(CacheState::Staged)
        } else {
            Ok(CacheState::Pending)
        }
    }
}

/// Result tree on the local filesystem under `log_root`.
#[derive(Debug, Clone)]
pub struct FsResultStore {
    root: PathBuf,
}

impl FsResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn canonical_path(&self, key: &ResultKey) -> PathBuf {
        self.root.join(key.canonical_relative())
    }

    pub fn staged_path(&self, key: &ResultKey) -> PathBuf {
        self.root.join(key.staged_relative())
    }
}

impl ResultStore for FsResultStore {
    fn prepare(&mut self, key: &ResultKey) -> Result<()> {
        let path = self.canonical_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| BenchError::io(parent, e))?;
        }
        Ok(())
    }

    fn is_committed(&self, key: &ResultKey) -> Result<bool> {
        exists(&self.canonical_path(key))
    }

    fn is_staged(&self, key: &ResultKey) -> Result<bool> {
        exists(&self.staged_path(key))
    }

    fn begin_stage(&mut self, key: &ResultKey) -> Result<Box<dyn Write>> {
        let path = self.staged_path(key);
        let file = fs::File::create(&path).map_err(|e| BenchError::io(&path, e))?;
        Ok(Box::new(file))
    }

    fn staged_contains(&self, key: &ResultKey, marker: &str) -> Result<bool> {
        let path = self.staged_path(key);
        let mut bytes = Vec::new();
        fs::File::open(&path)
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .map_err(|e| BenchError::io(&path, e))?;
        Ok(contains_marker(&bytes, marker))
    }

    fn commit(&mut self, key: &ResultKey) -> Result<()> {
        let staged = self.staged_path(key);
        let canonical = self.canonical_path(key);
        fs::File::open(&staged)
            .and_then(|f| f.sync_all())
            .map_err(|e| BenchError::io(&staged, e))?;
        fs::rename(&staged, &canonical).map_err(|e| BenchError::io(&canonical, e))?;
        if let Some(parent) = canonical.parent() {
            if let Ok(dir) = fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    fn staged_location(&self, key: &ResultKey) -> String {
        self.staged_path(key).display().to_string()
    }
}

fn exists(path: &Path) -> Result<bool> {
    path.try_exists().map_err(|e| BenchError::io(path, e))
}

/// Byte-level substring search; output need not be valid UTF-8.
pub fn contains_marker(haystack: &[u8], marker: &str) -> bool {
    let needle = marker.as_bytes();
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Committed logs and staged leftovers found under a log root.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TreeScan {
    pub committed: Vec<PathBuf>,
    /// Staged files with no canonical sibling: failed or interrupted runs.
    pub orphaned: Vec<PathBuf>,
}

pub fn scan_log_tree(root: &Path) -> Result<TreeScan> {
    let mut scan = TreeScan::default();
    if !root.exists() {
        return Ok(scan);
    }
    let staged_ext = format!("{}{}", CANONICAL_EXT, STAGED_SUFFIX);
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            BenchError::io(path, e.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let name = entry.file_name().to_string_lossy();
        if let Some(stem) = name.strip_suffix(&format!(".{}", staged_ext)) {
            let canonical = path.with_file_name(format!("{}.{}", stem, CANONICAL_EXT));
            if !canonical.exists() {
                scan.orphaned.push(path.to_path_buf());
            }
        } else if path.extension().and_then(|e| e.to_str()) == Some(CANONICAL_EXT) {
            scan.committed.push(path.to_path_buf());
        }
    }
    Ok(scan)
}
