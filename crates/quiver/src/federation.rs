//! Federation of per-tool filesystems into one shared namespace.
//!
//! The base module's filesystem holds the namespace:
//!
//! ```text
//! /shared
//! ├── data/        read-write, default cwd, symlinks to mounted files
//! ├── mnt/         read-only union of every locally mounted file
//! └── <tool>/      read-only view of each tool's bundled sample data
//! ```
//!
//! Every other tool sees the same tree through a proxy mount at `/shared`.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use crate::registry::SessionConfig;
use crate::runtime::RuntimeError;
use crate::vfs::{self, FsError, FsResult, MemFs, Mount, RangeFetcher, UnionFs, UnionSource};

/// A file handed to `mount()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountEntry {
    /// In-memory payload
    Bytes {
        /// File name under the data directory
        name: String,
        /// File contents
        data: Arc<[u8]>,
    },
    /// Host file read on demand
    Blob {
        /// File name under the data directory
        name: String,
        /// Host path
        path: PathBuf,
    },
    /// Remote file fetched lazily by byte range
    Remote {
        /// File name under the data directory
        name: String,
        /// Source URL
        url: String,
    },
}

impl MountEntry {
    /// In-memory entry.
    pub fn bytes(name: impl Into<String>, data: impl AsRef<[u8]>) -> Self {
        MountEntry::Bytes {
            name: name.into(),
            data: Arc::from(data.as_ref()),
        }
    }

    /// Host file entry.
    pub fn blob(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        MountEntry::Blob {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Remote entry.
    pub fn remote(name: impl Into<String>, url: impl Into<String>) -> Self {
        MountEntry::Remote {
            name: name.into(),
            url: url.into(),
        }
    }

    /// File name under the data directory.
    pub fn name(&self) -> &str {
        match self {
            MountEntry::Bytes { name, .. }
            | MountEntry::Blob { name, .. }
            | MountEntry::Remote { name, .. } => name,
        }
    }

    fn union_source(&self) -> Option<UnionSource> {
        match self {
            MountEntry::Bytes { data, .. } => Some(UnionSource::Bytes(Arc::clone(data))),
            MountEntry::Blob { path, .. } => Some(UnionSource::HostFile(path.clone())),
            MountEntry::Remote { .. } => None,
        }
    }
}

fn unsupported(value: &Value, reason: &str) -> RuntimeError {
    RuntimeError::UnsupportedInput(format!("{reason}: {value}"))
}

fn check_name(name: &str, value: &Value) -> Result<(), RuntimeError> {
    if name.is_empty() || name.contains('/') {
        return Err(unsupported(value, "file names must be non-empty and contain no '/'"));
    }
    Ok(())
}

fn name_from_url(raw: &str, value: &Value) -> Result<String, RuntimeError> {
    let url = url::Url::parse(raw).map_err(|e| unsupported(value, &e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(unsupported(value, "only http and https URLs can be mounted"));
    }
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| unsupported(value, "cannot derive a file name from URL"))
}

fn data_bytes(data: &Value) -> Result<Vec<u8>, RuntimeError> {
    match data {
        Value::String(text) => Ok(text.as_bytes().to_vec()),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|b| u8::try_from(b).ok())
                    .ok_or_else(|| unsupported(item, "data bytes must be integers 0-255"))
            })
            .collect(),
        other => Err(unsupported(other, "data must be a string or byte array")),
    }
}

fn classify_into(value: &Value, out: &mut Vec<MountEntry>) -> Result<(), RuntimeError> {
    match value {
        Value::Array(items) => {
            for item in items {
                classify_into(item, out)?;
            }
        }
        Value::String(url) => {
            let name = name_from_url(url, value)?;
            out.push(MountEntry::remote(name, url.clone()));
        }
        Value::Object(map) => {
            let given = match map.get("name") {
                None => None,
                Some(Value::String(name)) => Some(name.clone()),
                Some(_) => return Err(unsupported(value, "name must be a string")),
            };
            let entry = if let Some(data) = map.get("data") {
                let name = given.ok_or_else(|| unsupported(value, "data entries need a name"))?;
                MountEntry::bytes(name, data_bytes(data)?)
            } else if let Some(Value::String(url)) = map.get("url") {
                let name = match given {
                    Some(name) => name,
                    None => name_from_url(url, value)?,
                };
                MountEntry::remote(name, url.clone())
            } else if let Some(Value::String(path)) = map.get("path") {
                let path = PathBuf::from(path);
                let name = match given {
                    Some(name) => name,
                    None => path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .ok_or_else(|| unsupported(value, "cannot derive a file name from path"))?,
                };
                MountEntry::blob(name, path)
            } else {
                return Err(unsupported(value, "unsupported mount entry"));
            };
            check_name(entry.name(), value)?;
            out.push(entry);
        }
        other => return Err(unsupported(other, "unsupported mount entry")),
    }
    Ok(())
}

/// Turn the JSON argument of `mount()` into entries, rejecting the whole
/// input if any part of it is unsupported.
pub fn classify(value: &Value) -> Result<Vec<MountEntry>, RuntimeError> {
    let mut entries = Vec::new();
    classify_into(value, &mut entries)?;
    Ok(entries)
}

/// Unlink a file or symlink without touching its content.
fn remove_if_present(fs: &MemFs, path: &str) -> FsResult<()> {
    match fs.unlink(path) {
        Ok(()) | Err(FsError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Owns the shared namespace layout and the accumulated local mounts.
#[derive(Debug)]
pub struct Federator {
    shared: String,
    data: String,
    mounted: String,
    entries: Vec<MountEntry>,
    fetcher: Arc<dyn RangeFetcher>,
}

impl Federator {
    /// Federator for the directories named in `session`.
    pub fn new(session: &SessionConfig, fetcher: Arc<dyn RangeFetcher>) -> Self {
        Self {
            shared: session.shared_dir(),
            data: session.data_dir(),
            mounted: session.mounted_dir(),
            entries: Vec::new(),
            fetcher,
        }
    }

    /// Shared root.
    pub fn shared_dir(&self) -> &str {
        &self.shared
    }

    /// Data directory.
    pub fn data_dir(&self) -> &str {
        &self.data
    }

    /// Mounted directory.
    pub fn mounted_dir(&self) -> &str {
        &self.mounted
    }

    /// Local entries mounted so far, in mount order.
    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    /// Create the namespace in the base module's filesystem and move into
    /// the data directory.
    pub fn create_namespace(&self, base: &MemFs) -> FsResult<()> {
        base.mkdir_all(&self.data)?;
        base.mkdir_all(&self.mounted)?;
        base.chdir(&self.data)?;
        tracing::debug!(shared = %self.shared, "created shared namespace");
        Ok(())
    }

    /// Proxy a tool's shared root onto the base module's and adopt the
    /// base's current working directory. Replaces an earlier attachment.
    pub fn attach(&self, fs: &MemFs, base: &MemFs) -> FsResult<()> {
        if fs.is_mount(&self.shared) {
            fs.unmount(&self.shared)?;
        }
        fs.mkdir_all(&self.shared)?;
        fs.mount(Mount::proxy(base, self.shared.clone()), &self.shared)?;
        let cwd = base.cwd();
        if let Err(e) = fs.chdir(&cwd) {
            tracing::warn!(%cwd, error = %e, "could not adopt base working directory");
        }
        Ok(())
    }

    /// Mount `entries` into the base filesystem. Returns the logical paths
    /// under the data directory, in input order.
    pub fn mount(&mut self, base: &MemFs, entries: Vec<MountEntry>) -> FsResult<Vec<String>> {
        let mut paths = Vec::with_capacity(entries.len());
        let mut added = Vec::new();
        for entry in entries {
            let path = vfs::join(&self.data, entry.name());
            match &entry {
                MountEntry::Remote { name, url } => {
                    remove_if_present(base, &path)?;
                    base.create_lazy_file(&self.data, name, url, Arc::clone(&self.fetcher))?;
                    tracing::debug!(%path, %url, "registered lazy file");
                }
                _ => added.push(entry.name().to_string()),
            }
            if entry.union_source().is_some() {
                self.entries.push(entry);
            }
            paths.push(path);
        }
        self.remount(base)?;
        for name in &added {
            self.link(base, name)?;
        }
        Ok(paths)
    }

    /// Rebuild the union over every local entry and recreate all symlinks.
    pub fn replay(&self, base: &MemFs) -> FsResult<()> {
        self.remount(base)?;
        for entry in &self.entries {
            self.link(base, entry.name())?;
        }
        Ok(())
    }

    fn remount(&self, base: &MemFs) -> FsResult<()> {
        if base.is_mount(&self.mounted) {
            base.unmount(&self.mounted)?;
        }
        let union = UnionFs::new(
            self.entries
                .iter()
                .filter_map(|e| Some((e.name().to_string(), e.union_source()?))),
        );
        base.mount(Mount::union(union), &self.mounted)
    }

    fn link(&self, base: &MemFs, name: &str) -> FsResult<()> {
        let link = vfs::join(&self.data, name);
        remove_if_present(base, &link)?;
        base.symlink(&vfs::join(&self.mounted, name), &link)
    }

    /// Expose each tool's top-level `/<tool>` directory read-only at
    /// `<shared>/<tool>` in the base filesystem, unless that path exists.
    pub fn cross_mount_samples<'a>(
        &self,
        base: &MemFs,
        tools: impl IntoIterator<Item = (&'a str, &'a MemFs)>,
    ) -> FsResult<()> {
        for (tool, fs) in tools {
            let source = vfs::join("/", tool);
            if !fs.stat(&source).map(|m| m.is_dir()).unwrap_or(false) {
                continue;
            }
            let target = vfs::join(&self.shared, tool);
            if base.exists(&target) {
                continue;
            }
            base.mkdir(&target)?;
            base.mount(Mount::read_only_proxy(fs, source), &target)?;
            tracing::debug!(%tool, %target, "mounted sample data");
        }
        Ok(())
    }

    /// Remove the sample-data mount of `tool`, if any.
    pub fn detach_samples(&self, base: &MemFs, tool: &str) -> FsResult<()> {
        let target = vfs::join(&self.shared, tool);
        if base.is_mount(&target) {
            base.unmount(&target)?;
            base.rmdir(&target)?;
        }
        Ok(())
    }
}
