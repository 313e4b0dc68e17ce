//! The in-memory filesystem each tool instance owns.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::lazy::{LazyFile, RangeFetcher};
use super::path::{components, to_path};
use super::union::{UnionFs, slice_range};
use super::{DirEntry, FileKind, FsError, FsResult, MAX_FILE_SIZE, Metadata, PathAnalysis};

/// Maximum number of symlinks followed while resolving one path.
const MAX_SYMLINK_HOPS: usize = 40;

enum Node {
    Dir(BTreeMap<String, Node>),
    File(FileContent),
    Symlink(String),
}

enum FileContent {
    Bytes(Vec<u8>),
    Lazy(Arc<LazyFile>),
}

impl Node {
    fn kind(&self) -> FileKind {
        match self {
            Node::Dir(_) => FileKind::Directory,
            Node::File(_) => FileKind::File,
            Node::Symlink(_) => FileKind::Symlink,
        }
    }
}

/// A filesystem mounted over a directory of a [`MemFs`].
#[derive(Debug, Clone)]
pub enum Mount {
    /// Forwards every operation to the subtree `root` of `target`.
    Proxy {
        /// Filesystem the mount forwards to
        target: MemFs,
        /// Directory inside `target` that appears at the mount point
        root: String,
        /// Reject writes through this mount
        read_only: bool,
    },
    /// Read-only flat directory of local entries.
    Union(Arc<UnionFs>),
}

impl Mount {
    /// Writable proxy onto `root` inside `target`.
    pub fn proxy(target: &MemFs, root: impl Into<String>) -> Self {
        Mount::Proxy {
            target: target.clone(),
            root: root.into(),
            read_only: false,
        }
    }

    /// Read-only proxy onto `root` inside `target`.
    pub fn read_only_proxy(target: &MemFs, root: impl Into<String>) -> Self {
        Mount::Proxy {
            target: target.clone(),
            root: root.into(),
            read_only: true,
        }
    }

    /// Union mount over `fs`.
    pub fn union(fs: UnionFs) -> Self {
        Mount::Union(Arc::new(fs))
    }
}

struct FsState {
    root: Node,
    cwd: String,
    mounts: BTreeMap<String, Mount>,
}

/// Where a path lives once mounts and symlinks are resolved.
enum Route {
    /// In this filesystem's own tree, as symlink-free components.
    Local(Vec<String>),
    /// Behind a proxy mount; `path` is absolute inside `target`.
    Proxy {
        target: MemFs,
        path: String,
        read_only: bool,
    },
    /// Inside a union mount; `rel` is empty for the mount root.
    Union { fs: Arc<UnionFs>, rel: Vec<String> },
}

/// Sandboxed in-memory filesystem.
///
/// Cloning is cheap and yields another handle to the same tree. Locks are
/// never held while delegating to another filesystem or fetching remote
/// bytes, so proxies may point back at each other.
#[derive(Clone)]
pub struct MemFs {
    inner: Arc<RwLock<FsState>>,
}

impl std::fmt::Debug for MemFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Mount targets are not printed: proxies may form cycles.
        let st = self.state();
        f.debug_struct("MemFs")
            .field("cwd", &st.cwd)
            .field("mounts", &st.mounts.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup<'a>(root: &'a Node, parts: &[String]) -> Option<&'a Node> {
    let mut node = root;
    for part in parts {
        match node {
            Node::Dir(children) => node = children.get(part)?,
            _ => return None,
        }
    }
    Some(node)
}

fn lookup_mut<'a>(root: &'a mut Node, parts: &[String]) -> Option<&'a mut Node> {
    let mut node = root;
    for part in parts {
        match node {
            Node::Dir(children) => node = children.get_mut(part)?,
            _ => return None,
        }
    }
    Some(node)
}

/// Children of the parent directory of `parts`, plus the final name.
fn parent_dir<'a>(
    root: &'a mut Node,
    parts: &'a [String],
) -> FsResult<(&'a mut BTreeMap<String, Node>, &'a String)> {
    let Some((name, parent)) = parts.split_last() else {
        return Err(FsError::InvalidPath("/".to_string()));
    };
    match lookup_mut(root, parent) {
        Some(Node::Dir(children)) => Ok((children, name)),
        Some(_) => Err(FsError::NotADirectory(to_path(parent))),
        None => Err(FsError::NotFound(to_path(parent))),
    }
}

fn local_metadata(node: &Node) -> FsResult<Metadata> {
    Ok(match node {
        Node::Dir(_) => Metadata::directory(false),
        Node::File(FileContent::Bytes(data)) => Metadata::file(data.len() as u64, false),
        Node::File(FileContent::Lazy(lazy)) => Metadata::file(lazy.len()?, false),
        Node::Symlink(target) => Metadata {
            kind: FileKind::Symlink,
            size: target.len() as u64,
            read_only: false,
        },
    })
}

fn read_only_error(path: &str) -> FsError {
    FsError::ReadOnly(path.to_string())
}

impl MemFs {
    /// Create an empty filesystem with cwd `/`.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(FsState {
                root: Node::Dir(BTreeMap::new()),
                cwd: "/".to_string(),
                mounts: BTreeMap::new(),
            })),
        }
    }

    fn state(&self) -> RwLockReadGuard<'_, FsState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, FsState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether two handles refer to the same filesystem.
    pub fn same_fs(&self, other: &MemFs) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn route(&self, path: &str, follow_last: bool) -> FsResult<Route> {
        let st = self.state();
        let mut pending = components(&st.cwd, path);
        let mut hops = 0;
        loop {
            let mut resolved: Vec<String> = Vec::with_capacity(pending.len());
            let mut node = &st.root;
            let mut redirect = None;
            for (i, name) in pending.iter().enumerate() {
                resolved.push(name.clone());
                let key = to_path(&resolved);
                if let Some(mount) = st.mounts.get(&key) {
                    let rest = &pending[i + 1..];
                    return Ok(match mount {
                        Mount::Proxy {
                            target,
                            root,
                            read_only,
                        } => Route::Proxy {
                            target: target.clone(),
                            path: super::path::join(root, &rest.join("/")),
                            read_only: *read_only,
                        },
                        Mount::Union(fs) => Route::Union {
                            fs: Arc::clone(fs),
                            rel: rest.to_vec(),
                        },
                    });
                }
                let last = i + 1 == pending.len();
                let Node::Dir(children) = node else {
                    resolved.pop();
                    return Err(FsError::NotADirectory(to_path(&resolved)));
                };
                match children.get(name) {
                    None if last => return Ok(Route::Local(resolved)),
                    None => return Err(FsError::NotFound(key)),
                    Some(Node::Symlink(target)) if !last || follow_last => {
                        let parent = to_path(&resolved[..resolved.len() - 1]);
                        let mut next = components(&parent, target);
                        next.extend_from_slice(&pending[i + 1..]);
                        redirect = Some(next);
                        break;
                    }
                    Some(child) => node = child,
                }
            }
            match redirect {
                Some(next) => {
                    hops += 1;
                    if hops > MAX_SYMLINK_HOPS {
                        return Err(FsError::Loop(path.to_string()));
                    }
                    pending = next;
                }
                None => return Ok(Route::Local(resolved)),
            }
        }
    }

    /// Current working directory.
    pub fn cwd(&self) -> String {
        self.state().cwd.clone()
    }

    /// Change the working directory. The target must be a directory.
    pub fn chdir(&self, path: &str) -> FsResult<()> {
        let target = super::path::normalize(&self.cwd(), path);
        if !self.stat(&target)?.is_dir() {
            return Err(FsError::NotADirectory(target));
        }
        self.state_mut().cwd = target;
        Ok(())
    }

    /// Whether `path` resolves to an existing node.
    pub fn exists(&self, path: &str) -> bool {
        self.stat(path).is_ok()
    }

    /// Metadata of `path`, following symlinks.
    pub fn stat(&self, path: &str) -> FsResult<Metadata> {
        self.metadata(path, true)
    }

    /// Metadata of `path` without following a final symlink.
    pub fn lstat(&self, path: &str) -> FsResult<Metadata> {
        self.metadata(path, false)
    }

    fn metadata(&self, path: &str, follow: bool) -> FsResult<Metadata> {
        match self.route(path, follow)? {
            Route::Local(parts) => {
                let lazy = {
                    let st = self.state();
                    match lookup(&st.root, &parts) {
                        None => return Err(FsError::NotFound(to_path(&parts))),
                        Some(Node::File(FileContent::Lazy(lazy))) => Arc::clone(lazy),
                        Some(node) => return local_metadata(node),
                    }
                };
                Ok(Metadata::file(lazy.len()?, false))
            }
            Route::Proxy {
                target,
                path,
                read_only,
            } => {
                let mut meta = target.metadata(&path, follow)?;
                meta.read_only |= read_only;
                Ok(meta)
            }
            Route::Union { fs, rel } => fs.stat(&rel),
        }
    }

    /// Create a directory. The parent must exist.
    pub fn mkdir(&self, path: &str) -> FsResult<()> {
        match self.route(path, false)? {
            Route::Local(parts) => {
                if parts.is_empty() {
                    return Err(FsError::AlreadyExists("/".to_string()));
                }
                let mut st = self.state_mut();
                let (children, name) = parent_dir(&mut st.root, &parts)?;
                if children.contains_key(name) {
                    return Err(FsError::AlreadyExists(to_path(&parts)));
                }
                children.insert(name.clone(), Node::Dir(BTreeMap::new()));
                Ok(())
            }
            Route::Proxy {
                read_only: true,
                path,
                ..
            } => Err(read_only_error(&path)),
            Route::Proxy { target, path, .. } => target.mkdir(&path),
            Route::Union { rel, .. } if rel.is_empty() => {
                Err(FsError::AlreadyExists(path.to_string()))
            }
            Route::Union { .. } => Err(read_only_error(path)),
        }
    }

    /// Create a directory and any missing parents. Existing directories are
    /// accepted.
    pub fn mkdir_all(&self, path: &str) -> FsResult<()> {
        let parts = components(&self.cwd(), path);
        for depth in 1..=parts.len() {
            let prefix = to_path(&parts[..depth]);
            match self.mkdir(&prefix) {
                Ok(()) => {}
                Err(FsError::AlreadyExists(_)) => {
                    if !self.stat(&prefix)?.is_dir() {
                        return Err(FsError::NotADirectory(prefix));
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Remove an empty directory that is not a mount point.
    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        match self.route(path, false)? {
            Route::Local(parts) => {
                let key = to_path(&parts);
                let mut st = self.state_mut();
                if parts.is_empty() || st.mounts.contains_key(&key) {
                    return Err(FsError::Busy(key));
                }
                let (children, name) = parent_dir(&mut st.root, &parts)?;
                match children.get(name) {
                    None => Err(FsError::NotFound(key)),
                    Some(Node::Dir(entries)) if !entries.is_empty() => {
                        Err(FsError::NotEmpty(key))
                    }
                    Some(Node::Dir(_)) => {
                        children.remove(name);
                        Ok(())
                    }
                    Some(_) => Err(FsError::NotADirectory(key)),
                }
            }
            Route::Proxy {
                read_only: true,
                path,
                ..
            } => Err(read_only_error(&path)),
            Route::Proxy { target, path, .. } => target.rmdir(&path),
            Route::Union { rel, .. } if rel.is_empty() => Err(FsError::Busy(path.to_string())),
            Route::Union { .. } => Err(read_only_error(path)),
        }
    }

    /// Mount `mount` over the existing directory `mountpoint`.
    pub fn mount(&self, mount: Mount, mountpoint: &str) -> FsResult<()> {
        let parts = match self.route(mountpoint, true)? {
            Route::Local(parts) => parts,
            _ => return Err(FsError::Busy(mountpoint.to_string())),
        };
        let key = to_path(&parts);
        let mut st = self.state_mut();
        if parts.is_empty() || st.mounts.contains_key(&key) {
            return Err(FsError::Busy(key));
        }
        match lookup(&st.root, &parts) {
            Some(Node::Dir(_)) => {}
            Some(_) => return Err(FsError::NotADirectory(key)),
            None => return Err(FsError::NotFound(key)),
        }
        tracing::debug!(mountpoint = %key, "mounting filesystem");
        st.mounts.insert(key, mount);
        Ok(())
    }

    /// Remove the mount at `mountpoint`.
    pub fn unmount(&self, mountpoint: &str) -> FsResult<()> {
        let mut st = self.state_mut();
        let key = super::path::normalize(&st.cwd, mountpoint);
        match st.mounts.remove(&key) {
            Some(_) => Ok(()),
            None => Err(FsError::InvalidPath(format!("{key} is not a mount point"))),
        }
    }

    /// Whether `path` is a mount point of this filesystem.
    pub fn is_mount(&self, path: &str) -> bool {
        let st = self.state();
        let key = super::path::normalize(&st.cwd, path);
        st.mounts.contains_key(&key)
    }

    /// Entries of a directory without `.` and `..`, in name order.
    pub fn read_dir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        match self.route(path, true)? {
            Route::Local(parts) => {
                let st = self.state();
                match lookup(&st.root, &parts) {
                    Some(Node::Dir(children)) => Ok(children
                        .iter()
                        .map(|(name, node)| DirEntry {
                            name: name.clone(),
                            kind: node.kind(),
                        })
                        .collect()),
                    Some(_) => Err(FsError::NotADirectory(to_path(&parts))),
                    None => Err(FsError::NotFound(to_path(&parts))),
                }
            }
            Route::Proxy { target, path, .. } => target.read_dir(&path),
            Route::Union { fs, rel } => fs.read_dir(&rel),
        }
    }

    /// Names in a directory: `.` and `..` first, then entries in name order.
    pub fn readdir(&self, path: &str) -> FsResult<Vec<String>> {
        let mut names = vec![".".to_string(), "..".to_string()];
        names.extend(self.read_dir(path)?.into_iter().map(|e| e.name));
        Ok(names)
    }

    /// Create a symbolic link at `linkpath` whose content is `target`.
    pub fn symlink(&self, target: &str, linkpath: &str) -> FsResult<()> {
        match self.route(linkpath, false)? {
            Route::Local(parts) => {
                let mut st = self.state_mut();
                let (children, name) = parent_dir(&mut st.root, &parts)?;
                if children.contains_key(name) {
                    return Err(FsError::AlreadyExists(to_path(&parts)));
                }
                children.insert(name.clone(), Node::Symlink(target.to_string()));
                Ok(())
            }
            Route::Proxy {
                read_only: true,
                path,
                ..
            } => Err(read_only_error(&path)),
            Route::Proxy {
                target: fs, path, ..
            } => fs.symlink(target, &path),
            Route::Union { .. } => Err(read_only_error(linkpath)),
        }
    }

    /// Content of the symbolic link at `path`.
    pub fn readlink(&self, path: &str) -> FsResult<String> {
        match self.route(path, false)? {
            Route::Local(parts) => {
                let st = self.state();
                match lookup(&st.root, &parts) {
                    Some(Node::Symlink(target)) => Ok(target.clone()),
                    Some(_) => Err(FsError::InvalidPath(to_path(&parts))),
                    None => Err(FsError::NotFound(to_path(&parts))),
                }
            }
            Route::Proxy { target, path, .. } => target.readlink(&path),
            Route::Union { .. } => Err(FsError::InvalidPath(path.to_string())),
        }
    }

    /// Remove a file or symlink.
    pub fn unlink(&self, path: &str) -> FsResult<()> {
        match self.route(path, false)? {
            Route::Local(parts) => {
                let key = to_path(&parts);
                let mut st = self.state_mut();
                let (children, name) = parent_dir(&mut st.root, &parts)?;
                match children.get(name) {
                    None => Err(FsError::NotFound(key)),
                    Some(Node::Dir(_)) => Err(FsError::IsADirectory(key)),
                    Some(_) => {
                        children.remove(name);
                        Ok(())
                    }
                }
            }
            Route::Proxy {
                read_only: true,
                path,
                ..
            } => Err(read_only_error(&path)),
            Route::Proxy { target, path, .. } => target.unlink(&path),
            Route::Union { .. } => Err(read_only_error(path)),
        }
    }

    /// Move `from` to `to` within one filesystem. An existing file at `to`
    /// is replaced; an existing directory must be empty.
    pub fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        match (self.route(from, false)?, self.route(to, false)?) {
            (Route::Local(src), Route::Local(dst)) => {
                if dst.starts_with(&src) && dst.len() > src.len() {
                    return Err(FsError::InvalidPath(to_path(&dst)));
                }
                if src == dst {
                    return Ok(());
                }
                let mut st = self.state_mut();
                let src_key = to_path(&src);
                if st.mounts.contains_key(&src_key) {
                    return Err(FsError::Busy(src_key));
                }
                match lookup(&st.root, &dst) {
                    Some(Node::Dir(entries)) if !entries.is_empty() => {
                        return Err(FsError::NotEmpty(to_path(&dst)));
                    }
                    Some(Node::Dir(_)) if !matches!(lookup(&st.root, &src), Some(Node::Dir(_))) => {
                        return Err(FsError::IsADirectory(to_path(&dst)));
                    }
                    _ => {}
                }
                let Some((_, dst_parent)) = dst.split_last() else {
                    return Err(FsError::InvalidPath("/".to_string()));
                };
                match lookup(&st.root, dst_parent) {
                    Some(Node::Dir(_)) => {}
                    Some(_) => return Err(FsError::NotADirectory(to_path(dst_parent))),
                    None => return Err(FsError::NotFound(to_path(dst_parent))),
                }
                let node = {
                    let (children, name) = parent_dir(&mut st.root, &src)?;
                    children
                        .remove(name)
                        .ok_or_else(|| FsError::NotFound(src_key.clone()))?
                };
                let (children, name) = parent_dir(&mut st.root, &dst)?;
                children.insert(name.clone(), node);
                Ok(())
            }
            (
                Route::Proxy {
                    target: a,
                    path: pa,
                    read_only: ra,
                },
                Route::Proxy {
                    target: b,
                    path: pb,
                    read_only: rb,
                },
            ) if a.same_fs(&b) => {
                if ra || rb {
                    return Err(read_only_error(&pa));
                }
                a.rename(&pa, &pb)
            }
            (Route::Union { .. }, _) | (_, Route::Union { .. }) => Err(read_only_error(from)),
            _ => Err(FsError::CrossDevice(format!("{from} -> {to}"))),
        }
    }

    /// Read a whole file.
    pub fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        match self.route(path, true)? {
            Route::Local(parts) => {
                let lazy = {
                    let st = self.state();
                    match lookup(&st.root, &parts) {
                        Some(Node::File(FileContent::Bytes(data))) => return Ok(data.clone()),
                        Some(Node::File(FileContent::Lazy(lazy))) => Arc::clone(lazy),
                        Some(_) => return Err(FsError::IsADirectory(to_path(&parts))),
                        None => return Err(FsError::NotFound(to_path(&parts))),
                    }
                };
                lazy.read_all()
            }
            Route::Proxy { target, path, .. } => target.read_file(&path),
            Route::Union { fs, rel } => fs.read(&rel),
        }
    }

    /// Read up to `len` bytes starting at `offset`.
    pub fn read_at(&self, path: &str, offset: u64, len: u64) -> FsResult<Vec<u8>> {
        match self.route(path, true)? {
            Route::Local(parts) => {
                let lazy = {
                    let st = self.state();
                    match lookup(&st.root, &parts) {
                        Some(Node::File(FileContent::Bytes(data))) => {
                            return Ok(slice_range(data, offset, len));
                        }
                        Some(Node::File(FileContent::Lazy(lazy))) => Arc::clone(lazy),
                        Some(_) => return Err(FsError::IsADirectory(to_path(&parts))),
                        None => return Err(FsError::NotFound(to_path(&parts))),
                    }
                };
                lazy.read_at(offset, len)
            }
            Route::Proxy { target, path, .. } => target.read_at(&path, offset, len),
            Route::Union { fs, rel } => fs.read_at(&rel, offset, len),
        }
    }

    /// Create or replace a file with `data`.
    pub fn write_file(&self, path: &str, data: &[u8]) -> FsResult<()> {
        match self.route(path, true)? {
            Route::Local(parts) => {
                let key = to_path(&parts);
                let mut st = self.state_mut();
                let (children, name) = parent_dir(&mut st.root, &parts)?;
                if let Some(Node::Dir(_)) = children.get(name) {
                    return Err(FsError::IsADirectory(key));
                }
                children.insert(name.clone(), Node::File(FileContent::Bytes(data.to_vec())));
                Ok(())
            }
            Route::Proxy {
                read_only: true,
                path,
                ..
            } => Err(read_only_error(&path)),
            Route::Proxy { target, path, .. } => target.write_file(&path, data),
            Route::Union { .. } => Err(read_only_error(path)),
        }
    }

    /// Apply `edit` to the bytes of an existing local file, materializing
    /// lazy content first.
    fn edit_local<R>(
        &self,
        parts: &[String],
        edit: impl FnOnce(&mut Vec<u8>) -> R,
    ) -> FsResult<R> {
        let key = to_path(parts);
        let lazy = {
            let st = self.state();
            match lookup(&st.root, parts) {
                Some(Node::File(FileContent::Lazy(lazy))) => Some(Arc::clone(lazy)),
                Some(Node::File(FileContent::Bytes(_))) => None,
                Some(_) => return Err(FsError::IsADirectory(key)),
                None => return Err(FsError::NotFound(key)),
            }
        };
        let materialized = match lazy {
            Some(lazy) => Some(lazy.read_all()?),
            None => None,
        };
        let mut st = self.state_mut();
        let Some(Node::File(content)) = lookup_mut(&mut st.root, parts) else {
            return Err(FsError::NotFound(key));
        };
        if let Some(bytes) = materialized {
            *content = FileContent::Bytes(bytes);
        }
        match content {
            FileContent::Bytes(data) => Ok(edit(data)),
            FileContent::Lazy(_) => Err(FsError::Busy(key)),
        }
    }

    /// Write `data` at `offset` in an existing file, zero-filling any gap.
    pub fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> FsResult<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| FsError::TooLarge(path.to_string()))
            .and_then(|end| checked_file_size(path, end))?;
        match self.route(path, true)? {
            Route::Local(parts) => self.edit_local(&parts, |bytes| {
                let start = end - data.len();
                if bytes.len() < end {
                    bytes.resize(end, 0);
                }
                bytes[start..end].copy_from_slice(data);
            }),
            Route::Proxy {
                read_only: true,
                path,
                ..
            } => Err(read_only_error(&path)),
            Route::Proxy { target, path, .. } => target.write_at(&path, offset, data),
            Route::Union { .. } => Err(read_only_error(path)),
        }
    }

    /// Truncate or zero-extend a file to `size` bytes.
    pub fn set_size(&self, path: &str, size: u64) -> FsResult<()> {
        let size = checked_file_size(path, size)?;
        match self.route(path, true)? {
            Route::Local(parts) => self.edit_local(&parts, |bytes| bytes.resize(size, 0)),
            Route::Proxy {
                read_only: true,
                path,
                ..
            } => Err(read_only_error(&path)),
            Route::Proxy { target, path, .. } => target.set_size(&path, size as u64),
            Route::Union { .. } => Err(read_only_error(path)),
        }
    }

    /// Register a lazily fetched file `parent/name` backed by `url`.
    /// Returns its absolute path.
    pub fn create_lazy_file(
        &self,
        parent: &str,
        name: &str,
        url: &str,
        fetcher: Arc<dyn RangeFetcher>,
    ) -> FsResult<String> {
        if name.is_empty() || name.contains('/') {
            return Err(FsError::InvalidPath(name.to_string()));
        }
        let path = super::path::normalize(&self.cwd(), &format!("{parent}/{name}"));
        match self.route(&path, false)? {
            Route::Local(parts) => {
                let mut st = self.state_mut();
                let (children, file_name) = parent_dir(&mut st.root, &parts)?;
                if children.contains_key(file_name) {
                    return Err(FsError::AlreadyExists(path));
                }
                children.insert(
                    file_name.clone(),
                    Node::File(FileContent::Lazy(Arc::new(LazyFile::new(url, fetcher)))),
                );
                Ok(path)
            }
            Route::Proxy {
                read_only: true,
                path,
                ..
            } => Err(read_only_error(&path)),
            Route::Proxy {
                target,
                path: inner,
                ..
            } => {
                let (inner_parent, _) = super::path::split_parent(&inner);
                target.create_lazy_file(&inner_parent, name, url, fetcher)?;
                Ok(path)
            }
            Route::Union { .. } => Err(read_only_error(&path)),
        }
    }

    /// Describe `path` without failing when it is missing.
    pub fn analyze_path(&self, path: &str) -> PathAnalysis {
        let normalized = super::path::normalize(&self.cwd(), path);
        let (parent, name) = super::path::split_parent(&normalized);
        PathAnalysis {
            exists: self.exists(&normalized),
            parent_exists: self.stat(&parent).map(|m| m.is_dir()).unwrap_or(false),
            is_root: normalized == "/",
            path: normalized,
            name,
        }
    }

    /// Open a file, returning a positioned handle.
    pub fn open(&self, path: &str, flags: OpenFlags) -> FsResult<FileHandle> {
        let absolute = super::path::normalize(&self.cwd(), path);
        match self.stat(&absolute) {
            Ok(meta) if meta.is_dir() => return Err(FsError::IsADirectory(absolute)),
            Ok(_) if flags.create && flags.exclusive => {
                return Err(FsError::AlreadyExists(absolute));
            }
            Ok(meta) => {
                if (flags.write || flags.truncate) && meta.read_only {
                    return Err(read_only_error(&absolute));
                }
                if flags.truncate {
                    self.set_size(&absolute, 0)?;
                }
            }
            Err(FsError::NotFound(_)) if flags.create => self.write_file(&absolute, &[])?,
            Err(e) => return Err(e),
        }
        Ok(FileHandle {
            fs: self.clone(),
            path: absolute,
            flags,
            position: 0,
            closed: false,
        })
    }
}

/// `size` as an in-memory length, if it is within [`MAX_FILE_SIZE`].
fn checked_file_size(path: &str, size: u64) -> FsResult<usize> {
    if size > MAX_FILE_SIZE {
        return Err(FsError::TooLarge(path.to_string()));
    }
    usize::try_from(size).map_err(|_| FsError::TooLarge(path.to_string()))
}

/// Flags for [`MemFs::open`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    /// Open for reading
    pub read: bool,
    /// Open for writing
    pub write: bool,
    /// Create the file if missing
    pub create: bool,
    /// Truncate on open
    pub truncate: bool,
    /// Every write goes to the end of the file
    pub append: bool,
    /// Fail if the file exists (with `create`)
    pub exclusive: bool,
}

impl OpenFlags {
    /// Parse a C-style mode string: `r`, `r+`, `w`, `w+`, `a`, `a+`, with
    /// an optional `x` after `w` for exclusive creation.
    pub fn parse(mode: &str) -> FsResult<Self> {
        let mut flags = match mode.trim_end_matches(['+', 'x', 's']) {
            "r" => OpenFlags {
                read: true,
                ..Default::default()
            },
            "w" => OpenFlags {
                write: true,
                create: true,
                truncate: true,
                ..Default::default()
            },
            "a" => OpenFlags {
                write: true,
                create: true,
                append: true,
                ..Default::default()
            },
            _ => return Err(FsError::InvalidPath(format!("unknown open flag {mode:?}"))),
        };
        if mode.contains('+') {
            flags.read = true;
            flags.write = true;
        }
        flags.exclusive = mode.contains('x');
        Ok(flags)
    }
}

/// A positioned handle onto a file of a [`MemFs`].
pub struct FileHandle {
    fs: MemFs,
    path: String,
    flags: OpenFlags,
    position: u64,
    closed: bool,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path)
            .field("position", &self.position)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl FileHandle {
    fn check_open(&self) -> FsResult<()> {
        if self.closed {
            return Err(FsError::Closed(self.path.clone()));
        }
        Ok(())
    }

    /// Absolute path this handle was opened with.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Move to an absolute position.
    pub fn seek(&mut self, position: u64) -> FsResult<()> {
        self.check_open()?;
        self.position = position;
        Ok(())
    }

    /// Read up to `len` bytes at the current position and advance.
    pub fn read(&mut self, len: u64) -> FsResult<Vec<u8>> {
        self.check_open()?;
        if !self.flags.read {
            return Err(FsError::InvalidPath(format!("{} not open for reading", self.path)));
        }
        let bytes = self.fs.read_at(&self.path, self.position, len)?;
        self.position += bytes.len() as u64;
        Ok(bytes)
    }

    /// Write `data` at the current position (or the end, in append mode)
    /// and advance.
    pub fn write(&mut self, data: &[u8]) -> FsResult<usize> {
        self.check_open()?;
        if !self.flags.write {
            return Err(FsError::InvalidPath(format!("{} not open for writing", self.path)));
        }
        if self.flags.append {
            self.position = self.fs.stat(&self.path)?.size;
        }
        self.fs.write_at(&self.path, self.position, data)?;
        self.position += data.len() as u64;
        Ok(data.len())
    }

    /// Close the handle. Further use fails.
    pub fn close(&mut self) -> FsResult<()> {
        self.check_open()?;
        self.closed = true;
        Ok(())
    }
}
