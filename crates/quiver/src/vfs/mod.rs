//! In-memory sandboxed filesystem for tool instances.
//!
//! Every tool instance owns a private [`MemFs`]. The federation layer stitches
//! these private trees into one logical namespace using two mount kinds:
//!
//! - **Proxy** mounts forward a subtree to a subtree of another `MemFs`
//! - **Union** mounts expose a fixed, read-only set of local entries
//!
//! Lazy files fetch their content by byte range through a [`RangeFetcher`]
//! the first time a range is read.

mod lazy;
mod memfs;
mod path;
mod union;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use lazy::{HttpRangeFetcher, LAZY_CHUNK_SIZE, RangeFetcher};
pub use memfs::{FileHandle, MemFs, Mount, OpenFlags};
pub use path::{join, normalize, split_parent};
pub use union::{UnionFs, UnionSource};

/// Errors that can occur during filesystem operations
#[derive(Debug, Error)]
pub enum FsError {
    /// File or directory not found
    #[error("no such file or directory: {0}")]
    NotFound(String),
    /// Entry already exists
    #[error("file exists: {0}")]
    AlreadyExists(String),
    /// Path is not a directory
    #[error("not a directory: {0}")]
    NotADirectory(String),
    /// Path is a directory where a file was expected
    #[error("is a directory: {0}")]
    IsADirectory(String),
    /// Directory is not empty
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    /// Filesystem (or mount) is read-only
    #[error("read-only filesystem: {0}")]
    ReadOnly(String),
    /// Invalid path or argument
    #[error("invalid path: {0}")]
    InvalidPath(String),
    /// Too many levels of symbolic links
    #[error("too many levels of symbolic links: {0}")]
    Loop(String),
    /// Operation spans two filesystems
    #[error("cross-device link: {0}")]
    CrossDevice(String),
    /// Mount point is busy
    #[error("device or resource busy: {0}")]
    Busy(String),
    /// File handle was already closed
    #[error("bad file handle: {0}")]
    Closed(String),
    /// File would grow past [`MAX_FILE_SIZE`]
    #[error("file too large: {0}")]
    TooLarge(String),
    /// Error fetching lazy remote content
    #[error("remote fetch failed: {0}")]
    Remote(String),
    /// IO error from a host-backed entry
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Largest size a file may reach through writes or truncation.
pub const MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// Result alias for filesystem operations.
pub type FsResult<T> = Result<T, FsError>;

/// Kind of a filesystem node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// Directory
    Directory,
    /// Regular file (eager or lazy)
    File,
    /// Symbolic link
    Symlink,
}

/// File/directory metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Node kind
    pub kind: FileKind,
    /// Size in bytes (directories report 4096)
    pub size: u64,
    /// Whether the node is reached through a read-only mount
    pub read_only: bool,
}

impl Metadata {
    /// Whether this is a directory
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// Whether this is a regular file
    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    /// Whether this is a symbolic link
    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }

    pub(crate) fn directory(read_only: bool) -> Self {
        Self {
            kind: FileKind::Directory,
            size: DIR_SIZE,
            read_only,
        }
    }

    pub(crate) fn file(size: u64, read_only: bool) -> Self {
        Self {
            kind: FileKind::File,
            size,
            read_only,
        }
    }
}

/// Directory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name
    pub name: String,
    /// Entry kind
    pub kind: FileKind,
}

/// Result of [`MemFs::analyze_path`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathAnalysis {
    /// Normalized absolute path
    pub path: String,
    /// Final path component (empty for the root)
    pub name: String,
    /// Whether the path resolves to an existing node
    pub exists: bool,
    /// Whether the parent resolves to an existing directory
    pub parent_exists: bool,
    /// Whether the path is the root directory
    pub is_root: bool,
}

const DIR_SIZE: u64 = 4096;
