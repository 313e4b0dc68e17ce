//! Read-only union filesystem over a fixed set of local entries.
//!
//! The entry set is fixed at construction. Adding an entry means building a
//! new `UnionFs` from the full set and remounting it.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use super::{DirEntry, FileKind, FsError, FsResult, Metadata};

/// Content source of a union entry.
#[derive(Debug, Clone)]
pub enum UnionSource {
    /// Bytes held in memory
    Bytes(Arc<[u8]>),
    /// A host file, read on demand
    HostFile(PathBuf),
}

impl UnionSource {
    fn len(&self) -> FsResult<u64> {
        match self {
            UnionSource::Bytes(data) => Ok(data.len() as u64),
            UnionSource::HostFile(path) => Ok(std::fs::metadata(path)?.len()),
        }
    }

    fn read_at(&self, offset: u64, len: u64) -> FsResult<Vec<u8>> {
        match self {
            UnionSource::Bytes(data) => Ok(slice_range(data, offset, len)),
            UnionSource::HostFile(path) => {
                let mut file = File::open(path)?;
                file.seek(SeekFrom::Start(offset))?;
                let mut buf = Vec::new();
                file.take(len).read_to_end(&mut buf)?;
                Ok(buf)
            }
        }
    }
}

/// A flat, read-only directory of named entries.
#[derive(Debug, Clone, Default)]
pub struct UnionFs {
    entries: BTreeMap<String, UnionSource>,
}

impl UnionFs {
    /// Build a union from `(name, source)` pairs. Later duplicates win.
    pub fn new(entries: impl IntoIterator<Item = (String, UnionSource)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the union has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, rel: &[String]) -> FsResult<&UnionSource> {
        match rel {
            [name] => self
                .entries
                .get(name)
                .ok_or_else(|| FsError::NotFound(name.clone())),
            [] => Err(FsError::IsADirectory("/".to_string())),
            _ => Err(FsError::NotFound(rel.join("/"))),
        }
    }

    pub(crate) fn stat(&self, rel: &[String]) -> FsResult<Metadata> {
        if rel.is_empty() {
            return Ok(Metadata::directory(true));
        }
        let source = self.entry(rel)?;
        Ok(Metadata::file(source.len()?, true))
    }

    pub(crate) fn read_at(&self, rel: &[String], offset: u64, len: u64) -> FsResult<Vec<u8>> {
        self.entry(rel)?.read_at(offset, len)
    }

    pub(crate) fn read(&self, rel: &[String]) -> FsResult<Vec<u8>> {
        let source = self.entry(rel)?;
        source.read_at(0, source.len()?)
    }

    pub(crate) fn read_dir(&self, rel: &[String]) -> FsResult<Vec<DirEntry>> {
        if !rel.is_empty() {
            self.entry(rel)?;
            return Err(FsError::NotADirectory(rel.join("/")));
        }
        Ok(self
            .entries
            .keys()
            .map(|name| DirEntry {
                name: name.clone(),
                kind: FileKind::File,
            })
            .collect())
    }
}

pub(crate) fn slice_range(data: &[u8], offset: u64, len: u64) -> Vec<u8> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
    let len = usize::try_from(len).unwrap_or(usize::MAX);
    let end = start.saturating_add(len).min(data.len());
    data[start..end].to_vec()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use super::*;

    fn names(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_bytes_entry() {
        let union = UnionFs::new([(
            "a.txt".to_string(),
            UnionSource::Bytes(Arc::from(&b"hello"[..])),
        )]);
        assert_eq!(union.read(&names(&["a.txt"])).unwrap(), b"hello");
        assert_eq!(union.read_at(&names(&["a.txt"]), 1, 3).unwrap(), b"ell");
        let meta = union.stat(&names(&["a.txt"])).unwrap();
        assert_eq!(meta.size, 5);
        assert!(meta.read_only);
    }

    #[test]
    fn test_host_file_entry() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"on disk").unwrap();
        let union = UnionFs::new([(
            "disk.txt".to_string(),
            UnionSource::HostFile(file.path().to_path_buf()),
        )]);
        assert_eq!(union.read(&names(&["disk.txt"])).unwrap(), b"on disk");
        assert_eq!(union.read_at(&names(&["disk.txt"]), 3, 100).unwrap(), b"disk");
    }

    #[test]
    fn test_listing_and_missing() {
        let union = UnionFs::new([
            ("b".to_string(), UnionSource::Bytes(Arc::from(&b""[..]))),
            ("a".to_string(), UnionSource::Bytes(Arc::from(&b""[..]))),
        ]);
        let listed: Vec<_> = union
            .read_dir(&[])
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(listed, vec!["a", "b"]);
        assert!(matches!(
            union.read(&names(&["c"])),
            Err(FsError::NotFound(_))
        ));
        assert!(union.stat(&[]).unwrap().is_dir());
    }

    #[test]
    fn test_slice_range_clamps() {
        assert_eq!(slice_range(b"abc", 5, 2), b"");
        assert_eq!(slice_range(b"abc", 1, 100), b"bc");
    }
}
