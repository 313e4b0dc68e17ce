//! WASI preview1 for tools, provided by `wasi-common` over an instance's
//! [`MemFs`] and [`ProgramIo`].
//!
//! `wasi-common` owns the ABI: argument and environment marshalling, the
//! descriptor table, clocks, randomness and `proc_exit`. This module only
//! puts the in-memory filesystem behind its [`WasiDir`]/[`WasiFile`] traits
//! and routes stdio into the capture buffers. Two directories are
//! preopened: `.` at the working directory and `/`.

use std::any::Any;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::io::{IoSlice, IoSliceMut, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use wasi_common::dir::{OpenResult, ReaddirCursor, ReaddirEntity};
use wasi_common::file::{FdFlags, FileType, Filestat, OFlags};
use wasi_common::snapshots::preview_1::types::Errno;
use wasi_common::sync::WasiCtxBuilder;
use wasi_common::{Error, ErrorExt, WasiCtx, WasiDir, WasiFile};
use wasmtime::Linker;

use super::StoreLimiter;
use crate::program::{ProgramError, ProgramIo};
use crate::vfs::{self, FileHandle, FileKind, FsError, MemFs, Metadata, OpenFlags};

fn fs_error(err: FsError) -> Error {
    match err {
        FsError::NotFound(_) => Error::not_found(),
        FsError::AlreadyExists(_) => Error::exist(),
        FsError::NotADirectory(_) => Error::not_dir(),
        FsError::IsADirectory(_) => Errno::Isdir.into(),
        FsError::NotEmpty(_) => Errno::Notempty.into(),
        FsError::ReadOnly(_) => Errno::Rofs.into(),
        FsError::InvalidPath(_) => Error::invalid_argument(),
        FsError::Loop(_) => Errno::Loop.into(),
        FsError::CrossDevice(_) => Errno::Xdev.into(),
        FsError::Busy(_) => Errno::Busy.into(),
        FsError::Closed(_) => Error::badf(),
        FsError::TooLarge(_) => Errno::Fbig.into(),
        FsError::Remote(_) | FsError::Io(_) => Error::io(),
    }
}

fn program_error(err: ProgramError) -> Error {
    match err {
        ProgramError::Fs(e) => fs_error(e),
        ProgramError::StreamClosed(_) => Error::badf(),
        ProgramError::Trap(_) | ProgramError::Failed(_) => Error::io(),
    }
}

fn inode(path: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    hasher.finish()
}

fn filetype(kind: FileKind) -> FileType {
    match kind {
        FileKind::Directory => FileType::Directory,
        FileKind::File => FileType::RegularFile,
        FileKind::Symlink => FileType::SymbolicLink,
    }
}

fn filestat(path: &str, meta: &Metadata) -> Filestat {
    Filestat {
        device_id: 0,
        inode: inode(path),
        filetype: filetype(meta.kind),
        nlink: 1,
        size: meta.size,
        atim: None,
        mtim: None,
        ctim: None,
    }
}

fn total_len(bufs: &[IoSliceMut<'_>]) -> u64 {
    bufs.iter().map(|b| b.len() as u64).sum()
}

/// Copy `data` across `bufs` in order; returns the number of bytes placed.
fn scatter(data: &[u8], bufs: &mut [IoSliceMut<'_>]) -> u64 {
    let mut rest = data;
    for buf in bufs.iter_mut() {
        if rest.is_empty() {
            break;
        }
        let take = rest.len().min(buf.len());
        buf[..take].copy_from_slice(&rest[..take]);
        rest = &rest[take..];
    }
    (data.len() - rest.len()) as u64
}

fn gather(bufs: &[IoSlice<'_>]) -> Vec<u8> {
    bufs.iter().flat_map(|b| b.iter().copied()).collect()
}

/// Program I/O shared by the three stdio descriptors of one invocation.
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedIo(Arc<Mutex<ProgramIo>>);

impl SharedIo {
    pub(crate) fn new(io: ProgramIo) -> Self {
        Self(Arc::new(Mutex::new(io)))
    }

    fn lock(&self) -> MutexGuard<'_, ProgramIo> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fs(&self) -> MemFs {
        self.lock().fs().clone()
    }

    /// Take the I/O back out, leaving an empty value behind.
    pub(crate) fn take(&self) -> ProgramIo {
        std::mem::take(&mut *self.lock())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stdio {
    In,
    Out,
    Err,
}

#[derive(Debug)]
struct StdioFile {
    io: SharedIo,
    stream: Stdio,
}

#[async_trait]
impl WasiFile for StdioFile {
    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn get_filetype(&self) -> Result<FileType, Error> {
        Ok(FileType::CharacterDevice)
    }

    async fn read_vectored<'a>(&self, bufs: &mut [IoSliceMut<'a>]) -> Result<u64, Error> {
        if self.stream != Stdio::In {
            return Err(Error::badf());
        }
        let wanted = usize::try_from(total_len(bufs)).unwrap_or(usize::MAX);
        let data = self.io.lock().read_stdin(wanted);
        Ok(scatter(&data, bufs))
    }

    async fn write_vectored<'a>(&self, bufs: &[IoSlice<'a>]) -> Result<u64, Error> {
        let data = gather(bufs);
        let mut io = self.io.lock();
        let written = match self.stream {
            Stdio::Out => io.write_stdout(&data),
            Stdio::Err => io.write_stderr(&data),
            Stdio::In => return Err(Error::badf()),
        }
        .map_err(program_error)?;
        Ok(written as u64)
    }
}

/// An open regular file.
#[derive(Debug)]
struct MemFile {
    fs: MemFs,
    handle: Mutex<FileHandle>,
}

impl MemFile {
    fn handle(&self) -> MutexGuard<'_, FileHandle> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn path(&self) -> String {
        self.handle().path().to_string()
    }
}

#[async_trait]
impl WasiFile for MemFile {
    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn get_filetype(&self) -> Result<FileType, Error> {
        Ok(FileType::RegularFile)
    }

    async fn get_filestat(&self) -> Result<Filestat, Error> {
        let path = self.path();
        let meta = self.fs.stat(&path).map_err(fs_error)?;
        Ok(filestat(&path, &meta))
    }

    async fn set_filestat_size(&self, size: u64) -> Result<(), Error> {
        self.fs.set_size(&self.path(), size).map_err(fs_error)
    }

    async fn read_vectored<'a>(&self, bufs: &mut [IoSliceMut<'a>]) -> Result<u64, Error> {
        let data = self.handle().read(total_len(bufs)).map_err(fs_error)?;
        Ok(scatter(&data, bufs))
    }

    async fn read_vectored_at<'a>(
        &self,
        bufs: &mut [IoSliceMut<'a>],
        offset: u64,
    ) -> Result<u64, Error> {
        let data = self
            .fs
            .read_at(&self.path(), offset, total_len(bufs))
            .map_err(fs_error)?;
        Ok(scatter(&data, bufs))
    }

    async fn write_vectored<'a>(&self, bufs: &[IoSlice<'a>]) -> Result<u64, Error> {
        let written = self.handle().write(&gather(bufs)).map_err(fs_error)?;
        Ok(written as u64)
    }

    async fn write_vectored_at<'a>(&self, bufs: &[IoSlice<'a>], offset: u64) -> Result<u64, Error> {
        let data = gather(bufs);
        self.fs
            .write_at(&self.path(), offset, &data)
            .map_err(fs_error)?;
        Ok(data.len() as u64)
    }

    async fn seek(&self, pos: SeekFrom) -> Result<u64, Error> {
        let mut handle = self.handle();
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => handle.position().checked_add_signed(delta),
            SeekFrom::End(delta) => {
                let size = self.fs.stat(handle.path()).map_err(fs_error)?.size;
                size.checked_add_signed(delta)
            }
        }
        .ok_or_else(Error::invalid_argument)?;
        handle.seek(target).map_err(fs_error)?;
        Ok(target)
    }
}

/// A directory of a [`MemFs`]; guest paths resolve against `root`.
#[derive(Debug)]
struct MemDir {
    fs: MemFs,
    root: String,
}

impl MemDir {
    fn new(fs: MemFs, root: impl Into<String>) -> Self {
        Self {
            fs,
            root: root.into(),
        }
    }

    fn resolve(&self, path: &str) -> String {
        vfs::join(&self.root, path)
    }
}

#[async_trait]
impl WasiDir for MemDir {
    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn open_file(
        &self,
        symlink_follow: bool,
        path: &str,
        oflags: OFlags,
        read: bool,
        write: bool,
        fdflags: FdFlags,
    ) -> Result<OpenResult, Error> {
        let path = self.resolve(path);
        let create = oflags.contains(OFlags::CREATE);
        let exclusive = oflags.contains(OFlags::EXCLUSIVE);
        let meta = if symlink_follow {
            self.fs.stat(&path)
        } else {
            self.fs.lstat(&path)
        };
        match meta {
            Ok(meta) if meta.is_symlink() => return Err(Errno::Loop.into()),
            Ok(_) if create && exclusive => return Err(Error::exist()),
            Ok(meta) if meta.is_dir() => {
                if write {
                    return Err(Errno::Isdir.into());
                }
                return Ok(OpenResult::Dir(Box::new(MemDir::new(self.fs.clone(), path))));
            }
            Ok(_) if oflags.contains(OFlags::DIRECTORY) => return Err(Error::not_dir()),
            Err(e) if oflags.contains(OFlags::DIRECTORY) || !create => return Err(fs_error(e)),
            _ => {}
        }

        let flags = OpenFlags {
            read,
            write,
            create,
            truncate: oflags.contains(OFlags::TRUNCATE),
            append: fdflags.contains(FdFlags::APPEND),
            exclusive,
        };
        let handle = self.fs.open(&path, flags).map_err(fs_error)?;
        Ok(OpenResult::File(Box::new(MemFile {
            fs: self.fs.clone(),
            handle: Mutex::new(handle),
        })))
    }

    async fn create_dir(&self, path: &str) -> Result<(), Error> {
        self.fs.mkdir(&self.resolve(path)).map_err(fs_error)
    }

    async fn readdir(
        &self,
        cursor: ReaddirCursor,
    ) -> Result<Box<dyn Iterator<Item = Result<ReaddirEntity, Error>> + Send>, Error> {
        let mut entries = vec![
            (".".to_string(), FileType::Directory),
            ("..".to_string(), FileType::Directory),
        ];
        entries.extend(
            self.fs
                .read_dir(&self.root)
                .map_err(fs_error)?
                .into_iter()
                .map(|entry| (entry.name, filetype(entry.kind))),
        );
        let start = usize::try_from(u64::from(cursor)).unwrap_or(usize::MAX);
        let root = self.root.clone();
        let entities: Vec<_> = entries
            .into_iter()
            .enumerate()
            .skip(start)
            .map(|(index, (name, filetype))| {
                Ok(ReaddirEntity {
                    next: ReaddirCursor::from(index as u64 + 1),
                    inode: inode(&vfs::join(&root, &name)),
                    name,
                    filetype,
                })
            })
            .collect();
        Ok(Box::new(entities.into_iter()))
    }

    async fn symlink(&self, old_path: &str, new_path: &str) -> Result<(), Error> {
        self.fs
            .symlink(old_path, &self.resolve(new_path))
            .map_err(fs_error)
    }

    async fn remove_dir(&self, path: &str) -> Result<(), Error> {
        self.fs.rmdir(&self.resolve(path)).map_err(fs_error)
    }

    async fn unlink_file(&self, path: &str) -> Result<(), Error> {
        self.fs.unlink(&self.resolve(path)).map_err(fs_error)
    }

    async fn read_link(&self, path: &str) -> Result<PathBuf, Error> {
        let target = self.fs.readlink(&self.resolve(path)).map_err(fs_error)?;
        Ok(PathBuf::from(target))
    }

    async fn get_filestat(&self) -> Result<Filestat, Error> {
        let meta = self.fs.stat(&self.root).map_err(fs_error)?;
        Ok(filestat(&self.root, &meta))
    }

    async fn get_path_filestat(&self, path: &str, follow_symlinks: bool) -> Result<Filestat, Error> {
        let path = self.resolve(path);
        let meta = if follow_symlinks {
            self.fs.stat(&path)
        } else {
            self.fs.lstat(&path)
        }
        .map_err(fs_error)?;
        Ok(filestat(&path, &meta))
    }

    async fn rename(&self, path: &str, dest_dir: &dyn WasiDir, dest_path: &str) -> Result<(), Error> {
        let dest = dest_dir
            .as_any()
            .downcast_ref::<MemDir>()
            .ok_or_else(|| Error::from(Errno::Xdev))?;
        if !dest.fs.same_fs(&self.fs) {
            return Err(Errno::Xdev.into());
        }
        self.fs
            .rename(&self.resolve(path), &dest.resolve(dest_path))
            .map_err(fs_error)
    }
}

/// Store data for one invocation.
pub(crate) struct WasiState {
    wasi: WasiCtx,
    pub(crate) limiter: StoreLimiter,
}

impl WasiState {
    /// Context for running `program` with `args`. `argv[0]` is the program
    /// name and `PWD` is the filesystem's working directory.
    pub(crate) fn new(
        program: &str,
        args: &[String],
        io: &SharedIo,
        max_memory: u64,
    ) -> Result<Self, Error> {
        let fs = io.fs();
        let cwd = fs.cwd();
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(program.to_string());
        argv.extend(args.iter().cloned());

        let stdio = |stream| {
            Box::new(StdioFile {
                io: io.clone(),
                stream,
            })
        };
        let wasi = WasiCtxBuilder::new()
            .args(&argv)
            .map_err(|e| Error::trap(e.into()))?
            .env("PWD", &cwd)
            .map_err(|e| Error::trap(e.into()))?
            .stdin(stdio(Stdio::In))
            .stdout(stdio(Stdio::Out))
            .stderr(stdio(Stdio::Err))
            .build();
        wasi.push_preopened_dir(Box::new(MemDir::new(fs.clone(), cwd)), ".")?;
        wasi.push_preopened_dir(Box::new(MemDir::new(fs, "/")), "/")?;

        Ok(Self {
            wasi,
            limiter: StoreLimiter::new(max_memory),
        })
    }
}

/// Link both WASI snapshots against [`WasiState`].
pub(crate) fn add_to_linker(linker: &mut Linker<WasiState>) -> anyhow::Result<()> {
    wasi_common::sync::add_to_linker(linker, |state: &mut WasiState| &mut state.wasi)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn errno(err: &Error) -> Option<Errno> {
        err.downcast_ref().copied()
    }

    async fn open(dir: &MemDir, path: &str, oflags: OFlags, write: bool) -> Result<OpenResult, Error> {
        dir.open_file(true, path, oflags, true, write, FdFlags::empty())
            .await
    }

    fn data_dir() -> MemDir {
        let fs = MemFs::new();
        fs.mkdir_all("/shared/data").unwrap();
        fs.write_file("/shared/data/in.txt", b"abcdef").unwrap();
        fs.symlink("/shared/data/in.txt", "/shared/data/link").unwrap();
        MemDir::new(fs, "/shared/data")
    }

    #[tokio::test]
    async fn test_open_read_seek_and_write() {
        let dir = data_dir();
        let OpenResult::File(file) = open(&dir, "in.txt", OFlags::empty(), true).await.unwrap() else {
            panic!("expected a file");
        };

        let mut buf = [0u8; 4];
        let n = file.read_vectored(&mut [IoSliceMut::new(&mut buf)]).await.unwrap();
        assert_eq!(&buf[..n as usize], b"abcd");
        assert_eq!(file.seek(SeekFrom::End(-1)).await.unwrap(), 5);
        file.write_vectored(&[IoSlice::new(b"F!")]).await.unwrap();
        assert_eq!(dir.fs.read_file("/shared/data/in.txt").unwrap(), b"abcdeF!");

        assert_eq!(file.get_filestat().await.unwrap().size, 7);
        assert!(file.seek(SeekFrom::Current(-100)).await.is_err());
    }

    #[tokio::test]
    async fn test_open_flags_map_to_errnos() {
        let dir = data_dir();
        let missing = open(&dir, "nope.txt", OFlags::empty(), false).await.err().unwrap();
        assert_eq!(errno(&missing), Some(Errno::Noent));

        let exists = open(&dir, "in.txt", OFlags::CREATE | OFlags::EXCLUSIVE, true).await.err().unwrap();
        assert_eq!(errno(&exists), Some(Errno::Exist));

        let not_dir = open(&dir, "in.txt", OFlags::DIRECTORY, false).await.err().unwrap();
        assert_eq!(errno(&not_dir), Some(Errno::Notdir));

        let is_dir = open(&dir, "..", OFlags::empty(), true).await.err().unwrap();
        assert_eq!(errno(&is_dir), Some(Errno::Isdir));

        assert!(matches!(open(&dir, "..", OFlags::DIRECTORY, false).await.unwrap(), OpenResult::Dir(_)));
        assert!(matches!(
            open(&dir, "out.txt", OFlags::CREATE, true).await.unwrap(),
            OpenResult::File(_)
        ));
        assert!(dir.fs.exists("/shared/data/out.txt"));

        let nofollow = dir
            .open_file(false, "link", OFlags::empty(), true, false, FdFlags::empty())
            .await
            .err()
            .unwrap();
        assert_eq!(errno(&nofollow), Some(Errno::Loop));
    }

    #[tokio::test]
    async fn test_readdir_resumes_from_cursor() {
        let dir = data_dir();
        let names = |cursor: u64| {
            let dir = &dir;
            async move {
                dir.readdir(ReaddirCursor::from(cursor))
                    .await
                    .unwrap()
                    .map(|e| e.unwrap().name)
                    .collect::<Vec<_>>()
            }
        };
        assert_eq!(names(0).await, vec![".", "..", "in.txt", "link"]);
        assert_eq!(names(3).await, vec!["link"]);
        assert!(names(10).await.is_empty());
    }

    #[tokio::test]
    async fn test_directory_operations() {
        let dir = data_dir();
        dir.create_dir("sub").await.unwrap();
        let root = MemDir::new(dir.fs.clone(), "/");
        dir.rename("in.txt", &root, "shared/data/sub/moved.txt").await.unwrap();
        assert_eq!(dir.fs.read_file("/shared/data/sub/moved.txt").unwrap(), b"abcdef");

        let not_empty = dir.remove_dir("sub").await.err().unwrap();
        assert_eq!(errno(&not_empty), Some(Errno::Notempty));
        dir.unlink_file("sub/moved.txt").await.unwrap();
        dir.remove_dir("sub").await.unwrap();

        assert_eq!(
            dir.read_link("link").await.unwrap(),
            PathBuf::from("/shared/data/in.txt")
        );
        let stat = dir.get_path_filestat("link", false).await.unwrap();
        assert_eq!(stat.filetype, FileType::SymbolicLink);

        let other = MemDir::new(MemFs::new(), "/");
        dir.create_dir("x").await.unwrap();
        let xdev = dir.rename("x", &other, "x").await.err().unwrap();
        assert_eq!(errno(&xdev), Some(Errno::Xdev));
    }

    #[test]
    fn test_size_errors_map_to_fbig() {
        let err = fs_error(FsError::TooLarge("/big".into()));
        assert_eq!(errno(&err), Some(Errno::Fbig));
    }
}
