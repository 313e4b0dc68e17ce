//! Contracts between the runtime and loaded tool code.
//!
//! A [`ModuleLoader`] turns a [`ResolvedTool`] into a [`ToolModule`] (compiled
//! code plus bundled assets). Each [`ToolModule::instantiate`] yields a fresh
//! [`NativeProgram`] together with its private [`MemFs`]. Programs talk to
//! the outside world only through [`ProgramIo`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::executor::{OutputCapture, StdStreams, StdinBuffer, StreamKind};
use crate::registry::ResolvedTool;
use crate::runtime::RuntimeError;
use crate::vfs::{FsError, MemFs};

/// Failure raised inside a program invocation
#[derive(Debug, Error)]
pub enum ProgramError {
    /// The program trapped or aborted
    #[error("program trapped: {0}")]
    Trap(String),
    /// Write to a stream that is closed
    #[error("{0:?} is closed")]
    StreamClosed(StreamKind),
    /// Filesystem error surfaced by the program
    #[error("filesystem error: {0}")]
    Fs(#[from] FsError),
    /// Any other failure
    #[error("{0}")]
    Failed(String),
}

/// A freshly instantiated runtime and its private filesystem.
pub struct Instantiated {
    /// Callable entrypoint
    pub program: Box<dyn NativeProgram>,
    /// Filesystem the program sees
    pub fs: MemFs,
}

impl std::fmt::Debug for Instantiated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instantiated")
            .field("program", &self.program)
            .field("fs", &self.fs)
            .finish()
    }
}

/// Loads tool code.
#[async_trait]
pub trait ModuleLoader: Send + Sync + std::fmt::Debug {
    /// Fetch and compile the code for `tool`.
    async fn load(&self, tool: &ResolvedTool) -> Result<Arc<dyn ToolModule>, RuntimeError>;
}

/// Loaded tool code that can be instantiated any number of times.
pub trait ToolModule: Send + Sync + std::fmt::Debug {
    /// Create a new runtime with fresh global state and filesystem.
    fn instantiate(&self) -> Result<Instantiated, RuntimeError>;
}

/// An instantiated program.
pub trait NativeProgram: Send + std::fmt::Debug {
    /// Run the entrypoint. `args` excludes the program name. Returns the
    /// exit code.
    fn call_main(&mut self, args: &[String], io: &mut ProgramIo) -> Result<i32, ProgramError>;
}

/// Everything a program may touch during one invocation: its filesystem,
/// its standard streams and the shared stdin buffer.
///
/// The executor moves the pieces in before the call and takes them back
/// afterwards with [`ProgramIo::into_parts`].
#[derive(Debug, Default)]
pub struct ProgramIo {
    fs: MemFs,
    streams: StdStreams,
    stdin: StdinBuffer,
    capture: OutputCapture,
}

impl ProgramIo {
    /// Assemble the I/O for one invocation.
    pub fn new(fs: MemFs, streams: StdStreams, stdin: StdinBuffer, capture: OutputCapture) -> Self {
        Self {
            fs,
            streams,
            stdin,
            capture,
        }
    }

    /// Split back into streams, stdin buffer and capture.
    pub fn into_parts(self) -> (StdStreams, StdinBuffer, OutputCapture) {
        (self.streams, self.stdin, self.capture)
    }

    /// The program's filesystem.
    pub fn fs(&self) -> &MemFs {
        &self.fs
    }

    /// Write to standard output.
    pub fn write_stdout(&mut self, data: &[u8]) -> Result<usize, ProgramError> {
        self.streams
            .write(StreamKind::Stdout, data, &mut self.capture)
    }

    /// Write to standard error.
    pub fn write_stderr(&mut self, data: &[u8]) -> Result<usize, ProgramError> {
        self.streams
            .write(StreamKind::Stderr, data, &mut self.capture)
    }

    /// Read up to `max` bytes of standard input.
    pub fn read_stdin(&mut self, max: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.stdin.next_byte() {
                Some(byte) => out.push(byte),
                None => break,
            }
        }
        out
    }
}

type ProgramFn = dyn Fn(&[String], &mut ProgramIo) -> Result<i32, ProgramError> + Send + Sync;

/// A tool implemented as a Rust closure, with optional bundled assets.
#[derive(Clone)]
pub struct FnModule {
    main: Arc<ProgramFn>,
    assets: Vec<(String, Vec<u8>)>,
}

impl std::fmt::Debug for FnModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnModule")
            .field(
                "assets",
                &self.assets.iter().map(|(p, _)| p).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl FnModule {
    /// Module whose entrypoint is `main`.
    pub fn new(
        main: impl Fn(&[String], &mut ProgramIo) -> Result<i32, ProgramError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            main: Arc::new(main),
            assets: Vec::new(),
        }
    }

    /// Bundle a file that appears at the absolute `path` of every instance.
    pub fn with_asset(mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.assets.push((path.into(), bytes.into()));
        self
    }
}

impl ToolModule for FnModule {
    fn instantiate(&self) -> Result<Instantiated, RuntimeError> {
        let fs = MemFs::new();
        for (path, bytes) in &self.assets {
            let (parent, _) = crate::vfs::split_parent(path);
            fs.mkdir_all(&parent)?;
            fs.write_file(path, bytes)?;
        }
        Ok(Instantiated {
            program: Box::new(FnProgram {
                main: Arc::clone(&self.main),
            }),
            fs,
        })
    }
}

struct FnProgram {
    main: Arc<ProgramFn>,
}

impl std::fmt::Debug for FnProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnProgram").finish_non_exhaustive()
    }
}

impl NativeProgram for FnProgram {
    fn call_main(&mut self, args: &[String], io: &mut ProgramIo) -> Result<i32, ProgramError> {
        (self.main)(args, io)
    }
}

/// Loader serving pre-built modules keyed by program name.
///
/// A feature variant (`ssw-simd`) falls back to the module registered for
/// the plain program name.
#[derive(Debug, Default, Clone)]
pub struct StaticLoader {
    modules: HashMap<String, Arc<dyn ToolModule>>,
}

impl StaticLoader {
    /// Empty loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `module` under `program`.
    pub fn with_module(mut self, program: impl Into<String>, module: impl ToolModule + 'static) -> Self {
        self.modules.insert(program.into(), Arc::new(module));
        self
    }
}

#[async_trait]
impl ModuleLoader for StaticLoader {
    async fn load(&self, tool: &ResolvedTool) -> Result<Arc<dyn ToolModule>, RuntimeError> {
        self.modules
            .get(&tool.program)
            .or_else(|| self.modules.get(&tool.base_program))
            .cloned()
            .ok_or_else(|| RuntimeError::Load {
                tool: tool.tool.clone(),
                message: format!("no module registered for program {:?}", tool.program),
            })
    }
}
