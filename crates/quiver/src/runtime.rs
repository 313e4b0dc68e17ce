//! Runtime context: one session of federated tools

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::executor::{self, ExecOutput, StdinBuffer, StreamEvent};
use crate::federation::{self, Federator, MountEntry};
use crate::lifecycle::{LifecycleManager, ToolStatus};
use crate::probe::{FeatureProbe, HostFeatureProbe};
use crate::program::ModuleLoader;
use crate::registry::{CapabilityTable, Declaration, SessionConfig, ToolConfig};
use crate::vfs::{FsError, HttpRangeFetcher, MemFs, Metadata, OpenFlags, RangeFetcher};
use crate::wasm::WasmLoader;

/// Errors that can occur while driving a session
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Invalid tool declaration or call sequence
    #[error("configuration error: {0}")]
    Configuration(String),
    /// No tool answers to the requested program name
    #[error("not found: {0}")]
    NotFound(String),
    /// `mount` was given a shape it does not understand
    #[error("unsupported input: {0}")]
    UnsupportedInput(String),
    /// Tool code could not be fetched or compiled
    #[error("failed to load {tool}: {message}")]
    Load {
        /// Tool name
        tool: String,
        /// What went wrong
        message: String,
    },
    /// Error from the WASM runtime
    #[error("WASM error: {0}")]
    Wasm(String),
    /// Filesystem error
    #[error("filesystem error: {0}")]
    Fs(#[from] FsError),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The worker owning the runtime has stopped
    #[error("worker closed")]
    WorkerClosed,
}

impl RuntimeError {
    /// Stable machine-readable kind, as reported over RPC.
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::Configuration(_) => "configuration",
            RuntimeError::NotFound(_) => "not_found",
            RuntimeError::UnsupportedInput(_) => "unsupported_input",
            RuntimeError::Load { .. } => "load",
            RuntimeError::Wasm(_) => "wasm",
            RuntimeError::Fs(_) => "fs",
            RuntimeError::Io(_) => "io",
            RuntimeError::WorkerClosed => "worker_closed",
        }
    }
}

/// Result of [`Runtime::ls`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Listing {
    /// Directory entries, including `.` and `..`
    Entries(Vec<String>),
    /// Metadata of a single file
    File(Metadata),
}

/// Result of [`Runtime::download`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Download {
    /// Base name of the file
    pub name: String,
    /// File content
    pub bytes: Vec<u8>,
}

fn default_read_flag() -> String {
    "r".to_string()
}

fn default_write_flag() -> String {
    "w+".to_string()
}

/// Arguments of [`Runtime::read`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    /// File to read
    pub path: String,
    /// Maximum number of bytes
    pub length: u64,
    /// Position in the file to start at
    #[serde(default)]
    pub offset: u64,
    /// Open mode
    #[serde(default = "default_read_flag")]
    pub flag: String,
}

/// Arguments of [`Runtime::write`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// File to write
    pub path: String,
    /// Bytes to write
    pub buffer: Vec<u8>,
    /// Write only the first `length` bytes of `buffer`
    #[serde(default)]
    pub length: Option<u64>,
    /// Position in the file to start at
    #[serde(default)]
    pub offset: u64,
    /// Open mode
    #[serde(default = "default_write_flag")]
    pub flag: String,
}

/// Builder for [`Runtime`].
pub struct RuntimeBuilder {
    tools: Vec<ToolConfig>,
    session: SessionConfig,
    loader: Option<Arc<dyn ModuleLoader>>,
    probe: Option<Arc<dyn FeatureProbe>>,
    capabilities: CapabilityTable,
    fetcher: Option<Arc<dyn RangeFetcher>>,
    events: Option<UnboundedSender<StreamEvent>>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("tools", &self.tools)
            .field("session", &self.session)
            .field("loader", &self.loader)
            .finish_non_exhaustive()
    }
}

impl RuntimeBuilder {
    /// Empty builder: no tools, default session settings, WASM loader.
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            session: SessionConfig::default(),
            loader: None,
            probe: None,
            capabilities: CapabilityTable::default(),
            fetcher: None,
            events: None,
        }
    }

    /// Declare one more tool.
    pub fn tool(mut self, tool: ToolConfig) -> Self {
        self.tools.push(tool);
        self
    }

    /// Declare several tools, in order.
    pub fn tools(mut self, tools: impl IntoIterator<Item = ToolConfig>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Take tools and session settings from a declaration.
    pub fn declaration(mut self, declaration: Declaration) -> Self {
        self.tools.extend(declaration.tools);
        self.session = declaration.config;
        self
    }

    /// Session settings.
    pub fn session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Load tool code with `loader` instead of the WASM loader.
    pub fn loader(mut self, loader: impl ModuleLoader + 'static) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }

    /// Probe optional features with `probe` instead of inspecting the host.
    pub fn probe(mut self, probe: impl FeatureProbe + 'static) -> Self {
        self.probe = Some(Arc::new(probe));
        self
    }

    /// Replace the table of programs with feature variants.
    pub fn capabilities(mut self, capabilities: CapabilityTable) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Fetch lazy files through `fetcher` instead of HTTP.
    pub fn fetcher(mut self, fetcher: impl RangeFetcher + 'static) -> Self {
        self.fetcher = Some(Arc::new(fetcher));
        self
    }

    /// Forward output line by line to `events` when `printStream` is set.
    pub fn stream_events(mut self, events: UnboundedSender<StreamEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the runtime. Nothing is validated or loaded until
    /// [`Runtime::init`].
    pub fn build(self) -> Result<Runtime, RuntimeError> {
        let fetcher: Arc<dyn RangeFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpRangeFetcher::new()),
        };
        let loader: Arc<dyn ModuleLoader> = match self.loader {
            Some(loader) => loader,
            None => Arc::new(WasmLoader::new(&self.session.limits, Arc::clone(&fetcher))?),
        };
        let probe: Arc<dyn FeatureProbe> = match self.probe {
            Some(probe) => probe,
            None => Arc::new(HostFeatureProbe),
        };
        let federator = Federator::new(&self.session, fetcher);
        let manager = LifecycleManager::new(
            self.tools,
            self.session.clone(),
            loader,
            probe,
            self.capabilities,
            federator,
            self.events,
        );
        Ok(Runtime {
            manager,
            session: self.session,
            stdin: StdinBuffer::default(),
        })
    }
}

/// A session: the declared tools, their federated filesystem and the
/// shared stdin buffer.
///
/// Every operation takes `&mut self` or `&self`, so calls on one runtime
/// are serialized. Use [`crate::rpc::spawn_worker`] to drive it from
/// concurrent callers.
pub struct Runtime {
    manager: LifecycleManager,
    session: SessionConfig,
    stdin: StdinBuffer,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("manager", &self.manager)
            .field("stdin", &self.stdin.text())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Start configuring a runtime.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Session settings.
    pub fn session(&self) -> &SessionConfig {
        &self.session
    }

    /// Validate the declaration, load the base module, then every eager
    /// tool.
    pub async fn init(&mut self) -> Result<bool, RuntimeError> {
        self.manager.init().await?;
        tracing::info!(
            tools = self.manager.tools().len(),
            shared = %self.manager.federator().shared_dir(),
            "session initialized"
        );
        Ok(true)
    }

    fn base_fs(&self) -> Option<&MemFs> {
        self.manager.base_fs()
    }

    fn require_base(&self) -> Result<MemFs, RuntimeError> {
        self.base_fs().cloned().ok_or_else(|| {
            RuntimeError::Configuration("the session has not been initialized".to_string())
        })
    }

    /// Mount files described by a JSON value: a URL string, `{name, data}`,
    /// `{name?, url}`, `{name?, path}` or an array of those.
    pub fn mount(&mut self, files: &Value) -> Result<Vec<String>, RuntimeError> {
        let entries = federation::classify(files)?;
        self.mount_entries(entries)
    }

    /// Mount already-classified entries. Returns their paths under the data
    /// directory.
    pub fn mount_entries(&mut self, entries: Vec<MountEntry>) -> Result<Vec<String>, RuntimeError> {
        if let Some(bad) = entries
            .iter()
            .find(|e| e.name().is_empty() || e.name().contains('/'))
        {
            return Err(RuntimeError::UnsupportedInput(format!(
                "invalid file name {:?}",
                bad.name()
            )));
        }
        let base = self.require_base()?;
        let paths = self.manager.federator_mut().mount(&base, entries)?;
        tracing::debug!(?paths, "mounted files");
        Ok(paths)
    }

    /// Run a command. Without `args`, `command` is split on whitespace and
    /// its first word names the program.
    pub async fn exec(
        &mut self,
        command: &str,
        args: Option<Vec<String>>,
    ) -> Result<ExecOutput, RuntimeError> {
        if !self.manager.is_initialized() {
            return Err(RuntimeError::Configuration(
                "call init() before exec()".to_string(),
            ));
        }
        let (program, args) = executor::parse_command(command, args)?;
        let idx = self
            .manager
            .find(&program)
            .ok_or_else(|| RuntimeError::NotFound(format!("program {program:?} not found")))?;

        if !self.manager.tool(idx).is_some_and(|t| t.is_ready()) {
            tracing::debug!(%program, "activating lazy tool");
            self.manager.promote(idx);
            if let Err(e) = self.manager.init_modules().await {
                if !self.manager.tool(idx).is_some_and(|t| t.is_ready()) {
                    return Err(e);
                }
                tracing::warn!(error = %e, "another tool failed to initialize");
            }
        }

        let inst = self
            .manager
            .tool_mut(idx)
            .ok_or_else(|| RuntimeError::NotFound(format!("tool #{idx}")))?;
        let output = executor::invoke(inst, &args, &mut self.stdin).await?;

        if inst.config().reinit {
            self.manager.reinit(idx).await?;
        }
        Ok(output)
    }

    /// List a directory, or describe a file. `None` if the path is missing.
    pub fn ls(&self, path: &str) -> Option<Listing> {
        self.view().ls(path)
    }

    /// File content as text. `None` if the file is missing.
    pub fn cat(&self, path: &str) -> Option<String> {
        self.view().cat(path)
    }

    /// File content for handing to the caller. `None` if the file is
    /// missing.
    pub fn download(&self, path: &str) -> Option<Download> {
        self.view().download(path)
    }

    /// Change directory in every ready tool.
    pub fn cd(&self, path: &str) -> Result<(), RuntimeError> {
        let base = self.require_base()?;
        let target = crate::vfs::normalize(&base.cwd(), path);
        base.chdir(&target)?;
        for tool in self.manager.tools().iter().filter(|t| !t.is_base()) {
            if let Some(fs) = tool.fs()
                && let Err(e) = fs.chdir(&target)
            {
                tracing::warn!(tool = %tool.config().tool, path = %target, error = %e, "cd failed");
            }
        }
        Ok(())
    }

    /// Working directory of the base module.
    pub fn pwd(&self) -> Option<String> {
        self.base_fs().map(MemFs::cwd)
    }

    /// Create a directory. `false` if it could not be created.
    pub fn mkdir(&self, path: &str) -> bool {
        let Some(fs) = self.base_fs() else {
            return false;
        };
        match fs.mkdir(path) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(%path, error = %e, "mkdir failed");
                false
            }
        }
    }

    /// Read up to `length` bytes at `offset`.
    pub fn read(&self, request: &ReadRequest) -> Result<Vec<u8>, RuntimeError> {
        self.view().read(request)
    }

    /// Write `buffer` (or its first `length` bytes) at `offset`.
    pub fn write(&self, request: &WriteRequest) -> Result<(), RuntimeError> {
        self.view().write(request)
    }

    /// Detached handle on the base filesystem. Reads of lazy files fetch
    /// over the network, so the RPC worker runs these on a blocking thread.
    pub(crate) fn view(&self) -> FsView {
        FsView {
            base: self.base_fs().cloned(),
        }
    }

    /// Text fed to the next invocation's standard input.
    pub fn set_stdin(&mut self, text: impl Into<String>) {
        self.stdin.set(text);
    }

    /// Pending standard input.
    pub fn stdin(&self) -> &str {
        self.stdin.text()
    }

    /// Status of every declared tool.
    pub fn tools(&self) -> Vec<ToolStatus> {
        self.manager.status()
    }

    /// The lifecycle manager.
    pub fn manager(&self) -> &LifecycleManager {
        &self.manager
    }
}

/// File calls on the base module's filesystem.
#[derive(Debug, Clone)]
pub(crate) struct FsView {
    base: Option<MemFs>,
}

impl FsView {
    fn require_base(&self) -> Result<&MemFs, RuntimeError> {
        self.base.as_ref().ok_or_else(|| {
            RuntimeError::Configuration("the session has not been initialized".to_string())
        })
    }

    pub(crate) fn ls(&self, path: &str) -> Option<Listing> {
        let fs = self.base.as_ref()?;
        let meta = fs.stat(path).ok()?;
        if meta.is_dir() {
            fs.readdir(path).ok().map(Listing::Entries)
        } else {
            Some(Listing::File(meta))
        }
    }

    pub(crate) fn cat(&self, path: &str) -> Option<String> {
        let bytes = self.base.as_ref()?.read_file(path).ok()?;
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub(crate) fn download(&self, path: &str) -> Option<Download> {
        let bytes = self.base.as_ref()?.read_file(path).ok()?;
        let (_, name) = crate::vfs::split_parent(&crate::vfs::normalize("/", path));
        Some(Download { name, bytes })
    }

    pub(crate) fn read(&self, request: &ReadRequest) -> Result<Vec<u8>, RuntimeError> {
        let fs = self.require_base()?;
        let mut handle = fs.open(&request.path, OpenFlags::parse(&request.flag)?)?;
        handle.seek(request.offset)?;
        let bytes = handle.read(request.length)?;
        handle.close()?;
        Ok(bytes)
    }

    pub(crate) fn write(&self, request: &WriteRequest) -> Result<(), RuntimeError> {
        let fs = self.require_base()?;
        let len = request
            .length
            .map_or(request.buffer.len(), |l| {
                usize::try_from(l).unwrap_or(usize::MAX).min(request.buffer.len())
            });
        let mut handle = fs.open(&request.path, OpenFlags::parse(&request.flag)?)?;
        handle.seek(request.offset)?;
        handle.write(&request.buffer[..len])?;
        handle.close()?;
        Ok(())
    }
}
