//! Tool lifecycle management.
//!
//! Each declared tool becomes a [`ToolInstance`] moving through
//! `unready → (lazy-pending | loading) → ready`. A tool declared with
//! `reinit` is torn down after every invocation and rebuilt from its
//! original declaration.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use crate::executor::{OutputCapture, StdStreams, StreamEvent};
use crate::federation::Federator;
use crate::probe::{Feature, FeatureProbe};
use crate::program::{Instantiated, ModuleLoader, NativeProgram, ToolModule};
use crate::registry::{self, CapabilityTable, Loading, ResolvedTool, SessionConfig, ToolConfig};
use crate::runtime::RuntimeError;
use crate::vfs::MemFs;

/// Lifecycle state of a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    /// Not set up
    Unready,
    /// Lazy tool waiting for its first invocation
    LazyPending,
    /// Code is being loaded
    Loading,
    /// Loaded, instantiated and federated
    Ready,
}

/// Observable status of a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolStatus {
    /// Tool name
    pub tool: String,
    /// Program name, including any feature suffix once resolved
    pub program: String,
    /// Lifecycle state
    pub state: ToolState,
    /// Whether the tool can run
    pub ready: bool,
    /// Whether this is the base module
    pub base: bool,
    /// Features of the selected variant
    pub features: Vec<Feature>,
}

pub(crate) struct Loaded {
    pub(crate) program: Box<dyn NativeProgram>,
    pub(crate) fs: MemFs,
    pub(crate) streams: StdStreams,
}

/// One declared tool and, once ready, its running instance.
pub struct ToolInstance {
    snapshot: ToolConfig,
    pub(crate) config: ToolConfig,
    pub(crate) state: ToolState,
    pub(crate) is_base: bool,
    pub(crate) resolved: Option<ResolvedTool>,
    /// Compiled code, kept across teardown so reinit only re-instantiates.
    module: Option<Arc<dyn ToolModule>>,
    pub(crate) loaded: Option<Loaded>,
    pub(crate) capture: OutputCapture,
}

impl std::fmt::Debug for ToolInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolInstance")
            .field("tool", &self.config.tool)
            .field("state", &self.state)
            .field("is_base", &self.is_base)
            .finish_non_exhaustive()
    }
}

impl ToolInstance {
    /// Unready instance for `config`. The config is kept as the snapshot
    /// restored on reinit.
    pub fn new(config: ToolConfig) -> Self {
        Self {
            snapshot: config.clone(),
            config,
            state: ToolState::Unready,
            is_base: false,
            resolved: None,
            module: None,
            loaded: None,
            capture: OutputCapture::default(),
        }
    }

    /// Working configuration.
    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    /// Lifecycle state.
    pub fn state(&self) -> ToolState {
        self.state
    }

    /// Whether the tool can run.
    pub fn is_ready(&self) -> bool {
        self.state == ToolState::Ready
    }

    /// Whether this is the base module.
    pub fn is_base(&self) -> bool {
        self.is_base
    }

    /// Private filesystem, once ready.
    pub fn fs(&self) -> Option<&MemFs> {
        self.loaded.as_ref().map(|l| &l.fs)
    }

    /// Whether `name` invokes this tool: the declared program name or the
    /// resolved (possibly suffixed) one.
    pub fn matches(&self, name: &str) -> bool {
        self.config.program_name() == name
            || self.resolved.as_ref().is_some_and(|r| r.program == name)
    }

    /// Status snapshot.
    pub fn status(&self) -> ToolStatus {
        ToolStatus {
            tool: self.config.tool.clone(),
            program: self
                .resolved
                .as_ref()
                .map(|r| r.program.clone())
                .unwrap_or_else(|| self.config.program_name().to_string()),
            state: self.state,
            ready: self.is_ready(),
            base: self.is_base,
            features: self
                .resolved
                .as_ref()
                .map(|r| r.features.clone())
                .unwrap_or_default(),
        }
    }

    pub(crate) fn teardown(&mut self) {
        self.loaded = None;
        self.resolved = None;
        self.state = ToolState::Unready;
    }
}

/// Everything `setup` needs besides the instance and the federator.
struct SetupEnv {
    session: SessionConfig,
    loader: Arc<dyn ModuleLoader>,
    probe: Arc<dyn FeatureProbe>,
    capabilities: CapabilityTable,
    events: Option<UnboundedSender<StreamEvent>>,
    load_lock: Mutex<()>,
}

/// Bring one tool to ready, or leave a lazy non-base tool pending. A no-op
/// for tools that are already ready.
async fn setup(
    inst: &mut ToolInstance,
    env: &SetupEnv,
    federator: &Federator,
    base_fs: Option<&MemFs>,
) -> Result<(), RuntimeError> {
    if inst.is_ready() {
        return Ok(());
    }
    let resolved = inst
        .config
        .resolve(&env.session, &env.capabilities, env.probe.as_ref());
    inst.resolved = Some(resolved.clone());

    if inst.config.loading == Loading::Lazy && !inst.is_base {
        tracing::debug!(tool = %resolved.tool, "deferring lazy tool");
        inst.state = ToolState::LazyPending;
        return Ok(());
    }

    inst.state = ToolState::Loading;
    match load_and_federate(inst, &resolved, env, federator, base_fs).await {
        Ok(loaded) => {
            inst.loaded = Some(loaded);
            inst.state = ToolState::Ready;
            tracing::info!(
                tool = %resolved.tool,
                program = %resolved.program,
                base = inst.is_base,
                "tool ready"
            );
            Ok(())
        }
        Err(e) => {
            inst.state = ToolState::Unready;
            Err(e)
        }
    }
}

async fn load_and_federate(
    inst: &mut ToolInstance,
    resolved: &ResolvedTool,
    env: &SetupEnv,
    federator: &Federator,
    base_fs: Option<&MemFs>,
) -> Result<Loaded, RuntimeError> {
    let module = match inst.module.clone() {
        Some(module) => module,
        None => {
            // One load in flight at a time.
            let _guard = env.load_lock.lock().await;
            tracing::debug!(tool = %resolved.tool, url = %resolved.url_prefix, "loading tool code");
            let module = env.loader.load(resolved).await?;
            inst.module = Some(Arc::clone(&module));
            module
        }
    };
    let Instantiated { program, fs } = module.instantiate()?;

    let events = if env.session.print_stream {
        env.events.clone()
    } else {
        None
    };
    inst.capture = OutputCapture::new(
        resolved.tool.clone(),
        env.session.print_interleaved,
        env.session.limits.max_output_bytes as usize,
        events,
    );

    if inst.is_base {
        federator.create_namespace(&fs)?;
    } else if let Some(base) = base_fs {
        federator.attach(&fs, base)?;
    }

    Ok(Loaded {
        program,
        fs,
        streams: StdStreams::open(),
    })
}

/// Owns every tool instance and the federator.
pub struct LifecycleManager {
    env: SetupEnv,
    federator: Federator,
    tools: Vec<ToolInstance>,
    base: Option<usize>,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("tools", &self.tools)
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    /// Manager for `tools`. Nothing is validated or loaded until `init`.
    pub(crate) fn new(
        tools: Vec<ToolConfig>,
        session: SessionConfig,
        loader: Arc<dyn ModuleLoader>,
        probe: Arc<dyn FeatureProbe>,
        capabilities: CapabilityTable,
        federator: Federator,
        events: Option<UnboundedSender<StreamEvent>>,
    ) -> Self {
        Self {
            env: SetupEnv {
                session,
                loader,
                probe,
                capabilities,
                events,
                load_lock: Mutex::new(()),
            },
            federator,
            tools: tools.into_iter().map(ToolInstance::new).collect(),
            base: None,
        }
    }

    /// All instances in declaration order.
    pub fn tools(&self) -> &[ToolInstance] {
        &self.tools
    }

    /// Instance at `idx`.
    pub fn tool(&self, idx: usize) -> Option<&ToolInstance> {
        self.tools.get(idx)
    }

    pub(crate) fn tool_mut(&mut self, idx: usize) -> Option<&mut ToolInstance> {
        self.tools.get_mut(idx)
    }

    /// Index of the first tool invoked by `name`.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.tools.iter().position(|t| t.matches(name))
    }

    /// The base module's filesystem, once ready.
    pub fn base_fs(&self) -> Option<&MemFs> {
        self.base
            .and_then(|idx| self.tools.get(idx))
            .and_then(ToolInstance::fs)
    }

    /// The federator.
    pub fn federator(&self) -> &Federator {
        &self.federator
    }

    pub(crate) fn federator_mut(&mut self) -> &mut Federator {
        &mut self.federator
    }

    /// Whether `init` has selected a base module.
    pub fn is_initialized(&self) -> bool {
        self.base.is_some()
    }

    /// Two-phase init: validate, select and set up the base module, then
    /// set up everything else.
    pub async fn init(&mut self) -> Result<(), RuntimeError> {
        let configs: Vec<ToolConfig> = self.tools.iter().map(|t| t.config.clone()).collect();
        registry::validate(&configs)?;
        let base = registry::select_base(&configs)?;
        for (idx, tool) in self.tools.iter_mut().enumerate() {
            tool.is_base = idx == base;
        }
        self.base = Some(base);

        setup(&mut self.tools[base], &self.env, &self.federator, None).await?;
        self.init_modules().await
    }

    /// Set up every tool concurrently, then cross-mount sample data.
    pub async fn init_modules(&mut self) -> Result<(), RuntimeError> {
        let base_fs = self.base_fs().cloned();
        let env = &self.env;
        let federator = &self.federator;
        let results = join_all(
            self.tools
                .iter_mut()
                .map(|inst| setup(inst, env, federator, base_fs.as_ref())),
        )
        .await;

        let mut first_error = None;
        for (inst, result) in self.tools.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(tool = %inst.config.tool, error = %e, "tool setup failed");
                first_error.get_or_insert(e);
            }
        }
        self.cross_mount()?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn cross_mount(&self) -> Result<(), RuntimeError> {
        let Some(base) = self.base_fs() else {
            return Ok(());
        };
        let ready = self
            .tools
            .iter()
            .filter_map(|t| Some((t.config.tool.as_str(), t.fs()?)));
        self.federator.cross_mount_samples(base, ready)?;
        Ok(())
    }

    /// Make a lazy tool eager so the next `init_modules` loads it.
    pub(crate) fn promote(&mut self, idx: usize) {
        if let Some(tool) = self.tools.get_mut(idx) {
            tool.config.loading = Loading::Eager;
            if tool.state == ToolState::LazyPending {
                tool.state = ToolState::Unready;
            }
        }
    }

    /// Tear down and rebuild the tool at `idx` from its snapshot, keeping
    /// the working directory it had.
    pub async fn reinit(&mut self, idx: usize) -> Result<(), RuntimeError> {
        let Some(inst) = self.tools.get_mut(idx) else {
            return Err(RuntimeError::NotFound(format!("tool #{idx}")));
        };
        let cwd = inst.fs().map(MemFs::cwd);
        let was_base = inst.is_base;
        let name = inst.config.tool.clone();
        inst.config = inst.snapshot.clone();
        inst.teardown();
        tracing::debug!(tool = %name, "reinitializing tool");

        if !was_base && let Some(base) = self.base_fs() {
            self.federator.detach_samples(base, &name)?;
        }

        self.init().await?;

        if was_base {
            let base = self.base_fs().cloned().ok_or_else(|| {
                RuntimeError::Configuration("base module did not come back after reinit".into())
            })?;
            self.federator.replay(&base)?;
            for tool in self.tools.iter().filter(|t| !t.is_base) {
                if let Some(fs) = tool.fs() {
                    self.federator.attach(fs, &base)?;
                }
            }
        }

        if let Some(cwd) = cwd {
            for tool in &self.tools {
                if let Some(fs) = tool.fs()
                    && let Err(e) = fs.chdir(&cwd)
                {
                    tracing::warn!(
                        tool = %tool.config.tool,
                        %cwd,
                        error = %e,
                        "could not restore working directory"
                    );
                }
            }
        }
        Ok(())
    }

    /// Status of every tool.
    pub fn status(&self) -> Vec<ToolStatus> {
        self.tools.iter().map(ToolInstance::status).collect()
    }
}
