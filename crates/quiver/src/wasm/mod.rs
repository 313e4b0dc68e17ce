//! WebAssembly backend for tools (wasip1 core modules).
//!
//! [`WasmLoader`] fetches `<urlPrefix>/<program>.wasm`, compiles it once and
//! pre-links it against `wasi-common` (`InstancePre`), with the instance's
//! [`MemFs`] behind the WASI directory traits in [`wasi`]. Every
//! invocation then only creates a fresh `Store`, so each run starts from
//! clean global state while the compiled code is shared.

mod wasi;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use wasi_common::I32Exit;
use wasmtime::{Config, Engine, InstancePre, Linker, Module, Store};

use crate::limits::ResourceLimits;
use crate::program::{Instantiated, ModuleLoader, NativeProgram, ProgramError, ProgramIo, ToolModule};
use crate::registry::ResolvedTool;
use crate::runtime::RuntimeError;
use crate::vfs::{self, MemFs, RangeFetcher};

use self::wasi::{SharedIo, WasiState};

/// Where a tool's files live.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Location {
    Local(PathBuf),
    Remote(String),
}

impl Location {
    fn parse(prefix: &str) -> Result<Self, String> {
        match url::Url::parse(prefix) {
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map(Location::Local)
                .map_err(|()| format!("invalid file URL {prefix:?}")),
            Ok(url) if matches!(url.scheme(), "http" | "https") => {
                Ok(Location::Remote(prefix.trim_end_matches('/').to_string()))
            }
            Ok(url) => Err(format!("unsupported URL scheme {:?}", url.scheme())),
            Err(_) => Ok(Location::Local(PathBuf::from(prefix))),
        }
    }
}

/// A file placed into every instance of a tool.
#[derive(Debug, Clone)]
enum Asset {
    Bytes { path: String, bytes: Arc<[u8]> },
    Lazy { path: String, url: String },
}

/// List of asset paths published next to a remote tool.
#[derive(Debug, Deserialize)]
#[serde(transparent)]
struct AssetManifest(Vec<String>);

/// [`ModuleLoader`] for WebAssembly tools served over HTTP(S) or from a
/// local directory.
#[derive(Clone)]
pub struct WasmLoader {
    engine: Engine,
    linker: Linker<WasiState>,
    limits: ResourceLimits,
    fetcher: Arc<dyn RangeFetcher>,
    agent: ureq::Agent,
}

impl std::fmt::Debug for WasmLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmLoader")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl WasmLoader {
    /// Create a loader. Lazy assets of remote tools are read through
    /// `fetcher`.
    pub fn new(limits: &ResourceLimits, fetcher: Arc<dyn RangeFetcher>) -> Result<Self, RuntimeError> {
        let engine = Self::create_engine()?;
        let mut linker = Linker::new(&engine);
        wasi::add_to_linker(&mut linker).map_err(|e| RuntimeError::Wasm(e.to_string()))?;
        Ok(Self {
            engine,
            linker,
            limits: limits.clone(),
            fetcher,
            agent: ureq::AgentBuilder::new().build(),
        })
    }

    fn create_engine() -> Result<Engine, RuntimeError> {
        let mut config = Config::new();
        config.wasm_simd(true);
        Engine::new(&config).map_err(|e| RuntimeError::Wasm(e.to_string()))
    }

    /// Compile `wasm` (binary or text format) for `program`, without any
    /// bundled assets.
    pub fn compile(&self, program: &str, wasm: &[u8]) -> Result<WasmModule, RuntimeError> {
        self.compile_with_assets(program, wasm, Vec::new())
    }

    fn compile_with_assets(
        &self,
        program: &str,
        wasm: &[u8],
        assets: Vec<Asset>,
    ) -> Result<WasmModule, RuntimeError> {
        let module = Module::new(&self.engine, wasm).map_err(|e| RuntimeError::Wasm(e.to_string()))?;
        let mut linker = self.linker.clone();
        linker
            .define_unknown_imports_as_traps(&module)
            .map_err(|e| RuntimeError::Wasm(e.to_string()))?;
        let instance_pre = linker
            .instantiate_pre(&module)
            .map_err(|e| RuntimeError::Wasm(e.to_string()))?;
        Ok(WasmModule {
            shared: Arc::new(Shared {
                engine: self.engine.clone(),
                instance_pre,
                program: program.to_string(),
                max_memory_bytes: self.limits.max_memory_bytes,
            }),
            assets,
            fetcher: Arc::clone(&self.fetcher),
        })
    }

    async fn load_local(dir: PathBuf, program: String) -> Result<(Vec<u8>, Vec<Asset>), String> {
        let wasm_path = dir.join(format!("{program}.wasm"));
        let wasm = tokio::fs::read(&wasm_path)
            .await
            .map_err(|e| format!("{}: {e}", wasm_path.display()))?;
        let assets = tokio::task::spawn_blocking(move || local_assets(&dir.join("assets")))
            .await
            .map_err(|e| e.to_string())??;
        Ok((wasm, assets))
    }

    async fn load_remote(&self, prefix: String, program: String) -> Result<(Vec<u8>, Vec<Asset>), String> {
        let agent = self.agent.clone();
        tokio::task::spawn_blocking(move || {
            let wasm = http_get(&agent, &format!("{prefix}/{program}.wasm"))?
                .ok_or_else(|| format!("{prefix}/{program}.wasm: not found"))?;
            let assets = match http_get(&agent, &format!("{prefix}/assets.json"))? {
                Some(body) => {
                    let AssetManifest(paths) =
                        serde_json::from_slice(&body).map_err(|e| format!("assets.json: {e}"))?;
                    paths
                        .into_iter()
                        .map(|rel| {
                            let rel = rel.trim_start_matches('/').to_string();
                            Asset::Lazy {
                                path: vfs::join("/", &rel),
                                url: format!("{prefix}/assets/{rel}"),
                            }
                        })
                        .collect()
                }
                None => Vec::new(),
            };
            Ok((wasm, assets))
        })
        .await
        .map_err(|e| e.to_string())?
    }
}

/// GET `url`; `None` on 404.
fn http_get(agent: &ureq::Agent, url: &str) -> Result<Option<Vec<u8>>, String> {
    match agent.get(url).call() {
        Ok(response) => {
            let mut body = Vec::new();
            response
                .into_reader()
                .read_to_end(&mut body)
                .map_err(|e| format!("{url}: {e}"))?;
            Ok(Some(body))
        }
        Err(ureq::Error::Status(404, _)) => Ok(None),
        Err(e) => Err(format!("{url}: {e}")),
    }
}

/// Every file below `root`, keyed by its absolute path inside the tool.
fn local_assets(root: &Path) -> Result<Vec<Asset>, String> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut assets = Vec::new();
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| e.to_string())?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| e.to_string())?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let bytes = std::fs::read(entry.path()).map_err(|e| format!("{}: {e}", entry.path().display()))?;
        assets.push(Asset::Bytes {
            path: vfs::join("/", &rel),
            bytes: bytes.into(),
        });
    }
    Ok(assets)
}

#[async_trait]
impl ModuleLoader for WasmLoader {
    async fn load(&self, tool: &ResolvedTool) -> Result<Arc<dyn ToolModule>, RuntimeError> {
        let load_error = |message: String| RuntimeError::Load {
            tool: tool.tool.clone(),
            message,
        };
        let location = Location::parse(&tool.url_prefix).map_err(load_error)?;
        let (wasm, assets) = match location {
            Location::Local(dir) => Self::load_local(dir, tool.program.clone()).await,
            Location::Remote(prefix) => self.load_remote(prefix, tool.program.clone()).await,
        }
        .map_err(load_error)?;
        tracing::debug!(
            tool = %tool.tool,
            program = %tool.program,
            bytes = wasm.len(),
            assets = assets.len(),
            "fetched tool code"
        );
        let module = self.compile_with_assets(&tool.program, &wasm, assets)?;
        Ok(Arc::new(module))
    }
}

struct Shared {
    engine: Engine,
    instance_pre: InstancePre<WasiState>,
    program: String,
    max_memory_bytes: u64,
}

/// A compiled, pre-linked tool and its bundled assets.
#[derive(Clone)]
pub struct WasmModule {
    shared: Arc<Shared>,
    assets: Vec<Asset>,
    fetcher: Arc<dyn RangeFetcher>,
}

impl std::fmt::Debug for WasmModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmModule")
            .field("program", &self.shared.program)
            .field("assets", &self.assets.len())
            .finish_non_exhaustive()
    }
}

impl ToolModule for WasmModule {
    fn instantiate(&self) -> Result<Instantiated, RuntimeError> {
        let fs = MemFs::new();
        for asset in &self.assets {
            match asset {
                Asset::Bytes { path, bytes } => {
                    let (parent, _) = vfs::split_parent(path);
                    fs.mkdir_all(&parent)?;
                    fs.write_file(path, bytes)?;
                }
                Asset::Lazy { path, url } => {
                    let (parent, name) = vfs::split_parent(path);
                    fs.mkdir_all(&parent)?;
                    fs.create_lazy_file(&parent, &name, url, Arc::clone(&self.fetcher))?;
                }
            }
        }
        Ok(Instantiated {
            program: Box::new(WasmProgram {
                shared: Arc::clone(&self.shared),
            }),
            fs,
        })
    }
}

struct WasmProgram {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for WasmProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmProgram")
            .field("program", &self.shared.program)
            .finish_non_exhaustive()
    }
}

impl WasmProgram {
    /// Run `_start` in a fresh store. The store, and with it every
    /// descriptor holding `io`, is dropped before this returns.
    fn run(&self, args: &[String], io: &SharedIo) -> Result<i32, ProgramError> {
        let state = WasiState::new(&self.shared.program, args, io, self.shared.max_memory_bytes)
            .map_err(|e| ProgramError::Trap(format!("{e:#}")))?;
        let mut store = Store::new(&self.shared.engine, state);
        store.limiter(|state| &mut state.limiter);

        let result = self
            .shared
            .instance_pre
            .instantiate(&mut store)
            .and_then(|instance| instance.get_typed_func::<(), ()>(&mut store, "_start"))
            .and_then(|start| start.call(&mut store, ()));

        match result {
            Ok(()) => Ok(0),
            Err(e) => match e.downcast_ref::<I32Exit>() {
                Some(I32Exit(code)) => Ok(*code),
                None => Err(ProgramError::Trap(format!("{e:#}"))),
            },
        }
    }
}

impl NativeProgram for WasmProgram {
    fn call_main(&mut self, args: &[String], io: &mut ProgramIo) -> Result<i32, ProgramError> {
        let shared = SharedIo::new(std::mem::take(io));
        let result = self.run(args, &shared);
        *io = shared.take();
        result
    }
}

/// Caps linear memory growth at the configured limit.
pub(crate) struct StoreLimiter {
    max_memory: u64,
}

impl StoreLimiter {
    fn new(max_memory: u64) -> Self {
        Self { max_memory }
    }
}

impl wasmtime::ResourceLimiter for StoreLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        Ok(desired as u64 <= self.max_memory || current == desired)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        _desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::executor::{OutputCapture, StdStreams, StdinBuffer};
    use crate::vfs::HttpRangeFetcher;

    const HELLO: &str = r#"
        (module
          (import "wasi_snapshot_preview1" "fd_write"
            (func $fd_write (param i32 i32 i32 i32) (result i32)))
          (memory (export "memory") 1)
          (data (i32.const 16) "hello\n")
          (func (export "_start")
            (i32.store (i32.const 0) (i32.const 16))
            (i32.store (i32.const 4) (i32.const 6))
            (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))))
    "#;

    /// Opens `in.txt` relative to the working directory and copies up to
    /// 64 bytes of it to stdout. Exits with 2 if the open fails.
    const CAT: &str = r#"
        (module
          (import "wasi_snapshot_preview1" "path_open"
            (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
          (import "wasi_snapshot_preview1" "fd_read"
            (func $fd_read (param i32 i32 i32 i32) (result i32)))
          (import "wasi_snapshot_preview1" "fd_write"
            (func $fd_write (param i32 i32 i32 i32) (result i32)))
          (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
          (memory (export "memory") 1)
          (data (i32.const 300) "in.txt")
          (func (export "_start")
            (if (call $path_open (i32.const 3) (i32.const 1) (i32.const 300) (i32.const 6)
                  (i32.const 0) (i64.const 2) (i64.const 0) (i32.const 0) (i32.const 100))
              (then (call $proc_exit (i32.const 2))))
            (i32.store (i32.const 0) (i32.const 200))
            (i32.store (i32.const 4) (i32.const 64))
            (drop (call $fd_read (i32.load (i32.const 100)) (i32.const 0) (i32.const 1) (i32.const 104)))
            (i32.store (i32.const 8) (i32.const 200))
            (i32.store (i32.const 12) (i32.load (i32.const 104)))
            (drop (call $fd_write (i32.const 1) (i32.const 8) (i32.const 1) (i32.const 108)))))
    "#;

    /// Exits with the argument count.
    const ARGC: &str = r#"
        (module
          (import "wasi_snapshot_preview1" "args_sizes_get"
            (func $args_sizes_get (param i32 i32) (result i32)))
          (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
          (memory (export "memory") 1)
          (func (export "_start")
            (drop (call $args_sizes_get (i32.const 0) (i32.const 4)))
            (call $proc_exit (i32.load (i32.const 0)))))
    "#;

    /// Echoes up to 64 bytes of stdin to stderr.
    const STDIN: &str = r#"
        (module
          (import "wasi_snapshot_preview1" "fd_read"
            (func $fd_read (param i32 i32 i32 i32) (result i32)))
          (import "wasi_snapshot_preview1" "fd_write"
            (func $fd_write (param i32 i32 i32 i32) (result i32)))
          (memory (export "memory") 1)
          (func (export "_start")
            (i32.store (i32.const 0) (i32.const 200))
            (i32.store (i32.const 4) (i32.const 64))
            (drop (call $fd_read (i32.const 0) (i32.const 0) (i32.const 1) (i32.const 100)))
            (i32.store (i32.const 8) (i32.const 200))
            (i32.store (i32.const 12) (i32.load (i32.const 100)))
            (drop (call $fd_write (i32.const 2) (i32.const 8) (i32.const 1) (i32.const 104)))))
    "#;

    /// Copies argv into memory at 4096 and exits with the errno.
    const ARGS_GET: &str = r#"
        (module
          (import "wasi_snapshot_preview1" "args_get"
            (func $args_get (param i32 i32) (result i32)))
          (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
          (memory (export "memory") 1)
          (func (export "_start")
            (call $proc_exit (call $args_get (i32.const 0) (i32.const 4096)))))
    "#;

    const UNKNOWN_IMPORT: &str = r#"
        (module
          (import "env" "host_only" (func $host_only))
          (memory (export "memory") 1)
          (func (export "_start")
            (call $host_only)))
    "#;

    fn loader() -> WasmLoader {
        WasmLoader::new(&ResourceLimits::default(), Arc::new(HttpRangeFetcher::new())).unwrap()
    }

    fn run(module: &WasmModule, fs: MemFs, args: &[&str]) -> (Result<i32, ProgramError>, OutputCapture) {
        let mut program = module.instantiate().unwrap().program;
        let mut io = ProgramIo::new(fs, StdStreams::open(), StdinBuffer::default(), OutputCapture::default());
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let result = program.call_main(&args, &mut io);
        let (_, _, capture) = io.into_parts();
        (result, capture)
    }

    #[test]
    fn test_writes_stdout() {
        let module = loader().compile("hello", HELLO.as_bytes()).unwrap();
        let (result, capture) = run(&module, MemFs::new(), &[]);
        assert_eq!(result.unwrap(), 0);
        assert_eq!(capture.stdout_text(), "hello\n");
    }

    #[test]
    fn test_reads_file_relative_to_cwd() {
        let module = loader().compile("cat", CAT.as_bytes()).unwrap();
        let fs = MemFs::new();
        fs.mkdir_all("/shared/data").unwrap();
        fs.chdir("/shared/data").unwrap();
        fs.write_file("/shared/data/in.txt", b"abc\n").unwrap();

        let (result, capture) = run(&module, fs, &["in.txt"]);
        assert_eq!(result.unwrap(), 0);
        assert_eq!(capture.stdout_text(), "abc\n");

        let (result, _) = run(&module, MemFs::new(), &[]);
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn test_stdin_reaches_stderr() {
        let module = loader().compile("stdin", STDIN.as_bytes()).unwrap();
        let mut program = module.instantiate().unwrap().program;
        let mut stdin = StdinBuffer::default();
        stdin.set("ACGT\n");
        let mut io = ProgramIo::new(MemFs::new(), StdStreams::open(), stdin, OutputCapture::default());
        assert_eq!(program.call_main(&[], &mut io).unwrap(), 0);

        let (_, stdin, capture) = io.into_parts();
        assert_eq!(capture.stdout_text(), "ACGT\n");
        assert_eq!(stdin.text(), "");
    }

    #[test]
    fn test_proc_exit_reports_argc() {
        let module = loader().compile("argc", ARGC.as_bytes()).unwrap();
        let (result, _) = run(&module, MemFs::new(), &["a", "b"]);
        assert_eq!(result.unwrap(), 3);

        let many: Vec<String> = (0..120).map(|i| format!("arg{i}")).collect();
        let many: Vec<&str> = many.iter().map(String::as_str).collect();
        let (result, _) = run(&module, MemFs::new(), &many);
        assert_eq!(result.unwrap(), 121);
    }

    #[test]
    fn test_arguments_larger_than_memory_fail_cleanly() {
        let module = loader().compile("args", ARGS_GET.as_bytes()).unwrap();
        let (result, _) = run(&module, MemFs::new(), &["in.txt", "out.txt"]);
        assert_eq!(result.unwrap(), 0);

        let long = "x".repeat(1000);
        let args = vec![long.as_str(); 100];
        let (result, _) = run(&module, MemFs::new(), &args);
        assert!(!matches!(result, Ok(0)), "{result:?}");
    }

    #[test]
    fn test_unknown_import_traps() {
        let module = loader().compile("host_only", UNKNOWN_IMPORT.as_bytes()).unwrap();
        let (result, _) = run(&module, MemFs::new(), &[]);
        assert!(matches!(result, Err(ProgramError::Trap(_))));
    }

    #[tokio::test]
    async fn test_loads_local_directory_with_assets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.wasm"), HELLO).unwrap();
        std::fs::create_dir_all(dir.path().join("assets/hello")).unwrap();
        std::fs::write(dir.path().join("assets/hello/sample.txt"), "sample").unwrap();

        let tool = ResolvedTool {
            tool: "hello".to_string(),
            version: None,
            program: "hello".to_string(),
            base_program: "hello".to_string(),
            url_prefix: dir.path().to_string_lossy().into_owned(),
            features: Vec::new(),
        };
        let module = loader().load(&tool).await.unwrap();
        let inst = module.instantiate().unwrap();
        assert_eq!(inst.fs.read_file("/hello/sample.txt").unwrap(), b"sample");

        let mut missing = tool.clone();
        missing.program = "other".to_string();
        assert!(matches!(
            loader().load(&missing).await,
            Err(RuntimeError::Load { .. })
        ));
    }

    #[test]
    fn test_location_parsing() {
        assert_eq!(
            Location::parse("https://cdn.example/ssw/1.0/").unwrap(),
            Location::Remote("https://cdn.example/ssw/1.0".to_string())
        );
        assert_eq!(
            Location::parse("/opt/tools/ssw").unwrap(),
            Location::Local(PathBuf::from("/opt/tools/ssw"))
        );
        assert!(Location::parse("ftp://example/x").is_err());
    }
}
