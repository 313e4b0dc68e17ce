//! Quiver: several sandboxed command-line tools, one filesystem
//!
//! Quiver drives independently compiled WebAssembly tools from a single
//! worker as if they were command-line programs sharing one filesystem.
//! Every tool runs in its own instance with a private in-memory filesystem;
//! the first tool that is never re-initialized becomes the *base module*,
//! and every other tool proxies its shared subtree onto the base's, so files
//! written by one tool are immediately visible to the next.
//!
//! ```no_run
//! # async fn demo() -> Result<(), quiver::RuntimeError> {
//! use quiver::{Runtime, ToolConfig};
//!
//! let mut runtime = Runtime::builder()
//!     .tool("samtools/1.10".parse::<ToolConfig>()?)
//!     .build()?;
//! runtime.init().await?;
//! runtime.mount(&serde_json::json!({"name": "in.sam", "data": "..."}))?;
//! let output = runtime.exec("samtools view in.sam", None).await?;
//! println!("{}", output.stdout());
//! # Ok(())
//! # }
//! ```

mod executor;
mod federation;
mod lifecycle;
mod limits;
mod probe;
mod program;
mod registry;
mod runtime;
mod wasm;

pub mod rpc;
pub mod vfs;

#[cfg(test)]
mod tests;

pub use executor::{ExecOutput, OutputCapture, StdStreams, StdinBuffer, StreamEvent, StreamKind};
pub use federation::{Federator, MountEntry, classify};
pub use lifecycle::{LifecycleManager, ToolInstance, ToolState, ToolStatus};
pub use limits::{LimitedBuffer, ResourceLimits};
pub use probe::{Feature, FeatureProbe, FixedFeatureProbe, HostFeatureProbe};
pub use program::{
    FnModule, Instantiated, ModuleLoader, NativeProgram, ProgramError, ProgramIo, StaticLoader,
    ToolModule,
};
pub use registry::{
    CapabilityTable, DEFAULT_URL_CDN, Declaration, Loading, ResolvedTool, SessionConfig,
    ToolConfig,
};
pub use runtime::{
    Download, Listing, ReadRequest, Runtime, RuntimeBuilder, RuntimeError, WriteRequest,
};
pub use vfs::{DirEntry, FileKind, FsError, MemFs, Metadata};
pub use wasm::{WasmLoader, WasmModule};
