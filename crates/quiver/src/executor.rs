//! Command execution and standard I/O plumbing.
//!
//! Each ready tool owns a pair of line-buffered streams. Complete lines are
//! delivered to the tool's [`OutputCapture`] as they are written; a partial
//! trailing line is held until the stream is closed. After every invocation
//! both streams are closed and reopened, which delivers whatever is still
//! buffered without appending anything.

use std::mem;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::lifecycle::ToolInstance;
use crate::limits::{LimitedBuffer, ResourceLimits};
use crate::program::{ProgramError, ProgramIo};
use crate::runtime::RuntimeError;

/// Bytes held for an unterminated line before they are delivered anyway.
const MAX_PENDING_LINE: usize = 64 * 1024;

/// Which standard stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// A chunk of output delivered while a tool runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Tool that produced the output
    pub tool: String,
    /// Stream the output was written to
    pub stream: StreamKind,
    /// The delivered text
    pub text: String,
}

/// Result of `exec`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecOutput {
    /// stdout and stderr interleaved into one string
    Combined(String),
    /// stdout and stderr kept apart
    Split {
        /// Standard output
        stdout: String,
        /// Standard error
        stderr: String,
    },
}

impl ExecOutput {
    /// Standard output (everything, when interleaved).
    pub fn stdout(&self) -> &str {
        match self {
            ExecOutput::Combined(text) => text,
            ExecOutput::Split { stdout, .. } => stdout,
        }
    }
}

#[derive(Debug, Default)]
struct LineStream {
    pending: Vec<u8>,
}

impl LineStream {
    /// Buffer `data`; return the bytes that are ready for delivery.
    fn push(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        self.pending.extend_from_slice(data);
        if self.pending.len() >= MAX_PENDING_LINE {
            return Some(mem::take(&mut self.pending));
        }
        let cut = self.pending.iter().rposition(|b| *b == b'\n')? + 1;
        let rest = self.pending.split_off(cut);
        Some(mem::replace(&mut self.pending, rest))
    }

    fn take_remainder(&mut self) -> Vec<u8> {
        mem::take(&mut self.pending)
    }
}

/// A tool's stdout and stderr. A default value has both streams closed.
#[derive(Debug, Default)]
pub struct StdStreams {
    stdout: Option<LineStream>,
    stderr: Option<LineStream>,
}

impl StdStreams {
    /// Both streams open and empty.
    pub fn open() -> Self {
        Self {
            stdout: Some(LineStream::default()),
            stderr: Some(LineStream::default()),
        }
    }

    fn slot(&mut self, kind: StreamKind) -> &mut Option<LineStream> {
        match kind {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        }
    }

    /// Whether the stream is open.
    pub fn is_open(&self, kind: StreamKind) -> bool {
        match kind {
            StreamKind::Stdout => self.stdout.is_some(),
            StreamKind::Stderr => self.stderr.is_some(),
        }
    }

    /// Write to a stream, delivering complete lines to `capture`.
    pub fn write(
        &mut self,
        kind: StreamKind,
        data: &[u8],
        capture: &mut OutputCapture,
    ) -> Result<usize, ProgramError> {
        let stream = self
            .slot(kind)
            .as_mut()
            .ok_or(ProgramError::StreamClosed(kind))?;
        if let Some(chunk) = stream.push(data) {
            capture.deliver(kind, &chunk);
        }
        Ok(data.len())
    }

    /// Close a stream, delivering any buffered bytes. Closing a stream that
    /// is already closed is tolerated; returns whether it was open.
    pub fn close(&mut self, kind: StreamKind, capture: &mut OutputCapture) -> bool {
        match self.slot(kind).take() {
            Some(mut stream) => {
                let rest = stream.take_remainder();
                if !rest.is_empty() {
                    capture.deliver(kind, &rest);
                }
                true
            }
            None => {
                tracing::debug!(?kind, "stream already closed");
                false
            }
        }
    }

    /// Reopen a stream with an empty buffer.
    pub fn reopen(&mut self, kind: StreamKind) {
        *self.slot(kind) = Some(LineStream::default());
    }

    /// Force out buffered output by closing and reopening both streams.
    pub fn flush(&mut self, capture: &mut OutputCapture) {
        for kind in [StreamKind::Stdout, StreamKind::Stderr] {
            self.close(kind, capture);
            self.reopen(kind);
        }
    }
}

/// Per-tool output buffers.
#[derive(Debug)]
pub struct OutputCapture {
    tool: String,
    interleaved: bool,
    stdout: LimitedBuffer,
    stderr: LimitedBuffer,
    events: Option<UnboundedSender<StreamEvent>>,
}

impl Default for OutputCapture {
    fn default() -> Self {
        Self::new(
            "",
            true,
            ResourceLimits::default().max_output_bytes as usize,
            None,
        )
    }
}

impl OutputCapture {
    /// Capture for `tool`. With `interleaved`, stderr is appended to the
    /// stdout buffer. With `events`, every delivered chunk is also sent as a
    /// [`StreamEvent`].
    pub fn new(
        tool: impl Into<String>,
        interleaved: bool,
        limit: usize,
        events: Option<UnboundedSender<StreamEvent>>,
    ) -> Self {
        Self {
            tool: tool.into(),
            interleaved,
            stdout: LimitedBuffer::new(limit),
            stderr: LimitedBuffer::new(limit),
            events,
        }
    }

    /// Record bytes delivered by a stream.
    pub fn deliver(&mut self, kind: StreamKind, bytes: &[u8]) {
        if self.interleaved || kind == StreamKind::Stdout {
            self.stdout.write(bytes);
        } else {
            self.stderr.write(bytes);
        }
        if let Some(events) = &self.events {
            let event = StreamEvent {
                tool: self.tool.clone(),
                stream: kind,
                text: String::from_utf8_lossy(bytes).into_owned(),
            };
            if events.send(event).is_err() {
                tracing::debug!(tool = %self.tool, "stream event receiver dropped");
            }
        }
    }

    /// Empty both buffers.
    pub fn clear(&mut self) {
        self.stdout.clear();
        self.stderr.clear();
    }

    /// Whether either buffer hit the output limit since the last clear.
    pub fn was_truncated(&self) -> bool {
        self.stdout.was_truncated() || self.stderr.was_truncated()
    }

    /// Captured stdout (and stderr, when interleaved).
    pub fn stdout_text(&self) -> String {
        self.stdout.to_text()
    }

    /// Captured stderr (empty when interleaved).
    pub fn stderr_text(&self) -> String {
        self.stderr.to_text()
    }

    /// Shape the captured output.
    pub fn output(&self) -> ExecOutput {
        if self.interleaved {
            ExecOutput::Combined(self.stdout_text())
        } else {
            ExecOutput::Split {
                stdout: self.stdout_text(),
                stderr: self.stderr_text(),
            }
        }
    }
}

/// The shared stdin text and read cursor.
#[derive(Debug, Clone, Default)]
pub struct StdinBuffer {
    text: String,
    cursor: usize,
}

impl StdinBuffer {
    /// Replace the text and rewind.
    pub fn set(&mut self, text: impl Into<String>) {
        self.text = text.into();
        self.cursor = 0;
    }

    /// Current text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Next byte, advancing the cursor. At the end the buffer is cleared
    /// and `None` signals end of input.
    pub fn next_byte(&mut self) -> Option<u8> {
        match self.text.as_bytes().get(self.cursor) {
            Some(byte) => {
                self.cursor += 1;
                Some(*byte)
            }
            None => {
                self.text.clear();
                self.cursor = 0;
                None
            }
        }
    }
}

/// Split a command into the program name and its arguments. Without
/// explicit `args`, the command is split on whitespace.
pub(crate) fn parse_command(
    command: &str,
    args: Option<Vec<String>>,
) -> Result<(String, Vec<String>), RuntimeError> {
    let (name, args) = match args {
        Some(args) => (command.trim().to_string(), args),
        None => {
            let mut parts = command.split_whitespace();
            let name = parts.next().unwrap_or_default().to_string();
            (name, parts.map(str::to_string).collect())
        }
    };
    if name.is_empty() {
        return Err(RuntimeError::NotFound("empty command".to_string()));
    }
    Ok((name, args))
}

/// Run a ready tool's entrypoint with `args` and return its output.
///
/// Failures raised by the program are logged and swallowed; whatever was
/// captured up to that point is returned.
pub(crate) async fn invoke(
    instance: &mut ToolInstance,
    args: &[String],
    stdin: &mut StdinBuffer,
) -> Result<ExecOutput, RuntimeError> {
    let name = instance.config.tool.clone();
    let Some(mut loaded) = instance.loaded.take() else {
        return Err(RuntimeError::Configuration(format!(
            "tool {name:?} is not ready"
        )));
    };
    instance.capture.clear();
    let mut io = ProgramIo::new(
        loaded.fs.clone(),
        mem::take(&mut loaded.streams),
        mem::take(stdin),
        mem::take(&mut instance.capture),
    );
    tracing::debug!(tool = %name, ?args, "invoking entrypoint");

    // Programs run synchronously and may block on lazy file fetches.
    let args = args.to_vec();
    let tool = name.clone();
    let joined = tokio::task::spawn_blocking(move || {
        match loaded.program.call_main(&args, &mut io) {
            Ok(code) => tracing::debug!(%tool, code, "entrypoint returned"),
            Err(e) => tracing::error!(%tool, error = %e, "native execution failed"),
        }
        (loaded, io)
    })
    .await;
    let (mut loaded, io) = match joined {
        Ok(parts) => parts,
        Err(e) => {
            tracing::error!(tool = %name, error = %e, "entrypoint aborted");
            instance.teardown();
            return Err(RuntimeError::Wasm(format!("tool {name:?} aborted: {e}")));
        }
    };

    let (mut streams, stdin_after, mut capture) = io.into_parts();
    streams.flush(&mut capture);
    if capture.was_truncated() {
        tracing::warn!(tool = %name, "output truncated");
    }
    loaded.streams = streams;
    instance.loaded = Some(loaded);
    *stdin = stdin_after;
    instance.capture = capture;
    Ok(instance.capture.output())
}
