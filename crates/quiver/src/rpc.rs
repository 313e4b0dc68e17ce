//! Request/response boundary between a controller and the runtime.
//!
//! A worker task owns the [`Runtime`] and executes requests one at a time in
//! the order they were submitted. Callers hold a [`WorkerHandle`]; every
//! request gets a unique id and its reply is routed back by that id, so
//! replies never depend on arrival order.
//!
//! [`serve_lines`] speaks the same protocol as newline-delimited JSON:
//!
//! ```text
//! → {"id":1,"request":{"method":"exec","params":{"command":"echo in.txt"}}}
//! ← {"event":"stream","tool":"echo","stream":"stdout","text":"abc\n"}
//! ← {"id":1,"result":"abc\n"}
//! ```
//!
//! Stream notifications produced by a request are always written before
//! that request's reply.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use crate::executor::StreamEvent;
use crate::runtime::{ReadRequest, Runtime, RuntimeError, WriteRequest};

/// A call on the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Request {
    /// Load and federate the declared tools
    Init,
    /// Mount files (see [`Runtime::mount`])
    Mount {
        /// URL string, entry object or array of those
        files: Value,
    },
    /// Run a command
    Exec {
        /// Program name, optionally followed by whitespace-separated args
        command: String,
        /// Explicit arguments; `command` is then only the program name
        #[serde(default)]
        args: Option<Vec<String>>,
    },
    /// List a path
    Ls {
        /// Path to list
        path: String,
    },
    /// Read a file as text
    Cat {
        /// File to read
        path: String,
    },
    /// Fetch a file's bytes
    Download {
        /// File to fetch
        path: String,
    },
    /// Change directory everywhere
    Cd {
        /// New working directory
        path: String,
    },
    /// Current working directory
    Pwd,
    /// Create a directory
    Mkdir {
        /// Directory to create
        path: String,
    },
    /// Positioned read
    Read(ReadRequest),
    /// Positioned write
    Write(WriteRequest),
    /// Replace pending standard input
    SetStdin {
        /// Text fed to the next invocation
        text: String,
    },
    /// Pending standard input
    Stdin,
    /// Status of every tool
    Tools,
}

impl Request {
    /// Method name as it appears on the wire.
    pub fn method(&self) -> &'static str {
        match self {
            Request::Init => "init",
            Request::Mount { .. } => "mount",
            Request::Exec { .. } => "exec",
            Request::Ls { .. } => "ls",
            Request::Cat { .. } => "cat",
            Request::Download { .. } => "download",
            Request::Cd { .. } => "cd",
            Request::Pwd => "pwd",
            Request::Mkdir { .. } => "mkdir",
            Request::Read(_) => "read",
            Request::Write(_) => "write",
            Request::SetStdin { .. } => "set_stdin",
            Request::Stdin => "stdin",
            Request::Tools => "tools",
        }
    }
}

/// A request with its correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Caller-chosen id echoed in the reply
    pub id: u64,
    /// The call
    pub request: Request,
}

/// Error half of a reply.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct RpcError {
    /// Stable error kind, e.g. `not_found`
    pub kind: String,
    /// Human-readable description
    pub message: String,
}

impl From<&RuntimeError> for RpcError {
    fn from(err: &RuntimeError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// How a request ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Success value
    Result(Value),
    /// Failure
    Error(RpcError),
}

/// Reply to one [`Envelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Id of the request this answers
    pub id: u64,
    /// Result or error
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl Reply {
    /// Success value, or the error.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.outcome {
            Outcome::Result(value) => Ok(value),
            Outcome::Error(err) => Err(err),
        }
    }
}

/// Unsolicited message from the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    /// Output streamed while a tool runs
    Stream(StreamEvent),
}

fn to_json(value: impl Serialize) -> Result<Value, RuntimeError> {
    serde_json::to_value(value).map_err(|e| RuntimeError::Io(e.into()))
}

/// `false` for a filesystem miss.
fn or_false<T: Serialize>(value: Option<T>) -> Result<Value, RuntimeError> {
    match value {
        Some(value) => to_json(value),
        None => Ok(Value::Bool(false)),
    }
}

/// Run a filesystem call off the async threads; lazy files may fetch.
async fn blocking<T, F>(call: F) -> Result<T, RuntimeError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| RuntimeError::Io(std::io::Error::other(e)))
}

async fn dispatch(runtime: &mut Runtime, request: Request) -> Result<Value, RuntimeError> {
    match request {
        Request::Init => to_json(runtime.init().await?),
        Request::Mount { files } => to_json(runtime.mount(&files)?),
        Request::Exec { command, args } => to_json(runtime.exec(&command, args).await?),
        Request::Ls { path } => {
            let view = runtime.view();
            or_false(blocking(move || view.ls(&path)).await?)
        }
        Request::Cat { path } => {
            let view = runtime.view();
            or_false(blocking(move || view.cat(&path)).await?)
        }
        Request::Download { path } => {
            let view = runtime.view();
            or_false(blocking(move || view.download(&path)).await?)
        }
        Request::Cd { path } => {
            runtime.cd(&path)?;
            Ok(Value::Null)
        }
        Request::Pwd => or_false(runtime.pwd()),
        Request::Mkdir { path } => Ok(Value::Bool(runtime.mkdir(&path))),
        Request::Read(req) => {
            let view = runtime.view();
            to_json(blocking(move || view.read(&req)).await??)
        }
        Request::Write(req) => {
            let view = runtime.view();
            blocking(move || view.write(&req)).await??;
            Ok(Value::Null)
        }
        Request::SetStdin { text } => {
            runtime.set_stdin(text);
            Ok(Value::Null)
        }
        Request::Stdin => Ok(Value::String(runtime.stdin().to_string())),
        Request::Tools => to_json(runtime.tools()),
    }
}

async fn run_worker(
    mut runtime: Runtime,
    mut jobs: UnboundedReceiver<Envelope>,
    replies: UnboundedSender<Reply>,
) {
    while let Some(Envelope { id, request }) = jobs.recv().await {
        let method = request.method();
        tracing::debug!(id, method, "handling request");
        let outcome = match dispatch(&mut runtime, request).await {
            Ok(value) => Outcome::Result(value),
            Err(e) => {
                tracing::warn!(id, method, error = %e, "request failed");
                Outcome::Error(RpcError::from(&e))
            }
        };
        if replies.send(Reply { id, outcome }).is_err() {
            break;
        }
    }
    tracing::debug!("worker stopped");
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

async fn route_replies(mut replies: UnboundedReceiver<Reply>, pending: Pending) {
    while let Some(reply) = replies.recv().await {
        let sender = pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&reply.id);
        match sender {
            Some(sender) => {
                // The caller may have stopped waiting.
                let _ = sender.send(reply);
            }
            None => tracing::warn!(id = reply.id, "reply for unknown request"),
        }
    }
    // Dropping the senders wakes every remaining caller with an error.
    pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
}

/// Start a worker task that owns `runtime`. Must be called inside a tokio
/// runtime.
pub fn spawn_worker(runtime: Runtime) -> WorkerHandle {
    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
    let (replies_tx, replies_rx) = mpsc::unbounded_channel();
    let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

    tokio::spawn(run_worker(runtime, jobs_rx, replies_tx));
    tokio::spawn(route_replies(replies_rx, Arc::clone(&pending)));

    WorkerHandle {
        jobs: jobs_tx,
        pending,
        next_id: Arc::new(AtomicU64::new(1)),
    }
}

/// Cloneable handle for submitting requests to a worker.
#[derive(Clone)]
pub struct WorkerHandle {
    jobs: UnboundedSender<Envelope>,
    pending: Pending,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A submitted request whose reply has not been awaited yet.
#[derive(Debug)]
pub struct PendingReply {
    id: u64,
    rx: oneshot::Receiver<Reply>,
}

impl PendingReply {
    /// Id assigned to the request.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the reply.
    pub async fn wait(self) -> Result<Reply, RuntimeError> {
        self.rx.await.map_err(|_| RuntimeError::WorkerClosed)
    }
}

impl WorkerHandle {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue `request`. Requests run in the order they are submitted.
    pub fn submit(&self, request: Request) -> Result<PendingReply, RuntimeError> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        if self.jobs.send(Envelope { id, request }).is_err() {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            return Err(RuntimeError::WorkerClosed);
        }
        Ok(PendingReply { id, rx })
    }

    /// Submit `request` and wait for its reply.
    pub async fn call(&self, request: Request) -> Result<Reply, RuntimeError> {
        self.submit(request)?.wait().await
    }
}

fn invalid_request(line: &str, err: &serde_json::Error) -> Reply {
    let id = serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|v| v.get("id").and_then(Value::as_u64))
        .unwrap_or(0);
    Reply {
        id,
        outcome: Outcome::Error(RpcError {
            kind: "invalid_request".to_string(),
            message: err.to_string(),
        }),
    }
}

async fn write_line<W>(writer: &mut W, mut line: String) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

async fn write_event<W>(writer: &mut W, event: StreamEvent) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match serde_json::to_string(&Notification::Stream(event)) {
        Ok(line) => write_line(writer, line).await,
        Err(e) => {
            tracing::warn!(error = %e, "could not encode stream event");
            Ok(())
        }
    }
}

/// Write every event already queued.
async fn drain_events<W>(
    writer: &mut W,
    events: Option<&mut UnboundedReceiver<StreamEvent>>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if let Some(events) = events {
        while let Ok(event) = events.try_recv() {
            write_event(writer, event).await?;
        }
    }
    Ok(())
}

enum Outgoing {
    Reply(String),
    Event(StreamEvent),
}

/// Single writer for replies and notifications.
///
/// The worker queues a request's events before it sends the reply, so
/// draining the event queue ahead of each reply keeps them in order.
async fn write_lines<W>(
    mut writer: W,
    mut replies: UnboundedReceiver<String>,
    mut events: Option<UnboundedReceiver<StreamEvent>>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let next = match events.as_mut() {
            Some(queue) => tokio::select! {
                biased;
                reply = replies.recv() => reply.map(Outgoing::Reply),
                Some(event) = queue.recv() => Some(Outgoing::Event(event)),
            },
            None => replies.recv().await.map(Outgoing::Reply),
        };
        match next {
            Some(Outgoing::Event(event)) => write_event(&mut writer, event).await?,
            Some(Outgoing::Reply(line)) => {
                drain_events(&mut writer, events.as_mut()).await?;
                write_line(&mut writer, line).await?;
            }
            None => break,
        }
    }
    drain_events(&mut writer, events.as_mut()).await
}

/// Serve newline-delimited JSON envelopes from `reader`, writing replies and
/// stream notifications to `writer`. Returns once `reader` is exhausted and
/// every reply has been written.
pub async fn serve_lines<R, W>(
    handle: WorkerHandle,
    events: Option<UnboundedReceiver<StreamEvent>>,
    reader: R,
    writer: W,
) -> Result<(), RuntimeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(write_lines(writer, out_rx, events));

    let mut in_flight = JoinSet::new();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let envelope = match serde_json::from_str::<Envelope>(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "invalid request");
                let reply = invalid_request(&line, &e);
                if let Ok(text) = serde_json::to_string(&reply) {
                    let _ = out_tx.send(text);
                }
                continue;
            }
        };
        let client_id = envelope.id;
        let pending = handle.submit(envelope.request)?;
        let out = out_tx.clone();
        in_flight.spawn(async move {
            let mut reply = match pending.wait().await {
                Ok(reply) => reply,
                Err(e) => Reply {
                    id: client_id,
                    outcome: Outcome::Error(RpcError::from(&e)),
                },
            };
            reply.id = client_id;
            match serde_json::to_string(&reply) {
                Ok(text) => {
                    let _ = out.send(text);
                }
                Err(e) => tracing::warn!(error = %e, "could not encode reply"),
            }
        });
    }

    while in_flight.join_next().await.is_some() {}
    drop(out_tx);
    match writer_task.await {
        Ok(result) => result?,
        Err(e) => tracing::warn!(error = %e, "writer task failed"),
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::program::{FnModule, StaticLoader};
    use crate::registry::ToolConfig;

    fn worker() -> WorkerHandle {
        let runtime = Runtime::builder()
            .tool(ToolConfig::new("echo", "1"))
            .loader(StaticLoader::new().with_module(
                "echo",
                FnModule::new(|args, io| {
                    io.write_stdout(args.join(" ").as_bytes())?;
                    Ok(0)
                }),
            ))
            .build()
            .unwrap();
        spawn_worker(runtime)
    }

    #[test]
    fn test_request_wire_format() {
        let envelope: Envelope = serde_json::from_value(json!({
            "id": 7,
            "request": {"method": "exec", "params": {"command": "echo hi"}}
        }))
        .unwrap();
        assert_eq!(
            envelope.request,
            Request::Exec {
                command: "echo hi".into(),
                args: None
            }
        );

        let init: Envelope =
            serde_json::from_value(json!({"id": 1, "request": {"method": "init"}})).unwrap();
        assert_eq!(init.request, Request::Init);

        let reply = Reply {
            id: 7,
            outcome: Outcome::Error(RpcError {
                kind: "not_found".into(),
                message: "nope".into(),
            }),
        };
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"id": 7, "error": {"kind": "not_found", "message": "nope"}})
        );
        let event = Notification::Stream(StreamEvent {
            tool: "echo".into(),
            stream: crate::executor::StreamKind::Stdout,
            text: "x\n".into(),
        });
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "stream", "tool": "echo", "stream": "stdout", "text": "x\n"})
        );
    }

    #[tokio::test]
    async fn test_requests_run_in_submission_order() {
        let handle = worker();
        let init = handle.submit(Request::Init).unwrap();
        let exec = handle
            .submit(Request::Exec {
                command: "echo a b".into(),
                args: None,
            })
            .unwrap();
        let pwd = handle.submit(Request::Pwd).unwrap();
        assert!(exec.id() > init.id());

        // Await out of order; each reply still matches its request.
        assert_eq!(pwd.wait().await.unwrap().into_result().unwrap(), json!("/shared/data"));
        assert_eq!(exec.wait().await.unwrap().into_result().unwrap(), json!("a b"));
        assert_eq!(init.wait().await.unwrap().into_result().unwrap(), json!(true));
    }

    #[tokio::test]
    async fn test_errors_carry_kind() {
        let handle = worker();
        handle.call(Request::Init).await.unwrap();
        let err = handle
            .call(Request::Exec {
                command: "missing".into(),
                args: None,
            })
            .await
            .unwrap()
            .into_result()
            .unwrap_err();
        assert_eq!(err.kind, "not_found");

        let miss = handle
            .call(Request::Cat {
                path: "/nope".into(),
            })
            .await
            .unwrap();
        assert_eq!(miss.into_result().unwrap(), json!(false));
    }
}
