//! End-to-end session tests with closure-backed tools.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use crate::executor::{ExecOutput, StreamKind};
use crate::lifecycle::ToolState;
use crate::program::{FnModule, ProgramError, StaticLoader};
use crate::registry::{Loading, SessionConfig, ToolConfig};
use crate::runtime::{Listing, Runtime, RuntimeError, WriteRequest};

/// `echo FILE...` prints the files; `write NAME TEXT` creates a file;
/// `stdin` echoes standard input; `sampler` ships sample data; `fail`
/// prints a line and then fails; `split` writes to both streams; `pwd
/// FILE...` prints its working directory, then the files; `slow` blocks
/// its thread for 100ms.
fn loader() -> StaticLoader {
    StaticLoader::new()
        .with_module(
            "echo",
            FnModule::new(|args, io| {
                for arg in args {
                    let bytes = io.fs().read_file(arg)?;
                    io.write_stdout(&bytes)?;
                }
                Ok(0)
            }),
        )
        .with_module(
            "write",
            FnModule::new(|args, io| {
                let [name, text] = args else {
                    return Err(ProgramError::Failed("usage: write NAME TEXT".into()));
                };
                io.fs().write_file(name, text.as_bytes())?;
                Ok(0)
            }),
        )
        .with_module(
            "stdin",
            FnModule::new(|_, io| {
                let input = io.read_stdin(usize::MAX);
                io.write_stdout(&input)?;
                Ok(0)
            }),
        )
        .with_module(
            "sampler",
            FnModule::new(|_, io| {
                io.write_stdout(b"sampled\n")?;
                Ok(0)
            })
            .with_asset("/sampler/sample.txt", "ACGT\n"),
        )
        .with_module(
            "fail",
            FnModule::new(|_, io| {
                io.write_stdout(b"partial\n")?;
                Err(ProgramError::Failed("boom".into()))
            }),
        )
        .with_module(
            "pwd",
            FnModule::new(|args, io| {
                let cwd = io.fs().cwd();
                io.write_stdout(format!("{cwd}\n").as_bytes())?;
                for arg in args {
                    let bytes = io.fs().read_file(arg)?;
                    io.write_stdout(&bytes)?;
                }
                Ok(0)
            }),
        )
        .with_module(
            "slow",
            FnModule::new(|_, io| {
                std::thread::sleep(Duration::from_millis(100));
                io.write_stdout(b"done\n")?;
                Ok(0)
            }),
        )
        .with_module(
            "split",
            FnModule::new(|_, io| {
                io.write_stdout(b"out\n")?;
                io.write_stderr(b"err\n")?;
                Ok(0)
            }),
        )
}

fn runtime(tools: Vec<ToolConfig>) -> Runtime {
    Runtime::builder()
        .tools(tools)
        .loader(loader())
        .build()
        .unwrap()
}

async fn ready(tools: Vec<ToolConfig>) -> Runtime {
    let mut rt = runtime(tools);
    assert!(rt.init().await.unwrap());
    rt
}

#[tokio::test]
async fn test_init_without_tools_fails() {
    let mut rt = runtime(Vec::new());
    let err = rt.init().await.unwrap_err();
    assert!(matches!(err, RuntimeError::Configuration(_)));
    assert_eq!(rt.ls("/"), None);
}

#[tokio::test]
async fn test_init_with_only_reinit_tools_fails_before_loading() {
    // Nothing is registered for "ghost", so any load attempt would surface
    // as a load error instead.
    let mut rt = Runtime::builder()
        .tool(ToolConfig::new("ghost", "1").with_reinit(true))
        .loader(StaticLoader::new())
        .build()
        .unwrap();
    assert!(matches!(
        rt.init().await,
        Err(RuntimeError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_mount_then_cat() {
    let mut rt = ready(vec![ToolConfig::new("echo", "1")]).await;
    rt.mount(&json!([{"name": "f.txt", "data": "hello"}]))
        .unwrap();
    assert_eq!(rt.cat("f.txt").unwrap(), "hello");
}

#[tokio::test]
async fn test_mounting_twice_keeps_earlier_paths() {
    let mut rt = ready(vec![ToolConfig::new("echo", "1")]).await;
    let first = rt
        .mount(&json!({"name": "a.txt", "data": "alpha"}))
        .unwrap();
    rt.mount(&json!({"name": "a.txt", "data": "alpha"}))
        .unwrap();
    rt.mount(&json!({"name": "b.txt", "data": "beta"}))
        .unwrap();

    assert_eq!(rt.cat(&first[0]).unwrap(), "alpha");
    assert_eq!(rt.cat("/shared/mnt/a.txt").unwrap(), "alpha");
    assert_eq!(rt.cat("b.txt").unwrap(), "beta");
}

#[tokio::test]
async fn test_shared_root_lists_data_and_mounted() {
    let rt = ready(vec![ToolConfig::new("echo", "1")]).await;
    let Some(Listing::Entries(entries)) = rt.ls("/shared") else {
        panic!("expected a directory listing");
    };
    assert!(entries.contains(&"data".to_string()));
    assert!(entries.contains(&"mnt".to_string()));
}

#[tokio::test]
async fn test_lazy_tool_activates_on_first_exec() {
    let mut rt = ready(vec![
        ToolConfig::new("echo", "1"),
        ToolConfig::new("sampler", "1").with_loading(Loading::Lazy),
    ])
    .await;

    let status = rt.tools();
    assert_eq!(status[1].state, ToolState::LazyPending);
    assert!(!status[1].ready);
    assert_eq!(rt.ls("/shared/sampler"), None);

    let output = rt.exec("sampler", None).await.unwrap();
    assert_eq!(output.stdout(), "sampled\n");
    assert!(rt.tools()[1].ready);
    assert_eq!(rt.cat("/shared/sampler/sample.txt").unwrap(), "ACGT\n");
}

#[tokio::test]
async fn test_lazy_tool_starts_in_current_directory() {
    let mut rt = ready(vec![
        ToolConfig::new("echo", "1"),
        ToolConfig::new("pwd", "1").with_loading(Loading::Lazy),
    ])
    .await;
    rt.mount(&json!([{"name": "in.txt", "data": "abc\n"}]))
        .unwrap();
    assert!(rt.mkdir("work"));
    rt.write(&WriteRequest {
        path: "work/notes.txt".into(),
        buffer: b"note\n".to_vec(),
        length: None,
        offset: 0,
        flag: "w+".into(),
    })
    .unwrap();
    rt.cd("work").unwrap();
    assert!(!rt.tools()[1].ready);

    let output = rt.exec("pwd notes.txt ../in.txt", None).await.unwrap();
    assert_eq!(output.stdout(), "/shared/data/work\nnote\nabc\n");
    assert!(rt.tools()[1].ready);
    assert_eq!(rt.pwd().unwrap(), "/shared/data/work");
}

#[tokio::test]
async fn test_blocking_tool_leaves_runtime_free() {
    let mut rt = ready(vec![ToolConfig::new("slow", "1")]).await;
    let ticks = Arc::new(AtomicUsize::new(0));
    let ticker = tokio::spawn({
        let ticks = Arc::clone(&ticks);
        async move {
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                ticks.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    let output = rt.exec("slow", None).await.unwrap();
    ticker.abort();
    assert_eq!(output.stdout(), "done\n");
    assert!(ticks.load(Ordering::SeqCst) > 0);
}

#[tokio::test]
async fn test_sequential_execs_share_files() {
    let mut rt = ready(vec![ToolConfig::new("echo", "1"), ToolConfig::new("write", "1")]).await;
    rt.exec("write", Some(vec!["x.txt".into(), "from write\n".into()]))
        .await
        .unwrap();
    let output = rt.exec("echo x.txt", None).await.unwrap();
    assert_eq!(output, ExecOutput::Combined("from write\n".into()));
}

#[tokio::test]
async fn test_stdin_is_consumed_once() {
    let mut rt = ready(vec![ToolConfig::new("echo", "1"), ToolConfig::new("stdin", "1")]).await;
    rt.set_stdin("Hello");
    assert_eq!(rt.stdin(), "Hello");
    assert_eq!(rt.exec("stdin", None).await.unwrap().stdout(), "Hello");
    assert_eq!(rt.exec("stdin", None).await.unwrap().stdout(), "");
    assert_eq!(rt.stdin(), "");
}

#[tokio::test]
async fn test_reinit_tool_keeps_working_directory() {
    let mut rt = ready(vec![
        ToolConfig::new("echo", "1"),
        ToolConfig::new("write", "1").with_reinit(true),
    ])
    .await;
    assert!(rt.mkdir("work"));
    rt.cd("work").unwrap();
    let before = rt.pwd().unwrap();

    rt.exec("write", Some(vec!["out.txt".into(), "data".into()]))
        .await
        .unwrap();

    assert_eq!(rt.pwd().unwrap(), before);
    assert_eq!(rt.cat("/shared/data/work/out.txt").unwrap(), "data");
    let status = rt.tools();
    assert!(status[1].ready);
    assert_eq!(
        rt.manager().tool(1).unwrap().fs().unwrap().cwd(),
        "/shared/data/work"
    );
}

#[tokio::test]
async fn test_echo_scenario() {
    let mut rt = ready(vec![ToolConfig::new("echo", "1")]).await;
    let paths = rt
        .mount(&json!([{"name": "in.txt", "data": "abc\n"}]))
        .unwrap();
    assert_eq!(paths, vec!["/shared/data/in.txt"]);
    assert_eq!(
        rt.exec("echo in.txt", None).await.unwrap(),
        ExecOutput::Combined("abc\n".into())
    );
}

#[tokio::test]
async fn test_unknown_program_is_not_found() {
    let mut rt = ready(vec![ToolConfig::new("echo", "1")]).await;
    assert!(matches!(
        rt.exec("samtools view", None).await,
        Err(RuntimeError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_native_failure_returns_partial_output() {
    let mut rt = ready(vec![ToolConfig::new("echo", "1"), ToolConfig::new("fail", "1")]).await;
    let output = rt.exec("fail", None).await.unwrap();
    assert_eq!(output.stdout(), "partial\n");
}

#[tokio::test]
async fn test_unsupported_mount_is_rejected_without_changes() {
    let mut rt = ready(vec![ToolConfig::new("echo", "1")]).await;
    let err = rt
        .mount(&json!([{"name": "ok.txt", "data": "x"}, 42]))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::UnsupportedInput(_)));
    assert_eq!(rt.cat("ok.txt"), None);
}

#[tokio::test]
async fn test_split_output_and_stream_events() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = SessionConfig {
        print_interleaved: false,
        print_stream: true,
        ..SessionConfig::default()
    };
    let mut rt = Runtime::builder()
        .tool(ToolConfig::new("split", "1"))
        .session(session)
        .loader(loader())
        .stream_events(tx)
        .build()
        .unwrap();
    rt.init().await.unwrap();

    let output = rt.exec("split", None).await.unwrap();
    assert_eq!(
        output,
        ExecOutput::Split {
            stdout: "out\n".into(),
            stderr: "err\n".into()
        }
    );

    let first = rx.recv().await.unwrap();
    assert_eq!((first.stream, first.text.as_str()), (StreamKind::Stdout, "out\n"));
    let second = rx.recv().await.unwrap();
    assert_eq!((second.stream, second.text.as_str()), (StreamKind::Stderr, "err\n"));
}
