//! Integration tests for the JSON-lines transport.
//!
//! These tests drive a worker end to end over an in-memory duplex pipe:
//! - replies are correlated by the caller's ids
//! - malformed lines get an `invalid_request` error
//! - streamed output arrives as notifications

#![allow(clippy::unwrap_used)]

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use quiver::rpc::{serve_lines, spawn_worker};
use quiver::{FnModule, Runtime, SessionConfig, StaticLoader, StreamEvent, ToolConfig};

fn echo_loader() -> StaticLoader {
    StaticLoader::new().with_module(
        "echo",
        FnModule::new(|args, io| {
            for arg in args {
                let bytes = io.fs().read_file(arg)?;
                io.write_stdout(&bytes)?;
            }
            Ok(0)
        }),
    )
}

/// Send `requests`, close the input and collect every output line.
async fn session(
    runtime: Runtime,
    events: Option<mpsc::UnboundedReceiver<StreamEvent>>,
    requests: &[Value],
) -> Vec<Value> {
    let (client, server) = tokio::io::duplex(1024 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let handle = spawn_worker(runtime);
    let server = tokio::spawn(serve_lines(handle, events, server_read, server_write));

    let (client_read, mut client_write) = tokio::io::split(client);
    for request in requests {
        let mut line = request.to_string();
        line.push('\n');
        client_write.write_all(line.as_bytes()).await.unwrap();
    }
    client_write.write_all(b"this is not json\n").await.unwrap();
    client_write.shutdown().await.unwrap();
    drop(client_write);

    server.await.unwrap().unwrap();

    let mut lines = BufReader::new(client_read).lines();
    let mut out = Vec::new();
    while let Some(line) = lines.next_line().await.unwrap() {
        out.push(serde_json::from_str(&line).unwrap());
    }
    out
}

fn reply(lines: &[Value], id: u64) -> &Value {
    lines
        .iter()
        .find(|l| l.get("id").and_then(Value::as_u64) == Some(id))
        .unwrap_or_else(|| panic!("no reply for id {id} in {lines:?}"))
}

#[tokio::test]
async fn test_session_over_json_lines() {
    let runtime = Runtime::builder()
        .tool(ToolConfig::new("echo", "1"))
        .loader(echo_loader())
        .build()
        .unwrap();

    let lines = session(
        runtime,
        None,
        &[
            json!({"id": 10, "request": {"method": "init"}}),
            json!({"id": 11, "request": {"method": "mount", "params": {"files": [{"name": "in.txt", "data": "abc\n"}]}}}),
            json!({"id": 12, "request": {"method": "exec", "params": {"command": "echo in.txt"}}}),
            json!({"id": 13, "request": {"method": "cat", "params": {"path": "/nope"}}}),
            json!({"id": 14, "request": {"method": "exec", "params": {"command": "samtools view"}}}),
            json!({"id": 15, "request": {"method": "tools"}}),
        ],
    )
    .await;

    assert_eq!(reply(&lines, 10)["result"], json!(true));
    assert_eq!(reply(&lines, 11)["result"], json!(["/shared/data/in.txt"]));
    assert_eq!(reply(&lines, 12)["result"], json!("abc\n"));
    assert_eq!(reply(&lines, 13)["result"], json!(false));
    assert_eq!(reply(&lines, 14)["error"]["kind"], json!("not_found"));
    assert_eq!(reply(&lines, 15)["result"][0]["tool"], json!("echo"));
    assert_eq!(reply(&lines, 15)["result"][0]["ready"], json!(true));

    let invalid: Vec<_> = lines
        .iter()
        .filter(|l| l["error"]["kind"] == json!("invalid_request"))
        .collect();
    assert_eq!(invalid.len(), 1);
}

#[tokio::test]
async fn test_stream_notifications_precede_reply() {
    const LINES: usize = 2000;

    let (tx, rx) = mpsc::unbounded_channel();
    let loader = StaticLoader::new().with_module(
        "lines",
        FnModule::new(|_, io| {
            for i in 0..LINES {
                io.write_stdout(format!("line {i}\n").as_bytes())?;
            }
            Ok(0)
        }),
    );
    let runtime = Runtime::builder()
        .tool(ToolConfig::new("lines", "1"))
        .session(SessionConfig {
            print_stream: true,
            ..SessionConfig::default()
        })
        .loader(loader)
        .stream_events(tx)
        .build()
        .unwrap();

    let lines = session(
        runtime,
        Some(rx),
        &[
            json!({"id": 1, "request": {"method": "init"}}),
            json!({"id": 2, "request": {"method": "exec", "params": {"command": "lines"}}}),
        ],
    )
    .await;

    let reply_at = lines
        .iter()
        .position(|l| l.get("id").and_then(Value::as_u64) == Some(2))
        .unwrap();
    let events: Vec<(usize, &str)> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| l["event"] == json!("stream"))
        .map(|(i, l)| (i, l["text"].as_str().unwrap()))
        .collect();

    assert_eq!(events.len(), LINES);
    assert!(events.iter().all(|(i, _)| *i < reply_at));
    assert_eq!(events[0].1, "line 0\n");
    assert_eq!(events[LINES - 1].1, format!("line {}\n", LINES - 1));

    let output = reply(&lines, 2)["result"].as_str().unwrap();
    assert_eq!(output.lines().count(), LINES);
}
