//! Quiver CLI
//!
//! Usage:
//!   quiver serve --config session.json          JSON-lines RPC on stdin/stdout
//!   quiver run --tool samtools/1.10 -- samtools view in.sam
//!   quiver run --tool seqtk/1.3 --mount reads.fq --stdin -- seqtk comp

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use quiver::{Declaration, ExecOutput, Runtime, ToolConfig};
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Run sandboxed command-line tools that share one filesystem
#[derive(Parser, Debug)]
#[command(name = "quiver")]
#[command(about = "Run sandboxed command-line tools that share one filesystem")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve newline-delimited JSON requests on stdin, replying on stdout
    Serve(SessionArgs),
    /// Run a single command and print its output
    Run {
        #[command(flatten)]
        session: SessionArgs,
        /// Host files to mount before running
        #[arg(long = "mount", value_name = "PATH")]
        mounts: Vec<PathBuf>,
        /// Forward this process's stdin to the command
        #[arg(long)]
        stdin: bool,
        /// Command line to run
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct SessionArgs {
    /// Session declaration file (JSON with `tools` and `config`)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Additional tool, as `tool/version[/program]`
    #[arg(long = "tool", value_name = "TOOL")]
    tools: Vec<ToolConfig>,
    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

impl SessionArgs {
    fn declaration(&self) -> Result<Declaration> {
        let mut declaration = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str::<Declaration>(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => Declaration::default(),
        };
        declaration.tools.extend(self.tools.iter().cloned());
        declaration.config.debug |= self.debug;
        Ok(declaration)
    }
}

fn init_tracing(debug: bool) {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    // stdout carries replies, so logs go to stderr.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(level.into()))
        .init();
}

fn mount_entry(path: &Path) -> Result<serde_json::Value> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("no usable file name in {}", path.display()))?;
    let data =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(serde_json::json!({ "name": name, "data": data }))
}

async fn serve(declaration: Declaration) -> Result<()> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let runtime = Runtime::builder()
        .declaration(declaration)
        .stream_events(events_tx)
        .build()?;

    tracing::info!("serving JSON-lines requests on stdio");
    let handle = quiver::rpc::spawn_worker(runtime);
    quiver::rpc::serve_lines(
        handle,
        Some(events_rx),
        tokio::io::stdin(),
        tokio::io::stdout(),
    )
    .await?;
    Ok(())
}

async fn run(
    declaration: Declaration,
    mounts: &[PathBuf],
    forward_stdin: bool,
    command: &[String],
) -> Result<()> {
    let mut runtime = Runtime::builder().declaration(declaration).build()?;
    runtime.init().await?;

    if !mounts.is_empty() {
        let entries = mounts
            .iter()
            .map(|p| mount_entry(p))
            .collect::<Result<Vec<_>>>()?;
        let paths = runtime.mount(&serde_json::Value::Array(entries))?;
        tracing::debug!(?paths, "mounted host files");
    }

    if forward_stdin {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("reading stdin")?;
        runtime.set_stdin(text);
    }

    let Some((program, args)) = command.split_first() else {
        bail!("no command given");
    };
    match runtime.exec(program, Some(args.to_vec())).await? {
        ExecOutput::Combined(text) => print!("{text}"),
        ExecOutput::Split { stdout, stderr } => {
            print!("{stdout}");
            eprint!("{stderr}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(session) => {
            let declaration = session.declaration()?;
            init_tracing(declaration.config.debug);
            serve(declaration).await
        }
        Command::Run {
            session,
            mounts,
            stdin,
            command,
        } => {
            let declaration = session.declaration()?;
            init_tracing(declaration.config.debug);
            run(declaration, &mounts, stdin, &command).await
        }
    }
}
