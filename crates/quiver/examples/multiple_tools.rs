//! Several tools sharing one filesystem.
//!
//! Demonstrates the base module, a lazily loaded tool, a re-initialized
//! tool and stdin, using in-process tools so no network access is needed.
//!
//! Run with: cargo run -p quiver --example multiple_tools

use quiver::{FnModule, Loading, ProgramError, Runtime, StaticLoader, ToolConfig};
use serde_json::json;

fn loader() -> StaticLoader {
    StaticLoader::new()
        .with_module(
            "cat",
            FnModule::new(|args, io| {
                for arg in args {
                    let bytes = io.fs().read_file(arg)?;
                    io.write_stdout(&bytes)?;
                }
                Ok(0)
            }),
        )
        .with_module(
            "upper",
            FnModule::new(|args, io| {
                let [input, output] = args else {
                    return Err(ProgramError::Failed("usage: upper IN OUT".into()));
                };
                let text = io.fs().read_file(input)?.to_ascii_uppercase();
                io.fs().write_file(output, &text)?;
                Ok(0)
            }),
        )
        .with_module(
            "wc",
            FnModule::new(|_, io| {
                let input = io.read_stdin(usize::MAX);
                let lines = input.iter().filter(|b| **b == b'\n').count();
                io.write_stdout(format!("{lines}\n").as_bytes())?;
                Ok(0)
            })
            .with_asset("/wc/README", "counts lines on stdin\n"),
        )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut runtime = Runtime::builder()
        .tool(ToolConfig::new("cat", "1.0"))
        .tool(ToolConfig::new("upper", "1.0").with_reinit(true))
        .tool(ToolConfig::new("wc", "1.0").with_loading(Loading::Lazy))
        .loader(loader())
        .build()?;
    runtime.init().await?;

    println!("=== Tools ===");
    for status in runtime.tools() {
        println!("{}: {:?}", status.tool, status.state);
    }

    println!("\n=== Mounting ===");
    let paths = runtime.mount(&json!([
        {"name": "genes.txt", "data": "brca1\ntp53\negfr\n"}
    ]))?;
    println!("mounted: {paths:?}");

    println!("\n=== One tool writes, another reads ===");
    runtime.exec("upper genes.txt GENES.txt", None).await?;
    let output = runtime.exec("cat GENES.txt", None).await?;
    print!("{}", output.stdout());

    println!("\n=== Lazy tool with stdin ===");
    let genes = runtime.cat("genes.txt").unwrap_or_default();
    runtime.set_stdin(genes);
    let output = runtime.exec("wc", None).await?;
    print!("lines: {}", output.stdout());
    println!("asset: {:?}", runtime.cat("/shared/wc/README"));

    println!("\n=== Listing ===");
    println!("{:?}", runtime.ls("/shared/data"));

    Ok(())
}
