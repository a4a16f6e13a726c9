//! Build automation tasks for the API Publisher
//!
//! - Generating the CLI reference from the clap definitions

use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation tasks for the API Publisher", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Generate the CLI reference in Markdown
    GenerateCliDocs {
        /// Output directory for generated documentation
        #[arg(short, long, default_value = "docs")]
        output_dir: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateCliDocs { output_dir } => generate_cli_docs(&output_dir)?,
    }

    Ok(())
}

fn generate_cli_docs(output_dir: &str) -> anyhow::Result<()> {
    println!("Generating CLI documentation...");

    let markdown = clap_markdown::help_markdown::<apipub_core::Cli>();

    let content = format!(
        r#"# apipub CLI Reference

This documentation is auto-generated from the CLI source code. Last updated: {}.

## Overview

`apipub` replicates changed data from a source resource API to a target
resource API. A run has three stages, executed in order: key changes, upserts
and deletes.

## Quick Start

```bash
# Publish everything described by a configuration file
apipub publish --config apipub.toml

# Only changes inside a change-version window, errors to a file
apipub publish -c apipub.toml \
  --min-change-version 1200 \
  --max-change-version 1850 \
  --errors-file errors.jsonl
```

## Commands

{}

## Environment Variables

- `APIPUB_CONFIG` - Configuration file used when `--config` is omitted
- `APIPUB_SOURCE_URL`, `APIPUB_TARGET_URL` - Override connection URLs
- `APIPUB_SOURCE_ACCESS_TOKEN`, `APIPUB_TARGET_ACCESS_TOKEN` - Bearer tokens
- `APIPUB_LOG_LEVEL`, `APIPUB_LOG_OUTPUT`, `APIPUB_LOG_FORMAT`, `APIPUB_LOG_DIR` - Logging
- `RUST_LOG` - Tracing filter directives

---

*To update, run `cargo xtask generate-cli-docs`.*
"#,
        chrono::Utc::now().format("%Y-%m-%d"),
        markdown
    );

    let output_path = PathBuf::from(output_dir);
    fs::create_dir_all(&output_path)?;

    let file_path = output_path.join("cli-reference.md");
    fs::write(&file_path, content)?;

    println!("Generated CLI documentation at: {}", file_path.display());

    Ok(())
}
