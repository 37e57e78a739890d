//! exiftool-wasm: read image metadata with ExifTool running in a sandbox.
//!
//! # Usage
//!
//! ```bash
//! exiftool-wasm photo.jpg
//! exiftool-wasm --json photo.jpg
//! exiftool-wasm photo1.jpg photo2.jpg
//! ```

mod output;

use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use exif_runtime::{EngineConfig, ExifTool};
use log::error;
use std::io::Write;
use std::path::PathBuf;
use std::process;

/// Read image metadata with ExifTool compiled to WebAssembly.
///
/// No exiftool or perl installation is needed; the interpreter runs inside
/// an embedded wasmtime sandbox.
#[derive(Parser, Debug)]
#[command(name = "exiftool-wasm")]
#[command(author, about, long_about = None, disable_version_flag = true)]
struct Args {
    /// Image files to read
    #[arg(value_name = "FILE", required_unless_present = "version")]
    files: Vec<PathBuf>,

    /// Print all results as one JSON array
    #[arg(short, long)]
    json: bool,

    /// Print the tool and ExifTool versions
    #[arg(short = 'V', long)]
    version: bool,

    /// Path to exiftool.wasm (overrides the config file and EXIFTOOL_WASM_PATH)
    #[arg(long, value_name = "PATH")]
    module: Option<PathBuf>,

    /// Engine configuration file (TOML)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    if let Err(e) = run(&args) {
        error!("{e:#}");
        process::exit(1);
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(module) = &args.module {
        config = config.with_module_path(module);
    }

    let exiftool = ExifTool::with_config(&config).context("failed to initialize ExifTool")?;

    if args.version {
        let guest_version = exiftool.version().context("failed to query ExifTool version")?;
        println!(
            "exiftool-wasm version {} (ExifTool {guest_version})",
            env!("CARGO_PKG_VERSION")
        );
        return Ok(exiftool.close()?);
    }

    let stdout = std::io::stdout();
    let mut stdout = stdout.lock();
    let header = args.files.len() > 1;
    let mut records = Vec::new();

    for path in &args.files {
        let mut record = match exiftool.read_metadata(path) {
            Ok(record) => record,
            Err(e) => {
                error!("Error reading {}: {e}", path.display());
                continue;
            }
        };
        let source = path.display().to_string();
        record.insert("SourceFile", source.as_str());

        if args.json {
            records.push(record);
        } else {
            stdout.write_all(output::render_text(&source, &record, header).as_bytes())?;
        }
    }

    if args.json && !records.is_empty() {
        stdout.write_all(output::render_json(&records)?.as_bytes())?;
    }
    stdout.flush()?;

    exiftool.close()?;
    Ok(())
}
