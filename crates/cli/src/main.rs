mod console;
mod logging;

use anyhow::Context;
use clap::Parser;
use ilrecover_binary_parser::map_file;
use ilrecover_core::{Address, Config};
use ilrecover_il2cpp::output::REPORT_FILE_NAME;
use std::path::PathBuf;
use tracing::info;

use crate::console::{ConsoleOperator, Presets};

#[derive(Parser)]
#[command(name = "ilrecover")]
#[command(about = "Recover IL2CPP registrations and assembly skeletons from a binary and its metadata")]
struct Cli {
    /// IL2CPP executable or library (ELF, PE, Mach-O, NSO or WebAssembly)
    binary: PathBuf,
    /// global-metadata.dat
    metadata: PathBuf,
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Directory for assemblies.json (default: config, else current directory)
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Slice of a universal binary, numbered from 1
    #[arg(long)]
    slice: Option<usize>,
    /// Load address of a dumped image, 0 to continue without one
    #[arg(long, value_parser = hex_address)]
    dump_base: Option<Address>,
    /// CodeRegistration address, used when every search misses
    #[arg(long, value_parser = hex_address, requires = "metadata_registration")]
    code_registration: Option<Address>,
    /// MetadataRegistration address, used when every search misses
    #[arg(long, value_parser = hex_address, requires = "code_registration")]
    metadata_registration: Option<Address>,
    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn hex_address(text: &str) -> Result<Address, String> {
    ilrecover_il2cpp::parse_hex_address(text).map_err(|e| e.to_string())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading config {:?}", path))?,
        None => Config::default(),
    };
    logging::init(&config.log_filter, cli.json_logs)?;

    let binary = map_file(&cli.binary).with_context(|| format!("reading {:?}", cli.binary))?;
    let metadata = map_file(&cli.metadata).with_context(|| format!("reading {:?}", cli.metadata))?;

    let presets = Presets {
        slice: cli.slice,
        dump_base: cli.dump_base,
        code_registration: cli.code_registration,
        metadata_registration: cli.metadata_registration,
    };
    let stdin = std::io::stdin();
    let mut operator = ConsoleOperator::new(presets, stdin.lock(), std::io::stdout());

    let report = ilrecover_il2cpp::recover(&binary, &metadata, &config, &mut operator)?;

    let directory = cli
        .output
        .or_else(|| config.output.directory.clone())
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&directory)
        .with_context(|| format!("creating output directory {:?}", directory))?;
    let path = directory.join(REPORT_FILE_NAME);
    report.write_to_file(&path, config.output.pretty)?;

    info!(
        "Done! CodeRegistration {} MetadataRegistration {} via {:?}",
        report.code_registration, report.metadata_registration, report.strategy
    );
    println!("Done! {} assemblies written to {}", report.assemblies.len(), path.display());
    Ok(())
}
