use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use skiff::{Processor, StdConsole};
use tracing_subscriber::EnvFilter;

/// Runs segmented-memory machine images under the cooperative kernel.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Alternating code and heap image paths, one pair per process.
    #[arg(required = true, value_name = "IMAGE")]
    images: Vec<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    if args.images.len() % 2 != 0 {
        eprintln!("error: images must be given as code/heap pairs");
        return ExitCode::FAILURE;
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut processor = Processor::new(StdConsole)?;

    for pair in args.images.chunks(2) {
        let code = load_image(&pair[0])?;
        let heap = load_image(&pair[1])?;
        let pid = processor.create_process(&code, &heap)?;
        tracing::info!("created process {} from {}", pid, pair[0].display());
    }

    processor.switch_to(0)?;
    processor.run()?;
    Ok(())
}

/// Reads a raw image of little-endian words.
fn load_image(path: &Path) -> Result<Vec<u16>, io::Error> {
    let bytes = fs::read(path)?;
    if bytes.len() % 2 != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: image holds a torn trailing word", path.display()),
        ));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}
