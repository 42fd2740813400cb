//! Entry point for the sld linker.
//!
//! High-level application flow:
//! 1. Parse command-line arguments using `clap`.
//! 2. Map the input files into memory.
//! 3. Run the link: load, resolve, layout, relocate, write.
//!
//! File-level errors are reported via `anyhow`; link-level failures carry
//! the structured error kinds from `sld::error`.

use anyhow::{Context, Result};
use clap::Parser;
use memmap2::Mmap;
use std::fs::File;
use tracing_subscriber::EnvFilter;

use sld::arch::x86_64::X86_64;
use sld::config::Config;
use sld::linker::Linker;

fn main() -> Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).context("invalid --log-level")?,
        )
        .init();

    let mut mapped = Vec::new();
    for path in &config.inputs {
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("failed to map {}", path.display()))?;
        mapped.push((path.clone(), mmap));
    }

    let mut linker = Linker::new(X86_64, config.link_options());
    for (path, mmap) in &mapped {
        linker.add_input(&path.display().to_string(), &mmap[..])?;
    }

    let image = linker.link()?;
    image
        .write(&config.output)
        .with_context(|| format!("failed to write {}", config.output.display()))?;

    println!(
        "Linked {} input(s) to {} (entry 0x{:x})",
        mapped.len(),
        config.output.display(),
        image.entry_point
    );
    Ok(())
}
