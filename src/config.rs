//! Configuration module.
//!
//! Defines the command-line interface for the linker using `clap` and its
//! translation into the library-level [`LinkOptions`].

use clap::Parser;
use std::path::PathBuf;

use crate::linker::LinkOptions;

/// A minimal static linker for x86_64 ELF object files.
///
/// Combines relocatable object files and static archives into a single
/// executable.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Input object files and static archives, in link order
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Path to the output executable
    #[arg(short, long, default_value = "a.out")]
    pub output: PathBuf,

    /// Symbol to use as the entry point
    #[arg(long, default_value = "_start")]
    pub entry: String,

    /// Base load address (decimal or 0x-prefixed hex)
    #[arg(long, value_parser = parse_address, default_value = "0x400000")]
    pub base_addr: u64,

    /// Maximum image size in bytes (decimal or 0x-prefixed hex)
    #[arg(long, value_parser = parse_address, default_value = "0x10000000")]
    pub max_image_size: u64,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            entry_symbol: self.entry.clone(),
            base_address: self.base_addr,
            max_image_size: self.max_image_size,
        }
    }
}

fn parse_address(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|e| format!("invalid address `{s}`: {e}"))
}
