use std::{path::PathBuf, process::ExitCode};

use clap::{ArgAction, Parser, Subcommand};
use log::{error, info, LevelFilter};

use pepatch::{
    constants::DEFAULT_PATCH_SECTION, patch_file, set_section_virtual_size_file, ConflictPolicy,
    Error, PatchOptions,
};

#[derive(Parser, Debug)]
#[command(name = "pepatch", version, about = "Portable executable patch tool")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Only log errors
    #[arg(short, long, global = true)]
    quiet:   bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply a patch set from a section of the image
    Patch {
        /// Image file, patched in place
        image:        PathBuf,
        /// Section holding the patch records
        #[arg(default_value = DEFAULT_PATCH_SECTION)]
        section:      String,
        /// Fail instead of warning when two patches overlap
        #[arg(long)]
        strict:       bool,
        /// Leave section virtual sizes smaller than their raw sizes untouched
        #[arg(long)]
        no_normalize: bool,
    },
    /// Set the virtual size of a section
    Setvs {
        /// Image file, modified in place
        image:   PathBuf,
        /// Section name
        section: String,
        /// New virtual size, decimal or 0x-prefixed hexadecimal
        #[arg(value_parser = parse_number)]
        size:    u32,
    },
}

fn parse_number(value: &str) -> Result<u32, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse::<u32>(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", value, e))
}

fn init_logger(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => LevelFilter::Error,
        (false, 0) => LevelFilter::Info,
        (false, 1) => LevelFilter::Debug,
        (false, _) => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .format_module_path(false)
        .format_level(true)
        .format_target(false)
        .write_style(env_logger::WriteStyle::Auto)
        .init();
}

fn run(command: Command) -> Result<(), Error> {
    match command {
        Command::Patch {
            image,
            section,
            strict,
            no_normalize,
        } => {
            let options = PatchOptions {
                section,
                conflict_policy: if strict { ConflictPolicy::Deny } else { ConflictPolicy::Warn },
                normalize_virtual_sizes: !no_normalize,
                ..PatchOptions::default()
            };
            if let Some(summary) = patch_file(&image, &options)? {
                if summary.conflicts > 0 {
                    info!("{} conflicting patches", summary.conflicts);
                }
            }
        }
        Command::Setvs {
            image,
            section,
            size,
        } => {
            set_section_virtual_size_file(&image, &section, size)?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // usage errors exit with 1, help and version output with 0
            let code = if e.use_stderr() { ExitCode::FAILURE } else { ExitCode::SUCCESS };
            let _ = e.print();
            return code;
        }
    };
    init_logger(cli.verbose, cli.quiet);

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
