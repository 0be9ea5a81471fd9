//! Build automation tasks for FDX
//!
//! Run with: cargo xtask <command>

use clap::{Parser, Subcommand};
use std::process::Command;

const CLIPPY_ARGS: &[&str] = &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"];

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "FDX build automation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all tests
    Test,

    /// Run clippy lints
    Lint,

    /// Check formatting
    Fmt,

    /// Run all CI checks
    Ci,

    /// Run the disk writer benchmarks
    Bench {
        /// Only run benchmarks whose name contains this filter
        filter: Option<String>,
    },

    /// Run the fuzz target for a while (requires cargo-fuzz and nightly)
    Fuzz {
        /// Seconds to fuzz for
        #[arg(long, default_value_t = 60)]
        seconds: u64,
    },

    /// Generate documentation
    Doc,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Test => {
            run_command("cargo", &["test", "--workspace"])?;
        }
        Commands::Lint => {
            run_command("cargo", CLIPPY_ARGS)?;
        }
        Commands::Fmt => {
            run_command("cargo", &["fmt", "--all", "--check"])?;
        }
        Commands::Ci => {
            println!("Running CI checks...");
            run_command("cargo", &["fmt", "--all", "--check"])?;
            run_command("cargo", CLIPPY_ARGS)?;
            run_command("cargo", &["test", "--workspace"])?;
            println!("All CI checks passed!");
        }
        Commands::Bench { filter } => {
            let mut args = vec!["bench", "-p", "fdx-disk"];
            if let Some(filter) = filter.as_deref() {
                args.extend(["--", filter]);
            }
            run_command("cargo", &args)?;
        }
        Commands::Fuzz { seconds } => {
            let max_time = format!("-max_total_time={seconds}");
            run_command_in(
                "fuzz",
                "cargo",
                &["+nightly", "fuzz", "run", "fuzz_rate_samples", "--", &max_time],
            )?;
        }
        Commands::Doc => {
            run_command("cargo", &["doc", "--workspace", "--no-deps", "--open"])?;
        }
    }

    Ok(())
}

fn run_command(program: &str, args: &[&str]) -> anyhow::Result<()> {
    run_command_in(".", program, args)
}

fn run_command_in(dir: &str, program: &str, args: &[&str]) -> anyhow::Result<()> {
    let status = Command::new(program)
        .current_dir(dir)
        .args(args)
        .status()?;

    if !status.success() {
        anyhow::bail!("{} {:?} failed", program, args);
    }

    Ok(())
}
