use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;

mod cli;

use cli::commands;

#[derive(Parser)]
#[command(
    name = "rknn-convert",
    version,
    about = "Neural network model converter for RKNN targets",
    long_about = "Convert ONNX/TensorFlow/PyTorch models into the RKNN binary format, \
                  with optional fixed-point quantization"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a conversion described by a TOML configuration file
    Convert {
        #[arg(value_name = "CONFIG")]
        config: String,
    },

    /// Print the structural report for the configured model
    Explain {
        #[arg(value_name = "CONFIG")]
        config: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    println!(
        "{}",
        format!("rknn-convert v{}", env!("CARGO_PKG_VERSION")).bold().cyan()
    );
    println!();

    match cli.command {
        Commands::Convert { config } => {
            if !std::path::Path::new(&config).exists() {
                eprintln!("Error: configuration file '{config}' not found");
                std::process::exit(1);
            }
            commands::convert(&config)?;
        }
        Commands::Explain { config } => {
            if !std::path::Path::new(&config).exists() {
                eprintln!("Error: configuration file '{config}' not found");
                std::process::exit(1);
            }
            commands::explain(&config)?;
        }
    }

    Ok(())
}
