use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod kernels;
mod script;

#[derive(Parser)]
#[command(
    name = "svmctl",
    about = "streamvm — run instruction scripts on a stream scheduler",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an instruction script against a topology and print the dispatch
    /// trace and final registry.
    Run {
        /// Topology file (streams and initial objects)
        #[arg(short, long, default_value = "topology.toml")]
        topology: PathBuf,
        /// JSON instruction script
        #[arg(short, long)]
        script: PathBuf,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Check that a topology file parses and builds a scheduler
    Validate {
        #[arg(short, long, default_value = "topology.toml")]
        topology: PathBuf,
    },
    /// Write a topology scaffold with one control stream and N compute
    /// streams.
    Init {
        /// Compute device tag, e.g. cpu or cuda
        #[arg(short, long, default_value = "cpu")]
        device: String,
        /// Number of compute streams
        #[arg(short = 'n', long, default_value = "2")]
        devices: u32,
        #[arg(short, long, default_value = "topology.toml")]
        output: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,svmctl=info,svm_scheduler=info"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Run {
            topology,
            script,
            format,
        } => commands::run::run(&topology, &script, &format).await,
        Commands::Validate { topology } => commands::validate::validate(&topology),
        Commands::Init {
            device,
            devices,
            output,
            force,
        } => commands::init::init(&device, devices, &output, force),
    }
}
