// inference-runtime/src/main.rs

#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use inference_runtime::{config::Config, model_runtime::ModelDiscovery, run_server};

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "inference-runtime", version, about = "Pluggable AI model runtime")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Command {
    /// Load models and serve the HTTP API (default).
    Serve,
    /// Scan the models root and print what would be loaded.
    Discover {
        /// Overrides MODELS_ROOT.
        #[arg(long)]
        models_root: Option<std::path::PathBuf>,
    },
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = Config::from_env()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(cfg).await,
        Command::Discover { models_root } => {
            inference_runtime::telemetry::init_tracing_with("warn");
            let root = models_root.unwrap_or(cfg.models_root);
            let report = ModelDiscovery::new(root).discover_with_report()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
