mod commands;
mod input;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pricewatch")]
#[command(about = "Collect and compare product prices across web shops")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Look up every product on every source and write one row per product
    Run(Box<commands::run::RunArgs>),
    /// Show the source catalog and its run stages
    Sources(commands::sources::SourcesArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pricewatch=info".parse()?),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Run(args) => commands::run::run(args.as_ref()).await?,
        Commands::Sources(args) => commands::sources::run(args)?,
    }

    Ok(())
}
