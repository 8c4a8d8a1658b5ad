mod config;
mod error;

use clap::Parser;
use config::{Cli, Commands, Effective};

mod cmd;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::InnerJoin(args) => match Effective::new(&args) {
            Ok(eff) => cmd::inner_join::run(&eff).await.map(drop),
            Err(e) => Err(e),
        },
        Commands::ZipLast(args) => match Effective::new(&args) {
            Ok(eff) => cmd::zip_last::run(&eff).await.map(drop),
            Err(e) => Err(e),
        },
    };
    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
