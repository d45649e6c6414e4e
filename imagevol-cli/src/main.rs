mod cli;
mod commands;

use std::process;

use clap::Parser;
use cli::Cli;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing based on --debug flag
    let level = if cli.global.debug { "debug" } else { "info" };
    if let Some(log_dir) = &cli.global.log_dir {
        if let Err(e) = imagevol::init_logging_for(log_dir, level) {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    } else {
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level))
            .unwrap_or_else(|_| EnvFilter::new(level));

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    let result = match cli.command {
        cli::Commands::Serve(args) => commands::serve::execute(args, &cli.global).await,
        cli::Commands::Reconcile(args) => commands::reconcile::execute(args, &cli.global).await,
    };

    if let Err(error) = result {
        eprintln!("Error: {:#}", error);
        process::exit(1);
    }
}
