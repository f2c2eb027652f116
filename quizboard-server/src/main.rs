mod auth;
mod config;
mod server;
mod ws;

use clap::{Parser, Subcommand};
use config::Config;
use quizboard_core::{LeaderboardRepository, ListScoresOperation, ListScoresOperationRequest};
use server::run_server;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "quizboard")]
#[command(about = "Live quiz leaderboard with real-time score updates")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Print a page of the current leaderboard as JSON
    Leaderboard {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,

        /// Zero-based rank to start from
        #[arg(long, default_value_t = 0)]
        from: i64,

        /// Number of entries to print
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quizboard=info,quizboard_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => {
            tracing::info!("Starting Quizboard server with config: {}", config);

            let cfg = load_config(&config);
            tracing::info!(
                "Bind: {}, Store: {}, Namespace: {}",
                cfg.server.bind_addr,
                cfg.store.backend.as_str(),
                cfg.store.namespace_or_default()
            );

            if let Err(e) = run_server(cfg).await {
                tracing::error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Leaderboard {
            config,
            from,
            limit,
        } => {
            let cfg = load_config(&config);
            if let Err(e) = print_leaderboard(&cfg, from, limit).await {
                tracing::error!("Failed to read leaderboard: {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn load_config(path: &str) -> Config {
    match Config::from_file(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    }
}

async fn print_leaderboard(config: &Config, from: i64, limit: i64) -> quizboard_core::Result<()> {
    let builder = config.store_builder();
    let repository = LeaderboardRepository::new(builder.build().await?, builder.key_layout()?);

    let entries = ListScoresOperation::new(repository)
        .run(ListScoresOperationRequest { from, limit })
        .await?;

    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}
