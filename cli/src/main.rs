mod commands;
mod util;

use clap::{Parser, Subcommand};

use commands::analysis::AnalysisCommands;

#[derive(Parser)]
#[command(
    name = "coach",
    version,
    about = "Rift Coach CLI: submit matches for grounded analysis and follow the results"
)]
struct Cli {
    /// API base URL
    #[arg(long, env = "COACH_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check API health
    Health,
    /// Analysis jobs
    Analysis {
        #[command(subcommand)]
        command: AnalysisCommands,
    },
    /// Show quota for the authenticated account
    Quota,
}

fn require_token() -> String {
    util::resolve_token().unwrap_or_else(|e| exit_error_with_hint(&e))
}

fn exit_error_with_hint(message: &str) -> ! {
    util::exit_error(
        message,
        Some("Create an API key for your account and export COACH_API_KEY."),
    )
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Health => commands::health::run(&cli.api_url).await,
        Commands::Analysis { command } => {
            let token = require_token();
            commands::analysis::run(&cli.api_url, Some(&token), command).await
        }
        Commands::Quota => {
            let token = require_token();
            commands::quota::run(&cli.api_url, Some(&token)).await
        }
    };

    std::process::exit(code);
}
