use clap::{Parser, Subcommand};

mod commands;
mod util;

#[derive(Parser)]
#[command(name = "taskmine", version, about = "Taskmine CLI: verify answers offline, roll up trace KPIs, inspect traces")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify the numeric claims in an answer against a dataset file
    Verify(commands::verify::VerifyArgs),
    /// Roll up one day of traces into a KPI panel
    Rollup(commands::rollup::RollupArgs),
    /// Roll up every day with traces in a date range
    RollupRange(commands::rollup::RollupRangeArgs),
    /// Show the most recent trace records of a day
    Traces(commands::traces::TracesArgs),
    /// Check API health
    Health {
        /// API base URL
        #[arg(long, env = "TASKMINE_API_URL", default_value = "http://localhost:5000")]
        api_url: String,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Verify(args) => commands::verify::run(args),
        Commands::Rollup(args) => commands::rollup::run(args),
        Commands::RollupRange(args) => commands::rollup::run_range(args),
        Commands::Traces(args) => commands::traces::run(args),
        Commands::Health { api_url } => commands::health::run(&api_url).await,
    };

    std::process::exit(code);
}
