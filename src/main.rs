use std::env;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use macd_grid::{
    commands::{export_results, simulate},
    config::{settings_from_env, AnalysisSettings},
    context::AppContext,
};

#[derive(Parser)]
#[command(name = "macd-grid")]
#[command(about = "MACD parameter-sensitivity simulation engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured parameter grid over every data series and persist
    /// the missing simulation results
    Simulate,
    /// Export persisted simulation results for one series as CSV
    ExportResults {
        /// Asset symbol, e.g. AAPL
        asset: String,
        /// Timeframe, e.g. 1d
        timeframe: String,
        /// Only export runs simulated with this window length, in bars
        #[arg(long = "window-size")]
        window_size: Option<usize>,
        /// Destination CSV file
        #[arg(short, long, value_name = "PATH")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let app = AppContext::initialize(env::var("DATABASE_URL").ok());

    match cli.command {
        Commands::Simulate => {
            let settings = AnalysisSettings::from_settings_map(&settings_from_env())?;
            info!(
                "Simulating {} parameter triples over {} series",
                settings.grid.valid_params().count(),
                settings.data_configs.len()
            );
            simulate::run(&app, &settings).await?;
        }
        Commands::ExportResults {
            asset,
            timeframe,
            window_size,
            output,
        } => {
            export_results::run(&app, &asset, &timeframe, window_size, &output).await?;
        }
    }

    Ok(())
}
