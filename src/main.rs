use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use bracket_trader::execution::{OcoMode, StrategyConfig};
use bracket_trader::replay;

#[derive(Parser, Debug)]
#[command(name = "bracket-trader")]
#[command(about = "Bracket order management for futures strategies")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Print verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay a CSV of bars and signals against the paper broker
    Replay {
        /// CSV with timestamp,series,price,signal columns
        #[arg(short, long)]
        input: PathBuf,

        /// Strategy config (JSON); defaults are used when omitted
        #[arg(short, long, env = "BRACKET_CONFIG")]
        config: Option<PathBuf>,

        /// Use the scalper preset instead of the defaults
        #[arg(long, conflicts_with = "config")]
        scalper: bool,

        /// Treat the file as historical data preceding live trading
        #[arg(long)]
        historical: bool,

        /// Write completed trades to this CSV
        #[arg(short, long)]
        trades_out: Option<PathBuf>,

        /// Stop-loss distance in points
        #[arg(long)]
        stop: Option<f64>,

        /// Profit-target distance in points
        #[arg(long)]
        target: Option<f64>,

        /// Trail the stop behind favorable moves
        #[arg(long)]
        trailing: bool,

        /// Pull the target in after a retrace
        #[arg(long)]
        chasing: bool,

        /// Contracts per entry
        #[arg(short = 'q', long)]
        quantity: Option<i32>,

        /// OCO handling: simulated or native
        #[arg(long)]
        oco: Option<String>,
    },

    /// Print the default strategy config as JSON
    DefaultConfig {
        /// Print the scalper preset instead
        #[arg(long)]
        scalper: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let default_directive = if args.verbose {
        "bracket_trader=debug"
    } else {
        "bracket_trader=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive)),
        )
        .init();

    match args.command {
        Commands::Replay {
            input,
            config,
            scalper,
            historical,
            trades_out,
            stop,
            target,
            trailing,
            chasing,
            quantity,
            oco,
        } => {
            let mut strategy = match config {
                Some(path) => StrategyConfig::from_json_file(&path)
                    .with_context(|| format!("Failed to load config: {:?}", path))?,
                None if scalper => StrategyConfig::scalper(),
                None => StrategyConfig::default(),
            };
            if let Some(stop) = stop {
                strategy.stop_distance = stop;
            }
            if let Some(target) = target {
                strategy.target_distance = target;
            }
            if let Some(quantity) = quantity {
                strategy.quantity = quantity;
            }
            strategy.use_trailing_stop |= trailing;
            strategy.use_profit_chasing |= chasing;
            if let Some(mode) = oco {
                strategy.oco_mode = parse_oco_mode(&mode)?;
            }

            info!("Loading {:?}", input);
            let rows = replay::load_rows(&input)?;
            let summary = replay::run_replay(&rows, strategy, historical)?;
            summary.print();

            if let Some(path) = trades_out {
                replay::write_trades(&path, &summary.trades)?;
                info!("Wrote {} trades to {:?}", summary.trades.len(), path);
            }
        }
        Commands::DefaultConfig { scalper } => {
            let config = if scalper {
                StrategyConfig::scalper()
            } else {
                StrategyConfig::default()
            };
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn parse_oco_mode(mode: &str) -> Result<OcoMode> {
    serde_json::from_value(serde_json::Value::String(mode.to_ascii_lowercase()))
        .with_context(|| format!("Unknown OCO mode '{}' (expected simulated or native)", mode))
}
