//! CLI definition and dispatch.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::adapters::csv_adapter::CsvAdapter;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::domain::backtest::{BacktestConfig, BacktestResult, Engine};
use crate::domain::config_validation::{
    build_backtest_config, build_strategy_config, validate_backtest_config,
    validate_strategy_config,
};
use crate::domain::error::BacktestError;
use crate::domain::metrics::Metrics;
use crate::domain::strategy::{StrategyConfig, build_strategy};
use crate::domain::universe::survey_symbols;
use crate::logging::{DEFAULT_LEVEL, init_logging};
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::DataPort;

pub const DEFAULT_DATA_DIR: &str = "data";

#[derive(Parser, Debug)]
#[command(name = "backsim", about = "Event-driven bar-replay backtester")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a backtest
    Backtest {
        #[arg(short, long)]
        config: PathBuf,
        /// Directory of <SYMBOL>.csv files, overrides [data] dir
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
        /// Strategy name, overrides [strategy] name
        #[arg(short, long)]
        strategy: Option<String>,
    },
    /// Validate a configuration file and its data coverage
    Validate {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },
    /// Show the data range of a symbol, or of every symbol in the data dir
    Info {
        #[arg(long)]
        symbol: Option<String>,
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },
}

pub fn run(cli: Cli) -> ExitCode {
    match cli.command {
        Command::Backtest {
            config,
            data_dir,
            strategy,
        } => run_backtest(&config, data_dir.as_deref(), strategy.as_deref()),
        Command::Validate { config, data_dir } => run_validate(&config, data_dir.as_deref()),
        Command::Info {
            symbol,
            config,
            data_dir,
        } => run_info(symbol.as_deref(), &config, data_dir.as_deref()),
    }
}

fn fail(err: &BacktestError) -> ExitCode {
    tracing::error!(error = %err, "command failed");
    eprintln!("error: {err}");
    ExitCode::from(err)
}

/// Load the INI file and install logging at its `[logging] level`.
pub fn load_config(path: &Path) -> Result<FileConfigAdapter, ExitCode> {
    let adapter = FileConfigAdapter::from_file(path).map_err(|e| {
        let _ = init_logging(DEFAULT_LEVEL);
        fail(&e)
    })?;
    let level = adapter
        .get_string("logging", "level")
        .unwrap_or_else(|| DEFAULT_LEVEL.to_string());
    let _ = init_logging(&level);
    Ok(adapter)
}

/// `--data-dir` wins over `[data] dir`, which wins over `./data`.
pub fn resolve_data_dir(data_dir: Option<&Path>, config: &dyn ConfigPort) -> PathBuf {
    data_dir
        .map(Path::to_path_buf)
        .or_else(|| config.get_string("data", "dir").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

/// Run one backtest end to end and compute its metrics.
pub fn execute_backtest(
    data_port: &dyn DataPort,
    bt_config: &BacktestConfig,
    strategy_config: &StrategyConfig,
) -> Result<(BacktestResult, Metrics), BacktestError> {
    let mut strategy = build_strategy(strategy_config);
    let mut last_decile = 0u32;
    let mut engine = Engine::new(bt_config.clone()).with_progress_observer(move |pct, eta| {
        let decile = (pct / 10.0).floor() as u32;
        if decile > last_decile {
            last_decile = decile;
            tracing::info!(percent = decile * 10, eta = ?eta, "progress");
        }
    });
    let result = engine.run(data_port, strategy.as_mut())?;
    let metrics = Metrics::compute(&result)?;
    Ok((result, metrics))
}

pub fn run_backtest(
    config_path: &Path,
    data_dir: Option<&Path>,
    strategy_override: Option<&str>,
) -> ExitCode {
    let adapter = match load_config(config_path) {
        Ok(a) => a,
        Err(code) => return code,
    };
    tracing::info!(config = %config_path.display(), "loaded config");

    let bt_config = match build_backtest_config(&adapter) {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };
    let strategy_config = match build_strategy_config(&adapter, strategy_override) {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };

    let data_port = CsvAdapter::new(resolve_data_dir(data_dir, &adapter));
    let (result, metrics) = match execute_backtest(&data_port, &bt_config, &strategy_config) {
        Ok(r) => r,
        Err(e) => return fail(&e),
    };

    print_summary(&bt_config, &result, &metrics);

    match &result.failure {
        Some(failure) => {
            let err = BacktestError::strategy(format!(
                "step {} ({}): {}",
                failure.step, failure.timestamp, failure.message
            ));
            fail(&err)
        }
        None => ExitCode::SUCCESS,
    }
}

fn print_summary(config: &BacktestConfig, result: &BacktestResult, metrics: &Metrics) {
    eprintln!("\n=== Backtest Results: {} ===", result.strategy);
    eprintln!("Symbols:          {}", config.symbols.join(", "));
    eprintln!("Period:           {} to {}", config.start, config.end);
    eprintln!(
        "Steps:            {} of {}",
        result.steps_completed, result.total_steps
    );
    eprintln!("Initial Capital:  {}", metrics.initial_capital);
    eprintln!("Final Value:      {}", metrics.final_value.round_dp(2));
    eprintln!("Total Return:     {:.2}%", metrics.total_return * 100.0);
    eprintln!("Max Drawdown:     -{:.2}%", metrics.max_drawdown * 100.0);
    eprintln!("Sharpe (per bar): {:.3}", metrics.sharpe_ratio);
    eprintln!("Fills:            {}", metrics.fill_count);
    eprintln!("Win Rate:         {:.1}%", metrics.win_rate * 100.0);
    eprintln!("Realized P&L:     {}", metrics.realized_pnl.round_dp(2));
    eprintln!("Commission Paid:  {}", metrics.total_commission.round_dp(2));
    if !result.pending.is_empty() {
        eprintln!("Pending Orders:   {}", result.pending.len());
    }

    let open: Vec<_> = result
        .account
        .positions
        .values()
        .filter(|p| !p.is_flat())
        .collect();
    if !open.is_empty() {
        eprintln!("\n=== Open Positions ===");
        for pos in open {
            eprintln!(
                "  {}: qty {} @ {} (unrealized {})",
                pos.symbol,
                pos.quantity,
                pos.average_cost.round_dp(4),
                pos.unrealized_pnl.round_dp(2)
            );
        }
    }

    if result.stopped {
        eprintln!("\nRun stopped early");
    }
    if let Some(failure) = &result.failure {
        eprintln!(
            "\nStrategy failed at step {} ({}): {}",
            failure.step, failure.timestamp, failure.message
        );
    }
}

pub fn run_validate(config_path: &Path, data_dir: Option<&Path>) -> ExitCode {
    let adapter = match load_config(config_path) {
        Ok(a) => a,
        Err(code) => return code,
    };

    if let Err(e) = validate_backtest_config(&adapter) {
        return fail(&e);
    }
    if let Err(e) = validate_strategy_config(&adapter) {
        return fail(&e);
    }
    eprintln!("Config validated successfully");

    let bt_config = match build_backtest_config(&adapter) {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };
    let data_port = CsvAdapter::new(resolve_data_dir(data_dir, &adapter));
    let coverage = match survey_symbols(&data_port, &bt_config.symbols, bt_config.start, bt_config.end)
    {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };

    eprintln!("\nData coverage:");
    let mut missing = None;
    for entry in &coverage {
        match (entry.first, entry.last) {
            (Some(first), Some(last)) => {
                eprintln!("  {}: {} bars, {} to {}", entry.symbol, entry.bars, first, last)
            }
            _ => {
                eprintln!("  {}: no bars in range", entry.symbol);
                missing.get_or_insert_with(|| entry.symbol.clone());
            }
        }
    }

    if let Some(symbol) = missing {
        return fail(&BacktestError::DataUnavailable { symbol });
    }
    eprintln!("\nConfiguration is valid");
    ExitCode::SUCCESS
}

pub fn run_info(symbol: Option<&str>, config_path: &Path, data_dir: Option<&Path>) -> ExitCode {
    let adapter = match load_config(config_path) {
        Ok(a) => a,
        Err(code) => return code,
    };
    let data_port = CsvAdapter::new(resolve_data_dir(data_dir, &adapter));

    let symbols = match symbol {
        Some(s) => vec![s.to_string()],
        None => match data_port.list_symbols() {
            Ok(s) => s,
            Err(e) => return fail(&e),
        },
    };

    for symbol in &symbols {
        match data_port.get_data_range(symbol) {
            Ok(Some((first, last, count))) => {
                println!("{symbol}: {first} to {last} ({count} bars)");
            }
            Ok(None) => {
                if symbols.len() == 1 {
                    return fail(&BacktestError::DataUnavailable {
                        symbol: symbol.clone(),
                    });
                }
                println!("{symbol}: no data");
            }
            Err(e) => return fail(&e),
        }
    }

    ExitCode::SUCCESS
}
