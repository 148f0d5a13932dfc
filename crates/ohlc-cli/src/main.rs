use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ohlc_connectors::kraken::KrakenSource;
use ohlc_connectors::replay::ReplaySource;
use ohlc_connectors::sink::{ArchiveSink, JsonLinesSink};
use ohlc_connectors::{RetryPolicy, TradeSource};
use ohlc_core::aggregator::Aggregator;
use ohlc_core::archive::CandleArchive;
use ohlc_core::candle::Candle;
use ohlc_core::config::{AggregatorConfig, INSTRUMENT_FILTER_VAR, WINDOW_SECONDS_VAR};
use ohlc_core::emitter::{CandleSink, Emitter};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "ohlc", about = "Aggregate trade streams into OHLCV candles")]
struct Cli {
    /// Root directory of the candle archive (default: current directory)
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Aggregate a trade stream into candles
    Run(RunArgs),

    /// Show what candles exist in the archive
    Status {
        /// Filter by instrument (shows all if omitted)
        #[arg(short, long)]
        instrument: Option<String>,
    },

    /// Re-read archived candles and report issues
    Validate {
        /// Instruments to validate (all if omitted, comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        instruments: Option<Vec<String>>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Trade source: replay, kraken
    #[arg(long, default_value = "replay")]
    source: String,

    /// Newline-delimited JSON trades to replay
    #[arg(long)]
    input: Option<PathBuf>,

    /// Instrument to poll from Kraken
    #[arg(long, default_value = "BTC/USD")]
    instrument: String,

    /// Kraken pair name (defaults to the instrument without '/')
    #[arg(long)]
    pair: Option<String>,

    /// Kraken poll interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    poll_ms: u64,

    /// Candle window length in seconds (default: $OHLCV_WINDOW_SECONDS)
    #[arg(long)]
    window_seconds: Option<i64>,

    /// Only aggregate these instruments, comma-separated (default: $INSTRUMENT_FILTER)
    #[arg(long)]
    instruments: Option<String>,

    /// Candle sink: stdout, jsonl, archive
    #[arg(long, default_value = "stdout")]
    sink: String,

    /// Output file for the jsonl sink
    #[arg(long)]
    output: Option<PathBuf>,

    /// Candles per archive write
    #[arg(long, default_value_t = 100)]
    batch_size: usize,

    /// Attempts before giving up on an unavailable sink
    #[arg(long, default_value_t = 5)]
    emit_retries: u32,
}

/// Flags win over the environment; `env` looks up a variable by name.
fn build_config(args: &RunArgs, env: impl Fn(&str) -> Option<String>) -> Result<AggregatorConfig> {
    AggregatorConfig::from_lookup(|var| {
        let flag = match var {
            WINDOW_SECONDS_VAR => args.window_seconds.map(|secs| secs.to_string()),
            INSTRUMENT_FILTER_VAR => args.instruments.clone(),
            _ => None,
        };
        flag.or_else(|| env(var))
    })
    .context("invalid aggregator configuration")
}

async fn create_source(args: &RunArgs) -> Result<TradeSource> {
    match args.source.as_str() {
        "replay" => {
            let input = args
                .input
                .as_ref()
                .context("--input is required for the replay source")?;
            let source = ReplaySource::open(input)
                .await
                .with_context(|| format!("failed to open {}", input.display()))?;
            Ok(source.into())
        }
        "kraken" => {
            let pair = args
                .pair
                .clone()
                .unwrap_or_else(|| KrakenSource::default_pair(&args.instrument));
            Ok(KrakenSource::new(
                args.instrument.clone(),
                pair,
                Duration::from_millis(args.poll_ms),
            )
            .into())
        }
        other => anyhow::bail!("unknown source: {other}. Expected: replay, kraken"),
    }
}

fn create_sink(args: &RunArgs, data_dir: &Path) -> Result<Box<dyn CandleSink>> {
    match args.sink.as_str() {
        "stdout" => Ok(Box::new(JsonLinesSink::stdout())),
        "jsonl" => {
            let output = args
                .output
                .as_ref()
                .context("--output is required for the jsonl sink")?;
            Ok(Box::new(JsonLinesSink::create(output).with_context(|| {
                format!("failed to create {}", output.display())
            })?))
        }
        "archive" => Ok(Box::new(ArchiveSink::new(
            CandleArchive::new(data_dir),
            args.batch_size,
        ))),
        other => anyhow::bail!("unknown sink: {other}. Expected: stdout, jsonl, archive"),
    }
}

async fn cmd_run(args: &RunArgs, data_dir: &Path) -> Result<()> {
    let config = build_config(args, |var| std::env::var(var).ok())?;
    let mut source = create_source(args).await?;
    let mut emitter = Emitter::new(create_sink(args, data_dir)?);
    let mut aggregator = Aggregator::new(config);

    let retry = RetryPolicy {
        max_attempts: args.emit_retries.max(1),
        ..RetryPolicy::default()
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    let summary = ohlc_connectors::run(
        &mut source,
        &mut aggregator,
        &mut emitter,
        retry,
        shutdown,
    )
    .await
    .context("aggregation failed")?;

    info!(
        "done: {} candle(s) emitted, {} trade(s) accepted, {} late, {} invalid, {} window(s) left open",
        summary.stats.emitted,
        summary.stats.accepted,
        summary.stats.late_dropped,
        summary.stats.invalid + summary.malformed,
        summary.open_windows.len(),
    );
    Ok(())
}

fn cmd_status(archive: &CandleArchive, instrument: Option<&str>) -> Result<()> {
    let instruments = match instrument {
        Some(i) => vec![CandleArchive::instrument_dir_name(i)],
        None => archive
            .list_instruments()
            .context("failed to list instruments")?,
    };

    if instruments.is_empty() {
        println!("No candles in archive.");
        return Ok(());
    }

    for name in &instruments {
        match archive
            .date_range(name)
            .with_context(|| format!("failed to list dates for {name}"))?
        {
            Some((first, last)) => {
                let days = archive.list_dates(name)?.len();
                println!("{name}: {days} day(s), {first} to {last}");
            }
            None => println!("{name}: no data"),
        }
    }

    Ok(())
}

/// Consistency problems in a window-ordered run of candles for one instrument.
fn candle_issues(candles: &[Candle]) -> Vec<String> {
    let mut issues = Vec::new();
    let Some(first) = candles.first() else {
        return issues;
    };
    let duration = first.window_end.checked_sub(first.window_start);

    for (i, c) in candles.iter().enumerate() {
        let at = c.window_start;
        match (c.window_end.checked_sub(c.window_start), duration) {
            (None, _) => {
                issues.push(format!("window {at}: end {} out of range", c.window_end));
            }
            (Some(len), _) if len <= 0 => {
                issues.push(format!("window {at}: ends at or before its start"));
            }
            (Some(len), Some(expected)) if len != expected => {
                issues.push(format!("window {at}: length {len}ms differs from {expected}ms"));
            }
            (Some(len), _) if at.rem_euclid(len) != 0 => {
                issues.push(format!("window {at}: not aligned to {len}ms"));
            }
            _ => {}
        }
        if c.high < c.low {
            issues.push(format!("window {at}: high {} below low {}", c.high, c.low));
        }
        if c.open < c.low || c.open > c.high || c.close < c.low || c.close > c.high {
            issues.push(format!("window {at}: open/close outside [low, high]"));
        }
        if c.volume.is_sign_negative() && !c.volume.is_zero() {
            issues.push(format!("window {at}: negative volume {}", c.volume));
        }
        if i > 0 && c.window_start <= candles[i - 1].window_start {
            issues.push(format!("window {at}: duplicate or out of order"));
        }
    }

    issues
}

fn cmd_validate(archive: &CandleArchive, instruments: Option<&[String]>) -> Result<()> {
    let all_instruments = archive
        .list_instruments()
        .context("failed to list instruments")?;

    let to_check: Vec<&str> = match instruments {
        Some(list) => list.iter().map(|s| s.as_str()).collect(),
        None => all_instruments.iter().map(|s| s.as_str()).collect(),
    };

    if to_check.is_empty() {
        println!("No candles to validate.");
        return Ok(());
    }

    let mut issues = 0;

    for name in &to_check {
        match archive.read_all(name) {
            Ok(candles) => {
                if candles.is_empty() {
                    println!("WARN: {name}: no candles");
                    issues += 1;
                    continue;
                }
                for issue in candle_issues(&candles) {
                    println!("WARN: {name}: {issue}");
                    issues += 1;
                }
            }
            Err(e) => {
                println!("ERROR: {name}: failed to read: {e}");
                issues += 1;
            }
        }
    }

    if issues == 0 {
        println!("All candles valid.");
    } else {
        println!("{issues} issue(s) found.");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Candles may go to stdout, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    let archive = CandleArchive::new(&cli.data_dir);

    match &cli.command {
        Commands::Run(args) => {
            cmd_run(args, &cli.data_dir).await?;
        }
        Commands::Status { instrument } => {
            cmd_status(&archive, instrument.as_deref())?;
        }
        Commands::Validate { instruments } => {
            cmd_validate(&archive, instruments.as_deref())?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use rust_decimal::Decimal;

    fn candle(start: i64, open: i64, high: i64, low: i64, close: i64) -> Candle {
        Candle {
            instrument: "BTC/USD".into(),
            window_start: start,
            window_end: start + 60_000,
            open: Decimal::from(open),
            high: Decimal::from(high),
            low: Decimal::from(low),
            close: Decimal::from(close),
            volume: Decimal::ONE,
            trade_count: 1,
        }
    }

    #[test]
    fn parse_run_args() {
        let cli = Cli::try_parse_from([
            "ohlc",
            "run",
            "--input",
            "trades.jsonl",
            "--window-seconds",
            "60",
            "--instruments",
            "BTC/USD,ETH/USD",
            "--sink",
            "archive",
            "--batch-size",
            "10",
        ])
        .unwrap();

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.source, "replay");
                assert_eq!(args.input, Some(PathBuf::from("trades.jsonl")));
                assert_eq!(args.window_seconds, Some(60));
                assert_eq!(args.instruments.as_deref(), Some("BTC/USD,ETH/USD"));
                assert_eq!(args.sink, "archive");
                assert_eq!(args.batch_size, 10);
                assert_eq!(args.emit_retries, 5);
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn parse_run_kraken_defaults() {
        let cli = Cli::try_parse_from([
            "ohlc",
            "run",
            "--source",
            "kraken",
            "--window-seconds",
            "300",
        ])
        .unwrap();

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.source, "kraken");
                assert_eq!(args.instrument, "BTC/USD");
                assert!(args.pair.is_none());
                assert_eq!(args.poll_ms, 1000);
                assert_eq!(args.sink, "stdout");
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn parse_status_args() {
        let cli = Cli::try_parse_from(["ohlc", "status", "-i", "BTC/USD"]).unwrap();
        match cli.command {
            Commands::Status { instrument } => {
                assert_eq!(instrument, Some("BTC/USD".to_string()));
            }
            _ => panic!("expected Status command"),
        }
    }

    #[test]
    fn parse_validate_args() {
        let cli = Cli::try_parse_from(["ohlc", "validate", "-i", "BTC-USD,ETH-USD"]).unwrap();
        match cli.command {
            Commands::Validate { instruments } => {
                assert_eq!(
                    instruments,
                    Some(vec!["BTC-USD".to_string(), "ETH-USD".to_string()])
                );
            }
            _ => panic!("expected Validate command"),
        }
    }

    fn run_args(flags: &[&str]) -> RunArgs {
        let argv = ["ohlc", "run"].iter().chain(flags).copied();
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Run(args) => args,
            _ => panic!("expected Run command"),
        }
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn build_config_rejects_zero_window() {
        assert!(build_config(&run_args(&["--window-seconds", "0"]), no_env).is_err());
    }

    #[test]
    fn build_config_requires_a_window() {
        assert!(build_config(&run_args(&[]), no_env).is_err());
    }

    #[test]
    fn build_config_applies_filter() {
        let args = run_args(&["--window-seconds", "60", "--instruments", "BTC/USD"]);
        let config = build_config(&args, no_env).unwrap();
        assert!(config.allows("BTC/USD"));
        assert!(!config.allows("ETH/USD"));
    }

    #[test]
    fn build_config_falls_back_to_environment() {
        let env = |var: &str| match var {
            WINDOW_SECONDS_VAR => Some("300".to_string()),
            INSTRUMENT_FILTER_VAR => Some("ETH/USD,SOL/USD".to_string()),
            _ => None,
        };

        let from_env = build_config(&run_args(&[]), env).unwrap();
        assert_eq!(from_env.window().as_millis(), 300_000);
        assert!(from_env.allows("SOL/USD"));
        assert!(!from_env.allows("BTC/USD"));

        let flagged = build_config(&run_args(&["--window-seconds", "60"]), env).unwrap();
        assert_eq!(flagged.window().as_millis(), 60_000);
    }

    #[test]
    fn clean_candles_have_no_issues() {
        let candles = vec![
            candle(0, 100, 105, 99, 101),
            candle(60_000, 101, 102, 100, 100),
            candle(180_000, 100, 100, 100, 100),
        ];
        assert!(candle_issues(&candles).is_empty());
    }

    #[test]
    fn inconsistent_candles_are_reported() {
        let mut short = candle(240_000, 100, 100, 100, 100);
        short.window_end = short.window_start + 30_000;
        let candles = vec![
            candle(0, 100, 99, 101, 100),
            candle(0, 100, 105, 99, 110),
            short,
        ];

        let issues = candle_issues(&candles);
        assert!(issues.iter().any(|i| i.contains("below low")));
        assert!(issues.iter().any(|i| i.contains("outside [low, high]")));
        assert!(issues.iter().any(|i| i.contains("duplicate")));
        assert!(issues.iter().any(|i| i.contains("differs")));
    }

    #[test]
    fn corrupt_window_bounds_are_reported_not_panicking() {
        let mut corrupt = candle(120_000, 100, 100, 100, 100);
        corrupt.window_start = i64::MIN;
        corrupt.window_end = i64::MAX;
        let mut backwards = candle(180_000, 100, 100, 100, 100);
        backwards.window_end = 0;

        let issues = candle_issues(&[candle(0, 100, 100, 100, 100), corrupt, backwards]);
        assert!(issues.iter().any(|i| i.contains("out of range")));
        assert!(issues.iter().any(|i| i.contains("at or before its start")));

        let issues = candle_issues(&[candle(0, 100, 100, 100, 100)].map(|mut c| {
            c.window_start = i64::MIN;
            c
        }));
        assert!(issues.iter().any(|i| i.contains("out of range")));
    }

    #[test]
    fn status_and_validate_on_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = CandleArchive::new(dir.path());
        archive
            .write_batch(&[candle(0, 100, 105, 99, 101), candle(60_000, 101, 102, 100, 100)])
            .unwrap();

        cmd_status(&archive, None).unwrap();
        cmd_status(&archive, Some("BTC/USD")).unwrap();
        cmd_validate(&archive, None).unwrap();
    }
}
