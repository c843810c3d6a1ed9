//! # Terminal Server
//!
//! TCP trading terminal: simulated prices, per-user portfolios and broadcast alerts.
//!
//! ## Features
//! - Loads the instrument universe from a file (`SYMBOL [PRICE]` per line).
//! - Moves prices in the background and broadcasts large moves.
//! - Line-based TCP interface: `LOGIN`, `PING`, `/price`, `/portfolio`, `/trade`, `/alerts`.
//! - Optional JSON snapshot of portfolios, restored on startup and saved on exit.
//! - Ctrl-C closes every connection with a final notice.
//!
//! ## Command-line Options
//! - `--tcp-addr` / `-t`: TCP listen address (default `127.0.0.1:4000`).
//! - `--config` / `-c`: Path to the instruments file.
//! - `--log-level` / `-l`: Log level (`error`, `warn`, `info`, `debug`, `trace`).
//! - `--state-file` / `-s`: Portfolio snapshot file.
//! - Tuning: `--default-instrument`, `--alert-capacity`, `--outbound-buffer`,
//!   `--jitter`, `--alerts-limit`, `--alert-threshold`, `--tick-ms`, `--keep-alive-sec`.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;
use structopt::StructOpt;
use trade_terminal::config::TerminalConfig;
use trade_terminal::errors::CliError;
use trade_terminal::market_ticker::MarketTicker;
use trade_terminal::snapshot;
use trade_terminal::tcp_server::TcpServer;

/// Command-line options for the Terminal Server
#[derive(Debug, StructOpt)]
#[structopt(
    name = "terminal_server",
    about = "TCP trading terminal with simulated prices"
)]
struct Opt {
    /// TCP listen address, e.g., 127.0.0.1:4000
    #[structopt(short, long, default_value = "127.0.0.1:4000")]
    tcp_addr: String,

    /// Path to the instruments file
    #[structopt(short, long)]
    config: PathBuf,

    /// Log level: error, warn, info, debug, trace
    #[structopt(short, long, default_value = "info")]
    log_level: String,

    /// Portfolio snapshot file, restored on startup and written on exit
    #[structopt(short, long)]
    state_file: Option<PathBuf>,

    /// Instrument used by `/price` without arguments
    #[structopt(long, default_value = "SOL")]
    default_instrument: String,

    /// Alert log capacity
    #[structopt(long, default_value = "100")]
    alert_capacity: usize,

    /// Per-connection outbound queue size, in packets
    #[structopt(long, default_value = "64")]
    outbound_buffer: usize,

    /// Maximum relative price move per quote, e.g. 0.02 for ±2%
    #[structopt(long, default_value = "0.02")]
    jitter: f64,

    /// Alerts returned by `/alerts`
    #[structopt(long, default_value = "20")]
    alerts_limit: usize,

    /// Cumulative price move that triggers an alert, e.g. 0.05 for 5%
    #[structopt(long, default_value = "0.05")]
    alert_threshold: f64,

    /// Market ticker period in milliseconds
    #[structopt(long, default_value = "1000")]
    tick_ms: u64,

    /// Seconds of silence after which a client is disconnected
    #[structopt(long, default_value = "300")]
    keep_alive_sec: u64,
}

impl Opt {
    fn terminal_config(&self) -> TerminalConfig {
        let mut config = TerminalConfig::new(&self.config);
        config.default_instrument = self.default_instrument.to_ascii_uppercase();
        config.alert_capacity = self.alert_capacity;
        config.outbound_buffer = self.outbound_buffer;
        config.jitter = self.jitter;
        config.alerts_limit = self.alerts_limit;
        config.alert_threshold = self.alert_threshold;
        config.tick_period = Duration::from_millis(self.tick_ms);
        config.keep_alive = Duration::from_secs(self.keep_alive_sec);
        config
    }
}

/// Initializes the logger using env_logger with the given level
fn init_logger(level: &str) -> Result<(), CliError> {
    let mut builder = env_logger::Builder::new();

    let log_level = match level.to_lowercase().as_str() {
        "error" => log::LevelFilter::Error,
        "warn" => log::LevelFilter::Warn,
        "info" => log::LevelFilter::Info,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    };

    builder.filter_level(log_level);
    builder.format_timestamp_micros();
    builder.format_module_path(false);
    builder.format_target(false);
    builder
        .try_init()
        .map_err(|e| CliError::GeneralError(e.to_string()))
}

fn main() -> Result<(), CliError> {
    // Parse CLI arguments
    let opt = Opt::from_args();

    // Initialize logger
    init_logger(&opt.log_level)?;

    log::info!("Starting Terminal Server");
    log::debug!("Command line options: {:?}", opt);

    let config = opt.terminal_config();
    let terminal = config.build()?;

    if let Some(path) = &opt.state_file {
        snapshot::restore_if_present(&terminal.state, path)?;
    }

    let ticker = MarketTicker::new(
        terminal.oracle.clone(),
        terminal.manager.clone(),
        config.tick_period,
    );
    ticker.start()?;

    let tcp_server = TcpServer::new(&opt.tcp_addr, terminal.manager.clone(), config.keep_alive)?;

    let stop = tcp_server.shutdown_flag();
    ctrlc::set_handler(move || {
        log::info!("Interrupt received, shutting down");
        stop.store(true, Ordering::SeqCst);
    })
    .map_err(|e| CliError::GeneralError(format!("Failed to install signal handler: {}", e)))?;

    log::info!("TCP server initialized. Waiting for client connections...");

    // Run server (blocking call until Ctrl-C)
    let served = tcp_server.start();

    ticker.shutdown();
    terminal.manager.shutdown("BYE server shutting down");

    if let Some(path) = &opt.state_file {
        snapshot::save(&terminal.state, path)?;
    }

    served?;
    log::info!("Server shutdown complete");
    Ok(())
}
