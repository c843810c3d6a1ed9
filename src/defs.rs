//! Shared constants and defaults.

/// Instrument used by `/price` when no symbol is given.
pub const DEFAULT_INSTRUMENT: &str = "SOL";

/// Maximum number of alerts kept in the terminal alert log.
///
/// When the log is full, the oldest alert is evicted on every append.
pub const ALERT_LOG_CAPACITY: usize = 100;

/// Number of alerts returned by a single `/alerts` query.
pub const RECENT_ALERTS_LIMIT: usize = 20;

/// Per-connection outbound queue size (in packets).
///
/// Broadcasts that find the queue full are dropped for that connection
/// instead of stalling the fan-out.
pub const OUTBOUND_BUFFER_SIZE: usize = 64;

/// Maximum relative price change applied by the simulated oracle on a single call.
///
/// `0.02` means every quote moves by at most ±2%.
pub const PRICE_JITTER: f64 = 0.02;

/// Cumulative relative move that turns a price change into a broadcast alert.
pub const PRICE_ALERT_THRESHOLD: f64 = 0.05;

/// Market ticker period in milliseconds.
///
/// Every tick moves all simulated prices once.
pub const MARKET_TICK_PERIOD_MSEC: u64 = 1000;

/// Lowest price the simulated oracle will ever quote.
pub const MIN_PRICE: f64 = 0.0001;

/// Maximum allowed time (in seconds) without any input from a client.
///
/// A client that stays silent longer is disconnected and unregistered.
pub const CLIENT_KEEP_ALIVE_SEC: u64 = 300;

/// Polling interval (in milliseconds) used by the TCP layer when waiting for
/// new connections or data.
///
/// Reducing this value makes the server more responsive but increases CPU usage.
pub const TCP_CONNECTION_TICK_PERIOD_MSEC: u64 = 200;

/// Longest accepted user identifier in the `LOGIN` handshake.
pub const MAX_USER_ID_LEN: usize = 32;

/// Maximum time (in seconds) a single write to a client may block.
///
/// A client that stops reading fails its writes after this delay, which
/// unblocks its writer thread and lets the connection close.
pub const CLIENT_WRITE_TIMEOUT_SEC: u64 = 5;

/// Longest accepted input line in bytes, excluding the terminator.
///
/// Longer lines are discarded up to the next newline and answered as malformed.
pub const MAX_LINE_LEN: usize = 1024;
