use rust_decimal::Decimal;
use thiserror::Error;

/// Reasons a raw command line could not be turned into a typed command.
///
/// Parse errors never reach the client as failures: the
/// [`CommandParser`](crate::command::CommandParser) recovers every one of them
/// into [`Command::Unknown`](crate::command::Command::Unknown).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The line was empty or contained only whitespace.
    #[error("empty command")]
    Empty,

    /// The leading token is not a known command.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// The command got a wrong number of arguments.
    #[error("{command} expects {expected} argument(s), got {got}")]
    Arity {
        /// Command keyword, e.g. `/trade`.
        command: &'static str,
        /// Human readable expectation.
        expected: &'static str,
        /// Number of arguments actually supplied.
        got: usize,
    },

    /// Trade side is neither `buy` nor `sell`.
    #[error("invalid side: {0}")]
    InvalidSide(String),

    /// Trade quantity is not a positive decimal number.
    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),
}

/// Errors returned by a [`PriceOracle`](crate::oracle::PriceOracle).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OracleError {
    /// The requested symbol is not tracked by the oracle.
    #[error("unknown instrument {0}")]
    UnknownInstrument(String),

    /// The price source failed for a reason other than an unknown symbol.
    ///
    /// Treated as transient: the query is reported as unavailable.
    #[error("price unavailable for {instrument}: {reason}")]
    Unavailable {
        /// Requested symbol.
        instrument: String,
        /// Underlying failure.
        reason: String,
    },

    /// Jitter bound must lie within `[0, 1)`.
    #[error("invalid price jitter {0}, expected a value in [0, 1)")]
    InvalidJitter(f64),
}

/// Errors produced by [`TerminalState`](crate::state::TerminalState) operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// A sell would drive the held quantity below zero.
    #[error("insufficient holding of {instrument}: held {held}, requested {requested}")]
    InsufficientHolding {
        /// Instrument being sold.
        instrument: String,
        /// Quantity held before the attempt.
        held: Decimal,
        /// Quantity the user tried to sell.
        requested: Decimal,
    },

    /// A buy would push the held quantity past the representable maximum.
    #[error("position limit exceeded for {instrument}: held {held}, requested {requested}")]
    QuantityOverflow {
        /// Instrument being bought.
        instrument: String,
        /// Quantity held before the attempt.
        held: Decimal,
        /// Quantity the user tried to buy.
        requested: Decimal,
    },

    /// The alert log lock was poisoned by a panicking thread.
    #[error("alert log unavailable")]
    AlertLogPoisoned,
}

/// Errors of a single client connection.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The outbound queue is closed; the connection is shutting down.
    #[error("connection {0} is closed")]
    Closed(u64),

    /// The outbound queue is full and the packet was dropped.
    #[error("outbound queue of connection {0} is full")]
    QueueFull(u64),

    /// Writing to the underlying transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The writer thread could not be spawned.
    #[error("failed to start writer for connection {0}: {1}")]
    WriterStart(u64, String),
}

/// Errors returned by the [`ConnectionManager`](crate::connection_manager::ConnectionManager).
#[derive(Error, Debug)]
pub enum ManagerError {
    /// The live-connection registry lock was poisoned.
    #[error("connection registry unavailable")]
    RegistryPoisoned,

    /// No live connection with this id.
    #[error("no live connection with id {0}")]
    UnknownConnection(u64),

    /// Failure inside a single connection.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Failure inside the terminal state.
    #[error(transparent)]
    State(#[from] StateError),
}

/// Errors while loading the terminal configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The instruments file could not be read.
    #[error("failed to read instruments file: {0}")]
    Io(#[from] std::io::Error),

    /// A line of the instruments file is malformed.
    #[error("invalid instruments file line {line}: {reason}")]
    InvalidLine {
        /// 1-based line number.
        line: usize,
        /// What is wrong with it.
        reason: String,
    },

    /// The file did not define any instrument.
    #[error("instruments file defines no instruments")]
    NoInstruments,

    /// A numeric option is out of range.
    #[error("invalid option {name}: {reason}")]
    InvalidOption {
        /// Option name.
        name: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// The oracle rejected its parameters.
    #[error(transparent)]
    Oracle(#[from] OracleError),
}

/// Errors of the JSON state snapshot collaborator.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// Snapshot file could not be read or written.
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot file contents are not valid JSON for a snapshot.
    #[error("snapshot format error: {0}")]
    Format(#[from] serde_json::Error),
}

/// Errors of the background market ticker.
#[derive(Error, Debug)]
pub enum TickerError {
    /// The ticker thread could not be spawned.
    #[error("failed to start market ticker: {0}")]
    Start(String),
}

/// Errors produced by the TCP server subsystem.
#[derive(Error, Debug)]
pub enum TcpServerError {
    /// The TCP listener failed to bind to the specified address/port.
    #[error("Failed to bind TCP listener: {0}")]
    BindError(String),

    /// Error while accepting an incoming TCP client connection.
    #[error("Failed to accept TCP connection: {0}")]
    AcceptError(String),

    /// I/O error during communication with a specific client.
    #[error("Client IO error: {0}")]
    ClientIoError(String),

    /// The client never completed the `LOGIN` handshake.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// An error from the connection manager bubbled up into the TCP layer.
    #[error("Connection manager error: {0}")]
    ManagerError(#[from] ManagerError),
}

/// High-level errors returned by the server and client binaries.
#[derive(Error, Debug)]
pub enum CliError {
    /// General wrapper around any textual failure.
    #[error("Cli failed with error: {0}")]
    GeneralError(String),
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        CliError::GeneralError(err.to_string())
    }
}

impl From<TcpServerError> for CliError {
    fn from(err: TcpServerError) -> Self {
        CliError::GeneralError(err.to_string())
    }
}

impl From<SnapshotError> for CliError {
    fn from(err: SnapshotError) -> Self {
        CliError::GeneralError(err.to_string())
    }
}

impl From<TickerError> for CliError {
    fn from(err: TickerError) -> Self {
        CliError::GeneralError(err.to_string())
    }
}
