//! # Trade Terminal Server
//!
//! This crate implements a command-driven trading terminal served over a
//! **line-based TCP link**. Clients log in, query simulated prices, trade
//! against them, inspect their portfolio and read system alerts; join/leave
//! events and large price moves are broadcast to every connected client.
//!
//! ## Features
//!
//! - Load the instrument universe from a configuration file.
//! - Simulated price oracle with bounded random jitter per quote.
//! - Per-user portfolios with atomic, non-negative position updates.
//! - Bounded alert log shared by every connection.
//! - Per-connection bounded outbound queues; slow clients never stall broadcasts.
//! - Background market ticker turning large price moves into alerts.
//! - Optional JSON snapshot of portfolios across restarts.
//! - Keep-alive monitoring and graceful shutdown.
//!
//! ## Architecture Overview
//!
//! The crate is organized into several modules:
//!
//! - [`quote`](crate::quote) — Data model for an individual instrument price.
//! - [`oracle`](crate::oracle) — Price source trait and the local simulator.
//! - [`state`](crate::state) — Portfolios and the alert log.
//! - [`command`](crate::command) — Typed commands and their parser.
//! - [`processor`](crate::processor) — Applies commands, produces replies and broadcasts.
//! - [`connection`](crate::connection) — One live client and its outbound queue.
//! - [`connection_manager`](crate::connection_manager) — Live connections, routing, fan-out.
//! - [`tcp_server`](crate::tcp_server) — Accept loop, handshake and per-client read loop.
//! - [`market_ticker`](crate::market_ticker) — Periodic price moves and price alerts.
//! - [`snapshot`](crate::snapshot) — Portfolio persistence.
//! - [`config`](crate::config) — Options and component wiring.
//! - [`defs`](crate::defs) — Shared constants and defaults.
//! - [`errors`](crate::errors) — Error types used across modules.
//!
//! ## TCP Protocol
//!
//! Every message is a single line terminated by `\n`.
//!
//! - `LOGIN <user>` → `WELCOME <user>`. Must come first; reconnecting with the
//!   same user resumes the same portfolio.
//! - `PING` → `PONG`.
//! - `/price [SYMBOL]` → `PRICE <SYMBOL> <price>`
//! - `/portfolio` → `PORTFOLIO empty` or `PORTFOLIO SYM=qty ...`
//! - `/trade <buy|sell> <SYMBOL> <QTY>` → `OK ...` or `ERR ...`
//! - `/alerts` → `ALERTS none` or `ALERTS <n>` followed by `n` alert lines
//! - Anything else → a `HELP usage: ...` line; the connection stays open.
//!
//! Broadcasts arrive as `ALERT <message>` lines at any time.
//!
//! ## Example: Running the Server
//!
//! ```no_run
//! use trade_terminal::config::TerminalConfig;
//! use trade_terminal::tcp_server::TcpServer;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TerminalConfig::new("instruments.txt");
//!     let terminal = config.build()?;
//!
//!     let tcp = TcpServer::new("127.0.0.1:4000", terminal.manager.clone(), config.keep_alive)?;
//!     tcp.start()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![deny(unreachable_pub)]

pub mod command;
pub mod config;
pub mod connection;
pub mod connection_manager;
pub mod defs;
pub mod errors;
pub mod market_ticker;
pub mod oracle;
pub mod processor;
pub mod quote;
pub mod snapshot;
pub mod state;
pub mod tcp_server;
