use crate::connection::Connection;
use crate::connection_manager::ConnectionManager;
use crate::defs::{
    CLIENT_WRITE_TIMEOUT_SEC, MAX_LINE_LEN, MAX_USER_ID_LEN, TCP_CONNECTION_TICK_PERIOD_MSEC,
};
use crate::errors::TcpServerError;
use crate::processor::USAGE;

use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Reply to input received before a valid `LOGIN`.
pub const HANDSHAKE_HINT: &str = "ERR expected LOGIN <user>";

/// TCP front end of the terminal.
///
/// Protocol (newline-terminated lines):
/// - `LOGIN <user>` → `WELCOME <user>`; required before anything else
/// - `PING` → `PONG`
/// - any other line → handed to the [`ConnectionManager`]
pub struct TcpServer {
    /// TCP listener socket
    listener: TcpListener,

    /// Shared connection registry and command pipeline
    manager: Arc<ConnectionManager>,

    /// Idle time after which a silent client is dropped
    keep_alive: Duration,

    /// Set to stop the accept loop
    shutdown_flag: Arc<AtomicBool>,
}

impl TcpServer {
    /// Creates a new TCP server bound to the given address.
    ///
    /// # Arguments
    /// * `addr` - Address to bind, e.g., `"127.0.0.1:4000"`; port `0` picks a free one.
    /// * `manager` - Connection manager every client is registered with.
    /// * `keep_alive` - Idle timeout per client.
    ///
    /// # Returns
    /// * `Ok(TcpServer)` if binding succeeds.
    /// * `Err(TcpServerError::BindError)` if the port is unavailable.
    pub fn new(
        addr: &str,
        manager: Arc<ConnectionManager>,
        keep_alive: Duration,
    ) -> Result<Self, TcpServerError> {
        log::info!("Binding TCP server to address: {}", addr);
        let listener =
            TcpListener::bind(addr).map_err(|e| TcpServerError::BindError(e.to_string()))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| TcpServerError::BindError(e.to_string()))?;
        log::info!("TCP server successfully bound to: {}", addr);

        Ok(Self {
            listener,
            manager,
            keep_alive,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, TcpServerError> {
        self.listener
            .local_addr()
            .map_err(|e| TcpServerError::BindError(e.to_string()))
    }

    /// Flag that stops [`start`](Self::start) once set; clone it into signal handlers.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown_flag)
    }

    /// Asks the accept loop to stop.
    pub fn stop(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
    }

    /// Runs the accept loop until stopped.
    ///
    /// Every accepted client gets a dedicated handler thread; a failing client
    /// never affects the others.
    pub fn start(&self) -> Result<(), TcpServerError> {
        log::info!("TCP server starting main loop");
        let tick = Duration::from_millis(TCP_CONNECTION_TICK_PERIOD_MSEC);

        while !self.shutdown_flag.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    log::info!("New TCP connection from: {}", addr);
                    let manager = self.manager.clone();
                    let keep_alive = self.keep_alive;
                    thread::spawn(move || {
                        log::debug!("Spawning handler thread for client: {}", addr);
                        if let Err(e) = handle_connection(stream, addr, manager, keep_alive) {
                            log::warn!("Connection handler error for {}: {}", addr, e);
                        }
                        log::debug!("Handler thread finished for client: {}", addr);
                    });
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(tick),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("Failed to accept TCP connection: {}", e);
                    return Err(TcpServerError::AcceptError(e.to_string()));
                }
            }
        }

        log::info!("TCP server main loop stopped");
        Ok(())
    }
}

fn io_err(e: std::io::Error) -> TcpServerError {
    TcpServerError::ClientIoError(e.to_string())
}

fn is_timeout(e: &std::io::Error) -> bool {
    e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut
}

/// One frame read from a client.
#[derive(Debug, PartialEq)]
enum Frame {
    /// A complete line, terminator stripped and trimmed.
    Line(String),
    /// A line that is not UTF-8 or exceeds [`MAX_LINE_LEN`].
    Malformed,
}

/// Newline framing over raw bytes.
///
/// Partial input survives read timeouts, so a line split across reads (even
/// inside a multi-byte character) is reassembled before decoding.
struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    discarding: bool,
}

impl<R: io::Read> LineReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
            discarding: false,
        }
    }

    /// Next frame, `Ok(None)` on EOF. Timeouts surface as errors and keep
    /// the partial line.
    fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        loop {
            let available = self.inner.fill_buf()?;
            if available.is_empty() {
                return Ok(None);
            }

            let newline = available.iter().position(|&b| b == b'\n');
            let take = newline.map_or(available.len(), |pos| pos + 1);
            if !self.discarding {
                self.buf.extend_from_slice(&available[..newline.unwrap_or(take)]);
            }
            self.inner.consume(take);

            if newline.is_some() {
                if std::mem::take(&mut self.discarding) {
                    continue;
                }
                let raw = std::mem::take(&mut self.buf);
                if raw.len() > MAX_LINE_LEN {
                    return Ok(Some(Frame::Malformed));
                }
                return Ok(Some(match String::from_utf8(raw) {
                    Ok(line) => Frame::Line(line.trim().to_string()),
                    Err(_) => Frame::Malformed,
                }));
            }

            if !self.discarding && self.buf.len() > MAX_LINE_LEN {
                self.buf.clear();
                self.discarding = true;
                return Ok(Some(Frame::Malformed));
            }
        }
    }
}

/// Unregisters its connection when dropped, including during a panic unwind.
struct Registration<'a> {
    manager: &'a ConnectionManager,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.manager.unregister(self.id) {
            log::error!("Failed to unregister connection {}: {}", self.id, e);
        }
    }
}

/// Handles a single client TCP connection.
///
/// - Performs the `LOGIN` handshake.
/// - Registers the client and forwards every line to the manager.
/// - Unregisters exactly once, whatever ends the session.
fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    manager: Arc<ConnectionManager>,
    keep_alive: Duration,
) -> Result<(), TcpServerError> {
    // Accepted sockets may inherit the listener's non-blocking mode.
    stream.set_nonblocking(false).map_err(io_err)?;
    stream
        .set_write_timeout(Some(Duration::from_secs(CLIENT_WRITE_TIMEOUT_SEC)))
        .map_err(io_err)?;

    // Clone the stream for buffered, line-based reading
    let cloned = stream.try_clone().map_err(io_err)?;
    cloned
        .set_read_timeout(Some(Duration::from_millis(TCP_CONNECTION_TICK_PERIOD_MSEC)))
        .map_err(io_err)?;
    let mut reader = LineReader::new(cloned);

    let Some(user) = handshake(&mut stream, &mut reader, addr, keep_alive)? else {
        log::info!("Client {} left before logging in", addr);
        return Ok(());
    };

    let sink = stream.try_clone().map_err(io_err)?;
    let conn = manager.register(&user, sink)?;
    let _registration = Registration {
        manager: &manager,
        id: conn.id(),
    };
    log::info!("[tcp] {} logged in as {} (connection {})", addr, user, conn.id());

    read_loop(&mut reader, &conn, &manager, addr, keep_alive)
}

/// Waits for `LOGIN <user>`; `None` if the client leaves or times out first.
fn handshake(
    stream: &mut TcpStream,
    reader: &mut LineReader<TcpStream>,
    addr: SocketAddr,
    keep_alive: Duration,
) -> Result<Option<String>, TcpServerError> {
    let mut last_seen = Instant::now();

    loop {
        match reader.next_frame() {
            Ok(None) => return Ok(None),
            Ok(Some(frame)) => {
                last_seen = Instant::now();
                let login = match &frame {
                    Frame::Line(msg) if msg.is_empty() => continue,
                    Frame::Line(msg) if msg.eq_ignore_ascii_case("PING") => {
                        stream.write_all(b"PONG\n").map_err(io_err)?;
                        continue;
                    }
                    Frame::Line(msg) => parse_login(msg),
                    Frame::Malformed => None,
                };
                match login {
                    Some(user) => return Ok(Some(user)),
                    None => {
                        log::warn!("Invalid handshake from {}: {:?}", addr, frame);
                        stream
                            .write_all(format!("{}\n", HANDSHAKE_HINT).as_bytes())
                            .map_err(io_err)?;
                    }
                }
            }
            Err(ref e) if is_timeout(e) => {
                if last_seen.elapsed() > keep_alive {
                    log::warn!("Client {} did not log in within {:?}", addr, keep_alive);
                    return Ok(None);
                }
            }
            Err(e) => return Err(TcpServerError::Handshake(e.to_string())),
        }
    }
}

/// Parses `LOGIN <user>`; the user id is 1..=32 chars of `[A-Za-z0-9_-]`.
fn parse_login(msg: &str) -> Option<String> {
    let mut parts = msg.split_whitespace();
    let keyword = parts.next()?;
    let user = parts.next()?;
    if !keyword.eq_ignore_ascii_case("LOGIN") || parts.next().is_some() {
        return None;
    }
    let valid = user.len() <= MAX_USER_ID_LEN
        && user
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    valid.then(|| user.to_string())
}

/// Forwards lines to the manager until EOF, error or keep-alive timeout.
///
/// Undecodable or oversized lines get the usage reply; the connection stays open.
fn read_loop(
    reader: &mut LineReader<TcpStream>,
    conn: &Connection,
    manager: &ConnectionManager,
    addr: SocketAddr,
    keep_alive: Duration,
) -> Result<(), TcpServerError> {
    let mut last_seen = Instant::now();

    loop {
        match reader.next_frame() {
            Ok(None) => {
                log::info!("Client {} closed connection", addr);
                return Ok(());
            }
            Ok(Some(Frame::Malformed)) => {
                last_seen = Instant::now();
                log::debug!("Malformed line from {}", addr);
                conn.send(vec![USAGE.to_string()])
                    .map_err(|e| TcpServerError::ClientIoError(e.to_string()))?;
            }
            Ok(Some(Frame::Line(msg))) => {
                last_seen = Instant::now();

                if msg.is_empty() {
                    continue; // ignore empty lines
                }
                if msg.eq_ignore_ascii_case("PING") {
                    conn.send(vec!["PONG".to_string()])
                        .map_err(|e| TcpServerError::ClientIoError(e.to_string()))?;
                    continue;
                }
                manager.route_inbound(conn.id(), &msg)?;
            }
            Err(ref e) if is_timeout(e) => {
                // Keep-alive check
                if last_seen.elapsed() > keep_alive {
                    log::warn!(
                        "Client {} keep-alive timeout ({:?}), disconnecting",
                        addr,
                        keep_alive
                    );
                    return Ok(());
                }
            }
            Err(e) => {
                log::error!("Connection failed for {}: {}", addr, e);
                return Err(io_err(e));
            }
        }
    }
}
