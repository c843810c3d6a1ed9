use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use structopt::StructOpt;

/// Command-line options for the client
#[derive(Debug, StructOpt)]
#[structopt(
    name = "terminal_client",
    about = "Interactive client for the trading terminal"
)]
struct Opt {
    /// TCP server address, e.g., 127.0.0.1:4000
    #[structopt(short, long, default_value = "127.0.0.1:4000")]
    server_addr: String,

    /// User to log in as
    #[structopt(short, long)]
    user: String,

    /// Keep-alive interval in seconds
    #[structopt(short, long, default_value = "30")]
    keep_alive_sec: u64,
}

/// Connects to the terminal and performs the `LOGIN` handshake
fn connect(addr: &str, user: &str) -> io::Result<(TcpStream, BufReader<TcpStream>)> {
    let mut stream = TcpStream::connect(addr)?;
    let mut reader = BufReader::new(stream.try_clone()?);

    send_line(&mut stream, &format!("LOGIN {}", user))?;
    let mut reply = String::new();
    if reader.read_line(&mut reply)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "Server closed connection",
        ));
    }
    if !reply.starts_with("WELCOME") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Login rejected: {}", reply.trim()),
        ));
    }
    println!("Connected to {} as {}", addr, user);
    Ok((stream, reader))
}

/// Writes one newline-terminated line
fn send_line(stream: &mut TcpStream, line: &str) -> io::Result<()> {
    stream.write_all(line.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.flush()
}

/// Prints every server line until the connection ends
fn print_incoming(reader: BufReader<TcpStream>) {
    for line in reader.lines() {
        match line {
            Ok(line) if line == "PONG" => {}
            Ok(line) => println!("{}", line),
            Err(e) => {
                eprintln!("Connection error: {}", e);
                break;
            }
        }
    }
    println!("Disconnected from server.");
}

/// Terminal client main loop
fn main() -> io::Result<()> {
    let opt = Opt::from_args();

    let (stream, reader) = connect(&opt.server_addr, &opt.user)?;
    let stream = Arc::new(Mutex::new(stream));

    // Replies and broadcasts interleave, so one thread prints everything
    thread::spawn(move || print_incoming(reader));

    // Spawn keep-alive thread
    {
        let stream_clone = Arc::clone(&stream);
        let keep_alive = Duration::from_secs(opt.keep_alive_sec);
        thread::spawn(move || loop {
            thread::sleep(keep_alive);
            let Ok(mut s) = stream_clone.lock() else {
                break;
            };
            if let Err(e) = send_line(&mut s, "PING") {
                eprintln!("Keep-alive failed: {}", e);
                break;
            }
        });
    }

    // Interactive CLI loop
    let stdin = io::stdin();
    loop {
        print!("terminal> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if stdin.read_line(&mut input)? == 0 {
            break;
        }
        let command = input.trim();

        if command.is_empty() {
            continue;
        }
        if command.eq_ignore_ascii_case("EXIT") {
            println!("Exiting client.");
            break;
        }

        let mut s = stream
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "stream lock poisoned"))?;
        if let Err(e) = send_line(&mut s, command) {
            eprintln!("Command failed: {}", e);
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_invalid_server() {
        let result = connect("127.0.0.1:1", "alice"); // nothing listens on port 1
        assert!(result.is_err());
    }
}
