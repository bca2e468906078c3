//! respline - Interactive RESP Client
//!
//! This is the entry point for the respline CLI. It connects to a
//! Redis-compatible server, reads command lines from stdin, and prints each
//! reply. `subscribe` switches the session into subscription mode and
//! prints messages as they arrive.

use std::process;
use std::time::Duration;

use respline::cli::tokenize;
use respline::{Conn, Network, Subscriber};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Client configuration
struct Config {
    /// Transport family to connect over
    network: Network,
    /// Server address to connect to
    host: String,
    /// Connect timeout in seconds; 0 disables it
    timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::Tcp,
            host: "127.0.0.1:6379".to_string(),
            timeout: 30,
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--network" | "-n" => {
                    if i + 1 < args.len() {
                        config.network = args[i + 1].parse().unwrap_or_else(|err| {
                            eprintln!("Error: {err}");
                            process::exit(1);
                        });
                        i += 2;
                    } else {
                        eprintln!("Error: --network requires a value");
                        process::exit(1);
                    }
                }
                "--host" | "-h" => {
                    if i + 1 < args.len() {
                        config.host = args[i + 1].clone();
                        i += 2;
                    } else {
                        eprintln!("Error: --host requires a value");
                        process::exit(1);
                    }
                }
                "--timeout" | "-t" => {
                    if i + 1 < args.len() {
                        config.timeout = args[i + 1].parse().unwrap_or_else(|_| {
                            eprintln!("Error: invalid timeout");
                            process::exit(1);
                        });
                        i += 2;
                    } else {
                        eprintln!("Error: --timeout requires a value");
                        process::exit(1);
                    }
                }
                "--help" => {
                    print_help();
                    process::exit(0);
                }
                "--version" | "-v" => {
                    println!("respline version {}", respline::VERSION);
                    process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    process::exit(1);
                }
            }
        }

        config
    }
}

fn print_help() {
    println!(
        r#"
respline - Interactive RESP Client

USAGE:
    respline [OPTIONS]

OPTIONS:
    -n, --network <NET>     Network to connect over: tcp or unix (default: tcp)
    -h, --host <HOST>       Address to connect to (default: 127.0.0.1:6379)
    -t, --timeout <SECS>    Connect timeout in seconds, 0 for none (default: 30)
    -v, --version           Print version information
        --help              Print this help message

EXAMPLES:
    respline                             # Connect to 127.0.0.1:6379
    respline --host 10.0.0.5:6380        # Connect elsewhere
    respline -n unix -h /run/redis.sock  # Connect over a unix socket

SESSION:
    respline> SET name "Ariz"
    "OK"
    respline> GET name
    "Ariz"
    respline> subscribe news
    [news] hello
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args();

    // Set up logging; protocol-level noise stays out of the prompt.
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(Level::WARN)
        .with_target(false)
        .init();

    let conn = if config.timeout == 0 {
        Conn::dial(config.network, &config.host).await
    } else {
        Conn::dial_timeout(
            config.network,
            &config.host,
            Duration::from_secs(config.timeout),
        )
        .await
    };
    let conn = match conn {
        Ok(conn) => conn,
        Err(err) => {
            eprintln!("{err}");
            process::exit(1);
        }
    };
    println!("Connection established");

    tokio::select! {
        result = repl(conn) => result,
        _ = signal::ctrl_c() => {
            println!();
            Ok(())
        }
    }
}

/// The prompt loop: read a line, tokenize, dispatch, print.
async fn repl(mut conn: Conn) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"respline> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break; // stdin closed
        };
        let words = match tokenize(&line) {
            Ok(words) => words,
            Err(err) => {
                println!("{err}");
                continue;
            }
        };
        let Some((name, args)) = words.split_first() else {
            continue;
        };

        match name.to_lowercase().as_str() {
            "exit" | "quit" => break,
            "subscribe" | "psubscribe" => {
                // Subscription mode does not return to the prompt.
                subscribe(conn, args).await;
                return Ok(());
            }
            _ => run_command(&mut conn, name, args).await,
        }
    }

    conn.close().await?;
    Ok(())
}

/// Sends one command and prints its reply. Errors are printed and the
/// session continues.
async fn run_command(conn: &mut Conn, name: &str, args: &[String]) {
    let mut pipe = match conn.command(name, args.len()).await {
        Ok(pipe) => pipe,
        Err(err) => {
            println!("{err}");
            return;
        }
    };
    for arg in args {
        if let Err(err) = pipe.write_argument(arg.as_bytes()).await {
            println!("{err}");
            return;
        }
    }
    if let Err(err) = pipe.close().await {
        println!("{err}");
        return;
    }
    println!("{}", conn.resp().render().await);
}

/// Dedicates the session's connection to the given channels and prints
/// every message delivered for them.
async fn subscribe(conn: Conn, channels: &[String]) {
    let mut subscriber = Subscriber::new(conn);
    let (tx, mut rx) = mpsc::channel(10);

    for channel in channels {
        if let Err(err) = subscriber.subscribe(channel, tx.clone()).await {
            println!("{err}");
            return;
        }
    }
    drop(tx);

    while let Some(message) = rx.recv().await {
        match std::str::from_utf8(&message.payload) {
            Ok(text) => println!("[{}] {}", message.channel, text),
            Err(_) => println!(
                "[{}] (binary data, {} bytes)",
                message.channel,
                message.payload.len()
            ),
        }
    }
}
