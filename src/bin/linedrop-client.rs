//! Interactive linedrop client.
//!
//! Reads commands from stdin, sends them to the server and prints replies.
//! Received files land in the downloads directory with a PASS/FAIL verdict.

use clap::Parser;
use linedrop::client::{Client, Connect, Reply};
use linedrop::config::ClientArgs;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = ClientArgs::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    tokio::fs::create_dir_all(&args.downloads).await?;

    let addr = format!("{}:{}", args.host, args.port);
    let mut client = match Client::connect(addr.as_str(), &args.downloads).await {
        Ok(Connect::Connected(client)) => client,
        Ok(Connect::ServerFull) => {
            println!("[CLIENT] Server is at capacity. Try again later.");
            return Ok(());
        }
        Err(e) => {
            println!("[CLIENT] Could not connect to {}: {}", addr, e);
            return Ok(());
        }
    };

    println!("[CLIENT] Assigned name: {}", client.name());
    println!("[SERVER] {}", client.welcome());
    println!("Commands: help | list | status | who | ping | uptime | get <file> | <filename> | about | exit");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{} > ", client.name());
        std::io::stdout().flush()?;

        // EOF on stdin ends the session like `exit`
        let input = match stdin.next_line().await? {
            Some(line) => line.trim().to_string(),
            None => "exit".to_string(),
        };
        if input.is_empty() {
            continue;
        }

        let reply = match client.request(&input).await {
            Ok(reply) => reply,
            Err(e) => {
                println!("[CLIENT] {}", e);
                break;
            }
        };

        match reply {
            Reply::Line(line) => println!("[SERVER] {}", line),
            Reply::Status(rows) => {
                println!("[SERVER] --- STATUS ---");
                for row in rows {
                    println!("{}", row);
                }
                println!("[SERVER] ---------------");
            }
            Reply::Files(names) => {
                println!("[SERVER] --- FILES ---");
                for name in names {
                    println!("{}", name);
                }
                println!("[SERVER] --------------");
            }
            Reply::File(report) => {
                println!("[CLIENT] Saved file to: {}", report.path.display());
                if !report.is_complete() {
                    println!(
                        "[CLIENT] Received {} of {} bytes",
                        report.received, report.header.size
                    );
                }
                println!("[CLIENT] SHA256 verify: {}", report.verdict);
            }
            Reply::Bye(line) => {
                println!("[SERVER] {}", line);
                break;
            }
        }
    }

    Ok(())
}
