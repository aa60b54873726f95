use std::time::Duration;

use clap::Parser;

use ellog::{Client, ClientConfig, Error};

#[derive(Parser, Debug)]
#[command(author, version, about = "Ask the server for the latest elevation angle", long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:9876")]
    server: String,

    /// Round-trip timeout in milliseconds
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,

    /// Print the full record instead of the bare angle
    #[arg(short, long)]
    verbose: bool,

    /// Print the last N records instead of the latest one
    #[arg(long)]
    recent: Option<usize>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(match err {
            Error::ServerUnavailable(_) => 2,
            _ => 1,
        });
    }
}

fn run() -> Result<(), Error> {
    let args = Args::parse();
    let config = ClientConfig {
        timeout: Duration::from_millis(args.timeout_ms),
    };
    let mut client = Client::connect(args.server.as_str(), config)?;

    if let Some(count) = args.recent {
        for record in client.recent(count)? {
            println!("{record}");
        }
        return Ok(());
    }

    match client.latest()? {
        Some(record) if args.verbose => println!("{record}"),
        Some(record) => println!("{:.3}", record.angle),
        None => println!("no data"),
    }
    Ok(())
}
