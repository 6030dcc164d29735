//! hotrodkv CLI Client
//!
//! Command-line interface speaking Hot Rod to a hotrodkv (or any Hot Rod) server.

use clap::{Parser, Subcommand};
use hotrodkv::protocol::client::{Client, RequestWriter};
use hotrodkv::protocol::constants::VERSION_28;

/// hotrodkv CLI
#[derive(Parser, Debug)]
#[command(name = "hotrodkv-cli")]
#[command(about = "CLI for hotrodkv caches")]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:11222")]
    server: String,

    /// Cache to address (empty for the default cache)
    #[arg(short, long, default_value = "")]
    cache: String,

    /// Protocol version byte (e.g. 13 for 1.3, 28 for 2.8)
    #[arg(short = 'p', long, default_value_t = VERSION_28)]
    protocol: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ping the server
    Ping,

    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Store a key-value pair
    Put {
        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// Remove a key
    Remove {
        /// The key to remove
        key: String,
    },

    /// Number of entries in the cache
    Size,

    /// Cache statistics
    Stats,
}

fn main() {
    let args = Args::parse();

    let writer = RequestWriter::new(args.protocol).cache_name(args.cache.clone());
    let mut client = match Client::connect(&args.server, writer) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Failed to connect to {}: {}", args.server, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&mut client, args.command) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(client: &mut Client, command: Commands) -> hotrodkv::Result<()> {
    match command {
        Commands::Ping => {
            client.ping()?;
            println!("PONG");
        }
        Commands::Get { key } => match client.get(key.as_bytes())? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("(nil)"),
        },
        Commands::Put { key, value } => {
            client.put(key.as_bytes(), value.as_bytes())?;
            println!("OK");
        }
        Commands::Remove { key } => {
            if client.remove(key.as_bytes())? {
                println!("(removed)");
            } else {
                println!("(not found)");
            }
        }
        Commands::Size => println!("{}", client.size()?),
        Commands::Stats => {
            for (name, value) in client.stats()? {
                println!("{}: {}", name, value);
            }
        }
    }
    Ok(())
}
