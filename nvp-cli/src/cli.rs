use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Endpoint URI, e.g. tcp://127.0.0.1:21321
    #[arg(short, long, default_value = "tcp://127.0.0.1:21321")]
    pub uri: String,

    /// Submit window depth for I/O commands.
    #[arg(long, default_value_t = 64)]
    pub queue_depth: u64,

    /// Disables reconnect-and-replay on connection failure.
    #[arg(long)]
    pub no_ha: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Runs a server with the in-memory backend.
    Serve {
        /// Blocking backend workers.
        #[arg(long, default_value_t = 4)]
        threads: usize,
    },
    /// Creates a volume.
    Create {
        volume: String,
        /// Size in bytes.
        #[arg(long)]
        size: u64,
    },
    /// Removes a volume.
    Remove { volume: String },
    /// Resizes a volume.
    Truncate {
        volume: String,
        #[arg(long)]
        size: u64,
    },
    /// Prints a volume's size.
    Stat { volume: String },
    /// Lists volumes.
    List,
    /// Snapshot operations.
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },
    /// Reads a range and prints it as hex.
    Read {
        volume: String,
        #[arg(long)]
        offset: u64,
        #[arg(long)]
        size: usize,
    },
    /// Writes a byte pattern over a range.
    Write {
        volume: String,
        #[arg(long)]
        offset: u64,
        #[arg(long)]
        size: usize,
        /// Fill byte (0-255).
        #[arg(long, default_value_t = 0)]
        fill: u8,
    },
}

#[derive(Subcommand)]
pub enum SnapshotCommands {
    /// Creates a snapshot.
    Create {
        volume: String,
        snapshot: String,
        /// Backend sync timeout in seconds.
        #[arg(long, default_value_t = 30)]
        timeout: i64,
    },
    /// Removes a snapshot.
    Remove { volume: String, snapshot: String },
    /// Rolls a volume back to a snapshot.
    Rollback { volume: String, snapshot: String },
    /// Lists snapshots of a volume.
    List { volume: String },
    /// Checks whether a snapshot is synced to the backend.
    Synced { volume: String, snapshot: String },
}
