use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gridflow")]
#[command(about = "Parallel file transfer against a negotiated grid endpoint")]
#[command(after_help = "Run '<command> --help' for detailed options on each command.")]
pub struct Cli {
    /// Override the configuration directory for this invocation
    #[arg(long, global = true, value_name = "PATH")]
    pub config_dir: Option<PathBuf>,
    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send a local file over the parallel sockets
    Put(PutArgs),
    /// Receive a remote file over the parallel sockets
    Get(GetArgs),
    /// Inspect or clear stored restart checkpoints
    Restart {
        #[command(subcommand)]
        command: RestartCommand,
    },
}

/// What the control channel handed over for this transfer.
#[derive(Args, Clone, Debug)]
pub struct EndpointArgs {
    /// Host the server asked the client to connect to
    #[arg(long)]
    pub host: String,
    /// Port of the parallel listener
    #[arg(long)]
    pub port: u16,
    /// One-time password each socket presents after connecting
    #[arg(long)]
    pub cookie: i32,
    /// Number of parallel sockets
    #[arg(long, default_value_t = 4)]
    pub threads: usize,
    /// The session negotiated encryption
    #[arg(long, requires = "secret")]
    pub ssl: bool,
    /// Shared secret from the encrypted control channel
    #[arg(long, env = "GRIDFLOW_SECRET", hide_env_values = true)]
    pub secret: Option<String>,
}

#[derive(Args, Clone, Debug)]
pub struct TransferFlags {
    /// Keep a checkpoint so an interrupted transfer can be resumed
    #[arg(long)]
    pub restart: bool,
    /// Account the checkpoint is recorded under
    #[arg(long, default_value = "local")]
    pub account: String,
    /// Stop the other sockets as soon as one fails
    #[arg(long)]
    pub fail_fast: bool,
    /// Show a progress bar
    #[arg(long, short = 'p')]
    pub progress: bool,
}

#[derive(Args, Clone, Debug)]
pub struct PutArgs {
    /// Local file to send
    pub local: PathBuf,
    /// Absolute path of the target on the grid
    pub remote: String,
    #[command(flatten)]
    pub endpoint: EndpointArgs,
    #[command(flatten)]
    pub flags: TransferFlags,
}

#[derive(Args, Clone, Debug)]
pub struct GetArgs {
    /// Absolute path of the source on the grid
    pub remote: String,
    /// Local file to write
    pub local: PathBuf,
    /// Size of the remote file in bytes
    #[arg(long)]
    pub length: u64,
    /// Overwrite the local file if it exists
    #[arg(long, short = 'f')]
    pub force: bool,
    #[command(flatten)]
    pub endpoint: EndpointArgs,
    #[command(flatten)]
    pub flags: TransferFlags,
}

#[derive(Subcommand, Clone, Debug)]
pub enum RestartCommand {
    /// List every stored checkpoint
    List,
    /// Print one checkpoint as JSON
    Show(ShowArgs),
    /// Remove every stored checkpoint
    Clear,
}

#[derive(Args, Clone, Debug)]
pub struct ShowArgs {
    /// Absolute path on the grid the checkpoint belongs to
    pub remote: String,
    #[arg(long, value_enum, default_value_t = Direction::Put)]
    pub direction: Direction,
    #[arg(long, default_value = "local")]
    pub account: String,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Put,
    Get,
}
