use clap::{Parser, Subcommand};

/// Command line surface over the authentication-gated store.
#[derive(Parser, Debug)]
#[command(
    name = "bioseal",
    about = "Keep secrets behind a user-presence check",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Defaults to `status` when absent.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Decrypt an entry and print it to stdout.
    Read { name: String },
    /// Encrypt and store content under an entry name.
    Write { name: String, content: String },
    /// Remove an entry's key and payload.
    Delete { name: String },
    /// Report which authentication factors are usable.
    Status,
    /// Round-trip a probe entry through the encrypted store.
    Health,
    /// Print version and exit.
    Version,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}
