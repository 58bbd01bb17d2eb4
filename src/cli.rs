use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Build artifact distribution server.
#[derive(Parser, Debug)]
#[command(name = "shelf", version, about)]
pub struct Cli {
    /// Configuration file (.json, .toml, .yaml). Searched for when omitted.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP server (default).
    Serve(ServeArgs),
    /// Print the stored artifacts, newest first.
    List(ListArgs),
    /// Validate the configuration and exit.
    Check,
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Override the configured port.
    #[arg(short, long)]
    pub port: Option<u16>,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only list this category.
    #[arg(long)]
    pub category: Option<String>,
}
