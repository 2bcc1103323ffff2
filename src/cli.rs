use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "shared MITM proxy supervisor")]
pub struct Args {
    /// Sub‑commands (run, status, etc.)
    #[command(subcommand)]
    pub sub: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Start or join the shared proxy and supervise it (default if no sub‑command)
    Run {
        /// Path to configuration file
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
    /// Check the proxy port and report its owner (Exit 0 = served, 1 = free)
    Status {
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
    /// Clear proxy indirection left behind by a crashed instance
    Cleanup {
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
    /// Print the interception CA certificate location
    CertPath,
}
