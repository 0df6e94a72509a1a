use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sdn-zerotrust")]
#[command(about = "Zero-trust SDN policy reconciliation controller")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check repository and orchestrator connectivity
    Check,

    /// List enabled policies from the policy repository
    Policies,

    /// Run the policy reconciliation controller
    Run,
}
