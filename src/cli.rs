use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "nodeguardian")]
#[command(about = "Cluster-level automated node remediation controller")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the control loop (watch + trigger + recovery + HTTP server)
    Run {
        #[arg(long, default_value = "config.yaml")]
        config: String,
        #[arg(long, default_value = "/etc/nodeguardian/secrets")]
        secrets_dir: String,
        #[arg(long, default_value = "0.0.0.0:8080")]
        addr: String,
        /// Disable leader election (always act as leader; for single-replica use)
        #[arg(long)]
        no_leader_election: bool,
    },

    /// Check cluster connectivity and dry-run rule validation
    Check {
        #[arg(long, default_value = "config.yaml")]
        config: String,
    },

    /// List Kubernetes resources (e.g. pods, rules)
    List {
        /// Resource type to list (pods, rules)
        resource: String,
    },

    /// Manage the NodeGuardianRule and AlertTemplate CRDs
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML for NodeGuardianRule and AlertTemplate to stdout
    Generate,

    /// Install both CRDs into the connected cluster
    Install,
}
