//! keldad — the Kelda controller daemon.
//!
//! Runs the reconciliation engine: imports a compiled blueprint into the
//! in-memory store and drives the cloud providers and the Kubernetes
//! cluster toward it. The user-facing CLI (`show`, `ssh`, and friends)
//! is a separate front-end; this binary only hosts the control loop and
//! an `init` helper that prints a starter blueprint.
//!
//! # Usage
//!
//! ```text
//! keldad daemon --blueprint ./blueprint.json --admin-cidr 203.0.113.7/32
//! keldad init > blueprint.json
//! ```

mod daemon;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "keldad", about = "Kelda controller daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller loop.
    Daemon {
        /// Path to the compiled blueprint JSON to import at startup.
        #[arg(long)]
        blueprint: Option<std::path::PathBuf>,

        /// CIDR ranges granted full access to the deployment's machines.
        /// May be repeated.
        #[arg(long = "admin-cidr")]
        admin_cidrs: Vec<String>,

        /// Kubernetes apiserver address.
        #[arg(long, default_value = "http://localhost:8080")]
        kube_api: String,

        /// This controller's private IP, recorded as the leader address.
        #[arg(long, default_value = "127.0.0.1")]
        private_ip: String,

        /// Registry that built images are pushed to.
        #[arg(long, default_value = "localhost:5000")]
        registry: String,
    },

    /// Print a starter blueprint to stdout.
    Init,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,keldad=debug,kelda=debug".parse().expect("static filter")),
        )
        .init();

    // Exit codes: 0 success, 1 user/config error, 2 connection error.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Daemon {
            blueprint,
            admin_cidrs,
            kube_api,
            private_ip,
            registry,
        } => {
            daemon::run(daemon::DaemonOptions {
                blueprint,
                admin_cidrs,
                kube_api,
                private_ip,
                registry,
            })
            .await
        }
        Command::Init => {
            println!("{}", starter_blueprint());
            Ok(())
        }
    };

    if let Err(err) = result {
        eprintln!("keldad: {err:#}");
        let code = if err.is::<daemon::ConnectError>() { 2 } else { 1 };
        std::process::exit(code);
    }
}

fn starter_blueprint() -> &'static str {
    r#"{
    "namespace": "kelda-starter",
    "machines": [
        {"role": "Master", "provider": "Amazon", "region": "us-west-1", "size": "m4.large"},
        {"role": "Worker", "provider": "Amazon", "region": "us-west-1", "size": "m4.large"}
    ],
    "containers": [
        {"hostname": "web", "image": "nginx", "env": {}}
    ],
    "connections": [
        {"from": ["public"], "to": ["web"], "minPort": 80, "maxPort": 80}
    ],
    "placements": [],
    "loadBalancers": [],
    "invariants": []
}"#
}
