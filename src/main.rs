//! Run one process of the broadcast/agreement stack.

use core::fmt;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use error_stack::{Report, ResultExt};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};

use braid::config::Mode;
use braid::directory::{Directory, ProcessId};
use braid::node::Node;
use braid::output::OutputLog;
use braid::transport::UdpTransport;

#[derive(Parser, Debug)]
#[command(name = "braid")]
#[command(about = "Run one process of the braid broadcast/agreement stack")]
struct Args {
    /// Identifier of this process in the hosts file.
    #[arg(long)]
    id: u32,

    /// Path to the hosts file (one `<id> <ipv4> <port>` per line).
    #[arg(long)]
    hosts: PathBuf,

    /// Path the output log is written to.
    #[arg(long)]
    output: PathBuf,

    /// Path to the run configuration file.
    config: PathBuf,
}

/// Marker error for anything that stops the process from starting.
#[derive(Debug)]
struct StartupError;

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("process initialization failed")
    }
}

impl core::error::Error for StartupError {}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            error!("{report:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Report<StartupError>> {
    let self_id = ProcessId::new(args.id);

    let directory = Directory::load(&args.hosts).change_context(StartupError)?;
    if !directory.contains(self_id) {
        return Err(Report::new(StartupError)
            .attach(format!("id {self_id} is not in the hosts file")));
    }

    let mode = Mode::load(&args.config).change_context(StartupError)?;
    if let Mode::Send { target, .. } = mode {
        if !directory.contains(target) {
            return Err(Report::new(StartupError)
                .attach(format!("target id {target} is not in the hosts file")));
        }
    }

    let output = OutputLog::create(&args.output)
        .change_context(StartupError)
        .attach_with(|| format!("creating {}", args.output.display()))?;

    let transport = UdpTransport::bind(directory.clone(), self_id)
        .await
        .change_context(StartupError)
        .attach("binding the local socket")?;

    info!(id = %self_id, processes = directory.len(), "starting");

    let node = Node::new(self_id, &directory, mode, transport, output);
    node.run(shutdown_signal())
        .await
        .change_context(StartupError)
        .attach("flushing the output log")?;

    info!("stopped cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let mut terminate =
        signal(SignalKind::terminate()).expect("SIGTERM handler should install on a live runtime");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
