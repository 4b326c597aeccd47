// Standalone wrapper binary: govern a single workload and print its
// post-mortem record as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use transcode_core::job::WrapperConstraints;
use transcode_wrapper::{CgroupManager, Supervisor, WrapperMetrics};

#[derive(Parser, Debug)]
#[command(name = "transcode-wrap", about = "Non-owning workload supervisor")]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Fork the workload into its own process group and wait for it.
    Run {
        #[arg(long)]
        job_id: Option<Uuid>,
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// cgroup cpu.max, e.g. "200000 100000".
        #[arg(long)]
        cpu_max: Option<String>,
        /// cgroup cpu.weight, 1..=10000.
        #[arg(long)]
        cpu_weight: Option<u32>,
        /// cgroup memory.max in bytes.
        #[arg(long)]
        memory_max: Option<u64>,
        /// cgroup io.max line.
        #[arg(long)]
        io_max: Option<String>,
        /// The workload command line.
        #[arg(trailing_var_arg = true, required = true)]
        argv: Vec<String>,
    },
    /// Observe an already-running PID until it exits.
    Attach {
        #[arg(long)]
        job_id: Option<Uuid>,
        #[arg(long)]
        pid: u32,
        #[arg(long)]
        cpu_max: Option<String>,
        #[arg(long)]
        cpu_weight: Option<u32>,
        #[arg(long)]
        memory_max: Option<u64>,
        #[arg(long)]
        io_max: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let supervisor = Supervisor::new(CgroupManager::new(), Arc::new(WrapperMetrics::new()));

    let result = match args.command {
        Cmd::Run {
            job_id,
            cwd,
            cpu_max,
            cpu_weight,
            memory_max,
            io_max,
            argv,
        } => {
            supervisor
                .run(transcode_wrapper::WorkloadSpec {
                    job_id: job_id.unwrap_or_else(Uuid::new_v4),
                    argv,
                    cwd,
                    constraints: WrapperConstraints {
                        cpu_max,
                        cpu_weight,
                        memory_max,
                        io_max,
                    },
                })
                .await
                .context("supervision failed")?
        }
        Cmd::Attach {
            job_id,
            pid,
            cpu_max,
            cpu_weight,
            memory_max,
            io_max,
        } => {
            supervisor
                .attach(
                    job_id.unwrap_or_else(Uuid::new_v4),
                    pid,
                    WrapperConstraints {
                        cpu_max,
                        cpu_weight,
                        memory_max,
                        io_max,
                    },
                )
                .await
                .context("attach failed")?
        }
    };

    // The record goes to stdout exactly once; logs stay on stderr.
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
