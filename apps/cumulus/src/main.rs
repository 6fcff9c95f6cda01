use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cumulus_core::api::{AcceleratorFamily, ControlPlane, HttpControlPlane};
use cumulus_core::config::Config;
use cumulus_core::kernel::{ExecuteOptions, ExecutionStatus};
use cumulus_core::logging::{self, LogConfig, LogLevel};
use cumulus_core::runtime::{AssignOptions, RuntimeManager};
use cumulus_core::session::pool::{ConnectionPool, PoolConfig};
use cumulus_core::session::ConnectOptions;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (build ",
    env!("BUILD_TIMESTAMP"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "cumulus", version = VERSION, about = "Run code on cloud notebook runtimes")]
struct Cli {
    #[arg(long, value_enum, default_value_t = LogLevel::default(), global = true)]
    log_level: LogLevel,

    #[arg(long, global = true, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute code on a runtime kernel
    Run {
        code: String,

        #[arg(long, conflicts_with = "tpu")]
        gpu: bool,

        #[arg(long)]
        tpu: bool,

        #[arg(long, help = "Force a fresh runtime instead of reusing one")]
        new: bool,

        #[arg(long, help = "Execute timeout in milliseconds")]
        timeout_ms: Option<u64>,
    },
    /// Show current runtime assignments and their kernels
    Status,
    /// List eligible accelerators per family
    Accelerators,
    /// Release runtime assignments
    Shutdown {
        #[arg(long, help = "Also delete the remote kernels")]
        delete_kernels: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let config = Config::from_env();
    let api: Arc<dyn ControlPlane> = Arc::new(HttpControlPlane::new(
        &config.api_base,
        config.auth_token.clone(),
    )?);

    match cli.command {
        Command::Run {
            code,
            gpu,
            tpu,
            new,
            timeout_ms,
        } => {
            let family = if gpu {
                AcceleratorFamily::Gpu
            } else if tpu {
                AcceleratorFamily::Tpu
            } else {
                AcceleratorFamily::Default
            };
            let manager = RuntimeManager::new(api.clone());
            let runtime = manager
                .assign(&AssignOptions {
                    force_new: new,
                    family,
                    quiet: false,
                })
                .await?;

            let pool = ConnectionPool::new(
                api,
                ConnectOptions::from_config(&config),
                PoolConfig::from_config(&config),
            );
            let connection = pool.get_or_create(runtime).await?;

            let options = ExecuteOptions {
                timeout: timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(config.execute_timeout),
                ..ExecuteOptions::default()
            };
            let result = connection.execute(&code, &options).await?;
            pool.close_all().await;

            print!("{}", result.stdout);
            eprint!("{}", result.stderr);
            if let Some(error) = &result.error {
                for line in &error.traceback {
                    eprintln!("{line}");
                }
                eprintln!("{}: {}", error.ename, error.evalue);
            }
            if result.status != ExecutionStatus::Ok {
                std::process::exit(1);
            }
        }
        Command::Status => {
            let assignments = api.list_assignments().await?;
            if assignments.is_empty() {
                println!("no active runtime assignments");
                return Ok(());
            }
            for assignment in assignments {
                println!(
                    "{} ({}, {})",
                    assignment.endpoint, assignment.accelerator, assignment.family
                );
                match api.refresh_connection(&assignment.endpoint).await {
                    Ok(proxy) => match api.list_kernels(&proxy).await {
                        Ok(kernels) if kernels.is_empty() => println!("  no kernels"),
                        Ok(kernels) => {
                            for kernel in kernels {
                                println!("  kernel {} [{}]", kernel.id, kernel.execution_state);
                            }
                        }
                        Err(err) => println!("  kernels unavailable: {err}"),
                    },
                    Err(err) => println!("  unreachable: {err}"),
                }
            }
        }
        Command::Accelerators => {
            for family in [AcceleratorFamily::Gpu, AcceleratorFamily::Tpu] {
                let eligible = api
                    .list_accelerators(family)
                    .await
                    .with_context(|| format!("listing {family} accelerators"))?;
                println!("{family}: {}", eligible.join(", "));
            }
        }
        Command::Shutdown { delete_kernels } => {
            let assignments = api.list_assignments().await?;
            if assignments.is_empty() {
                println!("nothing to shut down");
                return Ok(());
            }
            for assignment in assignments {
                if delete_kernels {
                    if let Ok(proxy) = api.refresh_connection(&assignment.endpoint).await {
                        if let Ok(kernels) = api.list_kernels(&proxy).await {
                            for kernel in kernels {
                                if let Err(err) = api.delete_kernel(&kernel.id, &proxy).await {
                                    eprintln!("failed to delete kernel {}: {err}", kernel.id);
                                }
                            }
                        }
                    }
                }
                println!("released {}", assignment.endpoint);
            }
        }
    }
    Ok(())
}
