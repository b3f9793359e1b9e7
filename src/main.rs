use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use loadsim::error::{EC_INVALID_COMMANDLINE_ARGS, EC_INVALID_CONFIG_FILE};
use loadsim::stats::StatsPrinter;
use loadsim::{Config, Http, ServerManager};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "loadsim")]
#[command(about = "Configurable load-simulating TCP server")]
#[command(version)]
struct Cli {
    /// Path to the YAML configuration file.
    config: PathBuf,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(
            e.kind(),
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
        ) =>
        {
            e.exit();
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(EC_INVALID_COMMANDLINE_ARGS);
        }
    };

    init_logging();

    let config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "could not load config");
            std::process::exit(EC_INVALID_CONFIG_FILE);
        }
    };

    info!(
        control = %format!("{}:{}", config.control_server.ip, config.control_server.port),
        "management surface configured"
    );

    let planned_threads =
        config.concurrency.num_workers * config.concurrency.num_threads_per_worker;
    if planned_threads > num_cpus::get() {
        tracing::warn!(
            planned_threads,
            cores = num_cpus::get(),
            "worker threads exceed available cores"
        );
    }

    let manager = Arc::new(ServerManager::new());
    if let Err(e) = manager.create_server::<Http>(&config) {
        error!(error = %e, "failed to start server");
        std::process::exit(1);
    }

    let shutdown = Arc::new(AtomicBool::new(false));

    {
        let manager = manager.clone();
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            // A second signal while shutdown is already under way is
            // ignored; the trigger guard is strictly one-shot.
            if shutdown.swap(true, Ordering::SeqCst) {
                return;
            }
            info!("shutdown signal received");
            manager.stop_all();
        })
        .expect("failed to install signal handler");
    }

    // Periodic stats rows, one per server per tick.
    let stats_thread = {
        let manager = manager.clone();
        let shutdown = shutdown.clone();
        let header_interval = config.logging.header_interval;
        std::thread::Builder::new()
            .name("loadsim-stats".to_string())
            .spawn(move || {
                let mut printer = StatsPrinter::new(header_interval);
                while !shutdown.load(Ordering::Acquire) {
                    std::thread::sleep(STATS_INTERVAL);
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    for snapshot in manager.get_stats() {
                        println!("{}", printer.render(&snapshot));
                    }
                }
            })
            .expect("failed to spawn stats thread")
    };

    manager.wait();
    shutdown.store(true, Ordering::SeqCst);
    let _ = stats_thread.join();
    info!("loadsim shut down");
}
