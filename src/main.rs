/*!
 * Orbit Mirror CLI
 *
 * Version: 0.1.0
 * Author: Shane Wall <shaneawall@gmail.com>
 */

use clap::Parser;
use orbit_mirror::{
    config::{keys, Settings, Topology},
    error::{MirrorError, Result, EXIT_PARTIAL, EXIT_SUCCESS},
    logging::{self, LogOptions},
    node::{self, local_hostname, CycleOutcome, Node},
    pidfile::{kill_from_pidfile, PidFile},
    transfer::{LocalTransfer, RsyncTransfer, Transfer},
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "orbit-mirror")]
#[command(version, about = "Keep replica trees in step with a source tree, host by host", long_about = None)]
struct Cli {
    /// Topology file (`*.toml`, or the `key: value` line format)
    #[arg(short = 'c', long = "config", value_name = "FILE", default_value = "config.txt")]
    config: PathBuf,

    /// Act as this host instead of the machine's hostname
    #[arg(short = 'H', long = "hostname", value_name = "NAME")]
    hostname: Option<String>,

    /// Run a single cycle and exit
    #[arg(short = '1', long = "once")]
    once: bool,

    /// Report status instead of replicating
    #[arg(short = 's', long = "status")]
    status: bool,

    /// Scan and publish without pulling
    #[arg(short = 'z', long = "scan-only")]
    scan_only: bool,

    /// Push replica trees hosted here back to their sources
    #[arg(short = 'r', long = "restore")]
    restore: bool,

    /// Log transfers without running them
    #[arg(short = 'n', long = "dry-run")]
    dry_run: bool,

    /// Debug-level logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Run forever, logging to the configured log file
    #[arg(short = 'd', long = "daemon")]
    daemon: bool,

    /// Signal the running instance to exit
    #[arg(short = 'k', long = "kill")]
    kill: bool,

    /// Treat every location as local; host parts are ignored by transfers
    #[arg(long = "local")]
    local: bool,
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let mut cli = Cli::parse();
    if cli.daemon {
        cli.status = false;
        cli.scan_only = false;
        cli.once = false;
    }

    if cli.kill {
        let pid_file = Topology::load(&cli.config)
            .map(|topology| topology.settings().pid_file.clone())
            .unwrap_or_else(|_| Settings::default().pid_file);
        let pid = kill_from_pidfile(&pid_file)?;
        println!("Sent SIGTERM to {}", pid);
        return Ok(EXIT_SUCCESS);
    }

    let topology = Topology::load(&cli.config)?;
    let settings = topology.settings().clone();

    let log_to_file = cli.daemon || topology.option(None, keys::LOGFILE).is_some();
    let log_options = LogOptions {
        verbose: cli.verbose || settings.verbose,
        log_file: log_to_file.then(|| settings.log_file.clone()),
    };
    if let Err(e) = logging::init_logging(&log_options) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    let hostname = cli.hostname.clone().unwrap_or_else(local_hostname);
    let transfer: Arc<dyn Transfer> = if cli.local && !cli.dry_run {
        Arc::new(LocalTransfer::new())
    } else {
        Arc::new(
            RsyncTransfer::new(hostname.clone())
                .local_mode(cli.local)
                .dry_run(cli.dry_run),
        )
    };
    info!(
        "orbit-mirror {} as {} ({} contexts)",
        orbit_mirror::VERSION,
        hostname,
        topology.contexts().count()
    );

    let mut mirror = Node::new(topology, hostname, transfer).with_config_path(&cli.config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| MirrorError::Other(format!("Failed to start async runtime: {}", e)))?;

    runtime.block_on(async move {
        if cli.scan_only {
            return mirror.scan_only().await.map(exit_code_for);
        }
        if cli.restore {
            return mirror.restore().await.map(exit_code_for);
        }
        if cli.status {
            if cli.once {
                mirror.print_status();
            } else {
                let (handle, mut lifecycle) = node::channel();
                node::install_signal_handlers(handle)?;
                mirror.status_forever(&mut lifecycle).await;
            }
            return Ok(EXIT_SUCCESS);
        }

        let _pid_file = PidFile::acquire(&settings.pid_file)?;
        if cli.once {
            return mirror.run_once().await.map(exit_code_for);
        }

        let (handle, mut lifecycle) = node::channel();
        node::install_signal_handlers(handle)?;
        match mirror.run_forever(&mut lifecycle).await {
            Ok(()) => Ok(EXIT_SUCCESS),
            Err(e) => {
                error!(category = %e.category(), "Stopping: {}", e);
                Err(e)
            }
        }
    })
}

fn exit_code_for(outcome: CycleOutcome) -> i32 {
    if outcome.all_succeeded() {
        EXIT_SUCCESS
    } else {
        EXIT_PARTIAL
    }
}
