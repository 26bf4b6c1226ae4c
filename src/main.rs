/*!
 * Pluginbox - Main Entry Point
 *
 * One binary with two roles:
 * - Host: loads the configuration, starts sandboxed plugins, serves status
 * - Sandbox: re-entered under a registered argv[0] to prepare a plugin's
 *   namespaces and run it
 */

use clap::Parser;
use miette::IntoDiagnostic;
use std::path::PathBuf;
use tracing::{error, info};

use pluginbox::core::limits::{DEFAULT_CONFIG_PATH, EXIT_HOST_FAILURE};
use pluginbox::{host, init_tracing, reexec, HostConfig, TracingOptions};

#[derive(Debug, Parser)]
#[command(name = "pluginbox", version, about)]
struct Cli {
    /// Config file location
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

fn main() {
    // Re-entries must be dispatched before anything else runs
    if let Some(code) = reexec::init() {
        std::process::exit(code);
    }

    let cli = Cli::parse();
    if let Err(report) = run(cli) {
        eprintln!("{:?}", report);
        std::process::exit(EXIT_HOST_FAILURE);
    }
}

fn run(cli: Cli) -> miette::Result<()> {
    let config = HostConfig::load(&cli.config)?;

    init_tracing(TracingOptions::from_env(config.debug));
    info!(path = %cli.config.display(), plugins = config.plugins.len(), "Configuration loaded");

    serve(config).map_err(|report| {
        error!(error = %report, "Host failed");
        report
    })
}

fn serve(config: HostConfig) -> miette::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("pluginbox")
        .build()
        .into_diagnostic()?;

    runtime.block_on(host::run(config))?;
    info!("Host stopped");
    Ok(())
}
