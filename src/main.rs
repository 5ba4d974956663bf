use anyhow::{Context, Result as AnyhowResult};
use clap::Parser;
use tracing::{info, warn};

use squid_log_exporter::cli::{
    handle_generate_config, handle_validate, handle_version, print_report, Cli, Commands,
};
use squid_log_exporter::config::ExporterConfig;
use squid_log_exporter::constants::{EXPORTER_FULL_NAME, EXPORTER_VERSION};
use squid_log_exporter::daemon::Exporter;
use squid_log_exporter::logging::init_logging;

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need full initialization
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let (mut config, found) = ExporterConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    cli.apply_overrides(&mut config);
    config
        .validate()
        .context("Configuration is invalid after command line overrides")?;

    init_logging(&config.logging)?;

    if !found {
        warn!(
            "Config file not found at {}, using defaults",
            cli.config.display()
        );
    }
    info!("{} v{}", EXPORTER_FULL_NAME, EXPORTER_VERSION);

    let exporter = Exporter::new(config)?;

    match cli.command {
        Some(Commands::Once) => {
            let report = exporter.run_once().await?;
            print_report(&report);
        }
        _ => exporter.run().await?,
    }

    Ok(())
}
