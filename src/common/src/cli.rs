use clap::Parser;
use std::path::PathBuf;

/// Arguments shared by every partsync command
#[derive(Parser, Debug, Clone, Default)]
pub struct CommonArgs {
    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(
        short,
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Enable quiet mode (warnings and errors only)"
    )]
    pub quiet: bool,
}

impl CommonArgs {
    /// Log level selected by the verbosity flags
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            "warn"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::Configuration;
    use anyhow::{Context, Result};
    use tracing_subscriber::EnvFilter;

    /// Install the fmt subscriber. `RUST_LOG` wins over the CLI flags when set.
    pub fn init_logging(args: &CommonArgs) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(args.log_level()));

        // A second initialisation (tests, embedding) keeps the first subscriber
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    }

    /// Load configuration with optional override from CLI
    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        match config_path {
            Some(path) => {
                log::info!("Loading configuration from: {}", path.display());
                Configuration::load_from_path(path).context("Failed to load configuration")
            }
            None => Configuration::load().context("Failed to load configuration"),
        }
    }

    /// Display configuration in human-readable or JSON format
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        if json {
            let json = serde_json::to_string_pretty(config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
        } else {
            println!("partsync configuration:");
            println!("=======================");
            println!("Warehouse DSN: {}", redact_dsn(&config.warehouse.dsn));
            println!("Target table: {}", config.warehouse.target_table);
            println!("Staging table: {}", config.warehouse.staging_table);
            println!("Storage DSN: {}", redact_dsn(&config.storage.dsn));
            println!("Storage prefix: {}", config.storage.prefix);
            println!("Load source root: {}", config.bulk_load.source_root);
            println!("Load role variable: {}", config.bulk_load.role_env_var);
            println!("Process by: {}", config.sync.process_by);
            println!(
                "Staleness threshold: {:?}",
                config.sync.staleness_threshold
            );
            println!(
                "Retry: {} attempts, backoff {:?}..{:?}",
                config.sync.max_attempts, config.sync.initial_backoff, config.sync.max_backoff
            );
            println!(
                "Maintenance interval: every {} decisions",
                config.sync.maintenance_interval
            );
        }
        Ok(())
    }

    /// Validate configuration and report any issues
    pub fn validate_config(config: &Configuration) -> Result<()> {
        log::info!("Validating configuration...");
        config.validate().context("Invalid configuration")?;
        log::info!("Configuration validation passed");
        Ok(())
    }

    /// Standard version information for a binary
    pub fn version_info(name: &str, version: &str) -> String {
        format!(
            "{name} {version} (rust {})",
            env!("CARGO_PKG_RUST_VERSION")
        )
    }

    /// Hide the password component of a DSN before printing it.
    pub fn redact_dsn(dsn: &str) -> String {
        match url::Url::parse(dsn) {
            Ok(mut url) if url.password().is_some() => {
                let _ = url.set_password(Some("***"));
                url.to_string()
            }
            _ => dsn.to_string(),
        }
    }
}
