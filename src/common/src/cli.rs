use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Common CLI arguments shared across all binaries
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,
}

/// Common subcommands available for all services
#[derive(Subcommand, Debug, Clone, Default)]
pub enum CommonCommands {
    /// Start the service (default behavior)
    #[default]
    Start,
    /// Show current configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
    /// Validate configuration and exit
    Validate,
    /// Show version information and exit
    Version,
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::Configuration;
    use anyhow::{Context, Result};
    use tracing_subscriber::EnvFilter;

    /// Log level selected by the verbosity flags
    pub fn log_level(args: &CommonArgs) -> &'static str {
        if args.quiet {
            "warn"
        } else if args.verbose {
            "debug"
        } else {
            "info"
        }
    }

    /// Initialize logging based on CLI arguments; `RUST_LOG` still takes precedence
    pub fn init_logging(args: &CommonArgs) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(log_level(args)));
        tracing_subscriber::fmt().with_env_filter(filter).init();
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
            println!("Identity Service Configuration:");
            println!("===============================");
            for host in &config.cluster.hosts {
                println!(
                    "Cluster host: {} (datacenter: {}, rack: {})",
                    host.address,
                    host.datacenter.as_deref().unwrap_or("-"),
                    host.rack.as_deref().unwrap_or("-")
                );
            }
            println!(
                "Consistency level: {}",
                config
                    .cluster
                    .consistency_level
                    .as_deref()
                    .unwrap_or("driver default")
            );
            println!("Multi-DC routing: {}", config.cluster.multi_dc_enabled);
            println!("Pooling: {:?}", config.cluster.pooling);

            println!("Search URL: {}", config.search.url);
            println!("Search index: {}", config.search.index);
            println!("Search timeout: {:?}", config.search.timeout);

            println!("Keyspace: {}", config.reclamation.keyspace);
            println!("Request timeout: {:?}", config.reclamation.request_timeout);
            if config.reclamation.sweep_enabled {
                println!("Lookup sweep interval: {:?}", config.reclamation.sweep_interval);
            } else {
                println!("Lookup sweep: disabled");
            }
        }
        Ok(())
    }

    /// Validate configuration and report any issues
    pub fn validate_config(config: &Configuration) -> Result<()> {
        log::info!("Validating configuration...");

        if config.cluster.hosts.is_empty() {
            anyhow::bail!("At least one cluster host is required");
        }

        if config.cluster.hosts.iter().any(|h| h.address.trim().is_empty()) {
            anyhow::bail!("Cluster host addresses cannot be empty");
        }

        let pooling = &config.cluster.pooling;
        if pooling.core_connections_local > pooling.max_connections_local
            || pooling.core_connections_remote > pooling.max_connections_remote
        {
            anyhow::bail!("Core connections cannot exceed max connections");
        }

        if config.search.url.is_empty() {
            anyhow::bail!("Search URL cannot be empty");
        }

        if config.reclamation.keyspace.is_empty() {
            anyhow::bail!("Keyspace cannot be empty");
        }

        if config.reclamation.sweep_enabled && config.reclamation.sweep_interval.is_zero() {
            anyhow::bail!("Sweep interval must be positive when the sweep is enabled");
        }

        log::info!("✅ Configuration validation passed");
        Ok(())
    }

    /// Handle common CLI commands that don't require starting services
    pub async fn handle_common_command(
        command: &CommonCommands,
        config: &Configuration,
    ) -> Result<bool> {
        match command {
            CommonCommands::Config { json } => {
                display_config(config, *json)?;
                Ok(true)
            }
            CommonCommands::Validate => {
                validate_config(config)?;
                Ok(true)
            }
            CommonCommands::Version => {
                println!("{}", version_info());
                Ok(true)
            }
            CommonCommands::Start => Ok(false),
        }
    }

    /// Standard version information
    pub fn version_info() -> String {
        format!(
            "{} {} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_RUST_VERSION")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;

    #[test]
    fn test_common_commands_default() {
        let default_cmd = CommonCommands::default();
        assert!(matches!(default_cmd, CommonCommands::Start));
    }

    #[test]
    fn test_version_info() {
        let version = utils::version_info();
        assert!(version.contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_log_level_from_flags() {
        let mut args = CommonArgs {
            config: None,
            verbose: false,
            quiet: false,
        };
        assert_eq!(utils::log_level(&args), "info");
        args.verbose = true;
        assert_eq!(utils::log_level(&args), "debug");
        args.quiet = true;
        assert_eq!(utils::log_level(&args), "warn");
    }

    #[test]
    fn test_validate_default_config() {
        assert!(utils::validate_config(&Configuration::default()).is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_pool_limits() {
        let mut config = Configuration::default();
        config.cluster.pooling.core_connections_local = 20;
        config.cluster.pooling.max_connections_local = 2;
        assert!(utils::validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_missing_hosts() {
        let mut config = Configuration::default();
        config.cluster.hosts.clear();
        assert!(utils::validate_config(&config).is_err());
    }
}
