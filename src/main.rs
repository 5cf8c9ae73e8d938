use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cluster::spawn_shutdown_hook;
use common::cli::{CommonArgs, CommonCommands, utils};
use humantime_serde::re::humantime;
use identity::{FreeUpRequest, IdentifierKind, IdentityService};

#[derive(Parser)]
#[command(name = "identity-service")]
#[command(about = "Identity service: frees bound user identifiers across the primary store, lookups and search")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Option<IdentityCommands>,
}

#[derive(Subcommand)]
enum IdentityCommands {
    #[command(flatten)]
    Common(CommonCommands),
    /// Free identifiers bound to a user and exit
    FreeUp {
        /// User id
        user_id: String,
        /// Identifier kinds to free (email, phone)
        #[arg(required = true, value_delimiter = ',')]
        kinds: Vec<IdentifierKind>,
        /// Request deadline, e.g. "10s"
        #[arg(long, value_parser = humantime::parse_duration)]
        deadline: Option<Duration>,
    },
    /// List the tables of a keyspace and exit
    Tables {
        /// Keyspace, defaults to the configured one
        keyspace: Option<String>,
    },
    /// List role groups and exit
    RoleGroups,
    /// Run one stale lookup sweep and exit
    Sweep,
}

impl Default for IdentityCommands {
    fn default() -> Self {
        Self::Common(CommonCommands::Start)
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{json}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on CLI arguments
    utils::init_logging(&cli.common);

    // Load application configuration
    let config = utils::load_config(cli.common.config.as_ref())?;

    let command = cli.command.unwrap_or_default();
    if let IdentityCommands::Common(ref common_cmd) = command {
        if utils::handle_common_command(common_cmd, &config).await? {
            return Ok(()); // Command handled, exit early
        }
    }

    let service = IdentityService::start(&config)
        .await
        .context("Failed to start identity service")?;

    let result = match command {
        IdentityCommands::Common(_) => {
            log::info!("Identity service started; waiting for termination signal");
            spawn_shutdown_hook(service.cluster().clone())
                .await
                .context("Shutdown hook failed")
        }
        IdentityCommands::FreeUp {
            user_id,
            kinds,
            deadline,
        } => {
            let mut request = FreeUpRequest::new(user_id, kinds);
            if let Some(deadline) = deadline {
                request = request.with_deadline(deadline);
            }
            match service.free_up(request).await {
                Ok(outcome) => print_json(&outcome),
                Err(e) => Err(e).context("Free-up failed"),
            }
        }
        IdentityCommands::Tables { keyspace } => {
            let keyspace = keyspace.unwrap_or_else(|| config.reclamation.keyspace.clone());
            match service.cluster().list_tables(&keyspace).await {
                Ok(tables) => print_json(&tables),
                Err(e) => Err(e).with_context(|| format!("Failed to list tables of {keyspace}")),
            }
        }
        IdentityCommands::RoleGroups => match service.role_groups().list_role_groups().await {
            Ok(groups) => print_json(&groups),
            Err(e) => Err(e).context("Failed to list role groups"),
        },
        IdentityCommands::Sweep => match service.reconciler().reconcile_once().await {
            Ok(report) => print_json(&report),
            Err(e) => Err(e).context("Lookup sweep failed"),
        },
    };

    service.shutdown().await;
    log::info!("Identity service stopped");
    result
}
