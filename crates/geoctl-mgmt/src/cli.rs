use crate::audit_trail::AuditTrail;
use crate::config::GeoConfig;
use crate::confirmation::TerminalPrompt;
use crate::promotion::{PromotionOrchestrator, PromotionReport, PromotionRequest};
use anyhow::Result;
use clap::{Parser, Subcommand};
use geoctl_repl::{AttachOptions, PrimaryLocator, ReplicationBootstrapper, SslMode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "geo-ctl")]
#[command(about = "Geo replication bootstrap and secondary promotion", long_about = None)]
pub struct Cli {
    #[arg(
        short,
        long,
        global = true,
        env = "GEOCTL_CONFIG",
        default_value = "/etc/geoctl/geoctl.toml"
    )]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Promote this secondary node to primary.
    PromoteToPrimaryNode {
        /// Asked interactively when absent.
        #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
        confirm_primary_is_down: Option<bool>,
        #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
        confirm_removing_keys: Option<bool>,
        #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
        skip_preflight_checks: Option<bool>,
    },
    /// Replace the local database with a base backup of the primary and follow it.
    ReplicateGeoDatabase {
        #[arg(long)]
        host: String,
        #[arg(long)]
        slot_name: String,
        #[arg(long, default_value = "verify-full")]
        sslmode: SslMode,
        #[arg(long)]
        port: Option<u16>,
        /// Drop an active slot of the same name and attach again.
        #[arg(long)]
        force: bool,
    },
    /// Print the registered primary database address(es).
    GetPostgresqlPrimary {
        #[arg(long)]
        service: Option<String>,
    },
}

impl Command {
    pub fn promotion_request(&self) -> Option<PromotionRequest> {
        match *self {
            Command::PromoteToPrimaryNode {
                confirm_primary_is_down,
                confirm_removing_keys,
                skip_preflight_checks,
            } => Some(PromotionRequest {
                confirm_primary_down: confirm_primary_is_down,
                confirm_removing_keys,
                skip_preflight_checks,
            }),
            _ => None,
        }
    }
}

pub fn load_config(path: &Path) -> Result<GeoConfig> {
    if path.exists() {
        GeoConfig::from_file(path)
    } else {
        tracing::warn!("Config file not found, using defaults: {}", path.display());
        Ok(GeoConfig::default())
    }
}

impl Cli {
    /// Run the selected command and return the process exit code.
    pub async fn run(self, cancel: CancellationToken) -> Result<i32> {
        let config = load_config(&self.config)?;
        match &self.command {
            Command::PromoteToPrimaryNode { .. } => {
                let request = self.command.promotion_request().unwrap_or_default();
                promote(&config, request, &cancel).await
            }
            Command::ReplicateGeoDatabase {
                host,
                slot_name,
                sslmode,
                port,
                force,
            } => {
                let bootstrapper = ReplicationBootstrapper::from_config(config.replication.clone())?;
                let options = AttachOptions {
                    port: *port,
                    force: *force,
                };
                let slot = bootstrapper
                    .attach(host, slot_name, *sslmode, &options, &cancel)
                    .await?;
                println!(
                    "Replication slot {} attached to {}:{} (sslmode={})",
                    slot.name, slot.source_host, slot.source_port, slot.ssl_mode
                );
                Ok(0)
            }
            Command::GetPostgresqlPrimary { service } => {
                let locator = PrimaryLocator::new(config.registry.clone());
                let candidates = match service {
                    Some(name) => locator.resolve(name).await?,
                    None => locator.resolve_configured().await?,
                };
                for candidate in candidates {
                    println!("{}", candidate);
                }
                Ok(0)
            }
        }
    }
}

async fn promote(
    config: &GeoConfig,
    request: PromotionRequest,
    cancel: &CancellationToken,
) -> Result<i32> {
    let audit = Arc::new(AuditTrail::new());
    let mut orchestrator =
        PromotionOrchestrator::from_config(config, Arc::new(TerminalPrompt), audit)?;
    let report = orchestrator.promote(request, cancel).await;
    print_report(&report);
    Ok(report.exit_code())
}

fn print_report(report: &PromotionReport) {
    for warning in &report.warnings {
        eprintln!("WARNING: {}", warning);
    }
    let last = report
        .last_completed
        .map(|s| s.to_string())
        .unwrap_or_else(|| "none".to_string());
    match (&report.error, report.category()) {
        (Some(error), Some(category)) => {
            eprintln!("Promotion FAILED [{}]", category);
            eprintln!("  last completed state: {}", last);
            eprintln!("  error: {}", error);
        }
        _ => println!(
            "Promotion complete: {} (attempt {})",
            report.final_state, report.attempt_id
        ),
    }
}
