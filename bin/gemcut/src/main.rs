//! gemcut is a CLI tool to build and deploy EIP-2535 diamond proxy projects.

mod cli;

use std::process::ExitCode;

use clap::Parser;

use cli::{Cli, Command};
use gemcut_core::{
    Config, CutAction, DeployOptions, DeployReport, GemcutError, JsonRpcClient, Orchestrator,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "gemcut failed");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<(), GemcutError> {
    let config = Config::load(&cli.config)?;

    match cli.command {
        Command::Build => {
            let report = gemcut_core::build(&config).await?;
            for facet in &report.facets {
                tracing::info!(
                    facet = %facet.name,
                    selectors = facet.selectors.len(),
                    "Facet scanned"
                );
            }
            tracing::info!(
                facets = report.facets.len(),
                interface = %report.interface_path.display(),
                "Build complete"
            );
        }
        Command::Deploy {
            target,
            dry_run,
            force_core,
        } => {
            let orchestrator = Orchestrator::new(
                &config,
                DeployOptions {
                    dry_run,
                    force_core,
                },
            );
            let report = orchestrator
                .deploy(&target, |url| JsonRpcClient::new(url))
                .await?;
            report_deployment(&report);
        }
    }
    Ok(())
}

fn report_deployment(report: &DeployReport) {
    let label = if report.dry_run {
        "Planned operation"
    } else {
        "Applied operation"
    };
    for op in &report.operations {
        tracing::info!(
            action = %op.action,
            facet = %op.facet_name,
            selectors = op.selectors.len(),
            address = ?op.facet_address.filter(|_| op.action != CutAction::Remove),
            "{label}"
        );
    }

    if report.dry_run {
        tracing::info!(
            target = %report.target,
            diamond = %report.diamond_address,
            operations = report.operations.len(),
            "Dry run complete, nothing was sent"
        );
    } else {
        tracing::info!(
            target = %report.target,
            diamond = %report.diamond_address,
            facets_deployed = report.facets_deployed,
            cut_tx = ?report.cut_tx_hash,
            initialized = report.initialized,
            "Deployment complete"
        );
    }
}
