use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cpn-cli")]
#[command(about = "Normalize cloud compute pricing feeds into a relational schema")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every enabled region in the registry and upsert its pricing rows.
    Ingest,
    /// Create tables and unique indexes, then exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let summary = cpn_ingest::run_ingest_from_env().await?;
            println!(
                "ingest complete: run_id={} succeeded={} failed={} records={} skipped={} instances={} prices={} report={}",
                summary.report.run_id,
                summary.report.regions_succeeded.len(),
                summary.report.regions_failed.len(),
                summary.report.records_ingested,
                summary.report.record_errors.len(),
                summary.counts.instance_definitions,
                summary.counts.region_instance_prices,
                summary.report_dir.display()
            );
        }
        Commands::Migrate => {
            let counts = cpn_ingest::migrate_from_env().await?;
            println!(
                "schema ready: regions={} operating_systems={} vcpu_core_counts={} instances={} prices={}",
                counts.regions,
                counts.operating_systems,
                counts.vcpu_core_counts,
                counts.instance_definitions,
                counts.region_instance_prices
            );
        }
    }

    Ok(())
}
