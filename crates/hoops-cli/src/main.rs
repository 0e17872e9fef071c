use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use hoops_sync::{HoopsConfig, PlanRequest, StorageRoot};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "hoops")]
#[command(about = "Basketball stats inventory and fetch planning")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Archive the current inventory and to-pull manifest under a dated folder
    CopyPreviousMeta {
        /// Folder holding inventory.yaml and data_to_pull.yaml
        #[arg(default_value = "data/meta/")]
        root_folder: PathBuf,
        /// Folder that receives the dated archive
        #[arg(default_value = "data/logs/inventory_logs/")]
        out_folder: PathBuf,
    },
    /// Walk the data root and record which identifiers are already stored
    CreateInventory {
        /// Data root: a local folder, or the object prefix when a bucket is set
        #[arg(default_value = "data/nba/")]
        root_folder: String,
        /// Where to save the inventory
        #[arg(default_value = "data/meta/inventory.yaml")]
        output_path: PathBuf,
        /// Bucket to list instead of the local filesystem (defaults to BUCKET_NAME)
        #[arg(long, conflicts_with = "local")]
        bucket: Option<String>,
        /// Ignore BUCKET_NAME and walk the local filesystem
        #[arg(long)]
        local: bool,
    },
    /// Diff the inventory against the expected seasons and write the to-pull manifest
    GetDataToPull {
        #[arg(default_value = "data/meta/inventory.yaml")]
        inventory_path: PathBuf,
        #[arg(default_value = "data/meta/data_to_pull.yaml")]
        output_path: PathBuf,
        #[arg(default_value_t = 1990)]
        earliest_season_year: i32,
        /// Folder for the dated per-season error log
        #[arg(long, env = "HOOPS_ERROR_LOG_DIR", default_value = "data/logs/PLAN/")]
        error_log_dir: PathBuf,
        /// Read season rosters from captured game logs instead of the stats API
        #[arg(long, env = "HOOPS_ROSTER_FIXTURES")]
        roster_fixtures: Option<PathBuf>,
    },
    /// Print the key of the most recently started season
    CurrentSeason,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hoops=info,hoops_sync=info,hoops_adapters=info,hoops_storage=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = HoopsConfig::from_env();
    let today = chrono::Local::now().date_naive();

    match cli.command {
        Commands::CopyPreviousMeta {
            root_folder,
            out_folder,
        } => {
            let archive = hoops_sync::copy_previous_meta(&root_folder, &out_folder, today).await?;
            println!("archived meta to {}", archive.display());
        }
        Commands::CreateInventory {
            root_folder,
            output_path,
            bucket,
            local,
        } => {
            let bucket = if local {
                None
            } else {
                bucket.or_else(|| config.bucket_name.clone())
            };
            let root = match bucket {
                Some(bucket) => {
                    info!(%bucket, "listing object storage");
                    StorageRoot::Bucket {
                        bucket,
                        prefix: root_folder,
                    }
                }
                None => StorageRoot::Local(PathBuf::from(root_folder)),
            };
            let summary = hoops_sync::create_inventory(&root, &output_path, &config).await?;
            println!(
                "inventory complete: run_id={} root={} games={} players={} season_entries={} output={}",
                summary.run_id, summary.root, summary.games, summary.players, summary.season_entries, summary.output
            );
        }
        Commands::GetDataToPull {
            inventory_path,
            output_path,
            earliest_season_year,
            error_log_dir,
            roster_fixtures,
        } => {
            let request = PlanRequest {
                inventory_path,
                output_path,
                earliest_season_year,
                error_log_dir,
                roster_fixtures,
                today,
            };
            let summary = hoops_sync::get_data_to_pull(&request, &config).await?;
            println!(
                "plan complete: run_id={} current_season={} seasons_scanned={} games={} players={} fetch_failures={} no_data={} output={} error_log={}",
                summary.run_id,
                summary.current_season,
                summary.seasons_scanned,
                summary.games_to_pull,
                summary.players_to_pull,
                summary.fetch_failures,
                summary.no_data,
                summary.output,
                summary.error_log
            );
        }
        Commands::CurrentSeason => {
            println!("{}", hoops_core::current_season(today)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn plan_arguments_default_under_data_meta() {
        let cli = Cli::try_parse_from(["hoops", "get-data-to-pull"]).unwrap();
        let Commands::GetDataToPull {
            inventory_path,
            output_path,
            earliest_season_year,
            error_log_dir,
            roster_fixtures,
        } = cli.command
        else {
            panic!("wrong subcommand");
        };
        assert_eq!(inventory_path, PathBuf::from("data/meta/inventory.yaml"));
        assert_eq!(output_path, PathBuf::from("data/meta/data_to_pull.yaml"));
        assert_eq!(earliest_season_year, 1990);
        assert_eq!(error_log_dir, PathBuf::from("data/logs/PLAN/"));
        assert!(roster_fixtures.is_none());
    }

    #[test]
    fn bucket_and_local_conflict() {
        let parsed = Cli::try_parse_from(["hoops", "create-inventory", "--bucket", "b", "--local"]);
        assert!(parsed.is_err());
    }
}
