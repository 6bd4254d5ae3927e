//! Administration CLI for the data-manager database.
//!
//! Exits 0 on success and non-zero on any unhandled error.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use data_manager::catalog::{DataSet, SchemaOperations};
use data_manager::jobs::{JobOperations, TaskQueueOperations};
use data_manager::{Config, Store};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "admin_cli")]
#[command(about = "Administer the job/task manager database")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reload the catalog tables from a directory of YAML files
    PopulateSchema {
        /// Directory containing datasets/ and bundles/ sub-directories
        schema_dir: PathBuf,
    },

    /// Record dataset end dates, either explicitly or by scanning the
    /// filesystem for the newest year of data
    UpdateEndDate {
        /// Restrict to one dataset
        #[arg(long)]
        dataset_id: Option<String>,
        /// Explicit end date (YYYY/MM/DD); requires --dataset-id
        #[arg(long)]
        end_date: Option<String>,
    },

    /// Print the catalog, jobs, tasks and queue
    Dump,

    /// Delete all activity and the catalog
    Wipe,

    /// Delete all queue entries, tasks and jobs
    ClearActivity,

    /// Put RUNNING tasks back to NEW (operator action at service restart)
    ResetRunning,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("failed to load configuration")?;
    let store = Store::open(&config.database_url)
        .await
        .context("failed to open store")?;

    match cli.command {
        Commands::PopulateSchema { schema_dir } => populate_schema(&store, &schema_dir).await,
        Commands::UpdateEndDate {
            dataset_id,
            end_date,
        } => update_end_date(&store, dataset_id.as_deref(), end_date.as_deref()).await,
        Commands::Dump => dump(&store).await,
        Commands::Wipe => wipe(&store).await,
        Commands::ClearActivity => clear_activity(&store).await,
        Commands::ResetRunning => reset_running(&store).await,
    }
}

async fn populate_schema(store: &Store, schema_dir: &PathBuf) -> Result<()> {
    let mut tx = store.begin().await?;
    tx.populate_schema(schema_dir).await?;
    tx.commit().await?;
    println!("catalog reloaded from {}", schema_dir.display());
    Ok(())
}

async fn update_end_date(
    store: &Store,
    dataset_id: Option<&str>,
    end_date: Option<&str>,
) -> Result<()> {
    if end_date.is_some() && dataset_id.is_none() {
        bail!("--end-date requires --dataset-id");
    }

    let mut tx = store.begin().await?;
    let datasets = tx.list_datasets().await?;

    let mut processed = 0;
    for dataset in &datasets {
        if dataset_id.is_some_and(|id| id != dataset.dataset_id) {
            continue;
        }

        let end = match end_date {
            Some(s) => Store::decode_date(s)?,
            None => discover_end_date(dataset),
        };

        match end {
            Some(end) => {
                tx.update_dataset_end_date(&dataset.dataset_id, Some(end))
                    .await?;
                println!(
                    "set end date for dataset {}: {}",
                    dataset.dataset_id,
                    Store::encode_date(Some(end))
                );
                processed += 1;
            }
            None => println!(
                "failed to obtain end date for dataset {}",
                dataset.dataset_id
            ),
        }
    }
    tx.commit().await?;

    if dataset_id.is_some() && processed == 0 {
        bail!("unable to find dataset with id {}", dataset_id.unwrap_or(""));
    }
    Ok(())
}

/// Find the newest year of data on disk by listing the directory prefix of
/// the dataset's location template, up to its `{YEAR}` marker.
fn discover_end_date(dataset: &DataSet) -> Option<NaiveDate> {
    let marker = dataset.location.find("{YEAR}")?;
    let parent = &dataset.location[..marker];

    let years: Vec<i32> = fs::read_dir(parent)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().and_then(|n| n.parse().ok()))
        .collect();

    let last_year = years.into_iter().max()?;
    NaiveDate::from_ymd_opt(last_year, 12, 31)
}

async fn dump(store: &Store) -> Result<()> {
    let mut tx = store.begin().await?;

    println!("Schema:");
    println!("\tBundles:");
    for bundle in tx.list_bundles().await? {
        println!("\t\t{bundle:?}");
    }
    println!("\tDatasets:");
    for dataset in tx.list_datasets().await? {
        println!("\t\t{dataset:?}");
    }

    println!("Jobs/Tasks:");
    println!("\tJobs:");
    for job in tx.list_jobs(None).await? {
        println!("\t\t{job}");
    }
    println!("\tTasks:");
    for (task, submitter_id, _) in tx.list_tasks(None).await? {
        println!("\t\t{task} ({submitter_id})");
    }
    println!("\tTask Queue:");
    for entry in tx.queued_entries().await? {
        println!("\t\t{}/{}", entry.job_id, entry.task_name);
    }

    println!("Summary:");
    for row in tx.compute_summary().await? {
        println!("\t{} {} {}", row.kind, row.state, row.count);
    }
    println!("Metadata:");
    for row in tx.query_rows("SELECT * FROM metadata").await? {
        println!("\t{row:?}");
    }

    tx.commit().await?;
    Ok(())
}

async fn wipe(store: &Store) -> Result<()> {
    let mut tx = store.begin().await?;
    tx.clear_task_queue().await?;
    tx.remove_all_tasks().await?;
    tx.remove_all_jobs().await?;
    tx.clear_schema().await?;
    tx.commit().await?;
    println!("database wiped");
    Ok(())
}

async fn clear_activity(store: &Store) -> Result<()> {
    let mut tx = store.begin().await?;
    tx.clear_task_queue().await?;
    tx.remove_all_tasks().await?;
    let jobs = tx.remove_all_jobs().await?;
    tx.commit().await?;
    println!("cleared {jobs} jobs and their tasks");
    Ok(())
}

async fn reset_running(store: &Store) -> Result<()> {
    let mut tx = store.begin().await?;
    let reset = tx.reset_running_tasks().await?;
    tx.commit().await?;
    println!("reset {reset} running tasks to NEW");
    Ok(())
}
