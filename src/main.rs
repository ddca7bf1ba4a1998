use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;

use dossier_lib::config::EngineConfig;
use dossier_lib::db::open_sqlite_pool;
use dossier_lib::package::{dry_run_summarize, export_database, BackupPackage, ExportOptions};
use dossier_lib::report::{self, ReportFormat};
use dossier_lib::restore::{Destination, RestoreMode, Restorer, RunStatus};
use dossier_lib::{AppError, EXIT_OK};

#[derive(Debug, Parser)]
#[command(name = "dossier", about = "Cross-environment backup and restore", version)]
struct Cli {
    /// Engine configuration file (JSON). Falls back to DOSSIER_CONFIG.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Export a database into a portable package.
    CreateBackup {
        #[arg(long)]
        db: PathBuf,
        /// Package path; defaults to a timestamped file next to the database.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Free-form label recorded in the manifest.
        #[arg(long)]
        label: Option<String>,
    },
    /// Restore a package into an existing database.
    RestoreFromPackage {
        package: PathBuf,
        #[arg(long)]
        db: PathBuf,
        /// Run everything and roll it all back.
        #[arg(long, conflicts_with = "critical_only")]
        dry_run: bool,
        /// Restore only these record types (repeatable or comma separated).
        #[arg(long, value_delimiter = ',')]
        critical_only: Vec<String>,
        /// Keep committing batches that contain failed records.
        #[arg(long)]
        best_effort: bool,
        #[arg(long)]
        report_dir: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = ReportFormat::Human)]
        format: ReportFormat,
    },
    /// Check a package's integrity and summarize what it references.
    VerifyPackage {
        package: PathBuf,
        /// Emit the summary as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    dossier_lib::init_logging();

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: failed to start async runtime: {err}");
            process::exit(dossier_lib::EXIT_FATAL);
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            let app_error = AppError::from(err);
            tracing::error!(
                target: "dossier",
                event = "command_failed",
                code = %app_error.code(),
                error = %app_error
            );
            process::exit(app_error.exit_code());
        }
    }
}

async fn handle_cli(cli: Cli) -> Result<i32> {
    let config = EngineConfig::load(cli.config.as_deref()).context("load engine configuration")?;
    match cli.command {
        Commands::CreateBackup { db, output, label } => create_backup(&config, &db, output, label).await,
        Commands::RestoreFromPackage {
            package,
            db,
            dry_run,
            critical_only,
            best_effort,
            report_dir,
            format,
        } => {
            let mode = if dry_run {
                RestoreMode::DryRun
            } else if !critical_only.is_empty() {
                RestoreMode::CriticalOnly(critical_only.into_iter().collect::<BTreeSet<_>>())
            } else {
                RestoreMode::Full
            };
            restore_from_package(&config, &package, &db, mode, best_effort, report_dir, format).await
        }
        Commands::VerifyPackage { package, json } => verify_package(&config, &package, json),
    }
}

async fn create_backup(
    config: &EngineConfig,
    db_path: &Path,
    output: Option<PathBuf>,
    label: Option<String>,
) -> Result<i32> {
    let pool = open_sqlite_pool(db_path, false).await?;
    let options = ExportOptions {
        source_label: label.or_else(|| Some(db_path.display().to_string())),
        priority: config.priority.clone(),
        ..ExportOptions::default()
    };
    let exported = export_database(&pool, &config.registry(), &options).await;
    pool.close().await;
    let package = exported.with_context(|| format!("export database {}", db_path.display()))?;

    let output = output.unwrap_or_else(|| default_package_path(db_path));
    let path = package.write_archive(&output)?;
    println!(
        "Backup of {} records written to {}",
        package.total_records(),
        path.display()
    );
    Ok(EXIT_OK)
}

async fn restore_from_package(
    config: &EngineConfig,
    package_path: &Path,
    db_path: &Path,
    mode: RestoreMode,
    best_effort: bool,
    report_dir: Option<PathBuf>,
    format: ReportFormat,
) -> Result<i32> {
    let package = BackupPackage::load_with(package_path, &config.load_options()?)
        .with_context(|| format!("load package {}", package_path.display()))?;

    let destination = Destination::open(db_path).await?;
    let restorer = Restorer::new(destination, config.registry(), config.data_access()?);
    let options = config.restore_options(mode, best_effort);
    let run = restorer.restore(&package, &options).await?;
    restorer.destination().pool().close().await;

    let integrity = report::summarize(&run).context("build integrity report")?;
    let reports_dir = match report_dir {
        Some(dir) => dir,
        None => default_reports_dir()?,
    };
    let written = report::write_report(&reports_dir, package_path, &integrity)?;
    let rendered = report::render(&integrity, format).context("render integrity report")?;
    println!("{rendered}");
    eprintln!("Report written to {}", written.display());

    if run.status == RunStatus::Aborted {
        if let Some(abort) = run.abort_error() {
            eprintln!("Error: {abort}");
        }
    }
    Ok(run.exit_code())
}

fn verify_package(config: &EngineConfig, package_path: &Path, emit_json: bool) -> Result<i32> {
    let package = BackupPackage::load_with(package_path, &config.load_options()?)
        .with_context(|| format!("load package {}", package_path.display()))?;
    let summary = dry_run_summarize(&package, &config.registry());
    if emit_json {
        let payload = json!({
            "path": package_path.display().to_string(),
            "verified": true,
            "summary": summary,
        });
        let serialized = serde_json::to_string_pretty(&payload).context("serialize package summary")?;
        println!("{serialized}");
    } else {
        println!("Package {} verified.", package_path.display());
        print!("{}", summary.render_human());
    }
    Ok(EXIT_OK)
}

fn default_package_path(db_path: &Path) -> PathBuf {
    let stem = db_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dossier".into());
    let name = format!("{stem}-{}.dossier.zip", Utc::now().format("%Y%m%d-%H%M%S"));
    db_path.with_file_name(name)
}

fn default_reports_dir() -> Result<PathBuf> {
    let base = dirs::data_dir()
        .or_else(|| std::env::current_dir().ok())
        .ok_or_else(|| anyhow::anyhow!("failed to resolve application data directory"))?;
    Ok(base.join("dossier").join("reports"))
}
