// Docrate CLI binary

use std::path::PathBuf;
use clap::{Parser, Subcommand};
use anyhow::Result;
use rusqlite::Connection;

use docrate_lib::clock::SystemClock;
use docrate_lib::config::Config;
use docrate_lib::db::migrations::{MigrationRunner, MigrationStatus, StepStatus};
use docrate_lib::db::{open_db, schema};
use docrate_lib::import::{discover_import_files, ImportLock, ImportRequest, ImportSummary, Importer};
use docrate_lib::parser::{detect_column_mapping, CanonicalField, ColumnMapping, FormatRegistry, ParseOptions};
use docrate_lib::sanitize::mask_phone;
use docrate_lib::settings::SqliteSettings;

#[derive(Parser)]
#[command(name = "docrate")]
#[command(about = "Docrate - import insurer doctor directories", long_about = None)]
#[command(version)]
struct Cli {
    /// Database file (overrides the secrets file)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Secrets file (defaults to $DOCRATE_SECRETS_FILE or ~/.docrate/private/docrate-secrets.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate {
        /// Only show the current and latest version
        #[arg(long)]
        status: bool,
        /// Roll back the most recent migration
        #[arg(long, conflicts_with = "status")]
        rollback: bool,
    },

    /// Import a file, or every supported file in a directory
    Import {
        /// File or directory
        path: PathBuf,
        /// Insurance company the file came from
        #[arg(short, long)]
        source: String,
        /// Field delimiter ("," ";" "tab" ...)
        #[arg(long)]
        delimiter: Option<String>,
        /// Quote character
        #[arg(long)]
        quote: Option<String>,
        /// 1-based header row
        #[arg(long, default_value = "1")]
        header_row: usize,
        /// 0-based sheet index (workbooks)
        #[arg(long, default_value = "0")]
        sheet: usize,
        /// Keep rows where every cell is blank
        #[arg(long)]
        keep_empty: bool,
        /// Explicit column mapping, e.g. --map first_name="Given Name"
        #[arg(long = "map", value_name = "FIELD=HEADER")]
        map: Vec<String>,
    },

    /// Show a file's headers and the detected column mapping
    Columns {
        file: PathBuf,
        #[arg(long)]
        delimiter: Option<String>,
        #[arg(long, default_value = "1")]
        header_row: usize,
        #[arg(long, default_value = "0")]
        sheet: usize,
    },

    /// Inspect or clear the import lock
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },

    /// List recent import runs
    Runs {
        #[arg(long, default_value = "20")]
        limit: i64,
        /// Filter by insurance company
        #[arg(long)]
        source: Option<String>,
    },

    /// Show one import run
    Run {
        id: i64,
        /// List failed rows
        #[arg(long)]
        errors: bool,
    },

    /// Manage normalization mappings
    Mapping {
        #[command(subcommand)]
        action: MappingAction,
    },
}

#[derive(Subcommand)]
enum LockAction {
    /// Show who holds the lock
    Status,
    /// Remove the lock record regardless of owner
    Release {
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum MappingAction {
    /// Set a manual override (type: specialty, city, company)
    Set {
        mapping_type: String,
        source_value: String,
        normalized_value: String,
    },
    /// Show the normalized value for a source value
    Get {
        mapping_type: String,
        source_value: String,
    },
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    if let Some(path) = config.source() {
        log::debug!("Loaded {} config from {}", config.environment(), path.display());
    }

    let db_path = match &cli.db {
        Some(path) => path.clone(),
        None => config.database_path()?,
    };
    let conn = open_db(&db_path)?;

    match cli.command {
        Commands::Migrate { status, rollback } => cmd_migrate(&conn, status, rollback),
        Commands::Import { path, source, delimiter, quote, header_row, sheet, keep_empty, map } => {
            let options = ParseOptions {
                delimiter: delimiter.as_deref().map(parse_byte).transpose()?,
                quote: match quote.as_deref() {
                    Some(q) => parse_byte(q)?,
                    None => ParseOptions::default().quote,
                },
                header_row,
                sheet_index: sheet,
                skip_empty: !keep_empty,
            };
            let mapping = parse_mapping(&map)?;
            cmd_import(&conn, &config, path, source, options, mapping)
        }
        Commands::Columns { file, delimiter, header_row, sheet } => {
            let options = ParseOptions {
                delimiter: delimiter.as_deref().map(parse_byte).transpose()?,
                header_row,
                sheet_index: sheet,
                ..Default::default()
            };
            cmd_columns(file, options)
        }
        Commands::Lock { action } => cmd_lock(&conn, &config, action),
        Commands::Runs { limit, source } => cmd_runs(&conn, limit, source),
        Commands::Run { id, errors } => cmd_run(&conn, id, errors),
        Commands::Mapping { action } => cmd_mapping(&conn, action),
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // Also installs the log -> tracing bridge for library log records
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn cmd_migrate(conn: &Connection, status: bool, rollback: bool) -> Result<()> {
    let settings = SqliteSettings::open(conn)?;
    let runner = MigrationRunner::new(conn, &settings);

    if status {
        println!("Schema version: {} (latest {})", runner.current_version()?, runner.latest_version());
        if runner.pending()? {
            println!("Migrations pending. Run 'docrate migrate' to apply.");
        }
        return Ok(());
    }

    let report = if rollback { runner.rollback_last()? } else { runner.migrate()? };

    for step in &report.steps {
        let mark = match step.status {
            StepStatus::Success => "ok",
            StepStatus::Error => "FAILED",
        };
        println!("  [{:>6}] {:>3}  {}", mark, step.version, step.message);
    }

    match report.status {
        MigrationStatus::UpToDate => {
            println!("Schema is up to date (version {})", report.to_version);
            Ok(())
        }
        MigrationStatus::Migrated => {
            println!("Schema version {} -> {}", report.from_version, report.to_version);
            Ok(())
        }
        MigrationStatus::Halted => {
            anyhow::bail!(
                "Migration halted at version {} (schema left at {})",
                report.failure().map(|s| s.version).unwrap_or(report.to_version + 1),
                report.to_version
            )
        }
    }
}

fn cmd_import(
    conn: &Connection,
    config: &Config,
    path: PathBuf,
    source: String,
    options: ParseOptions,
    mapping: Option<ColumnMapping>,
) -> Result<()> {
    let settings = SqliteSettings::open(conn)?;
    if MigrationRunner::new(conn, &settings).pending()? {
        anyhow::bail!("Database schema is out of date. Run 'docrate migrate' first.");
    }

    let clock = SystemClock;
    let importer = Importer::new(conn, &settings, &clock).with_lock_ttl(config.lock_ttl_seconds());

    let files = discover_import_files(&path, importer.registry())?;
    if files.is_empty() {
        println!("No importable files found in {}", path.display());
        return Ok(());
    }

    let template = ImportRequest {
        path: path.clone(),
        source,
        options,
        mapping,
    };

    let mut failed = 0;
    for item in importer.run_batch(&files, &template) {
        match item.outcome {
            Ok(summary) => {
                print_summary(&summary);
                if !summary.is_completed() {
                    failed += 1;
                }
            }
            Err(e) => {
                println!("{}: {} ({})", item.file.display(), e.message, e.code);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} files failed to import", failed, files.len());
    }
    Ok(())
}

fn print_summary(summary: &ImportSummary) {
    println!();
    println!("Run {}: {} ({}) - {}", summary.run_id, summary.file, summary.source, summary.status);
    if let Some(message) = &summary.error_message {
        println!("  Error:      {}", message);
        return;
    }
    let c = &summary.counters;
    println!("  Rows:       {}", c.total_rows);
    println!("  Processed:  {}", c.processed_rows);
    println!("  New:        {}", c.new_count);
    println!("  Updated:    {}", c.updated_count);
    println!("  Skipped:    {}", c.skipped_count);
    println!("  Errors:     {}", c.error_count);
    if c.error_count > 0 {
        println!("  See 'docrate run {} --errors' for details", summary.run_id);
    }
}

fn cmd_columns(file: PathBuf, options: ParseOptions) -> Result<()> {
    let parsed = FormatRegistry::default().parse(&file, &options)?;
    let mapping = detect_column_mapping(&parsed.headers);

    println!("{} ({} rows)", parsed.file_name(), parsed.total_rows());
    println!();
    println!("{:>3}  {:<30}  {}", "#", "Header", "Field");
    println!("{}", "-".repeat(50));

    for (idx, header) in parsed.headers.iter().enumerate() {
        let field = mapping
            .iter()
            .find(|(_, h)| *h == header.as_str())
            .map(|(f, _)| f.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:>3}  {:<30}  {}", idx + 1, header, field);
    }

    let unmapped: Vec<&str> = CanonicalField::ALL
        .iter()
        .filter(|f| mapping.get(**f).is_none())
        .map(|f| f.as_str())
        .collect();
    if !unmapped.is_empty() {
        println!();
        println!("Not found: {}", unmapped.join(", "));
    }

    Ok(())
}

fn cmd_lock(conn: &Connection, config: &Config, action: LockAction) -> Result<()> {
    let settings = SqliteSettings::open(conn)?;
    let clock = SystemClock;
    let lock = ImportLock::new(&settings, &clock).with_ttl(config.lock_ttl_seconds());

    match action {
        LockAction::Status => {
            let status = lock.status()?;
            println!("{}", status.message);
            if let (Some(started), Some(owner)) = (&status.started, &status.owner_id) {
                println!("  Started:  {} UTC", started);
                println!("  Owner:    {}", owner);
            }
        }
        LockAction::Release { force } => {
            if !force {
                anyhow::bail!("Releasing another process's lock requires --force");
            }
            if lock.force_release()? {
                println!("Import lock released");
            } else {
                println!("No lock to release");
            }
        }
    }
    Ok(())
}

fn cmd_runs(conn: &Connection, limit: i64, source: Option<String>) -> Result<()> {
    let runs = schema::list_import_runs(conn, source.as_deref(), limit)?;

    if runs.is_empty() {
        println!("No import runs found.");
        return Ok(());
    }

    println!("{:>5}  {:<12}  {:<10}  {:>6}  {:>6}  {:>6}  {:>6}  {:<20}  {}",
        "ID", "Source", "Status", "Rows", "New", "Upd", "Err", "Started", "File");
    println!("{}", "-".repeat(100));

    for run in runs {
        println!("{:>5}  {:<12}  {:<10}  {:>6}  {:>6}  {:>6}  {:>6}  {:<20}  {}",
            run.id,
            run.source,
            run.status,
            run.total_rows,
            run.new_count,
            run.updated_count,
            run.error_count,
            run.started_at.as_deref().unwrap_or("-"),
            run.filename.as_deref().unwrap_or("-"),
        );
    }

    Ok(())
}

fn cmd_run(conn: &Connection, id: i64, errors: bool) -> Result<()> {
    let run = schema::get_import_run(conn, id)?
        .ok_or_else(|| anyhow::anyhow!("Import run {} not found", id))?;

    println!("Run {}", run.id);
    println!("  Source:     {}", run.source);
    println!("  File:       {}", run.filename.as_deref().unwrap_or("-"));
    println!("  Status:     {}", run.status);
    println!("  Started:    {}", run.started_at.as_deref().unwrap_or("-"));
    println!("  Completed:  {}", run.completed_at.as_deref().unwrap_or("-"));
    println!("  Rows:       {} total, {} processed", run.total_rows, run.processed_rows);
    println!("  Results:    {} new, {} updated, {} skipped, {} errors",
        run.new_count, run.updated_count, run.skipped_count, run.error_count);
    if let Some(message) = &run.error_message {
        println!("  Error:      {}", message);
    }

    if errors {
        let rows = schema::list_import_rows(conn, id, Some("error"))?;
        println!();
        if rows.is_empty() {
            println!("No failed rows.");
        }
        for row in rows {
            println!("  row {:>5}: {}", row.source_row, row.error_message.as_deref().unwrap_or("-"));
            if let Some(phone) = row
                .raw_data
                .as_deref()
                .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
                .and_then(|raw| raw_phone(&raw))
            {
                println!("             phone {}", mask_phone(&phone));
            }
        }
    }

    Ok(())
}

/// First phone-looking value in a raw row snapshot.
fn raw_phone(raw: &serde_json::Value) -> Option<String> {
    let fields = raw.as_object()?;
    let mapping = detect_column_mapping(&fields.keys().collect::<Vec<_>>());
    let header = mapping.get(CanonicalField::Phone)?;
    fields.get(header)?.as_str().map(|s| s.to_string())
}

fn cmd_mapping(conn: &Connection, action: MappingAction) -> Result<()> {
    match action {
        MappingAction::Set { mapping_type, source_value, normalized_value } => {
            schema::upsert_mapping(conn, &mapping_type, &source_value, &normalized_value, None, true)?;
            println!("{} '{}' -> '{}'", mapping_type, source_value, normalized_value);
        }
        MappingAction::Get { mapping_type, source_value } => {
            match schema::get_mapping(conn, &mapping_type, &source_value)? {
                Some(m) => println!(
                    "{} '{}' -> '{}'{}",
                    m.mapping_type,
                    m.source_value,
                    m.normalized_value,
                    if m.is_manual_override { " (manual)" } else { "" }
                ),
                None => println!("No mapping for {} '{}'", mapping_type, source_value),
            }
        }
    }
    Ok(())
}

/// Single-byte delimiter/quote from CLI text. Accepts "tab" and "\t".
fn parse_byte(value: &str) -> Result<u8> {
    match value {
        "tab" | "\\t" | "\t" => Ok(b'\t'),
        v if v.len() == 1 => Ok(v.as_bytes()[0]),
        v => anyhow::bail!("Expected a single ASCII character, got '{}'", v),
    }
}

/// `field=Header` pairs into a column mapping.
fn parse_mapping(pairs: &[String]) -> Result<Option<ColumnMapping>> {
    if pairs.is_empty() {
        return Ok(None);
    }

    let mut mapping = ColumnMapping::new();
    for pair in pairs {
        let (field, header) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Invalid --map '{}', expected FIELD=HEADER", pair))?;
        let field: CanonicalField = field.parse()?;
        mapping.insert(field, header.trim());
    }
    Ok(Some(mapping))
}
