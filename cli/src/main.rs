use std::env;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use fetchq_core::logging::init_logging;
use fetchq_core::storage::SqliteStore;
use fetchq_core::{CoreError, CoreResult, RecordId, SettingsPatch, TransferScheduler};

mod cli;
mod console;

use crate::cli::{Cli, Command, RootAction, SettingsAction, SettingsArgs};
use crate::console::{format_bytes, ConsoleSink};

const DB_ENV: &str = "FETCHQ_DB";
const DOWNLOAD_DIR_ENV: &str = "FETCHQ_DOWNLOAD_DIR";

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> CoreResult<()> {
    let scheduler = build_scheduler(cli.store)?;

    match cli.command {
        Command::Get {
            urls,
            name,
            connections,
            parallel,
        } => {
            if name.is_some() && urls.len() > 1 {
                return Err(CoreError::Validation(
                    "--name needs exactly one URL".to_string(),
                ));
            }
            let patch = SettingsPatch {
                num_connections: connections,
                max_concurrent_downloads: parallel,
                ..SettingsPatch::default()
            };
            if !patch.is_empty() {
                scheduler.update_settings(&patch)?;
            }
            for url in &urls {
                let record = scheduler.submit(url, name.as_deref())?;
                println!("added {} -> {}", record.id, record.destination.display());
            }
            scheduler.wait_idle()?;
        }
        Command::Run => {
            let count = scheduler.requeue_interrupted()?;
            if count == 0 {
                println!("nothing to run");
                return Ok(());
            }
            scheduler.wait_idle()?;
            println!("queue complete");
        }
        Command::List { json } => {
            let records = scheduler.list_all()?;
            if json {
                let text = serde_json::to_string_pretty(&records)
                    .map_err(|err| CoreError::Storage(err.to_string()))?;
                println!("{}", text);
            } else {
                for record in records {
                    println!(
                        "{}\t{}\t{:.1}%\t{}\t{}",
                        record.id,
                        record.status,
                        record.progress_percent,
                        format_bytes(record.total_bytes),
                        record.url
                    );
                }
            }
        }
        Command::Cancel { id } => scheduler.cancel(&parse_id(&id)?)?,
        Command::Remove { id } => scheduler.remove(&parse_id(&id)?)?,
        Command::Pause { id } => scheduler.pause(&parse_id(&id)?)?,
        Command::Resume { id } => {
            scheduler.resume(&parse_id(&id)?)?;
            scheduler.wait_idle()?;
        }
        Command::ClearHistory => {
            let removed = scheduler.clear_history()?;
            println!("removed {} records", removed);
        }
        Command::Root { action } => match action {
            RootAction::Show => println!("{}", scheduler.download_root().display()),
            RootAction::Set { path } => {
                let root = scheduler.set_download_root(path)?;
                println!("{}", root.display());
            }
            RootAction::Choose => match scheduler.choose_download_root(&prompt_directory)? {
                Some(root) => println!("{}", root.display()),
                None => println!("unchanged"),
            },
        },
        Command::Settings { action } => {
            let settings = match action {
                SettingsAction::Show => scheduler.settings()?,
                SettingsAction::Set(args) => {
                    let patch = settings_patch(args);
                    if patch.is_empty() {
                        return Err(CoreError::Validation("no settings given".to_string()));
                    }
                    scheduler.update_settings(&patch)?
                }
                SettingsAction::Reset => scheduler.reset_settings()?,
            };
            let text = serde_json::to_string_pretty(&settings)
                .map_err(|err| CoreError::Storage(err.to_string()))?;
            println!("{}", text);
        }
    }
    Ok(())
}

fn build_scheduler(store: Option<PathBuf>) -> CoreResult<TransferScheduler> {
    let path = match store.or_else(|| env::var_os(DB_ENV).map(PathBuf::from)) {
        Some(path) => path,
        None => dirs::data_dir()
            .map(|dir| dir.join("fetchq").join("fetchq.db"))
            .ok_or_else(|| CoreError::Storage(format!("no data directory; set {}", DB_ENV)))?,
    };
    tracing::debug!(path = %path.display(), "opening store");

    let mut builder = TransferScheduler::builder()
        .store(Box::new(SqliteStore::new(path)?))
        .event_sink(Arc::new(ConsoleSink::default()));
    if let Some(dir) = env::var_os(DOWNLOAD_DIR_ENV) {
        builder = builder.default_root(PathBuf::from(dir));
    }
    builder.build()
}

fn parse_id(raw: &str) -> CoreResult<RecordId> {
    RecordId::parse_str(raw.trim())
        .map_err(|_| CoreError::Validation(format!("invalid record id: {}", raw)))
}

fn settings_patch(args: SettingsArgs) -> SettingsPatch {
    SettingsPatch {
        max_concurrent_downloads: args.max_concurrent,
        num_connections: args.connections,
        auto_extract: args.auto_extract,
        auto_convert: args.auto_convert,
        move_to_secondary: args.move_to_secondary,
        secondary_root: if args.clear_secondary_root {
            Some(None)
        } else {
            args.secondary_root.map(Some)
        },
        download_root: None,
        converter_path: if args.clear_converter {
            Some(None)
        } else {
            args.converter.map(Some)
        },
        max_history: args.max_history,
    }
}

/// Reads a directory from stdin; an empty line keeps `current`.
fn prompt_directory(current: &Path) -> Option<PathBuf> {
    print!("download directory [{}]: ", current.display());
    io::stdout().flush().ok()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).ok()?;
    let line = line.trim();
    if line.is_empty() {
        None
    } else {
        Some(PathBuf::from(line))
    }
}
