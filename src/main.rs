mod config;
mod db;
mod error;
mod ledger;
mod models;
mod run;
mod selection;

use anyhow::{Context, Result};
use std::path::PathBuf;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let mut args: Vec<String> = std::env::args().collect();
    let config = config::Config::load()?;
    let db_path = match take_flag(&mut args, "--db") {
        Some(path) => PathBuf::from(run::shellexpand(&path)),
        None => get_db_path()?,
    };
    let mut db = db::Database::open(&db_path, &config.storage)?;
    let ledger = ledger::Ledger::new(&config);

    if db.backfill_pending()? {
        eprintln!("Upgrading database: computing running balances...");
        let reports = ledger
            .backfill_all(&mut db, &ledger::CancelToken::new())
            .context("Snapshot backfill failed")?;
        eprintln!("Backfilled {} accounts", reports.len());
    }

    let ctx = run::Context {
        db: &mut db,
        ledger: &ledger,
        db_path: &db_path,
        config: &config,
    };
    let result = run::as_cli(&args, ctx);
    if let Some(err) = result.as_ref().err().and_then(|e| e.downcast_ref::<error::LedgerError>()) {
        log::debug!("ledger error (status {}): {err}", err.status_code());
        if err.is_transient() {
            eprintln!("Nothing was changed; the ledger was busy. Try again.");
        } else if err.is_validation() {
            eprintln!("Nothing was changed.");
        }
    }
    result
}

/// Remove `flag <value>` from the argument list and return the value.
fn take_flag(args: &mut Vec<String>, flag: &str) -> Option<String> {
    let idx = args.iter().position(|a| a == flag)?;
    if idx + 1 >= args.len() {
        return None;
    }
    let value = args.remove(idx + 1);
    args.remove(idx);
    Some(value)
}

fn get_db_path() -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("com", "runbal", "runbal")
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
    let data_dir = proj_dirs.data_dir();
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
    Ok(data_dir.join("runbal.db"))
}
