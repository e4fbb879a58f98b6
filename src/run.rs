mod cli;

use std::path::Path;

use crate::config::Config;
use crate::db::Database;
use crate::ledger::Ledger;

pub(crate) use cli::{as_cli, shellexpand};

/// Everything a command needs, built once in `main`.
pub(crate) struct Context<'a> {
    pub(crate) db: &'a mut Database,
    pub(crate) ledger: &'a Ledger,
    pub(crate) db_path: &'a Path,
    pub(crate) config: &'a Config,
}
