mod schema;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;

use crate::config::StorageConfig;
use crate::error::LedgerResult;
use crate::models::*;

pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";

pub(crate) const ACCOUNT_COLUMNS: &str =
    "id, name, account_type, institution, currency, owner_id, created_at, balance, opening_balance";

pub(crate) const TXN_COLUMNS: &str = "id, account_id, to_account_id, txn_type, amount, date, \
     description, category_id, created_at, balance_after_transaction, to_account_balance_after";

pub(crate) struct Database {
    conn: Connection,
}

impl Database {
    pub(crate) fn open(path: &Path, storage: &StorageConfig) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("Failed to set database pragmas")?;
        conn.busy_timeout(storage.busy_timeout())
            .context("Failed to set busy timeout")?;
        let mut db = Self { conn };
        db.migrate().context("Database migration failed")?;
        Ok(db)
    }

    #[cfg(test)]
    pub(crate) fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let mut db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&mut self) -> Result<()> {
        // Check if schema_version table exists
        let has_version_table: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            [],
            |row| row.get(0),
        )?;

        if !has_version_table {
            // Fresh database - apply full schema
            self.conn.execute_batch(schema::SCHEMA)?;
            self.conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![schema::CURRENT_VERSION],
            )?;
            return Ok(());
        }

        // Existing database - check version and apply migrations
        let current: i32 = self
            .conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?
            .unwrap_or(0);

        if current >= schema::CURRENT_VERSION {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        for &(from_version, sql) in schema::MIGRATIONS {
            if current <= from_version {
                tx.execute_batch(sql)?;
            }
        }
        tx.execute(
            "UPDATE schema_version SET version = ?1",
            params![schema::CURRENT_VERSION],
        )?;
        if current < schema::SNAPSHOT_VERSION {
            // Cleared by the ledger once every account has been replayed.
            tx.execute("UPDATE schema_version SET backfill_pending = 1", [])?;
            log::info!("migrated schema v{current} -> v{}, snapshot backfill pending", schema::CURRENT_VERSION);
        }
        tx.commit()?;
        Ok(())
    }

    /// Whether snapshots still have to be backfilled after an upgrade from a
    /// database that predates them. Stays set until a backfill completes.
    pub(crate) fn backfill_pending(&self) -> Result<bool> {
        Ok(self.conn.query_row(
            "SELECT backfill_pending FROM schema_version LIMIT 1",
            [],
            |row| row.get::<_, bool>(0),
        )?)
    }

    /// Open the single write transaction an engine operation runs in. IMMEDIATE
    /// takes SQLite's write lock up front so a concurrent writer cannot slip in
    /// between our reads and writes.
    pub(crate) fn begin_write(&mut self) -> LedgerResult<rusqlite::Transaction<'_>> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }

    /// Read-only transaction used to plan which accounts an operation will lock.
    pub(crate) fn begin_read(&mut self) -> LedgerResult<rusqlite::Transaction<'_>> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Deferred)?)
    }

    // ── Accounts ──────────────────────────────────────────────

    pub(crate) fn insert_account(&self, account: &Account) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO accounts (name, account_type, institution, currency, owner_id, created_at, balance, opening_balance)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                account.name,
                account.account_type.as_str(),
                account.institution,
                account.currency,
                account.owner_id,
                account.created_at,
                account.balance().to_string(),
                account.opening_balance().map(|b| b.to_string()),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub(crate) fn get_accounts(&self) -> Result<Vec<Account>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY name"))?;
        let rows = stmt.query_map([], account_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub(crate) fn get_account_by_id(&self, id: i64) -> Result<Option<Account>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                params![id],
                account_from_row,
            )
            .optional()?)
    }

    /// Resolve a CLI account reference: a numeric id or a case-insensitive name.
    pub(crate) fn find_account(&self, reference: &str) -> Result<Option<Account>> {
        if let Ok(id) = reference.parse::<i64>() {
            if let Some(account) = self.get_account_by_id(id)? {
                return Ok(Some(account));
            }
        }
        let lower = reference.to_lowercase();
        Ok(self
            .get_accounts()?
            .into_iter()
            .find(|a| a.name.to_lowercase() == lower))
    }

    // ── Transactions ──────────────────────────────────────────

    pub(crate) fn get_transaction(&self, id: i64) -> Result<Option<Transaction>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {TXN_COLUMNS} FROM transactions WHERE id = ?1"),
                params![id],
                transaction_from_row,
            )
            .optional()?)
    }

    /// Every transaction naming the account on either side, oldest first.
    pub(crate) fn get_account_history(&self, account_id: i64) -> Result<Vec<Transaction>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TXN_COLUMNS} FROM transactions
             WHERE account_id = ?1 OR to_account_id = ?1
             ORDER BY date, created_at, id"
        ))?;
        let rows = stmt.query_map(params![account_id], transaction_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub(crate) fn get_transaction_count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?)
    }

    // ── Selection history ─────────────────────────────────────

    pub(crate) fn insert_selection(&self, selection: &Selection) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO selection_history (transaction_id, payee, category_id, selected_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                selection.transaction_id,
                selection.payee,
                selection.category_id,
                selection.selected_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub(crate) fn get_selections(&self, transaction_id: i64) -> Result<Vec<Selection>> {
        let mut stmt = self.conn.prepare(
            "SELECT transaction_id, payee, category_id, selected_at FROM selection_history
             WHERE transaction_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![transaction_id], |row| {
            Ok(Selection {
                transaction_id: row.get(0)?,
                payee: row.get(1)?,
                category_id: row.get(2)?,
                selected_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Row mapping ───────────────────────────────────────────────

pub(crate) fn decimal_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    parse_decimal(idx, &text)
}

pub(crate) fn optional_decimal_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| parse_decimal(idx, &t)).transpose()
}

fn parse_decimal(idx: usize, text: &str) -> rusqlite::Result<Decimal> {
    Decimal::from_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn date_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let text: String = row.get(idx)?;
    NaiveDate::parse_from_str(&text, DATE_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Creation stamp with enough precision to order same-day entries.
pub(crate) fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    let mut account = Account::new(
        row.get(1)?,
        AccountType::parse(&row.get::<_, String>(2)?),
        row.get(3)?,
    );
    account.currency = row.get(4)?;
    account.owner_id = row.get(5)?;
    account.created_at = row.get(6)?;
    Ok(account.hydrate(
        row.get(0)?,
        decimal_column(row, 7)?,
        optional_decimal_column(row, 8)?,
    ))
}

pub(crate) fn txn_type_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<TransactionType> {
    let text: String = row.get(idx)?;
    TransactionType::parse(&text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown transaction type: {text}").into(),
        )
    })
}

pub(crate) fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    let draft = TransactionDraft {
        account_id: row.get(1)?,
        to_account_id: row.get(2)?,
        txn_type: txn_type_column(row, 3)?,
        amount: decimal_column(row, 4)?,
        date: date_column(row, 5)?,
        description: row.get(6)?,
        category_id: row.get(7)?,
    };
    Ok(Transaction::from_draft(
        row.get(0)?,
        draft,
        row.get(8)?,
        decimal_column(row, 9)?,
        optional_decimal_column(row, 10)?,
    ))
}
