//! The only SQL in the crate that writes `accounts.balance`,
//! `accounts.opening_balance` and the two snapshot columns. Every function
//! runs inside the caller's write transaction.

use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use rust_decimal::Decimal;

use super::delta::Role;
use crate::db::{
    account_from_row, date_column, decimal_column, format_date, optional_decimal_column,
    transaction_from_row, txn_type_column, ACCOUNT_COLUMNS, TXN_COLUMNS,
};
use crate::error::{LedgerError, LedgerResult};
use crate::models::{Account, Transaction, TransactionDraft, TransactionType};

/// A transaction as seen from one account during replay.
#[derive(Debug, Clone)]
pub(super) struct ReplayRow {
    pub(super) id: i64,
    pub(super) date: NaiveDate,
    pub(super) created_at: String,
    pub(super) txn_type: TransactionType,
    pub(super) amount: Decimal,
    pub(super) role: Role,
    /// Snapshot currently stored for this account's side of the entry.
    pub(super) stored: Option<Decimal>,
}

/// Keyset position of the last row handed out.
#[derive(Debug, Clone)]
pub(super) struct Cursor {
    date: String,
    created_at: String,
    id: i64,
}

impl Cursor {
    pub(super) fn start() -> Self {
        Self {
            date: String::new(),
            created_at: String::new(),
            id: 0,
        }
    }

    pub(super) fn after(row: &ReplayRow) -> Self {
        Self {
            date: format_date(row.date),
            created_at: row.created_at.clone(),
            id: row.id,
        }
    }
}

fn role_of(flag: i64) -> Role {
    if flag == 0 {
        Role::Source
    } else {
        Role::Destination
    }
}

// ── Accounts ──────────────────────────────────────────────────

pub(super) fn load_account(conn: &Connection, id: i64) -> LedgerResult<Account> {
    conn.query_row(
        &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
        params![id],
        account_from_row,
    )
    .optional()?
    .ok_or(LedgerError::AccountNotFound(id))
}

pub(super) fn set_balance(conn: &Connection, account_id: i64, balance: Decimal) -> LedgerResult<()> {
    conn.execute(
        "UPDATE accounts SET balance = ?1 WHERE id = ?2",
        params![balance.to_string(), account_id],
    )?;
    Ok(())
}

pub(super) fn set_opening_balance(
    conn: &Connection,
    account_id: i64,
    opening: Decimal,
) -> LedgerResult<()> {
    conn.execute(
        "UPDATE accounts SET opening_balance = ?1 WHERE id = ?2",
        params![opening.to_string(), account_id],
    )?;
    Ok(())
}

/// Mark the post-upgrade snapshot backfill as done.
pub(super) fn clear_backfill_pending(conn: &Connection) -> LedgerResult<()> {
    conn.execute("UPDATE schema_version SET backfill_pending = 0", [])?;
    Ok(())
}

pub(super) fn all_account_ids(conn: &Connection) -> LedgerResult<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM accounts ORDER BY id")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// ── Transactions ──────────────────────────────────────────────

pub(super) fn load_transaction(conn: &Connection, id: i64) -> LedgerResult<Option<Transaction>> {
    Ok(conn
        .query_row(
            &format!("SELECT {TXN_COLUMNS} FROM transactions WHERE id = ?1"),
            params![id],
            transaction_from_row,
        )
        .optional()?)
}

pub(super) fn insert_transaction(
    conn: &Connection,
    draft: &TransactionDraft,
    created_at: &str,
    balance_after: Decimal,
    to_balance_after: Option<Decimal>,
) -> LedgerResult<i64> {
    conn.execute(
        "INSERT INTO transactions (account_id, to_account_id, txn_type, amount, date, description,
                                   category_id, created_at, balance_after_transaction, to_account_balance_after)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            draft.account_id,
            draft.to_account_id,
            draft.txn_type.as_str(),
            draft.amount.to_string(),
            format_date(draft.date),
            draft.description,
            draft.category_id,
            created_at,
            balance_after.to_string(),
            to_balance_after.map(|b| b.to_string()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(super) fn update_transaction(
    conn: &Connection,
    id: i64,
    draft: &TransactionDraft,
    balance_after: Decimal,
    to_balance_after: Option<Decimal>,
) -> LedgerResult<()> {
    conn.execute(
        "UPDATE transactions
         SET account_id = ?1, to_account_id = ?2, txn_type = ?3, amount = ?4, date = ?5,
             description = ?6, category_id = ?7,
             balance_after_transaction = ?8, to_account_balance_after = ?9
         WHERE id = ?10",
        params![
            draft.account_id,
            draft.to_account_id,
            draft.txn_type.as_str(),
            draft.amount.to_string(),
            format_date(draft.date),
            draft.description,
            draft.category_id,
            balance_after.to_string(),
            to_balance_after.map(|b| b.to_string()),
            id,
        ],
    )?;
    Ok(())
}

/// Remove a transaction and the side-table rows pointing at it.
pub(super) fn delete_transaction(conn: &Connection, id: i64) -> LedgerResult<()> {
    conn.execute(
        "DELETE FROM selection_history WHERE transaction_id = ?1",
        params![id],
    )?;
    conn.execute("DELETE FROM transactions WHERE id = ?1", params![id])?;
    Ok(())
}

/// Whether the account has anything dated after `date`, i.e. whether a new
/// entry on `date` lands in the middle of its history.
pub(super) fn has_entries_after(
    conn: &Connection,
    account_id: i64,
    date: NaiveDate,
) -> LedgerResult<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM transactions WHERE account_id = ?1 AND date > ?2)
             OR EXISTS(SELECT 1 FROM transactions WHERE to_account_id = ?1 AND date > ?2)",
        params![account_id, format_date(date)],
        |row| row.get(0),
    )?)
}

// ── Replay ────────────────────────────────────────────────────

/// Snapshot of the latest entry on the account dated strictly before `before`.
pub(super) fn anchor_snapshot(
    conn: &Connection,
    account_id: i64,
    before: NaiveDate,
) -> LedgerResult<Option<Decimal>> {
    let row = conn
        .query_row(
            "SELECT id, date, created_at, balance_after_transaction AS snapshot
               FROM transactions WHERE account_id = ?1 AND date < ?2
             UNION ALL
             SELECT id, date, created_at, to_account_balance_after
               FROM transactions WHERE to_account_id = ?1 AND date < ?2
             ORDER BY date DESC, created_at DESC, id DESC
             LIMIT 1",
            params![account_id, format_date(before)],
            |row| Ok((row.get::<_, i64>(0)?, optional_decimal_column(row, 3)?)),
        )
        .optional()?;
    match row {
        None => Ok(None),
        Some((_, Some(snapshot))) => Ok(Some(snapshot)),
        Some((id, None)) => Err(LedgerError::Corrupt(format!(
            "transfer {id} has no destination snapshot"
        ))),
    }
}

/// Next page of the account's entries on or after `from` (everything when
/// `None`), past `cursor`, oldest first.
pub(super) fn replay_page(
    conn: &Connection,
    account_id: i64,
    from: Option<NaiveDate>,
    cursor: &Cursor,
    limit: usize,
) -> LedgerResult<Vec<ReplayRow>> {
    let from = from.map(format_date).unwrap_or_default();
    let mut stmt = conn.prepare_cached(
        "SELECT id, date, created_at, txn_type, amount, 0 AS role, balance_after_transaction
           FROM transactions
          WHERE account_id = ?1 AND date >= ?2 AND (date, created_at, id) > (?3, ?4, ?5)
         UNION ALL
         SELECT id, date, created_at, txn_type, amount, 1, to_account_balance_after
           FROM transactions
          WHERE to_account_id = ?1 AND date >= ?2 AND (date, created_at, id) > (?3, ?4, ?5)
         ORDER BY date, created_at, id
         LIMIT ?6",
    )?;
    let rows = stmt.query_map(
        params![
            account_id,
            from,
            cursor.date,
            cursor.created_at,
            cursor.id,
            limit as i64
        ],
        |row| {
            Ok(ReplayRow {
                id: row.get(0)?,
                date: date_column(row, 1)?,
                created_at: row.get(2)?,
                txn_type: txn_type_column(row, 3)?,
                amount: decimal_column(row, 4)?,
                role: role_of(row.get(5)?),
                stored: optional_decimal_column(row, 6)?,
            })
        },
    )?;
    let page = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(page)
}

/// Write one page of replayed snapshots: at most one UPDATE per snapshot column.
pub(super) fn write_snapshots(conn: &Connection, writes: &[(i64, Role, Decimal)]) -> LedgerResult<()> {
    for (role, column) in [
        (Role::Source, "balance_after_transaction"),
        (Role::Destination, "to_account_balance_after"),
    ] {
        let values: Vec<Value> = writes
            .iter()
            .filter(|(_, r, _)| *r == role)
            .flat_map(|(id, _, balance)| [Value::Integer(*id), Value::Text(balance.to_string())])
            .collect();
        if values.is_empty() {
            continue;
        }
        let tuples = vec!["(?, ?)"; values.len() / 2].join(", ");
        let sql = format!(
            "UPDATE transactions SET {column} = v.column2
             FROM (VALUES {tuples}) AS v
             WHERE transactions.id = v.column1"
        );
        conn.execute(&sql, params_from_iter(values.iter()))?;
    }
    Ok(())
}
