//! Opening balances: what an account held before its first transaction.
//!
//! The live balance is authoritative. An account whose opening balance is
//! unknown (rows from before snapshots were stored) gets it derived backwards
//! from the live balance by undoing every transaction, and the result is
//! persisted so later replays start from the same point. The zero-floor
//! reading (assume nothing before the first entry unless an initial-funding
//! entry says otherwise) is only consulted to flag histories the two readings
//! disagree on.

use regex::Regex;
use rusqlite::Connection;
use rust_decimal::Decimal;
use std::sync::OnceLock;

use super::delta::reversal;
use super::store::{self, Cursor};
use crate::error::LedgerResult;
use crate::models::Account;

fn initial_funding_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(?i)\b(opening|initial|starting)\s+(balance|deposit|funding)\b").ok()
        })
        .as_ref()
}

pub(crate) fn is_initial_funding(description: &str) -> bool {
    initial_funding_pattern().is_some_and(|re| re.is_match(description))
}

/// Opening balance of `account`, deriving and persisting it on first use.
pub(super) fn resolve(conn: &Connection, account: &Account, batch_size: usize) -> LedgerResult<Decimal> {
    if let Some(opening) = account.opening_balance() {
        return Ok(opening);
    }
    let Some(account_id) = account.id else {
        return Ok(Decimal::ZERO);
    };

    let derivation = derive_backward(conn, account, batch_size)?;
    if derivation.opening != Decimal::ZERO && derivation.entries > 0 {
        log::warn!(
            "account {account_id}: opening balance derived as {} from live balance {} over {} entries, \
             zero-floor would assume 0{}; history before the first entry is unverifiable",
            derivation.opening,
            account.balance(),
            derivation.entries,
            if derivation.saw_initial_funding {
                " even with an initial funding entry"
            } else {
                ""
            },
        );
    } else {
        log::info!(
            "account {account_id}: derived opening balance {} over {} entries",
            derivation.opening,
            derivation.entries
        );
    }

    store::set_opening_balance(conn, account_id, derivation.opening)?;
    Ok(derivation.opening)
}

#[derive(Debug, Clone, PartialEq)]
pub(super) struct Derivation {
    pub(super) opening: Decimal,
    pub(super) entries: usize,
    pub(super) saw_initial_funding: bool,
}

/// Undo every transaction on the account, newest to oldest, starting from
/// the live balance. Summing reversals is order independent, so the history
/// is streamed in the cheap ascending order.
pub(super) fn derive_backward(
    conn: &Connection,
    account: &Account,
    batch_size: usize,
) -> LedgerResult<Derivation> {
    let category = account.category();
    let account_id = account.id.unwrap_or_default();
    let mut opening = account.balance();
    let mut entries = 0;
    let mut first_id = None;
    let mut cursor = Cursor::start();
    loop {
        let page = store::replay_page(conn, account_id, None, &cursor, batch_size)?;
        let Some(last) = page.last() else {
            break;
        };
        cursor = Cursor::after(last);
        if first_id.is_none() {
            first_id = page.first().map(|row| row.id);
        }
        for row in &page {
            opening += reversal(category, row.txn_type, row.role, row.amount);
            entries += 1;
        }
    }

    let saw_initial_funding = match first_id {
        Some(id) => store::load_transaction(conn, id)?
            .is_some_and(|txn| is_initial_funding(&txn.description)),
        None => false,
    };

    Ok(Derivation {
        opening,
        entries,
        saw_initial_funding,
    })
}
