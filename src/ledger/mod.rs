//! Running-balance engine. [`Ledger`] is the only writer of account balances
//! and transaction snapshots; everything else asks it for a mutation.

mod cancel;
mod delta;
mod locks;
mod opening;
mod recalc;
mod store;

pub(crate) use cancel::CancelToken;
pub(crate) use locks::AccountLocks;
pub(crate) use opening::is_initial_funding;
pub(crate) use recalc::RecalcReport;

use chrono::NaiveDate;
use rusqlite::Connection;
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, RecalcConfig};
use crate::db::{timestamp_now, Database};
use crate::error::{LedgerError, LedgerResult};
use crate::models::{Account, Transaction, TransactionDraft, TransactionPatch, TransactionType};
use delta::{legs, Role};
use recalc::Recalculator;

/// How often an operation re-plans when the rows it is about to touch moved
/// to other accounts between planning and locking.
const PLAN_ATTEMPTS: usize = 3;

/// Which transactions a bulk edit may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scope {
    All,
    /// Only transactions whose source account belongs to this owner.
    Owner(i64),
}

impl Scope {
    fn admits(&self, account: &Account) -> bool {
        match self {
            Self::All => true,
            Self::Owner(owner) => account.owner_id == *owner,
        }
    }
}

/// Replay outcome of a consistency check that writes nothing.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Audit {
    pub(crate) account_id: i64,
    pub(crate) live_balance: Decimal,
    pub(crate) replayed_balance: Decimal,
    /// (transaction id, stored snapshot, replayed snapshot)
    pub(crate) mismatches: Vec<(i64, Option<Decimal>, Decimal)>,
}

impl Audit {
    pub(crate) fn is_consistent(&self) -> bool {
        self.mismatches.is_empty() && self.live_balance == self.replayed_balance
    }
}

pub(crate) struct Ledger {
    locks: Arc<AccountLocks>,
    recalc: RecalcConfig,
    lock_timeout: Duration,
}

impl Ledger {
    pub(crate) fn new(config: &Config) -> Self {
        Self::with_locks(config, Arc::new(AccountLocks::new()))
    }

    /// Share one lock table between ledgers driving different connections to
    /// the same database file.
    pub(crate) fn with_locks(config: &Config, locks: Arc<AccountLocks>) -> Self {
        Self {
            locks,
            recalc: config.recalc.clone(),
            lock_timeout: config.locks.timeout(),
        }
    }

    // ── Operations ────────────────────────────────────────────

    pub(crate) fn create_transaction(
        &self,
        db: &mut Database,
        draft: TransactionDraft,
        cancel: &CancelToken,
    ) -> LedgerResult<Transaction> {
        let draft = validate(draft)?;
        let ids: BTreeSet<i64> = draft.account_ids().collect();

        self.locked(
            db,
            |_| Ok(ids.clone()),
            |conn, ids| {
                let accounts = self.prepare_accounts(conn, ids)?;
                let mut balances = live_balances(&accounts);
                let (after, to_after) = apply(&accounts, &mut balances, &draft, false);

                let created_at = timestamp_now();
                let id = store::insert_transaction(conn, &draft, &created_at, after, to_after)?;
                write_balances(conn, &balances)?;

                let mut backdated = false;
                for &account_id in ids {
                    backdated |= store::has_entries_after(conn, account_id, draft.date)?;
                }
                if backdated {
                    log::debug!("transaction {id} is back-dated to {}, replaying", draft.date);
                    Recalculator::new(conn, &self.recalc, cancel).run(ids, Some(draft.date))?;
                }

                let txn = reload(conn, id)?;
                log::info!(
                    "created {} {} on account {} ({id})",
                    txn.txn_type,
                    txn.amount,
                    txn.account_id
                );
                Ok(txn)
            },
        )
    }

    pub(crate) fn update_transaction(
        &self,
        db: &mut Database,
        id: i64,
        patch: &TransactionPatch,
        cancel: &CancelToken,
    ) -> LedgerResult<Transaction> {
        self.locked(
            db,
            |conn| {
                let existing = store::load_transaction(conn, id)?
                    .ok_or(LedgerError::TransactionNotFound(id))?;
                let next = validate(patch.apply_to(&existing.draft()))?;
                Ok(existing.draft().account_ids().chain(next.account_ids()).collect())
            },
            |conn, ids| {
                let existing = reload(conn, id)?;
                let old = existing.draft();
                let next = validate(patch.apply_to(&old))?;

                let accounts = self.prepare_accounts(conn, ids)?;
                let mut balances = live_balances(&accounts);
                apply(&accounts, &mut balances, &old, true);
                let (after, to_after) = apply(&accounts, &mut balances, &next, false);

                store::update_transaction(conn, id, &next, after, to_after)?;
                write_balances(conn, &balances)?;

                let earliest = old.date.min(next.date);
                Recalculator::new(conn, &self.recalc, cancel).run(ids, Some(earliest))?;

                let txn = reload(conn, id)?;
                log::info!("updated transaction {id}, replayed {ids:?} from {earliest}");
                Ok(txn)
            },
        )
    }

    pub(crate) fn delete_transaction(
        &self,
        db: &mut Database,
        id: i64,
        cancel: &CancelToken,
    ) -> LedgerResult<()> {
        self.locked(
            db,
            |conn| {
                let existing = store::load_transaction(conn, id)?
                    .ok_or(LedgerError::TransactionNotFound(id))?;
                Ok(existing.draft().account_ids().collect())
            },
            |conn, ids| {
                let existing = reload(conn, id)?;
                let old = existing.draft();

                let accounts = self.prepare_accounts(conn, ids)?;
                let mut balances = live_balances(&accounts);
                apply(&accounts, &mut balances, &old, true);

                store::delete_transaction(conn, id)?;
                write_balances(conn, &balances)?;

                // Later entries were computed with this one in place.
                Recalculator::new(conn, &self.recalc, cancel).run(ids, Some(old.date))?;
                log::info!("deleted transaction {id}");
                Ok(())
            },
        )
    }

    /// Apply the same patch to many transactions with a single replay per
    /// touched account. Unknown and out-of-scope ids are skipped.
    pub(crate) fn bulk_update_transactions(
        &self,
        db: &mut Database,
        ids: &[i64],
        patch: &TransactionPatch,
        scope: Scope,
        cancel: &CancelToken,
    ) -> LedgerResult<Vec<Transaction>> {
        // Every account the item touches, before or after the patch, must be in scope.
        let targets = |conn: &Connection| -> LedgerResult<Vec<(Transaction, TransactionDraft)>> {
            let mut found = Vec::new();
            let mut seen = BTreeSet::new();
            for &id in ids {
                if !seen.insert(id) {
                    continue;
                }
                let Some(txn) = store::load_transaction(conn, id)? else {
                    continue;
                };
                let old = txn.draft();
                if !in_scope(conn, scope, old.account_ids())? {
                    continue;
                }
                let next = validate(patch.apply_to(&old))?;
                if in_scope(conn, scope, next.account_ids())? {
                    found.push((txn, next));
                }
            }
            Ok(found)
        };

        self.locked(
            db,
            |conn| {
                let mut accounts = BTreeSet::new();
                for (txn, next) in targets(conn)? {
                    accounts.extend(txn.draft().account_ids().chain(next.account_ids()));
                }
                Ok(accounts)
            },
            |conn, account_ids| {
                let found = targets(conn)?;
                if found.is_empty() {
                    return Ok(Vec::new());
                }

                let accounts = self.prepare_accounts(conn, account_ids)?;
                let mut balances = live_balances(&accounts);
                let mut earliest: Option<NaiveDate> = None;
                for (txn, next) in &found {
                    cancel.check()?;
                    let old = txn.draft();
                    apply(&accounts, &mut balances, &old, true);
                    let (after, to_after) = apply(&accounts, &mut balances, next, false);
                    store::update_transaction(conn, txn.id, next, after, to_after)?;

                    let date = old.date.min(next.date);
                    earliest = Some(earliest.map_or(date, |e| e.min(date)));
                }
                write_balances(conn, &balances)?;

                Recalculator::new(conn, &self.recalc, cancel).run(account_ids, earliest)?;

                let updated = found
                    .iter()
                    .map(|(txn, _)| reload(conn, txn.id))
                    .collect::<LedgerResult<Vec<_>>>()?;
                log::info!(
                    "bulk-updated {} transactions, replayed {account_ids:?} from {}",
                    updated.len(),
                    earliest.map(|d| d.to_string()).unwrap_or_default()
                );
                Ok(updated)
            },
        )
    }

    /// Replay an account's entire history from its opening balance and
    /// reconcile the live balance to the result.
    pub(crate) fn recalculate_account(
        &self,
        db: &mut Database,
        account_id: i64,
        cancel: &CancelToken,
    ) -> LedgerResult<RecalcReport> {
        let ids = BTreeSet::from([account_id]);
        self.locked(
            db,
            |_| Ok(ids.clone()),
            |conn, ids| {
                self.prepare_accounts(conn, ids)?;
                let mut reports = Recalculator::new(conn, &self.recalc, cancel).run(ids, None)?;
                let report = reports.remove(&account_id).unwrap_or_default();
                log::info!(
                    "recalculated account {account_id}: {} replayed, {} rewritten, correction {}",
                    report.transactions_replayed,
                    report.transactions_updated,
                    report.balance_correction
                );
                Ok(report)
            },
        )
    }

    /// One-time replay of every account, run after upgrading a database
    /// that stored live balances but no snapshots. Each account commits on
    /// its own; the pending marker is only cleared once all of them have, so
    /// an interrupted backfill runs again on the next open.
    pub(crate) fn backfill_all(
        &self,
        db: &mut Database,
        cancel: &CancelToken,
    ) -> LedgerResult<Vec<(i64, RecalcReport)>> {
        let account_ids = {
            let tx = db.begin_read()?;
            store::all_account_ids(&tx)?
        };
        let mut reports = Vec::with_capacity(account_ids.len());
        for account_id in account_ids {
            cancel.check()?;
            let report = self.recalculate_account(db, account_id, cancel)?;
            reports.push((account_id, report));
        }
        let tx = db.begin_write()?;
        store::clear_backfill_pending(&tx)?;
        tx.commit()?;
        log::info!("snapshot backfill complete for {} accounts", reports.len());
        Ok(reports)
    }

    /// Replay an account in memory and compare against what is stored.
    pub(crate) fn audit_account(&self, db: &mut Database, account_id: i64) -> LedgerResult<Audit> {
        let tx = db.begin_read()?;
        let account = store::load_account(&tx, account_id)?;
        let category = account.category();
        let mut balance = match account.opening_balance() {
            Some(opening) => opening,
            None => opening::derive_backward(&tx, &account, self.recalc.batch_size)?.opening,
        };

        let mut mismatches = Vec::new();
        let mut cursor = store::Cursor::start();
        loop {
            let page = store::replay_page(&tx, account_id, None, &cursor, self.recalc.batch_size)?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = store::Cursor::after(last);
            for row in &page {
                balance += delta::delta(category, row.txn_type, row.role, row.amount);
                if row.stored != Some(balance) {
                    mismatches.push((row.id, row.stored, balance));
                }
            }
        }

        Ok(Audit {
            account_id,
            live_balance: account.balance(),
            replayed_balance: balance,
            mismatches,
        })
    }

    // ── Plumbing ──────────────────────────────────────────────

    /// Plan the account set, lock it, then run `op` inside one IMMEDIATE
    /// transaction. Any error drops the transaction, rolling everything back.
    fn locked<T>(
        &self,
        db: &mut Database,
        plan: impl Fn(&Connection) -> LedgerResult<BTreeSet<i64>>,
        op: impl FnOnce(&Connection, &BTreeSet<i64>) -> LedgerResult<T>,
    ) -> LedgerResult<T> {
        let mut planned = {
            let tx = db.begin_read()?;
            plan(&*tx)?
        };
        for _ in 0..PLAN_ATTEMPTS {
            let guard = self.locks.acquire(&planned, self.lock_timeout)?;
            let tx = db.begin_write()?;
            let ids = plan(&*tx)?;
            if guard.covers(&ids) {
                let out = op(&*tx, &ids)?;
                tx.commit()?;
                return Ok(out);
            }
            log::debug!("account set moved from {planned:?} to {ids:?}, re-planning");
            planned = ids;
        }
        Err(LedgerError::LockTimeout(planned.into_iter().collect()))
    }

    /// Load every account an operation touches and pin its opening balance
    /// before any balance moves.
    fn prepare_accounts(
        &self,
        conn: &Connection,
        ids: &BTreeSet<i64>,
    ) -> LedgerResult<BTreeMap<i64, Account>> {
        let mut accounts = BTreeMap::new();
        for &id in ids {
            let account = store::load_account(conn, id)?;
            opening::resolve(conn, &account, self.recalc.batch_size)?;
            accounts.insert(id, account);
        }
        Ok(accounts)
    }
}

/// Check the transfer target and amount, and normalize the amount to cents.
fn validate(mut draft: TransactionDraft) -> LedgerResult<TransactionDraft> {
    match (draft.txn_type, draft.to_account_id) {
        (TransactionType::Transfer, None) => {
            return Err(LedgerError::InvalidTransferTarget(
                "a transfer needs a destination account".into(),
            ))
        }
        (TransactionType::Transfer, Some(to)) if to == draft.account_id => {
            return Err(LedgerError::InvalidTransferTarget(format!(
                "account {to} cannot transfer to itself"
            )))
        }
        (TransactionType::Income | TransactionType::Expense, Some(_)) => {
            return Err(LedgerError::InvalidTransferTarget(format!(
                "{} cannot have a destination account",
                draft.txn_type
            )))
        }
        _ => {}
    }
    if draft.amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount(draft.amount));
    }
    draft.amount = draft.amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    if draft.amount.is_zero() {
        return Err(LedgerError::InvalidAmount(draft.amount));
    }
    Ok(draft)
}

fn in_scope(conn: &Connection, scope: Scope, ids: impl Iterator<Item = i64>) -> LedgerResult<bool> {
    if scope == Scope::All {
        return Ok(true);
    }
    for id in ids {
        if !scope.admits(&store::load_account(conn, id)?) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn reload(conn: &Connection, id: i64) -> LedgerResult<Transaction> {
    store::load_transaction(conn, id)?.ok_or(LedgerError::TransactionNotFound(id))
}

fn live_balances(accounts: &BTreeMap<i64, Account>) -> BTreeMap<i64, Decimal> {
    accounts.iter().map(|(id, a)| (*id, a.balance())).collect()
}

fn write_balances(conn: &Connection, balances: &BTreeMap<i64, Decimal>) -> LedgerResult<()> {
    for (&account_id, &balance) in balances {
        store::set_balance(conn, account_id, balance)?;
    }
    Ok(())
}

/// Move the running live balances by the draft's legs (or undo them) and
/// return the resulting (source, destination) snapshots.
fn apply(
    accounts: &BTreeMap<i64, Account>,
    balances: &mut BTreeMap<i64, Decimal>,
    draft: &TransactionDraft,
    reverse: bool,
) -> (Decimal, Option<Decimal>) {
    let mut source_after = Decimal::ZERO;
    let mut destination_after = None;
    for leg in legs(draft) {
        let (Some(account), Some(balance)) =
            (accounts.get(&leg.account_id), balances.get_mut(&leg.account_id))
        else {
            continue;
        };
        let change = delta::delta(account.category(), draft.txn_type, leg.role, draft.amount);
        if reverse {
            *balance -= change;
        } else {
            *balance += change;
        }
        match leg.role {
            Role::Source => source_after = *balance,
            Role::Destination => destination_after = Some(*balance),
        }
    }
    (source_after, destination_after)
}

#[cfg(test)]
mod tests;
