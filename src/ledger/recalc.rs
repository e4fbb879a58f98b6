use chrono::NaiveDate;
use rusqlite::Connection;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};

use super::cancel::CancelToken;
use super::delta::{delta, Role};
use super::opening;
use super::store::{self, Cursor};
use crate::config::RecalcConfig;
use crate::error::{LedgerError, LedgerResult};

/// Outcome of replaying one account.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct RecalcReport {
    /// Entries on or after the start date that were replayed.
    pub(crate) transactions_replayed: usize,
    /// Entries whose stored snapshot actually changed.
    pub(crate) transactions_updated: usize,
    /// Replayed final balance minus the live balance found before the pass.
    pub(crate) balance_correction: Decimal,
    pub(crate) final_balance: Decimal,
}

/// Forward replay of stored snapshots from an anchor.
pub(super) struct Recalculator<'a> {
    conn: &'a Connection,
    config: &'a RecalcConfig,
    cancel: &'a CancelToken,
}

impl<'a> Recalculator<'a> {
    pub(super) fn new(conn: &'a Connection, config: &'a RecalcConfig, cancel: &'a CancelToken) -> Self {
        Self {
            conn,
            config,
            cancel,
        }
    }

    /// Replay every account in `accounts` from `earliest` (the whole history
    /// when `None`) and reset each live balance to its last replayed snapshot.
    pub(super) fn run(
        &self,
        accounts: &BTreeSet<i64>,
        earliest: Option<NaiveDate>,
    ) -> LedgerResult<BTreeMap<i64, RecalcReport>> {
        let mut reports = BTreeMap::new();
        for &account_id in accounts {
            let report = self.replay_account(account_id, earliest)?;
            reports.insert(account_id, report);
        }
        Ok(reports)
    }

    fn replay_account(&self, account_id: i64, earliest: Option<NaiveDate>) -> LedgerResult<RecalcReport> {
        let account = store::load_account(self.conn, account_id)?;
        let category = account.category();

        let anchor = match earliest {
            Some(date) => store::anchor_snapshot(self.conn, account_id, date)?,
            None => None,
        };
        let mut balance = match anchor {
            Some(snapshot) => snapshot,
            None => opening::resolve(self.conn, &account, self.config.batch_size)?,
        };

        let mut report = RecalcReport::default();
        let mut cursor = Cursor::start();
        let mut warned = false;
        loop {
            self.cancel.check()?;
            let page = store::replay_page(
                self.conn,
                account_id,
                earliest,
                &cursor,
                self.config.batch_size,
            )?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Cursor::after(last);

            report.transactions_replayed += page.len();
            if let Some(limit) = self.config.max_rows {
                if report.transactions_replayed > limit {
                    return Err(LedgerError::FanOutLimitExceeded {
                        account_id,
                        rows: report.transactions_replayed,
                        limit,
                    });
                }
            }
            if !warned && report.transactions_replayed > self.config.warn_threshold {
                log::warn!(
                    "recalculation of account {account_id} from {} passed {} rows",
                    earliest.map_or_else(|| "the beginning".to_string(), |d| d.to_string()),
                    self.config.warn_threshold
                );
                warned = true;
            }

            let mut writes: Vec<(i64, Role, Decimal)> = Vec::with_capacity(page.len());
            for row in &page {
                balance += delta(category, row.txn_type, row.role, row.amount);
                if row.stored != Some(balance) {
                    writes.push((row.id, row.role, balance));
                }
            }
            report.transactions_updated += writes.len();
            store::write_snapshots(self.conn, &writes)?;
        }

        report.final_balance = balance;
        report.balance_correction = balance - account.balance();
        if !report.balance_correction.is_zero() {
            log::info!(
                "account {account_id}: live balance {} corrected to {balance}",
                account.balance()
            );
            store::set_balance(self.conn, account_id, balance)?;
        }
        log::debug!(
            "account {account_id}: replayed {} entries, rewrote {}",
            report.transactions_replayed,
            report.transactions_updated
        );
        Ok(report)
    }
}
