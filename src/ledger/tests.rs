#![allow(clippy::unwrap_used)]

use chrono::NaiveDate;
use rusqlite::params;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::config::Config;
use crate::db::Database;
use crate::models::{AccountType, Selection};

fn setup() -> (Database, Ledger) {
    (Database::open_in_memory().unwrap(), Ledger::new(&Config::default()))
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
}

fn open_account(db: &Database, name: &str, account_type: AccountType, balance: Decimal) -> i64 {
    db.insert_account(
        &Account::new(name.into(), account_type, String::new()).with_starting_balance(balance),
    )
    .unwrap()
}

fn balance(db: &Database, id: i64) -> Decimal {
    db.get_account_by_id(id).unwrap().unwrap().balance()
}

fn snapshot(db: &Database, txn_id: i64, account_id: i64) -> Decimal {
    db.get_transaction(txn_id)
        .unwrap()
        .unwrap()
        .snapshot_for(account_id)
        .unwrap()
}

/// Snapshots of the account's history, oldest first.
fn snapshots(db: &Database, account_id: i64) -> Vec<Decimal> {
    db.get_account_history(account_id)
        .unwrap()
        .iter()
        .map(|t| t.snapshot_for(account_id).unwrap())
        .collect()
}

fn add(
    ledger: &Ledger,
    db: &mut Database,
    account_id: i64,
    txn_type: TransactionType,
    amount: Decimal,
    date: NaiveDate,
) -> Transaction {
    ledger
        .create_transaction(
            db,
            TransactionDraft::new(account_id, txn_type, amount, date),
            &CancelToken::new(),
        )
        .unwrap()
}

fn transfer(ledger: &Ledger, db: &mut Database, from: i64, to: i64, amount: Decimal, date: NaiveDate) -> Transaction {
    ledger
        .create_transaction(db, TransactionDraft::transfer(from, to, amount, date), &CancelToken::new())
        .unwrap()
}

fn assert_consistent(ledger: &Ledger, db: &mut Database, account_id: i64) {
    let audit = ledger.audit_account(db, account_id).unwrap();
    assert!(audit.is_consistent(), "account {account_id} inconsistent: {audit:?}");
}

fn amount_patch(amount: Decimal) -> TransactionPatch {
    TransactionPatch {
        amount: Some(amount),
        ..Default::default()
    }
}

// ── Create ────────────────────────────────────────────────────

#[test]
fn test_asset_expense_then_income() {
    let (mut db, ledger) = setup();
    let acct = open_account(&db, "Checking", AccountType::Checking, dec!(1000));

    let a = add(&ledger, &mut db, acct, TransactionType::Expense, dec!(200), day(1));
    assert_eq!(a.balance_after_transaction(), dec!(800));
    let b = add(&ledger, &mut db, acct, TransactionType::Income, dec!(50), day(2));
    assert_eq!(b.balance_after_transaction(), dec!(850));
    assert_eq!(balance(&db, acct), dec!(850));
    assert_consistent(&ledger, &mut db, acct);
}

#[test]
fn test_credit_card_charge_and_payment() {
    let (mut db, ledger) = setup();
    let card = open_account(&db, "Visa", AccountType::CreditCard, Decimal::ZERO);

    let charge = add(&ledger, &mut db, card, TransactionType::Expense, dec!(100), day(1));
    assert_eq!(charge.balance_after_transaction(), dec!(100));
    let payment = add(&ledger, &mut db, card, TransactionType::Income, dec!(40), day(2));
    assert_eq!(payment.balance_after_transaction(), dec!(60));
    assert_eq!(balance(&db, card), dec!(60));
    assert_consistent(&ledger, &mut db, card);
}

#[test]
fn test_transfer_between_assets() {
    let (mut db, ledger) = setup();
    let checking = open_account(&db, "Checking", AccountType::Checking, dec!(500));
    let savings = open_account(&db, "Savings", AccountType::Savings, dec!(100));

    let txn = transfer(&ledger, &mut db, checking, savings, dec!(150), day(3));
    assert_eq!(txn.balance_after_transaction(), dec!(350));
    assert_eq!(txn.to_account_balance_after(), Some(dec!(250)));
    assert_eq!(balance(&db, checking), dec!(350));
    assert_eq!(balance(&db, savings), dec!(250));
    assert_consistent(&ledger, &mut db, checking);
    assert_consistent(&ledger, &mut db, savings);
}

#[test]
fn test_transfer_pays_down_liability() {
    let (mut db, ledger) = setup();
    let checking = open_account(&db, "Checking", AccountType::Checking, dec!(1000));
    let card = open_account(&db, "Visa", AccountType::CreditCard, dec!(300));

    let txn = transfer(&ledger, &mut db, checking, card, dec!(100), day(5));
    assert_eq!(txn.balance_after_transaction(), dec!(900));
    assert_eq!(txn.to_account_balance_after(), Some(dec!(200)));
    assert_eq!(balance(&db, card), dec!(200));
    assert_consistent(&ledger, &mut db, card);
}

#[test]
fn test_backdated_create_shifts_later_snapshots() {
    let (mut db, ledger) = setup();
    let acct = open_account(&db, "Checking", AccountType::Checking, dec!(1000));
    let first = add(&ledger, &mut db, acct, TransactionType::Expense, dec!(100), day(5));
    let second = add(&ledger, &mut db, acct, TransactionType::Expense, dec!(100), day(10));

    let early = add(&ledger, &mut db, acct, TransactionType::Expense, dec!(50), day(1));
    assert_eq!(early.balance_after_transaction(), dec!(950));
    assert_eq!(snapshot(&db, first.id, acct), dec!(850));
    assert_eq!(snapshot(&db, second.id, acct), dec!(750));
    assert_eq!(balance(&db, acct), dec!(750));
    assert_consistent(&ledger, &mut db, acct);
}

#[test]
fn test_same_day_entries_replay_in_creation_order() {
    let (mut db, ledger) = setup();
    let acct = open_account(&db, "Cash", AccountType::Cash, dec!(100));
    let a = add(&ledger, &mut db, acct, TransactionType::Expense, dec!(10), day(3));
    let b = add(&ledger, &mut db, acct, TransactionType::Expense, dec!(20), day(3));
    let c = add(&ledger, &mut db, acct, TransactionType::Income, dec!(5), day(3));

    ledger
        .update_transaction(&mut db, b.id, &amount_patch(dec!(30)), &CancelToken::new())
        .unwrap();
    assert_eq!(snapshot(&db, a.id, acct), dec!(90));
    assert_eq!(snapshot(&db, b.id, acct), dec!(60));
    assert_eq!(snapshot(&db, c.id, acct), dec!(65));
    assert_eq!(balance(&db, acct), dec!(65));
}

#[test]
fn test_amount_rounded_to_cents() {
    let (mut db, ledger) = setup();
    let acct = open_account(&db, "Checking", AccountType::Checking, dec!(10));
    let txn = add(&ledger, &mut db, acct, TransactionType::Expense, dec!(1.005), day(1));
    assert_eq!(txn.amount, dec!(1.01));
    assert_eq!(balance(&db, acct), dec!(8.99));

    // Half a cent rounds away from zero, never to the even cent.
    let txn = add(&ledger, &mut db, acct, TransactionType::Income, dec!(0.125), day(2));
    assert_eq!(txn.amount, dec!(0.13));
    assert_eq!(balance(&db, acct), dec!(9.12));
}

// ── Validation ────────────────────────────────────────────────

#[test]
fn test_transfer_needs_distinct_destination() {
    let (mut db, ledger) = setup();
    let acct = open_account(&db, "Checking", AccountType::Checking, dec!(100));
    let cancel = CancelToken::new();

    let mut no_target = TransactionDraft::new(acct, TransactionType::Transfer, dec!(10), day(1));
    no_target.to_account_id = None;
    let err = ledger.create_transaction(&mut db, no_target, &cancel).unwrap_err();
    assert!(matches!(err, LedgerError::InvalidTransferTarget(_)));

    let to_self = TransactionDraft::transfer(acct, acct, dec!(10), day(1));
    let err = ledger.create_transaction(&mut db, to_self, &cancel).unwrap_err();
    assert!(matches!(err, LedgerError::InvalidTransferTarget(_)));
    assert!(err.is_validation());

    let mut expense = TransactionDraft::new(acct, TransactionType::Expense, dec!(10), day(1));
    expense.to_account_id = Some(acct);
    let err = ledger.create_transaction(&mut db, expense, &cancel).unwrap_err();
    assert!(matches!(err, LedgerError::InvalidTransferTarget(_)));

    assert_eq!(db.get_transaction_count().unwrap(), 0);
    assert_eq!(balance(&db, acct), dec!(100));
}

#[test]
fn test_non_positive_amounts_rejected() {
    let (mut db, ledger) = setup();
    let acct = open_account(&db, "Checking", AccountType::Checking, dec!(100));
    for amount in [Decimal::ZERO, dec!(-5), dec!(0.001)] {
        let draft = TransactionDraft::new(acct, TransactionType::Expense, amount, day(1));
        let err = ledger
            .create_transaction(&mut db, draft, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)), "{amount}: {err}");
    }
    assert_eq!(db.get_transaction_count().unwrap(), 0);
}

#[test]
fn test_missing_account_and_transaction() {
    let (mut db, ledger) = setup();
    let acct = open_account(&db, "Checking", AccountType::Checking, dec!(100));
    let cancel = CancelToken::new();

    let draft = TransactionDraft::transfer(acct, 404, dec!(10), day(1));
    let err = ledger.create_transaction(&mut db, draft, &cancel).unwrap_err();
    assert!(matches!(err, LedgerError::AccountNotFound(404)));
    assert_eq!(err.status_code(), 404);
    assert_eq!(db.get_transaction_count().unwrap(), 0);
    assert_eq!(balance(&db, acct), dec!(100));

    let err = ledger
        .update_transaction(&mut db, 77, &amount_patch(dec!(1)), &cancel)
        .unwrap_err();
    assert!(matches!(err, LedgerError::TransactionNotFound(77)));

    let err = ledger.delete_transaction(&mut db, 77, &cancel).unwrap_err();
    assert!(matches!(err, LedgerError::TransactionNotFound(77)));

    let err = ledger.recalculate_account(&mut db, 404, &cancel).unwrap_err();
    assert!(matches!(err, LedgerError::AccountNotFound(404)));
}

// ── Update ────────────────────────────────────────────────────

#[test]
fn test_amount_edit_replays_later_entries() {
    let (mut db, ledger) = setup();
    let acct = open_account(&db, "Checking", AccountType::Checking, dec!(1000));
    let a = add(&ledger, &mut db, acct, TransactionType::Expense, dec!(200), day(1));
    let b = add(&ledger, &mut db, acct, TransactionType::Income, dec!(50), day(2));

    let updated = ledger
        .update_transaction(&mut db, a.id, &amount_patch(dec!(300)), &CancelToken::new())
        .unwrap();
    assert_eq!(updated.balance_after_transaction(), dec!(700));
    assert_eq!(snapshot(&db, b.id, acct), dec!(750));
    assert_eq!(balance(&db, acct), dec!(750));
    assert_consistent(&ledger, &mut db, acct);
}

#[test]
fn test_moving_date_reorders_history() {
    let (mut db, ledger) = setup();
    let acct = open_account(&db, "Checking", AccountType::Checking, dec!(100));
    let income = add(&ledger, &mut db, acct, TransactionType::Income, dec!(50), day(2));
    let expense = add(&ledger, &mut db, acct, TransactionType::Expense, dec!(30), day(10));

    let patch = TransactionPatch {
        date: Some(day(1)),
        ..Default::default()
    };
    ledger
        .update_transaction(&mut db, expense.id, &patch, &CancelToken::new())
        .unwrap();
    assert_eq!(snapshot(&db, expense.id, acct), dec!(70));
    assert_eq!(snapshot(&db, income.id, acct), dec!(120));
    assert_eq!(snapshots(&db, acct), vec![dec!(70), dec!(120)]);

    // And forward again.
    let patch = TransactionPatch {
        date: Some(day(20)),
        ..Default::default()
    };
    ledger
        .update_transaction(&mut db, expense.id, &patch, &CancelToken::new())
        .unwrap();
    assert_eq!(snapshots(&db, acct), vec![dec!(150), dec!(120)]);
    assert_eq!(balance(&db, acct), dec!(120));
    assert_consistent(&ledger, &mut db, acct);
}

#[test]
fn test_transfer_turned_expense_releases_destination() {
    let (mut db, ledger) = setup();
    let checking = open_account(&db, "Checking", AccountType::Checking, dec!(500));
    let savings = open_account(&db, "Savings", AccountType::Savings, dec!(0));
    let txn = transfer(&ledger, &mut db, checking, savings, dec!(100), day(1));
    let later = add(&ledger, &mut db, savings, TransactionType::Income, dec!(10), day(2));
    assert_eq!(snapshot(&db, later.id, savings), dec!(110));

    let patch = TransactionPatch {
        txn_type: Some(TransactionType::Expense),
        ..Default::default()
    };
    let updated = ledger
        .update_transaction(&mut db, txn.id, &patch, &CancelToken::new())
        .unwrap();
    assert_eq!(updated.to_account_id, None);
    assert_eq!(updated.to_account_balance_after(), None);
    assert_eq!(updated.balance_after_transaction(), dec!(400));
    assert_eq!(balance(&db, checking), dec!(400));
    assert_eq!(balance(&db, savings), dec!(10));
    assert_eq!(snapshot(&db, later.id, savings), dec!(10));
    assert_consistent(&ledger, &mut db, checking);
    assert_consistent(&ledger, &mut db, savings);
}

#[test]
fn test_moving_to_another_account() {
    let (mut db, ledger) = setup();
    let checking = open_account(&db, "Checking", AccountType::Checking, dec!(500));
    let card = open_account(&db, "Visa", AccountType::CreditCard, dec!(0));
    let txn = add(&ledger, &mut db, checking, TransactionType::Expense, dec!(80), day(4));

    let patch = TransactionPatch {
        account_id: Some(card),
        ..Default::default()
    };
    let moved = ledger
        .update_transaction(&mut db, txn.id, &patch, &CancelToken::new())
        .unwrap();
    assert_eq!(moved.balance_after_transaction(), dec!(80));
    assert_eq!(balance(&db, checking), dec!(500));
    assert_eq!(balance(&db, card), dec!(80));
    assert_consistent(&ledger, &mut db, checking);
    assert_consistent(&ledger, &mut db, card);
}

#[test]
fn test_invalid_update_changes_nothing() {
    let (mut db, ledger) = setup();
    let acct = open_account(&db, "Checking", AccountType::Checking, dec!(100));
    let txn = add(&ledger, &mut db, acct, TransactionType::Expense, dec!(10), day(1));

    let patch = TransactionPatch {
        txn_type: Some(TransactionType::Transfer),
        ..Default::default()
    };
    let err = ledger
        .update_transaction(&mut db, txn.id, &patch, &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidTransferTarget(_)));
    assert_eq!(db.get_transaction(txn.id).unwrap().unwrap(), txn);
    assert_eq!(balance(&db, acct), dec!(90));
}

// ── Delete ────────────────────────────────────────────────────

#[test]
fn test_create_then_delete_restores_state() {
    let (mut db, ledger) = setup();
    let checking = open_account(&db, "Checking", AccountType::Checking, dec!(1000));
    let savings = open_account(&db, "Savings", AccountType::Savings, dec!(200));
    add(&ledger, &mut db, checking, TransactionType::Expense, dec!(25), day(1));
    add(&ledger, &mut db, checking, TransactionType::Income, dec!(300), day(20));
    add(&ledger, &mut db, savings, TransactionType::Income, dec!(5), day(25));
    let before = (snapshots(&db, checking), snapshots(&db, savings));

    let txn = transfer(&ledger, &mut db, checking, savings, dec!(120), day(10));
    assert_eq!(balance(&db, checking), dec!(1155));
    ledger
        .delete_transaction(&mut db, txn.id, &CancelToken::new())
        .unwrap();

    assert!(db.get_transaction(txn.id).unwrap().is_none());
    assert_eq!((snapshots(&db, checking), snapshots(&db, savings)), before);
    assert_eq!(balance(&db, checking), dec!(1275));
    assert_eq!(balance(&db, savings), dec!(205));
    assert_consistent(&ledger, &mut db, checking);
    assert_consistent(&ledger, &mut db, savings);
}

#[test]
fn test_delete_removes_selection_history() {
    let (mut db, ledger) = setup();
    let acct = open_account(&db, "Checking", AccountType::Checking, dec!(100));
    let txn = add(&ledger, &mut db, acct, TransactionType::Expense, dec!(10), day(1));
    db.insert_selection(&Selection::new(txn.id, "Grocer".into(), Some(2)))
        .unwrap();
    assert_eq!(db.get_selections(txn.id).unwrap().len(), 1);

    ledger
        .delete_transaction(&mut db, txn.id, &CancelToken::new())
        .unwrap();
    assert!(db.get_selections(txn.id).unwrap().is_empty());
    assert_eq!(balance(&db, acct), dec!(100));
}

// ── Bulk ──────────────────────────────────────────────────────

/// Two checking accounts and a card with some history; returns (db, ids of
/// accounts, ids of transactions).
fn bulk_fixture(ledger: &Ledger) -> (Database, [i64; 3], Vec<i64>) {
    let mut db = Database::open_in_memory().unwrap();
    let a = open_account(&db, "A", AccountType::Checking, dec!(1000));
    let b = open_account(&db, "B", AccountType::Savings, dec!(100));
    let card = open_account(&db, "Card", AccountType::CreditCard, dec!(0));
    let txns = vec![
        add(ledger, &mut db, a, TransactionType::Expense, dec!(40), day(2)).id,
        transfer(ledger, &mut db, a, b, dec!(200), day(4)).id,
        add(ledger, &mut db, card, TransactionType::Expense, dec!(60), day(6)).id,
        add(ledger, &mut db, b, TransactionType::Income, dec!(15), day(8)).id,
        transfer(ledger, &mut db, a, card, dec!(60), day(12)).id,
    ];
    (db, [a, b, card], txns)
}

#[test]
fn test_bulk_matches_sequential_updates() {
    let ledger = Ledger::new(&Config::default());
    let patch = TransactionPatch {
        amount: Some(dec!(25)),
        date: Some(day(3)),
        ..Default::default()
    };

    let (mut bulk_db, accounts, txns) = bulk_fixture(&ledger);
    let targets = [txns[0], txns[2], txns[4]];
    let updated = ledger
        .bulk_update_transactions(&mut bulk_db, &targets, &patch, Scope::All, &CancelToken::new())
        .unwrap();
    assert_eq!(updated.len(), 3);

    let (mut seq_db, _, _) = bulk_fixture(&ledger);
    for id in targets {
        ledger
            .update_transaction(&mut seq_db, id, &patch, &CancelToken::new())
            .unwrap();
    }

    for id in accounts {
        assert_eq!(balance(&bulk_db, id), balance(&seq_db, id), "account {id}");
        assert_eq!(snapshots(&bulk_db, id), snapshots(&seq_db, id), "account {id}");
        assert_consistent(&ledger, &mut bulk_db, id);
    }
}

#[test]
fn test_bulk_skips_unknown_and_out_of_scope() {
    let ledger = Ledger::new(&Config::default());
    let mut db = Database::open_in_memory().unwrap();
    let mine = open_account(&db, "Mine", AccountType::Checking, dec!(100));
    let mut theirs = Account::new("Theirs".into(), AccountType::Checking, String::new())
        .with_starting_balance(dec!(100));
    theirs.owner_id = 2;
    let theirs = db.insert_account(&theirs).unwrap();
    let a = add(&ledger, &mut db, mine, TransactionType::Expense, dec!(10), day(1));
    let b = add(&ledger, &mut db, theirs, TransactionType::Expense, dec!(10), day(1));

    let updated = ledger
        .bulk_update_transactions(
            &mut db,
            &[a.id, b.id, 999, a.id],
            &amount_patch(dec!(20)),
            Scope::Owner(1),
            &CancelToken::new(),
        )
        .unwrap();
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].id, a.id);
    assert_eq!(balance(&db, mine), dec!(80));
    assert_eq!(balance(&db, theirs), dec!(90));

    let none = ledger
        .bulk_update_transactions(&mut db, &[999], &amount_patch(dec!(5)), Scope::All, &CancelToken::new())
        .unwrap();
    assert!(none.is_empty());
}

#[test]
fn test_bulk_skips_patch_that_moves_into_another_owner() {
    let ledger = Ledger::new(&Config::default());
    let mut db = Database::open_in_memory().unwrap();
    let mine = open_account(&db, "Mine", AccountType::Checking, dec!(100));
    let spare = open_account(&db, "Spare", AccountType::Savings, dec!(0));
    let mut theirs = Account::new("Theirs".into(), AccountType::Checking, String::new())
        .with_starting_balance(dec!(100));
    theirs.owner_id = 2;
    let theirs = db.insert_account(&theirs).unwrap();
    let expense = add(&ledger, &mut db, mine, TransactionType::Expense, dec!(10), day(1));
    let transfer = ledger
        .create_transaction(&mut db, TransactionDraft::transfer(mine, spare, dec!(5), day(2)), &CancelToken::new())
        .unwrap();

    let move_source = TransactionPatch {
        account_id: Some(theirs),
        ..Default::default()
    };
    let updated = ledger
        .bulk_update_transactions(&mut db, &[expense.id], &move_source, Scope::Owner(1), &CancelToken::new())
        .unwrap();
    assert!(updated.is_empty());

    let retarget = TransactionPatch {
        to_account_id: Some(Some(theirs)),
        ..Default::default()
    };
    let err = ledger
        .bulk_update_transactions(
            &mut db,
            &[expense.id, transfer.id],
            &retarget,
            Scope::Owner(1),
            &CancelToken::new(),
        )
        .unwrap_err();
    // The expense cannot take a destination at all, so the call fails as a whole.
    assert!(err.is_validation());

    let updated = ledger
        .bulk_update_transactions(&mut db, &[transfer.id], &retarget, Scope::Owner(1), &CancelToken::new())
        .unwrap();
    assert!(updated.is_empty());

    assert_eq!(balance(&db, mine), dec!(85));
    assert_eq!(balance(&db, spare), dec!(5));
    assert_eq!(balance(&db, theirs), dec!(100));
    assert_eq!(db.get_transaction(transfer.id).unwrap().unwrap().to_account_id, Some(spare));

    // The same patch goes through when every account is in scope.
    let updated = ledger
        .bulk_update_transactions(&mut db, &[transfer.id], &retarget, Scope::All, &CancelToken::new())
        .unwrap();
    assert_eq!(updated.len(), 1);
    assert_eq!(balance(&db, spare), dec!(0));
    assert_eq!(balance(&db, theirs), dec!(105));
}

#[test]
fn test_bulk_validation_failure_rolls_back_everything() {
    let ledger = Ledger::new(&Config::default());
    let (mut db, accounts, txns) = bulk_fixture(&ledger);
    let before: Vec<_> = accounts.iter().map(|&id| snapshots(&db, id)).collect();

    // Turning a plain expense into a transfer leaves it without a destination.
    let patch = TransactionPatch {
        txn_type: Some(TransactionType::Transfer),
        ..Default::default()
    };
    let err = ledger
        .bulk_update_transactions(&mut db, &[txns[1], txns[0]], &patch, Scope::All, &CancelToken::new())
        .unwrap_err();
    assert!(err.is_validation());
    let after: Vec<_> = accounts.iter().map(|&id| snapshots(&db, id)).collect();
    assert_eq!(before, after);
}

// ── Cancellation and limits ───────────────────────────────────

#[test]
fn test_cancelled_update_rolls_back() {
    let (mut db, ledger) = setup();
    let acct = open_account(&db, "Checking", AccountType::Checking, dec!(1000));
    let a = add(&ledger, &mut db, acct, TransactionType::Expense, dec!(200), day(1));
    add(&ledger, &mut db, acct, TransactionType::Income, dec!(50), day(2));
    let before = snapshots(&db, acct);

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = ledger
        .update_transaction(&mut db, a.id, &amount_patch(dec!(300)), &cancel)
        .unwrap_err();
    assert!(matches!(err, LedgerError::Cancelled));
    assert!(err.is_transient());
    assert_eq!(db.get_transaction(a.id).unwrap().unwrap().amount, dec!(200));
    assert_eq!(snapshots(&db, acct), before);
    assert_eq!(balance(&db, acct), dec!(850));

    let err = ledger
        .bulk_update_transactions(&mut db, &[a.id], &amount_patch(dec!(300)), Scope::All, &cancel)
        .unwrap_err();
    assert!(matches!(err, LedgerError::Cancelled));
    assert_eq!(balance(&db, acct), dec!(850));
}

#[test]
fn test_fan_out_limit_aborts_pass() {
    let mut config = Config::default();
    config.recalc.max_rows = Some(2);
    let ledger = Ledger::new(&config);
    let mut db = Database::open_in_memory().unwrap();
    let acct = open_account(&db, "Checking", AccountType::Checking, dec!(100));
    let first = add(&ledger, &mut db, acct, TransactionType::Expense, dec!(1), day(1));
    add(&ledger, &mut db, acct, TransactionType::Expense, dec!(1), day(2));
    add(&ledger, &mut db, acct, TransactionType::Expense, dec!(1), day(3));

    let err = ledger
        .update_transaction(&mut db, first.id, &amount_patch(dec!(5)), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::FanOutLimitExceeded {
            rows: 3,
            limit: 2,
            ..
        }
    ));
    assert_eq!(balance(&db, acct), dec!(97));
    assert_eq!(snapshots(&db, acct), vec![dec!(99), dec!(98), dec!(97)]);
}

#[test]
fn test_lock_timeout_when_account_is_busy() {
    let mut config = Config::default();
    config.locks.timeout_ms = 20;
    let locks = Arc::new(AccountLocks::new());
    let ledger = Ledger::with_locks(&config, Arc::clone(&locks));
    let mut db = Database::open_in_memory().unwrap();
    let acct = open_account(&db, "Checking", AccountType::Checking, dec!(100));

    let guard = locks
        .acquire(&BTreeSet::from([acct]), Duration::from_millis(10))
        .unwrap();
    let draft = TransactionDraft::new(acct, TransactionType::Expense, dec!(5), day(1));
    let err = ledger
        .create_transaction(&mut db, draft.clone(), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, LedgerError::LockTimeout(_)));
    assert_eq!(err.status_code(), 503);

    drop(guard);
    ledger
        .create_transaction(&mut db, draft, &CancelToken::new())
        .unwrap();
    assert_eq!(balance(&db, acct), dec!(95));
    assert!(!locks.is_held(acct));
}

// ── Recalculation ─────────────────────────────────────────────

#[test]
fn test_recalculate_repairs_drift_and_is_idempotent() {
    let mut config = Config::default();
    config.recalc.batch_size = 2;
    let ledger = Ledger::new(&config);
    let mut db = Database::open_in_memory().unwrap();
    let acct = open_account(&db, "Checking", AccountType::Checking, dec!(100));
    let mut ids = Vec::new();
    for d in 1..=5 {
        ids.push(add(&ledger, &mut db, acct, TransactionType::Income, dec!(10), day(d)).id);
    }

    db.conn()
        .execute(
            "UPDATE transactions SET balance_after_transaction = '0' WHERE id = ?1",
            params![ids[2]],
        )
        .unwrap();
    db.conn()
        .execute("UPDATE accounts SET balance = '999' WHERE id = ?1", params![acct])
        .unwrap();
    let audit = ledger.audit_account(&mut db, acct).unwrap();
    assert!(!audit.is_consistent());
    assert_eq!(audit.mismatches, vec![(ids[2], Some(Decimal::ZERO), dec!(130))]);
    assert_eq!(audit.replayed_balance, dec!(150));

    let report = ledger
        .recalculate_account(&mut db, acct, &CancelToken::new())
        .unwrap();
    assert_eq!(report.transactions_replayed, 5);
    assert_eq!(report.transactions_updated, 1);
    assert_eq!(report.balance_correction, dec!(-849));
    assert_eq!(report.final_balance, dec!(150));
    assert_eq!(balance(&db, acct), dec!(150));

    let again = ledger
        .recalculate_account(&mut db, acct, &CancelToken::new())
        .unwrap();
    assert_eq!(again.transactions_updated, 0);
    assert!(again.balance_correction.is_zero());
    assert_consistent(&ledger, &mut db, acct);
}

#[test]
fn test_recalculate_empty_account_keeps_opening() {
    let (mut db, ledger) = setup();
    let acct = open_account(&db, "Savings", AccountType::Savings, dec!(42));
    let report = ledger
        .recalculate_account(&mut db, acct, &CancelToken::new())
        .unwrap();
    assert_eq!(
        report,
        RecalcReport {
            final_balance: dec!(42),
            ..Default::default()
        }
    );
}

#[test]
fn test_unknown_opening_derived_from_live_balance() {
    let (mut db, ledger) = setup();
    db.conn()
        .execute(
            "INSERT INTO accounts (name, account_type, balance, opening_balance, created_at)
             VALUES ('Legacy', 'Checking', '500', NULL, '2023-12-31T00:00:00Z')",
            [],
        )
        .unwrap();
    let acct = db.conn().last_insert_rowid();
    for (txn_type, amount, date) in [("income", "100", "2024-01-02"), ("expense", "30", "2024-01-03")] {
        db.conn()
            .execute(
                "INSERT INTO transactions (account_id, txn_type, amount, date, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![acct, txn_type, amount, date],
            )
            .unwrap();
    }

    let report = ledger
        .recalculate_account(&mut db, acct, &CancelToken::new())
        .unwrap();
    assert_eq!(report.transactions_updated, 2);
    assert!(report.balance_correction.is_zero());
    let account = db.get_account_by_id(acct).unwrap().unwrap();
    assert_eq!(account.opening_balance(), Some(dec!(430)));
    assert_eq!(account.balance(), dec!(500));
    assert_eq!(snapshots(&db, acct), vec![dec!(530), dec!(500)]);

    // The derived opening is pinned: later edits replay from it.
    let first = db.get_account_history(acct).unwrap()[0].id;
    ledger
        .update_transaction(&mut db, first, &amount_patch(dec!(70)), &CancelToken::new())
        .unwrap();
    assert_eq!(snapshots(&db, acct), vec![dec!(500), dec!(470)]);
    assert_consistent(&ledger, &mut db, acct);
}

#[test]
fn test_backfill_all_reports_every_account() {
    let (mut db, ledger) = setup();
    let a = open_account(&db, "A", AccountType::Checking, dec!(10));
    let b = open_account(&db, "B", AccountType::Loan, dec!(1000));
    add(&ledger, &mut db, b, TransactionType::Income, dec!(100), day(1));

    let reports = ledger.backfill_all(&mut db, &CancelToken::new()).unwrap();
    let ids: Vec<i64> = reports.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![a, b]);
    assert_eq!(reports[1].1.final_balance, dec!(900));
    assert!(reports.iter().all(|(_, r)| r.transactions_updated == 0));
}

#[test]
fn test_backfill_honours_cancellation() {
    let (mut db, ledger) = setup();
    open_account(&db, "A", AccountType::Checking, dec!(10));
    let cancel = CancelToken::new();
    cancel.cancel();
    let err = ledger.backfill_all(&mut db, &cancel).unwrap_err();
    assert!(matches!(err, LedgerError::Cancelled));
}

// ── Concurrency ───────────────────────────────────────────────

#[test]
fn test_concurrent_writers_keep_balances_exact() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runbal.db");
    let config = Config::default();
    let (checking, savings) = {
        let db = Database::open(&path, &config.storage).unwrap();
        (
            open_account(&db, "Checking", AccountType::Checking, dec!(1000)),
            open_account(&db, "Savings", AccountType::Savings, dec!(0)),
        )
    };
    let locks = Arc::new(AccountLocks::new());

    let work: [fn(&Ledger, &mut Database, i64, i64); 3] = [
        |ledger, db, from, to| {
            transfer(ledger, db, from, to, dec!(10), day(1));
        },
        |ledger, db, from, _| {
            add(ledger, db, from, TransactionType::Expense, dec!(5), day(1));
        },
        |ledger, db, _, to| {
            add(ledger, db, to, TransactionType::Income, dec!(1), day(1));
        },
    ];
    std::thread::scope(|scope| {
        for job in work {
            let ledger = Ledger::with_locks(&config, Arc::clone(&locks));
            let mut db = Database::open(&path, &config.storage).unwrap();
            scope.spawn(move || {
                for _ in 0..10 {
                    job(&ledger, &mut db, checking, savings);
                }
            });
        }
    });

    let mut db = Database::open(&path, &config.storage).unwrap();
    let ledger = Ledger::new(&config);
    assert_eq!(balance(&db, checking), dec!(850));
    assert_eq!(balance(&db, savings), dec!(110));
    assert_eq!(db.get_transaction_count().unwrap(), 30);
    assert_consistent(&ledger, &mut db, checking);
    assert_consistent(&ledger, &mut db, savings);
}
