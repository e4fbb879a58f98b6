use anyhow::{Context as _, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::str::FromStr;

use super::Context;
use crate::db::{Database, DATE_FORMAT};
use crate::ledger::{is_initial_funding, CancelToken, Scope};
use crate::models::{Account, AccountType, Selection, Transaction, TransactionDraft, TransactionPatch, TransactionType};
use crate::selection::SelectionRecorder;

pub(crate) fn as_cli(args: &[String], ctx: Context<'_>) -> Result<()> {
    let Some(command) = args.get(1) else {
        print_usage();
        return Ok(());
    };
    let rest = &args[2..];
    match command.as_str() {
        "accounts" => cli_accounts(ctx.db),
        "add-account" => cli_add_account(rest, ctx.db),
        "add" => cli_add(rest, ctx),
        "edit" => cli_edit(rest, ctx),
        "bulk-edit" => cli_bulk_edit(rest, ctx),
        "delete" => cli_delete(rest, ctx),
        "history" | "h" => cli_history(rest, ctx.db),
        "recalc" => cli_recalc(rest, ctx),
        "check" => cli_check(ctx),
        "export" => cli_export(rest, ctx.db),
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        "--version" | "-V" | "version" => {
            println!("runbal {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        other => {
            print_usage();
            anyhow::bail!("Unknown command: {other}");
        }
    }
}

fn print_usage() {
    println!("runbal — running balances for a local personal finance ledger");
    println!();
    println!("Usage: runbal [--db <path>] <command>");
    println!();
    println!("Commands:");
    println!("  accounts                              List accounts with live balances");
    println!("  add-account <name>                    Create an account");
    println!("    --type <type>                       Checking, Savings, Cash, Investment, PPF, Credit Card, Loan");
    println!("    --balance <amount>                  Starting balance (default 0)");
    println!("    --institution <name>  --owner <id>");
    println!("  add <account> <type> <amount>         Record income, expense or transfer");
    println!("    --to <account>                      Destination (transfers only)");
    println!("    --date <YYYY-MM-DD>                 Default: today");
    println!("    --desc <text>  --category <id>  --payee <name>");
    println!("  edit <id> [fields]                    Change a transaction; fields as for add,");
    println!("    --account <account>  --type <type>  --amount <amount>  --no-to");
    println!("  bulk-edit <id,id,...> [fields]        Apply the same change to many transactions");
    println!("    --owner <id>                        Only touch this owner's transactions");
    println!("  delete <id>                           Delete a transaction");
    println!("  history <account>                     Show the ledger with running balances");
    println!("  recalc <account> | --all              Replay history and reconcile balances");
    println!("  check                                 Verify every balance without writing");
    println!("  export <account> [path]               Export the ledger to CSV");
    println!("  --help, -h                            Show this help");
    println!("  --version, -V                         Show version");
}

// ── Argument helpers ─────────────────────────────────────────

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == name)
        .map(|w| w[1].as_str())
}

fn has_flag(args: &[String], name: &str) -> bool {
    args.iter().any(|a| a == name)
}

/// Arguments before the first `--flag`.
fn positionals(args: &[String]) -> Vec<&str> {
    args.iter()
        .take_while(|a| !a.starts_with("--"))
        .map(String::as_str)
        .collect()
}

fn parse_amount(s: &str) -> Result<Decimal> {
    Decimal::from_str(s.trim_start_matches('$')).with_context(|| format!("Invalid amount: {s}"))
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .with_context(|| format!("Invalid date (expected YYYY-MM-DD): {s}"))
}

fn parse_type(s: &str) -> Result<TransactionType> {
    TransactionType::parse(s)
        .ok_or_else(|| anyhow::anyhow!("Unknown transaction type: {s} (income, expense, transfer)"))
}

fn parse_id(s: &str) -> Result<i64> {
    s.parse::<i64>()
        .with_context(|| format!("Invalid transaction id: {s}"))
}

fn resolve_account(db: &Database, reference: &str) -> Result<Account> {
    db.find_account(reference)?
        .ok_or_else(|| anyhow::anyhow!("Account '{reference}' not found"))
}

fn account_id(db: &Database, reference: &str) -> Result<i64> {
    resolve_account(db, reference)?
        .id
        .ok_or_else(|| anyhow::anyhow!("Account has no ID"))
}

/// Field changes shared by `edit` and `bulk-edit`.
fn parse_patch(args: &[String], db: &Database) -> Result<TransactionPatch> {
    let mut patch = TransactionPatch::default();
    if let Some(account) = flag(args, "--account") {
        patch.account_id = Some(account_id(db, account)?);
    }
    if let Some(to) = flag(args, "--to") {
        patch.to_account_id = Some(Some(account_id(db, to)?));
    } else if has_flag(args, "--no-to") {
        patch.to_account_id = Some(None);
    }
    if let Some(t) = flag(args, "--type") {
        patch.txn_type = Some(parse_type(t)?);
    }
    if let Some(amount) = flag(args, "--amount") {
        patch.amount = Some(parse_amount(amount)?);
    }
    if let Some(date) = flag(args, "--date") {
        patch.date = Some(parse_date(date)?);
    }
    if let Some(desc) = flag(args, "--desc") {
        patch.description = Some(desc.to_string());
    }
    if let Some(category) = flag(args, "--category") {
        patch.category_id = Some(Some(parse_id(category)?));
    }
    if patch.is_empty() {
        anyhow::bail!("Nothing to change. Use --amount, --date, --type, --account, --to, --desc or --category");
    }
    Ok(patch)
}

fn print_transaction(txn: &Transaction) {
    let to = txn
        .to_account_id
        .map(|id| format!(" -> {id}"))
        .unwrap_or_default();
    let to_balance = txn
        .to_account_balance_after()
        .map(|b| format!("  dest after: {b:.2}"))
        .unwrap_or_default();
    println!(
        "#{} {} {:<8} {:>10.2} account {}{to}  after: {:.2}{to_balance}",
        txn.id,
        txn.date,
        txn.txn_type.as_str(),
        txn.amount,
        txn.account_id,
        txn.balance_after_transaction(),
    );
}

// ── Commands ─────────────────────────────────────────────────

fn cli_accounts(db: &Database) -> Result<()> {
    let accounts = db.get_accounts()?;
    if accounts.is_empty() {
        println!("No accounts");
        return Ok(());
    }

    println!("{:<4} {:<20} {:<12} {:>12}", "ID", "Name", "Type", "Balance");
    println!("{}", "─".repeat(51));
    for acct in &accounts {
        println!(
            "{:<4} {:<20} {:<12} {:>12.2}",
            acct.id.unwrap_or(0),
            acct.name,
            acct.account_type.as_str(),
            acct.balance(),
        );
    }
    Ok(())
}

fn cli_add_account(args: &[String], db: &mut Database) -> Result<()> {
    let name = positionals(args).join(" ");
    if name.is_empty() {
        let types: Vec<&str> = AccountType::all().iter().map(|t| t.as_str()).collect();
        anyhow::bail!(
            "Usage: runbal add-account <name> [--type <type>] [--balance <amount>]. Types: {}",
            types.join(", ")
        );
    }
    let account_type = flag(args, "--type")
        .map(AccountType::parse)
        .unwrap_or(AccountType::Checking);
    let mut account = Account::new(
        name.clone(),
        account_type,
        flag(args, "--institution").unwrap_or_default().to_string(),
    );
    if let Some(balance) = flag(args, "--balance") {
        account = account.with_starting_balance(parse_amount(balance)?);
    }
    if let Some(owner) = flag(args, "--owner") {
        account.owner_id = owner.parse().with_context(|| format!("Invalid owner id: {owner}"))?;
    }
    let id = db.insert_account(&account)?;
    println!("Created account #{id}: {name} ({account_type}, {:.2})", account.balance());
    Ok(())
}

fn cli_add(args: &[String], ctx: Context<'_>) -> Result<()> {
    let pos = positionals(args);
    if pos.len() < 3 {
        anyhow::bail!("Usage: runbal add <account> <income|expense|transfer> <amount> [--to <account>] [--date YYYY-MM-DD] [--desc <text>]");
    }
    let account_id = account_id(ctx.db, pos[0])?;
    let txn_type = parse_type(pos[1])?;
    let amount = parse_amount(pos[2])?;
    let date = match flag(args, "--date") {
        Some(d) => parse_date(d)?,
        None => chrono::Local::now().date_naive(),
    };

    let mut draft = TransactionDraft::new(account_id, txn_type, amount, date)
        .with_description(flag(args, "--desc").unwrap_or_default());
    if let Some(to) = flag(args, "--to") {
        draft.to_account_id = Some(self::account_id(ctx.db, to)?);
    }
    if let Some(category) = flag(args, "--category") {
        draft.category_id = Some(parse_id(category)?);
    }

    let txn = ctx
        .ledger
        .create_transaction(ctx.db, draft, &CancelToken::new())?;
    print_transaction(&txn);

    if let Some(payee) = flag(args, "--payee") {
        let recorder = SelectionRecorder::spawn(ctx.db_path.to_path_buf(), ctx.config.storage.clone());
        recorder.record(Selection::new(txn.id, payee.to_string(), txn.category_id));
        recorder.finish();
    }
    Ok(())
}

fn cli_edit(args: &[String], ctx: Context<'_>) -> Result<()> {
    let pos = positionals(args);
    let Some(id) = pos.first() else {
        anyhow::bail!("Usage: runbal edit <id> [--amount X] [--date YYYY-MM-DD] [--type T] [--account A] [--to A|--no-to] [--desc D]");
    };
    let id = parse_id(id)?;
    let patch = parse_patch(args, ctx.db)?;
    let txn = ctx
        .ledger
        .update_transaction(ctx.db, id, &patch, &CancelToken::new())?;
    print_transaction(&txn);
    Ok(())
}

fn cli_bulk_edit(args: &[String], ctx: Context<'_>) -> Result<()> {
    let pos = positionals(args);
    let Some(list) = pos.first() else {
        anyhow::bail!("Usage: runbal bulk-edit <id,id,...> [fields]");
    };
    let ids = list
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| parse_id(s.trim()))
        .collect::<Result<Vec<_>>>()?;
    let patch = parse_patch(args, ctx.db)?;
    let scope = match flag(args, "--owner") {
        Some(owner) => Scope::Owner(owner.parse().with_context(|| format!("Invalid owner id: {owner}"))?),
        None => Scope::All,
    };

    let updated = ctx
        .ledger
        .bulk_update_transactions(ctx.db, &ids, &patch, scope, &CancelToken::new())?;
    for txn in &updated {
        print_transaction(txn);
    }
    let skipped = ids.len() - updated.len();
    println!("Updated {} transactions ({skipped} skipped)", updated.len());
    Ok(())
}

fn cli_delete(args: &[String], ctx: Context<'_>) -> Result<()> {
    let Some(id) = positionals(args).first().copied() else {
        anyhow::bail!("Usage: runbal delete <id>");
    };
    let id = parse_id(id)?;
    ctx.ledger
        .delete_transaction(ctx.db, id, &CancelToken::new())?;
    println!("Deleted transaction #{id}");
    Ok(())
}

fn cli_history(args: &[String], db: &Database) -> Result<()> {
    let Some(reference) = positionals(args).first().copied() else {
        anyhow::bail!("Usage: runbal history <account>");
    };
    let account = resolve_account(db, reference)?;
    let account_id = account.id.unwrap_or(0);
    let history = db.get_account_history(account_id)?;

    println!("{} ({}), balance {:.2}", account.name, account.account_type, account.balance());
    if let Some(opening) = account.opening_balance() {
        println!("  opening {:>42.2}", opening);
    }
    println!("{}", "─".repeat(60));
    for txn in &history {
        let side = if txn.account_id != account_id {
            format!("from {}", txn.account_id)
        } else if txn.is_transfer() {
            txn.to_account_id.map(|to| format!("to {to}")).unwrap_or_default()
        } else {
            String::new()
        };
        let marker = if is_initial_funding(&txn.description) { "*" } else { " " };
        println!(
            "{marker}{:<5} {} {:<8} {:>10.2} {:<8} {:>12.2}  {}",
            txn.id,
            txn.date,
            txn.txn_type.as_str(),
            txn.amount,
            side,
            txn.snapshot_for(account_id).unwrap_or_default(),
            txn.description,
        );
    }
    Ok(())
}

fn cli_recalc(args: &[String], ctx: Context<'_>) -> Result<()> {
    let cancel = CancelToken::new();
    if has_flag(args, "--all") {
        let reports = ctx.ledger.backfill_all(ctx.db, &cancel)?;
        for (account_id, report) in &reports {
            println!(
                "account {account_id}: {} updated, correction {:.2}",
                report.transactions_updated, report.balance_correction
            );
        }
        return Ok(());
    }

    let Some(reference) = positionals(args).first().copied() else {
        anyhow::bail!("Usage: runbal recalc <account> | --all");
    };
    let account_id = account_id(ctx.db, reference)?;
    let report = ctx.ledger.recalculate_account(ctx.db, account_id, &cancel)?;
    println!(
        "Replayed {} transactions, {} updated, balance correction {:.2} (balance now {:.2})",
        report.transactions_replayed,
        report.transactions_updated,
        report.balance_correction,
        report.final_balance
    );
    Ok(())
}

fn cli_check(ctx: Context<'_>) -> Result<()> {
    let accounts = ctx.db.get_accounts()?;
    let mut broken = 0;
    for account in &accounts {
        let Some(id) = account.id else { continue };
        let audit = ctx.ledger.audit_account(ctx.db, id)?;
        if audit.is_consistent() {
            println!("ok      {:<20} {:>12.2}", account.name, audit.live_balance);
            continue;
        }
        broken += 1;
        println!(
            "MISMATCH {:<20} #{} live {:.2}, replayed {:.2}",
            account.name, audit.account_id, audit.live_balance, audit.replayed_balance
        );
        for (txn_id, stored, expected) in &audit.mismatches {
            let stored = stored.map(|s| format!("{s:.2}")).unwrap_or_else(|| "none".into());
            println!("    #{txn_id}: stored {stored}, expected {expected:.2}");
        }
    }
    println!(
        "{} transactions across {} accounts, {broken} inconsistent",
        ctx.db.get_transaction_count()?,
        accounts.len()
    );
    if broken > 0 {
        anyhow::bail!("{broken} account(s) need `runbal recalc`");
    }
    Ok(())
}

fn cli_export(args: &[String], db: &Database) -> Result<()> {
    let pos = positionals(args);
    let Some(reference) = pos.first().copied() else {
        anyhow::bail!("Usage: runbal export <account> [path]");
    };
    let account = resolve_account(db, reference)?;
    let account_id = account.id.unwrap_or(0);
    let output_path = pos.get(1).map(|p| shellexpand(p)).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        format!("{home}/runbal-{}.csv", account.name.to_lowercase().replace(' ', "-"))
    });

    let history = db.get_account_history(account_id)?;
    let count = export_history(&output_path, account_id, &history)?;
    println!("Exported {count} transactions to {output_path}");
    Ok(())
}

fn export_history(path: &str, account_id: i64, history: &[Transaction]) -> Result<usize> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {path}"))?;
    wtr.write_record(["id", "date", "type", "amount", "counterparty", "description", "balance_after"])?;
    for txn in history {
        let counterparty = if txn.account_id == account_id {
            txn.to_account_id.map(|id| id.to_string()).unwrap_or_default()
        } else {
            txn.account_id.to_string()
        };
        wtr.write_record([
            txn.id.to_string(),
            txn.date.format(DATE_FORMAT).to_string(),
            txn.txn_type.to_string(),
            format!("{:.2}", txn.amount),
            counterparty,
            txn.description.clone(),
            format!("{:.2}", txn.snapshot_for(account_id).unwrap_or_default()),
        ])?;
    }
    wtr.flush()?;
    Ok(history.len())
}

pub(crate) fn shellexpand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        format!("{home}/{rest}")
    } else {
        path.to_string()
    }
}
