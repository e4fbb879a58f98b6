pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version          INTEGER NOT NULL,
    backfill_pending INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS accounts (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL,
    account_type    TEXT NOT NULL DEFAULT 'Checking',
    institution     TEXT NOT NULL DEFAULT '',
    currency        TEXT NOT NULL DEFAULT 'USD',
    owner_id        INTEGER NOT NULL DEFAULT 1,
    balance         TEXT NOT NULL DEFAULT '0',
    opening_balance TEXT,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS transactions (
    id                        INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id                INTEGER NOT NULL REFERENCES accounts(id),
    to_account_id             INTEGER REFERENCES accounts(id),
    txn_type                  TEXT NOT NULL,
    amount                    TEXT NOT NULL,
    date                      TEXT NOT NULL,
    description               TEXT NOT NULL DEFAULT '',
    category_id               INTEGER,
    created_at                TEXT NOT NULL,
    balance_after_transaction TEXT NOT NULL DEFAULT '0',
    to_account_balance_after  TEXT
);

CREATE INDEX IF NOT EXISTS idx_transactions_account_order
    ON transactions(account_id, date, created_at);
CREATE INDEX IF NOT EXISTS idx_transactions_to_account_order
    ON transactions(to_account_id, date, created_at);

CREATE TABLE IF NOT EXISTS selection_history (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    transaction_id INTEGER NOT NULL REFERENCES transactions(id),
    payee          TEXT NOT NULL,
    category_id    INTEGER,
    selected_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_selection_history_txn ON selection_history(transaction_id);
"#;

pub(crate) const CURRENT_VERSION: i32 = 3;

/// First version that stores per-transaction snapshots. Databases migrated
/// from below it need a full replay before their snapshot columns mean anything.
pub(crate) const SNAPSHOT_VERSION: i32 = 2;

/// Migrations from version N to N+1.
/// Each entry is (from_version, sql).
pub(crate) const MIGRATIONS: &[(i32, &str)] = &[
    (
        1,
        "ALTER TABLE accounts ADD COLUMN opening_balance TEXT;
         ALTER TABLE transactions ADD COLUMN balance_after_transaction TEXT NOT NULL DEFAULT '0';
         ALTER TABLE transactions ADD COLUMN to_account_balance_after TEXT;
         DROP INDEX IF EXISTS idx_transactions_account;
         CREATE INDEX IF NOT EXISTS idx_transactions_account_order
             ON transactions(account_id, date, created_at);
         CREATE INDEX IF NOT EXISTS idx_transactions_to_account_order
             ON transactions(to_account_id, date, created_at);",
    ),
    (
        2,
        "ALTER TABLE schema_version ADD COLUMN backfill_pending INTEGER NOT NULL DEFAULT 0;",
    ),
];

/// Layout written by version 1: live balances only, no snapshots.
#[cfg(test)]
pub(crate) const LEGACY_SCHEMA_V1: &str = r#"
CREATE TABLE schema_version (version INTEGER NOT NULL);
INSERT INTO schema_version (version) VALUES (1);

CREATE TABLE accounts (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    name         TEXT NOT NULL,
    account_type TEXT NOT NULL DEFAULT 'Checking',
    institution  TEXT NOT NULL DEFAULT '',
    currency     TEXT NOT NULL DEFAULT 'USD',
    owner_id     INTEGER NOT NULL DEFAULT 1,
    balance      TEXT NOT NULL DEFAULT '0',
    created_at   TEXT NOT NULL
);

CREATE TABLE transactions (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id    INTEGER NOT NULL REFERENCES accounts(id),
    to_account_id INTEGER REFERENCES accounts(id),
    txn_type      TEXT NOT NULL,
    amount        TEXT NOT NULL,
    date          TEXT NOT NULL,
    description   TEXT NOT NULL DEFAULT '',
    category_id   INTEGER,
    created_at    TEXT NOT NULL
);

CREATE INDEX idx_transactions_account ON transactions(account_id);

CREATE TABLE selection_history (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    transaction_id INTEGER NOT NULL REFERENCES transactions(id),
    payee          TEXT NOT NULL,
    category_id    INTEGER,
    selected_at    TEXT NOT NULL
);
"#;
