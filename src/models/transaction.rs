use chrono::NaiveDate;
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    Income,
    Expense,
    Transfer,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Income => "income",
            Self::Expense => "expense",
            Self::Transfer => "transfer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "income" => Some(Self::Income),
            "expense" => Some(Self::Expense),
            "transfer" => Some(Self::Transfer),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Caller-supplied fields of a transaction, before the ledger assigns snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionDraft {
    pub account_id: i64,
    pub to_account_id: Option<i64>,
    pub txn_type: TransactionType,
    pub amount: Decimal,
    pub date: NaiveDate,
    pub description: String,
    pub category_id: Option<i64>,
}

impl TransactionDraft {
    pub fn new(account_id: i64, txn_type: TransactionType, amount: Decimal, date: NaiveDate) -> Self {
        Self {
            account_id,
            to_account_id: None,
            txn_type,
            amount,
            date,
            description: String::new(),
            category_id: None,
        }
    }

    pub fn transfer(from: i64, to: i64, amount: Decimal, date: NaiveDate) -> Self {
        Self {
            to_account_id: Some(to),
            ..Self::new(from, TransactionType::Transfer, amount, date)
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Every account this draft touches: the source, then the destination if any.
    pub fn account_ids(&self) -> impl Iterator<Item = i64> {
        std::iter::once(self.account_id).chain(self.to_account_id)
    }
}

/// Partial update. `None` leaves the field as it is; the nested options on
/// `to_account_id` and `category_id` allow clearing them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionPatch {
    pub account_id: Option<i64>,
    pub to_account_id: Option<Option<i64>>,
    pub txn_type: Option<TransactionType>,
    pub amount: Option<Decimal>,
    pub date: Option<NaiveDate>,
    pub description: Option<String>,
    pub category_id: Option<Option<i64>>,
}

impl TransactionPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(&self, current: &TransactionDraft) -> TransactionDraft {
        let mut next = current.clone();
        if let Some(account_id) = self.account_id {
            next.account_id = account_id;
        }
        if let Some(txn_type) = self.txn_type {
            next.txn_type = txn_type;
        }
        match self.to_account_id {
            Some(to) => next.to_account_id = to,
            // Leaving a transfer drops its destination unless one is named explicitly.
            None if next.txn_type != TransactionType::Transfer => next.to_account_id = None,
            None => {}
        }
        if let Some(amount) = self.amount {
            next.amount = amount;
        }
        if let Some(date) = self.date {
            next.date = date;
        }
        if let Some(description) = &self.description {
            next.description = description.clone();
        }
        if let Some(category_id) = self.category_id {
            next.category_id = category_id;
        }
        next
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: i64,
    pub account_id: i64,
    pub to_account_id: Option<i64>,
    pub txn_type: TransactionType,
    pub amount: Decimal,
    pub date: NaiveDate,
    pub description: String,
    pub category_id: Option<i64>,
    pub created_at: String,
    balance_after_transaction: Decimal,
    to_account_balance_after: Option<Decimal>,
}

impl Transaction {
    pub(crate) fn from_draft(
        id: i64,
        draft: TransactionDraft,
        created_at: String,
        balance_after_transaction: Decimal,
        to_account_balance_after: Option<Decimal>,
    ) -> Self {
        Self {
            id,
            account_id: draft.account_id,
            to_account_id: draft.to_account_id,
            txn_type: draft.txn_type,
            amount: draft.amount,
            date: draft.date,
            description: draft.description,
            category_id: draft.category_id,
            created_at,
            balance_after_transaction,
            to_account_balance_after,
        }
    }

    pub fn balance_after_transaction(&self) -> Decimal {
        self.balance_after_transaction
    }

    pub fn to_account_balance_after(&self) -> Option<Decimal> {
        self.to_account_balance_after
    }

    /// Snapshot of `account_id` after this transaction, whichever side it sits on.
    pub fn snapshot_for(&self, account_id: i64) -> Option<Decimal> {
        if self.account_id == account_id {
            Some(self.balance_after_transaction)
        } else if self.to_account_id == Some(account_id) {
            self.to_account_balance_after
        } else {
            None
        }
    }

    pub fn draft(&self) -> TransactionDraft {
        TransactionDraft {
            account_id: self.account_id,
            to_account_id: self.to_account_id,
            txn_type: self.txn_type,
            amount: self.amount,
            date: self.date,
            description: self.description.clone(),
            category_id: self.category_id,
        }
    }

    pub fn is_transfer(&self) -> bool {
        self.txn_type == TransactionType::Transfer
    }
}
