use rust_decimal::{Decimal, RoundingStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountType {
    Checking,
    Savings,
    CreditCard,
    Investment,
    Cash,
    Ppf,
    Loan,
    Other,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checking => "Checking",
            Self::Savings => "Savings",
            Self::CreditCard => "Credit Card",
            Self::Investment => "Investment",
            Self::Cash => "Cash",
            Self::Ppf => "PPF",
            Self::Loan => "Loan",
            Self::Other => "Other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "checking" => Self::Checking,
            "savings" => Self::Savings,
            "credit card" | "creditcard" | "credit" => Self::CreditCard,
            "investment" => Self::Investment,
            "cash" => Self::Cash,
            "ppf" => Self::Ppf,
            "loan" => Self::Loan,
            _ => Self::Other,
        }
    }

    pub fn all() -> &'static [AccountType] {
        &[
            Self::Checking,
            Self::Savings,
            Self::CreditCard,
            Self::Investment,
            Self::Cash,
            Self::Ppf,
            Self::Loan,
            Self::Other,
        ]
    }

    /// Sign semantics of the balance: what the account holds vs. what is owed on it.
    pub fn category(&self) -> AccountCategory {
        match self {
            Self::CreditCard | Self::Loan => AccountCategory::LiabilityLike,
            Self::Checking
            | Self::Savings
            | Self::Investment
            | Self::Cash
            | Self::Ppf
            | Self::Other => AccountCategory::AssetLike,
        }
    }
}

impl std::fmt::Display for AccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountCategory {
    AssetLike,
    LiabilityLike,
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: Option<i64>,
    pub name: String,
    pub account_type: AccountType,
    pub institution: String,
    pub currency: String,
    pub owner_id: i64,
    pub created_at: String,
    balance: Decimal,
    opening_balance: Option<Decimal>,
}

impl Account {
    pub fn new(name: String, account_type: AccountType, institution: String) -> Self {
        Self {
            id: None,
            name,
            account_type,
            institution,
            currency: "USD".to_string(),
            owner_id: 1,
            created_at: chrono::Utc::now().to_rfc3339(),
            balance: Decimal::ZERO,
            opening_balance: Some(Decimal::ZERO),
        }
    }

    /// Starting balance for a freshly opened account. Only meaningful before insert.
    pub fn with_starting_balance(mut self, balance: Decimal) -> Self {
        let balance = balance.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        self.balance = balance;
        self.opening_balance = Some(balance);
        self
    }

    /// Attach the stored balance columns to a row loaded from the database.
    pub(crate) fn hydrate(mut self, id: i64, balance: Decimal, opening: Option<Decimal>) -> Self {
        self.id = Some(id);
        self.balance = balance;
        self.opening_balance = opening;
        self
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    /// `None` for legacy rows whose opening balance has not been derived yet.
    pub fn opening_balance(&self) -> Option<Decimal> {
        self.opening_balance
    }

    pub fn category(&self) -> AccountCategory {
        self.account_type.category()
    }
}
