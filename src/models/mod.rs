mod account;
mod selection;
mod transaction;

pub use account::{Account, AccountCategory, AccountType};
pub use selection::Selection;
pub use transaction::{Transaction, TransactionDraft, TransactionPatch, TransactionType};
