//! Sign rules mapping a transaction onto a balance change.
//!
//! Every balance movement in the engine (live balance, replayed snapshots,
//! opening-balance derivation) goes through [`delta`], so the three can never
//! disagree about direction.

use rust_decimal::Decimal;

use crate::models::{AccountCategory, TransactionDraft, TransactionType};

/// Which side of a transaction an account sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Source,
    Destination,
}

/// One account's participation in a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Leg {
    pub(crate) account_id: i64,
    pub(crate) role: Role,
}

/// +1, -1, or 0 when the role does not exist for the type (a non-transfer has
/// no destination).
pub(crate) fn sign(category: AccountCategory, txn_type: TransactionType, role: Role) -> Decimal {
    use AccountCategory::*;
    use Role::*;
    use TransactionType::*;

    match (category, txn_type, role) {
        (AssetLike, Income, Source) => Decimal::ONE,
        (AssetLike, Expense, Source) => Decimal::NEGATIVE_ONE,
        (AssetLike, Transfer, Source) => Decimal::NEGATIVE_ONE,
        (AssetLike, Transfer, Destination) => Decimal::ONE,
        // Payment reduces debt, charge increases it.
        (LiabilityLike, Income, Source) => Decimal::NEGATIVE_ONE,
        (LiabilityLike, Expense, Source) => Decimal::ONE,
        (LiabilityLike, Transfer, Source) => Decimal::ONE,
        (LiabilityLike, Transfer, Destination) => Decimal::NEGATIVE_ONE,
        (_, Income | Expense, Destination) => Decimal::ZERO,
    }
}

pub(crate) fn delta(
    category: AccountCategory,
    txn_type: TransactionType,
    role: Role,
    amount: Decimal,
) -> Decimal {
    sign(category, txn_type, role) * amount
}

pub(crate) fn reversal(
    category: AccountCategory,
    txn_type: TransactionType,
    role: Role,
    amount: Decimal,
) -> Decimal {
    -delta(category, txn_type, role, amount)
}

/// The accounts a transaction moves, source first.
pub(crate) fn legs(draft: &TransactionDraft) -> Vec<Leg> {
    let mut legs = vec![Leg {
        account_id: draft.account_id,
        role: Role::Source,
    }];
    if draft.txn_type == TransactionType::Transfer {
        if let Some(to) = draft.to_account_id {
            legs.push(Leg {
                account_id: to,
                role: Role::Destination,
            });
        }
    }
    legs
}
