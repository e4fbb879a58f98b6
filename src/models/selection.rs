/// A payee/category pick made by the user for a transaction, fed to the
/// suggestion engine. Never read back by the ledger.
#[derive(Debug, Clone)]
pub struct Selection {
    pub transaction_id: i64,
    pub payee: String,
    pub category_id: Option<i64>,
    pub selected_at: String,
}

impl Selection {
    pub fn new(transaction_id: i64, payee: String, category_id: Option<i64>) -> Self {
        Self {
            transaction_id,
            payee,
            category_id,
            selected_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}
