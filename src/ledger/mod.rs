pub mod models;
pub mod repository;

pub use models::{CreditTransaction, SpendOutcome, TransactionType};
pub use repository::LedgerRepository;
