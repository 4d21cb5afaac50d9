pub mod models;
pub mod provider;
pub mod repository;

pub use models::{MonitoringStatus, Payment, PaymentPurpose, PaymentStatus, TransitionDecision};
pub use provider::{CardProcessor, ProviderInvoice, ProviderStatus, SettlementProvider};
pub use repository::PaymentRepository;
