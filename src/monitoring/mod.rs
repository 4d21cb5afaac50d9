pub mod allocation;
pub mod failures;
pub mod metrics;
pub mod monitor;
pub mod queue;

pub use allocation::{AllocationOutcome, CreditAllocator};
pub use failures::{FailureCategory, FailureRecord, FailureRegistry};
pub use metrics::{MetricsSnapshot, MonitorMetrics};
pub use monitor::PaymentMonitor;
pub use queue::PendingPaymentQueue;
