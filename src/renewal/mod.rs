pub mod admin_tasks;
pub mod models;
pub mod repository;
pub mod sweep;

pub use admin_tasks::{AdminTask, AdminTaskCategory, AdminTaskRepository};
pub use models::{RenewalAction, RenewalMethod, Subscription, SubscriptionStatus};
pub use repository::{OrderRepository, SubscriptionRepository};
pub use sweep::RenewalSweep;
