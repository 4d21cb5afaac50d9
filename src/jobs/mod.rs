pub mod lock;
pub mod scheduler;

pub use lock::{InMemoryLockCoordinator, LockCoordinator, LockToken, PgLockCoordinator};
pub use scheduler::JobScheduler;
