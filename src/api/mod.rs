pub mod handler;
pub mod models;
pub mod webhooks;

pub use handler::AppState;
