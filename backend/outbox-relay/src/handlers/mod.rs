pub mod health;

pub use health::{register_routes, AppState};
