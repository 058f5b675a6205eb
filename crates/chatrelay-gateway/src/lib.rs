//! Chatrelay Gateway - HTTP surface and background maintenance

pub mod api;
pub mod maintenance;
pub mod server;
pub mod state;

pub use api::ApiError;
pub use maintenance::spawn_maintenance;
pub use server::{router, start_gateway};
pub use state::AppState;
