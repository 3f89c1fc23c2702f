pub mod config;
pub mod db;
pub mod models;
pub mod services;
pub mod state;
pub mod utils;

pub use state::EntitlementState;
