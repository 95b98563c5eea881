pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod notify;
pub mod promote;
pub mod scheduler;
pub mod shutdown;
pub mod state;
