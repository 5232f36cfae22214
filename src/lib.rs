pub mod config;
pub mod embed;
pub mod feedback;
pub mod pass;
pub mod rate_limit;
pub mod state;
pub mod stratz;
pub mod webhook;
