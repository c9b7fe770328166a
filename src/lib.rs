pub mod api;
pub mod auth;
pub mod bot;
pub mod config;
pub mod metrics;
pub mod rate_limit;
pub mod relay;
pub mod users;
