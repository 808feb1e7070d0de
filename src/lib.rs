//! Library crate for proxyip-check-rs exposing reusable modules.
pub mod auth;
pub mod checker;
pub mod config;
pub mod dns;
pub mod endpoint;
pub mod error;
pub mod geo;
pub mod probe;
pub mod ranges;
pub mod scanner;
pub mod server;
pub mod types;
