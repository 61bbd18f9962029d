// Library for the binary and tests

pub mod adapter;
pub mod bucket;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod resources;
pub mod routes;
pub mod scheduler;
pub mod store;
pub mod tasks;

pub use error::{Result, RollupError};
