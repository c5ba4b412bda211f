//! service-core: Shared infrastructure for the settlement workspace.
pub mod config;
pub mod error;
pub mod http;
pub mod middleware;
pub mod observability;
pub mod utils;
