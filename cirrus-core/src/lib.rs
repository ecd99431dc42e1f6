//! Cirrus Core
//!
//! Resource lifecycle engine for cloud provider plugins: schemas,
//! diffs, retries, and CRUD dispatch

pub mod context;
pub mod diag;
pub mod diff;
pub mod error;
pub mod ids;
pub mod lifecycle;
pub mod registry;
pub mod resource;
pub mod retry;
pub mod schema;
pub mod server;
pub mod state;
pub mod value;
pub mod waiter;
