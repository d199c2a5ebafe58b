pub mod action;
pub mod auth;
pub mod codec;
pub mod config;
pub mod error;
pub mod observability;
pub mod registry;
pub mod server;
pub mod storage;

pub use action::{Action, ActionDispatcher};
pub use config::Config;
pub use error::{DataApiError, Result};
pub use registry::ClusterRegistry;
pub use server::Server;
pub use storage::StorageEngine;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
