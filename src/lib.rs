//! # Berth
//!
//! A multi-tenant control plane for container-compose stacks running behind
//! remote agents, usable both as a standalone binary and as a library.
//!
//! ## Library Usage
//!
//! ```toml
//! [dependencies]
//! berth = { version = "0.0.1", default-features = false }
//! ```
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use berth::config::ServerConfig;
//! use berth::server::{AppState, create_router};
//! use berth::store::{SqliteStore, Store};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = ServerConfig::default();
//! let store = SqliteStore::new(config.db_path()).unwrap();
//! store.initialize().unwrap();
//!
//! let secrets = config.secret_box().unwrap();
//! let state = Arc::new(AppState::new(
//!     Arc::new(store),
//!     config,
//!     secrets,
//!     CancellationToken::new(),
//! ).unwrap());
//! state.queue.replay().await.unwrap();
//! state.queue.start_reaper();
//! let router = create_router(state);
//! // Serve with axum...
//! ```
//!
//! ## Feature Flags
//!
//! - `cli` (default): Includes CLI module. Disable with `default-features = false`.

pub mod agent;
pub mod audit;
pub mod auth;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod operations;
pub mod pattern;
pub mod queue;
pub mod rbac;
pub mod server;
pub mod store;
pub mod types;
pub mod webhook;
