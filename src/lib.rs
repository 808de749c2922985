//! drive_sync - Two-way sync between a local folder and a Google Drive folder.
//!
//! This library provides functionality to:
//! - Scan a local tree and a Drive folder into comparable snapshots
//! - Reconcile both snapshots against the last synced state into a plan
//! - Execute the plan concurrently with retries, journaling every action
//! - Run one-shot transfers (recursive upload/download, tree and item listings)
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use drive_sync::{Authenticator, DriveClient, FolderRef, SyncConfig, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let auth = Authenticator::from_file("service-account.json")?;
//!     let client = DriveClient::new(auth);
//!
//!     let engine = SyncEngine::new(
//!         Arc::new(client),
//!         "./Documents",
//!         FolderRef::parse("https://drive.google.com/drive/folders/1abc123")?,
//!         SyncConfig::default(),
//!     );
//!     let report = engine.run().await?;
//!     println!("{}", report);
//!
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod batch;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod folder_ref;
pub mod logging;
pub mod models;
pub mod reconcile;
pub mod remote;
pub mod retry;
pub mod scan;
pub mod snapshot;
pub mod state;
pub mod transfer;

// Re-exports for convenience
pub use auth::Authenticator;
pub use client::DriveClient;
pub use config::SyncConfig;
pub use engine::{SyncEngine, SyncReport};
pub use error::{DriveError, Result, SyncError};
pub use folder_ref::{extract_id, FolderRef};
pub use models::FileMetadata;
pub use reconcile::{reconcile, Action, ConflictKind, ConflictPolicy, Plan};
pub use remote::RemoteStore;
pub use state::{Resolution, StateStore};
