//! CubbyStore library -- S3-compatible object storage on a local filesystem.
//!
//! The storage engine ([`storage::ObjectStore`] and
//! [`storage::MultipartManager`]) is usable on its own; [`server::app`]
//! puts a thin S3 HTTP layer in front of it.

use std::sync::Arc;

pub mod chunked;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod metadata;
pub mod metrics;
pub mod pagination;
pub mod server;
pub mod storage;
pub mod xml;

use crate::config::Config;
use crate::storage::{MultipartManager, ObjectStore};

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Buckets and objects.
    pub store: Arc<ObjectStore>,
    /// In-flight multipart uploads.
    pub multipart: Arc<MultipartManager>,
}

impl AppState {
    /// Open the store and multipart manager at `config.storage.root_dir`,
    /// recovering whatever a previous process left behind.
    pub fn open(config: Config) -> Result<Self, errors::StoreError> {
        let store = Arc::new(ObjectStore::open(&config.storage.root_dir)?);
        let multipart = Arc::new(MultipartManager::open(Arc::clone(&store))?);
        Ok(Self {
            config,
            store,
            multipart,
        })
    }
}
