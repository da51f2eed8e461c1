//! mockgcs library — Google Cloud Storage emulator.
//!
//! This crate provides the pieces of an in-process GCS emulator: the
//! request dispatcher, the pluggable storage backends, the resumable
//! upload state machine, the notification registry, and the startup
//! seeder.

use std::sync::Arc;

pub mod backend;
pub mod checksum;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod notify;
pub mod resource;
pub mod seed;
pub mod server;
pub mod upload;
pub mod xml;

use crate::backend::store::Storage;
use crate::config::Config;
use crate::notify::NotificationRegistry;
use crate::upload::UploadManager;

/// Shared application state passed to all handlers via
/// `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Storage backend (in-memory or filesystem).
    pub storage: Arc<dyn Storage>,
    /// Resumable upload session registry.
    pub uploads: Arc<UploadManager>,
    /// Per-bucket notification configs and event fan-out.
    pub notifications: Arc<NotificationRegistry>,
}
