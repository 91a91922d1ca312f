//! PartKeeper library -- resumable multipart uploads in front of an
//! S3-compatible object store.
//!
//! This crate provides the upload session coordinator and its
//! collaborators: key normalization, pluggable session stores, remote
//! upload gateways, part staging, and the HTTP surface.

pub mod config;
pub mod coordinator;
pub mod errors;
pub mod gateway;
pub mod handlers;
pub mod metrics;
pub mod naming;
pub mod server;
pub mod session;
pub mod staging;

use crate::config::Config;
use crate::coordinator::UploadCoordinator;
use crate::staging::Stager;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Upload state machine over the session store and the remote gateway.
    pub coordinator: UploadCoordinator,
    /// Streams part bodies into temp files.
    pub stager: Stager,
}
