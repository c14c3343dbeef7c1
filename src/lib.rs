//! Trackrelay - headless live-tracking server speaking the MapMyTracks protocol
//!
//! This crate provides the core functionality for relaying live GPS data:
//! - The vendor wire protocol (commands, XML envelope, point batches)
//! - Session reconstruction for trackers that never send a usable session id
//! - Fan-out of accumulated tracks to ordered storage destinations
//! - HTTP server emulating the vendor's path layout, headers, and fragments
//!
//! # Usage
//!
//! As a library:
//! ```ignore
//! use trackrelay::{Config, Core};
//!
//! let config = Config::from_file("~/.trackrelay/config.toml").unwrap();
//! let core = Core::new(config).unwrap();
//! // core.start_server().await.unwrap();
//! ```
//!
//! As a standalone server (CLI):
//! ```text
//! trackrelay --config ~/.trackrelay/config.toml
//! ```

pub mod api;
pub mod audit;
pub mod auth;
pub mod codec;
pub mod config;
pub mod error;
pub mod fanout;
pub mod gpx;
pub mod normalize;
pub mod registry;
pub mod storage;

// Re-export main types for convenience
pub use config::Config;
pub use error::{CoreError, Result};

use api::{AppState, TrackingState};
use audit::AuditLog;
use auth::AuthGate;
use fanout::DestinationSet;
use registry::SessionRegistry;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Core service that assembles configuration into a runnable server
pub struct Core {
    /// Configuration
    pub config: Config,
}

impl Core {
    /// Create a new Core instance with the given configuration
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Core { config })
    }

    /// Assemble the shared state every request handler works against:
    /// the destination chain, the credential gate next to the
    /// authoritative directory, and a fresh audit ring.
    pub fn build_state(&self) -> Result<AppState> {
        let mut destinations = Vec::with_capacity(self.config.destinations.len());
        for entry in &self.config.destinations {
            let path = entry
                .path
                .as_deref()
                .map(|p| config::expand_path(Path::new(p)));
            destinations.push(storage::build_destination(&entry.kind, path.as_deref())?);
        }

        let authoritative_dir = self.config.authoritative_path()?;

        Ok(AppState {
            tracking: Arc::new(tokio::sync::Mutex::new(TrackingState {
                registry: SessionRegistry::new(),
                destinations: DestinationSet::new(destinations),
            })),
            auth: Arc::new(AuthGate::new(&authoritative_dir)),
            audit: Arc::new(AuditLog::new(self.config.audit.capacity)),
            uniqueid: Uuid::new_v4().simple().to_string(),
        })
    }

    /// Start the HTTP server
    pub async fn start_server(&self) -> Result<()> {
        let state = self.build_state()?;
        api::serve(&self.config, state).await
    }
}
