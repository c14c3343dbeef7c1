//! Storage destinations for tracked sessions
//!
//! This module contains the destinations a session can be fanned out to.
//! The first configured destination is authoritative: it mints track
//! identifiers and answers catalog queries. Everything after it is a
//! best-effort mirror.

pub mod directory;
pub mod memory;

pub use directory::DirectoryDestination;
pub use memory::MemoryDestination;

use crate::error::{CoreError, ProtocolError};
use crate::gpx::TrackSnapshot;
use chrono::{DateTime, Utc};

/// One entry in the authoritative catalog listing.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub ident: String,
    pub title: String,
    pub category: String,
    pub time: DateTime<Utc>,
}

/// Numeric identifiers in order, anything else after them.
pub(crate) fn sort_catalog(entries: &mut [CatalogEntry]) {
    use std::cmp::Ordering;
    entries.sort_by(|a, b| match (a.ident.parse::<u64>(), b.ident.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.ident.cmp(&b.ident),
    });
}

/// Destination trait for track storage backends
pub trait Destination: Send {
    /// Get the destination name for logs
    fn name(&self) -> &'static str;

    /// Persist a full track snapshot. `ident` of `None` asks the
    /// destination to mint a fresh identifier; the identifier actually
    /// used is returned either way.
    fn save(&mut self, ident: Option<&str>, track: &TrackSnapshot<'_>)
        -> Result<String, ProtocolError>;

    /// Persist pre-serialized track text as delivered, without parsing it.
    fn store_raw(&mut self, ident: Option<&str>, content: &str) -> Result<String, ProtocolError>;

    /// List every stored track.
    fn catalog(&self) -> Result<Vec<CatalogEntry>, ProtocolError>;

    /// Stored text for one identifier, `None` when the id is unknown.
    fn read_raw(&self, ident: &str) -> Result<Option<String>, ProtocolError>;
}

/// Build a destination for the configured kind
pub fn build_destination(
    kind: &str,
    path: Option<&std::path::Path>,
) -> Result<Box<dyn Destination>, CoreError> {
    match kind {
        "directory" => {
            let path = path.ok_or_else(|| {
                CoreError::Config("destination kind \"directory\" needs a path".to_string())
            })?;
            Ok(Box::new(DirectoryDestination::new(path)?))
        }
        "memory" => Ok(Box::new(MemoryDestination::new())),
        other => Err(CoreError::Config(format!(
            "unknown destination kind \"{}\"",
            other
        ))),
    }
}
