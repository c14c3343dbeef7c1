//! In-memory track storage
//!
//! A mirror destination for setups that want fan-out without a second
//! directory on disk: tracks live in a map for the life of the process.
//! Catalog queries work the same way as on disk so tests can swap one in
//! for the authoritative slot too.

use super::{CatalogEntry, Destination};
use crate::error::ProtocolError;
use crate::gpx::{self, TrackSnapshot, DEFAULT_CATEGORY};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct MemoryDestination {
    tracks: HashMap<String, String>,
}

impl MemoryDestination {
    pub fn new() -> MemoryDestination {
        MemoryDestination::default()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    fn mint_ident(&self) -> String {
        let highest = self
            .tracks
            .keys()
            .filter_map(|k| k.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        (highest + 1).to_string()
    }
}

impl Destination for MemoryDestination {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn save(
        &mut self,
        ident: Option<&str>,
        track: &TrackSnapshot<'_>,
    ) -> Result<String, ProtocolError> {
        let ident = ident.map(str::to_string).unwrap_or_else(|| self.mint_ident());
        self.tracks.insert(ident.clone(), gpx::render_gpx(track));
        Ok(ident)
    }

    fn store_raw(&mut self, ident: Option<&str>, content: &str) -> Result<String, ProtocolError> {
        let ident = ident.map(str::to_string).unwrap_or_else(|| self.mint_ident());
        self.tracks.insert(ident.clone(), content.to_string());
        Ok(ident)
    }

    fn catalog(&self) -> Result<Vec<CatalogEntry>, ProtocolError> {
        let mut entries: Vec<CatalogEntry> = self
            .tracks
            .iter()
            .map(|(ident, text)| CatalogEntry {
                ident: ident.clone(),
                title: gpx::unescape_text(gpx::scan_field(text, "name").unwrap_or("")),
                category: gpx::scan_category(text)
                    .map(gpx::unescape_text)
                    .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
                time: gpx::scan_field(text, "time")
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or(DateTime::UNIX_EPOCH),
            })
            .collect();
        super::sort_catalog(&mut entries);
        Ok(entries)
    }

    fn read_raw(&self, ident: &str) -> Result<Option<String>, ProtocolError> {
        Ok(self.tracks.get(ident).cloned())
    }
}
