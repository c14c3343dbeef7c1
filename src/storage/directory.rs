//! File-backed track storage
//!
//! One `.gpx` file per track in a flat directory, named `{ident}.gpx`.
//! Identifiers are successive integers as plain strings: minting scans the
//! directory for the highest numeric stem and adds one, starting at `"1"`
//! in an empty directory. The directory destination is the only kind
//! allowed in the authoritative slot, because the credential file and the
//! catalog live here.

use super::{CatalogEntry, Destination};
use crate::error::{CoreError, ProtocolError};
use crate::gpx::{self, TrackSnapshot, DEFAULT_CATEGORY};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};

pub struct DirectoryDestination {
    root: PathBuf,
}

impl DirectoryDestination {
    /// Open (creating if missing) a track directory.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<DirectoryDestination, CoreError> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            fs::create_dir_all(&root)?;
            tracing::info!(path = %root.display(), "created track directory");
        }
        Ok(DirectoryDestination { root })
    }

    fn track_path(&self, ident: &str) -> PathBuf {
        self.root.join(format!("{}.gpx", ident))
    }

    /// Stems of every `.gpx` file present.
    fn list_idents(&self) -> Result<Vec<String>, ProtocolError> {
        let mut idents = Vec::new();
        let entries = fs::read_dir(&self.root).map_err(io_failure)?;
        for entry in entries {
            let entry = entry.map_err(io_failure)?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".gpx") {
                idents.push(stem.to_string());
            }
        }
        Ok(idents)
    }

    /// Highest numeric identifier plus one; `"1"` for a fresh directory.
    /// Non-numeric stems do not take part.
    fn mint_ident(&self) -> Result<String, ProtocolError> {
        let highest = self
            .list_idents()?
            .iter()
            .filter_map(|stem| stem.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        Ok((highest + 1).to_string())
    }

    fn write(&self, ident: &str, content: &str) -> Result<(), ProtocolError> {
        fs::write(self.track_path(ident), content).map_err(io_failure)
    }
}

fn io_failure(err: std::io::Error) -> ProtocolError {
    ProtocolError::Destination(err.to_string())
}

impl Destination for DirectoryDestination {
    fn name(&self) -> &'static str {
        "directory"
    }

    fn save(
        &mut self,
        ident: Option<&str>,
        track: &TrackSnapshot<'_>,
    ) -> Result<String, ProtocolError> {
        let ident = match ident {
            Some(ident) => ident.to_string(),
            None => self.mint_ident()?,
        };
        self.write(&ident, &gpx::render_gpx(track))?;
        tracing::debug!(ident, points = track.points.len(), "saved track");
        Ok(ident)
    }

    fn store_raw(&mut self, ident: Option<&str>, content: &str) -> Result<String, ProtocolError> {
        let ident = match ident {
            Some(ident) => ident.to_string(),
            None => self.mint_ident()?,
        };
        self.write(&ident, content)?;
        tracing::debug!(ident, bytes = content.len(), "stored uploaded track");
        Ok(ident)
    }

    fn catalog(&self) -> Result<Vec<CatalogEntry>, ProtocolError> {
        let mut entries = Vec::new();
        for ident in self.list_idents()? {
            let text = fs::read_to_string(self.track_path(&ident)).map_err(io_failure)?;
            let time = gpx::scan_field(&text, "time")
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or(DateTime::UNIX_EPOCH);
            entries.push(CatalogEntry {
                // Stored text is XML-escaped; the catalog hands back the
                // title as the tracker sent it.
                title: gpx::unescape_text(gpx::scan_field(&text, "name").unwrap_or("")),
                category: gpx::scan_category(&text)
                    .map(gpx::unescape_text)
                    .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
                time,
                ident,
            });
        }
        super::sort_catalog(&mut entries);
        Ok(entries)
    }

    fn read_raw(&self, ident: &str) -> Result<Option<String>, ProtocolError> {
        // tid comes straight off the query string; keep it inside the root.
        if ident.contains(['/', '\\']) || ident.contains("..") {
            return Ok(None);
        }
        match fs::read_to_string(self.track_path(ident)) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_failure(err)),
        }
    }
}
