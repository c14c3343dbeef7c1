//! Fan-out of track writes to the configured destinations
//!
//! The first destination is authoritative: its write must succeed, and on
//! a session's first write it mints the identifier the session then keeps.
//! Every later destination is a mirror receiving the same snapshot under
//! the same identifier, best effort. A mirror failure is logged and the
//! request succeeds anyway; there is no cross-destination transaction, so
//! a failed mirror simply lags until the session's next write reaches it.

use crate::error::ProtocolError;
use crate::gpx::TrackSnapshot;
use crate::registry::TrackingSession;
use crate::storage::{CatalogEntry, Destination};

pub struct DestinationSet {
    destinations: Vec<Box<dyn Destination>>,
}

impl DestinationSet {
    pub fn new(destinations: Vec<Box<dyn Destination>>) -> DestinationSet {
        DestinationSet { destinations }
    }

    /// Write a session's full accumulated track everywhere.
    ///
    /// Returns the identifier the authoritative destination used; the
    /// caller records it on the session after the first write.
    pub fn write(&mut self, session: &TrackingSession) -> Result<String, ProtocolError> {
        let snapshot = TrackSnapshot {
            title: &session.title,
            category: &session.category,
            public: session.public,
            points: &session.points,
        };
        let ident = self
            .authoritative_mut()?
            .save(session.ident.as_deref(), &snapshot)?;
        for mirror in self.destinations.iter_mut().skip(1) {
            if let Err(err) = mirror.save(Some(&ident), &snapshot) {
                tracing::warn!(destination = mirror.name(), ident, error = %err, "mirror write failed");
            }
        }
        Ok(ident)
    }

    /// Store uploaded track text as delivered, fanned out the same way.
    pub fn store_raw(&mut self, content: &str) -> Result<String, ProtocolError> {
        let ident = self.authoritative_mut()?.store_raw(None, content)?;
        for mirror in self.destinations.iter_mut().skip(1) {
            if let Err(err) = mirror.store_raw(Some(&ident), content) {
                tracing::warn!(destination = mirror.name(), ident, error = %err, "mirror upload failed");
            }
        }
        Ok(ident)
    }

    /// The authoritative catalog.
    pub fn catalog(&self) -> Result<Vec<CatalogEntry>, ProtocolError> {
        self.authoritative()?.catalog()
    }

    /// Stored text from the authoritative destination.
    pub fn read_raw(&self, ident: &str) -> Result<Option<String>, ProtocolError> {
        self.authoritative()?.read_raw(ident)
    }

    fn authoritative(&self) -> Result<&dyn Destination, ProtocolError> {
        self.destinations
            .first()
            .map(Box::as_ref)
            .ok_or_else(|| ProtocolError::Destination("no destinations configured".to_string()))
    }

    fn authoritative_mut(&mut self) -> Result<&mut Box<dyn Destination>, ProtocolError> {
        self.destinations
            .first_mut()
            .ok_or_else(|| ProtocolError::Destination("no destinations configured".to_string()))
    }
}
