//! The tracker table: one live session per sending device
//!
//! The wire protocol carries no reliable session identifier, so sessions are
//! correlated by whatever the request does offer: usually the sender's
//! network address, sometimes an explicit activity id. The registry keeps
//! one canonical store keyed by a generated uuid plus two secondary indexes
//! (address and minted identifier) pointing into it, so a session reachable
//! two ways is still a single object.
//!
//! Callers must hold the state lock for a whole request; the transitions
//! below assume no interleaving for the same sender.

use crate::codec::Point;
use crate::gpx::DEFAULT_CATEGORY;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::IpAddr;
use uuid::Uuid;

/// One in-progress live track.
#[derive(Debug, Clone)]
pub struct TrackingSession {
    pub key: Uuid,
    /// Minted by the authoritative destination on first write. Never
    /// changes once set.
    pub ident: Option<String>,
    pub sender: IpAddr,
    pub started_at: DateTime<Utc>,
    pub points: Vec<Point>,
    /// Terminal. Only ever flips false to true.
    pub done: bool,
    pub title: String,
    pub public: bool,
    pub category: String,
}

impl TrackingSession {
    fn new(sender: IpAddr) -> TrackingSession {
        TrackingSession {
            key: Uuid::new_v4(),
            ident: None,
            sender,
            started_at: Utc::now(),
            points: Vec::new(),
            done: false,
            title: String::new(),
            public: false,
            category: DEFAULT_CATEGORY.to_string(),
        }
    }
}

/// What a stop request ended up doing.
#[derive(Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// A specific session resolved and was finished.
    Stopped(Uuid),
    /// Nothing resolved; every active session was finished instead.
    StoppedAll(usize),
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<Uuid, TrackingSession>,
    by_addr: HashMap<IpAddr, Uuid>,
    by_ident: HashMap<String, Uuid>,
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        SessionRegistry::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.values().filter(|s| !s.done).count()
    }

    pub fn get(&self, key: Uuid) -> Option<&TrackingSession> {
        self.sessions.get(&key)
    }

    pub fn get_mut(&mut self, key: Uuid) -> Option<&mut TrackingSession> {
        self.sessions.get_mut(&key)
    }

    /// Start transition. Returns the session key and whether it was
    /// freshly created.
    ///
    /// A sender whose session is still active gets that session back, so
    /// duplicate start retries collapse into updates instead of forking a
    /// second track.
    pub fn start(&mut self, sender: IpAddr) -> (Uuid, bool) {
        if let Some(&key) = self.by_addr.get(&sender) {
            if self.sessions.get(&key).is_some_and(|s| !s.done) {
                tracing::debug!(%sender, session = %key, "start for a live session, treating as update");
                return (key, false);
            }
        }
        (self.create(sender), true)
    }

    /// Resolution for update/stop: explicit identifier first, sender
    /// address second.
    ///
    /// An identifier hit re-points the address index at that session, since
    /// a device may legitimately resurface from a new address mid-stream.
    pub fn resolve(&mut self, sender: IpAddr, ident: Option<&str>) -> Option<Uuid> {
        if let Some(ident) = ident.filter(|i| !i.is_empty()) {
            if let Some(&key) = self.by_ident.get(ident) {
                if self.by_addr.get(&sender) != Some(&key) {
                    tracing::debug!(%sender, ident, session = %key, "sender address moved, re-registering");
                    self.by_addr.insert(sender, key);
                    if let Some(session) = self.sessions.get_mut(&key) {
                        session.sender = sender;
                    }
                }
                return Some(key);
            }
        }
        if let Some(&key) = self.by_addr.get(&sender) {
            return Some(key);
        }
        if !self.sessions.is_empty() {
            tracing::warn!(%sender, ?ident, "request did not resolve to any session");
        }
        None
    }

    /// Update transition. A request that resolves to nothing creates a
    /// session on the fly rather than failing: the start was evidently
    /// lost, and refusing points would lose track data for good.
    pub fn update(&mut self, sender: IpAddr, ident: Option<&str>) -> (Uuid, bool) {
        if let Some(key) = self.resolve(sender, ident) {
            if self.sessions.get(&key).is_some_and(|s| s.done) {
                tracing::error!(session = %key, %sender, "points for a finished session, accepting anyway");
            }
            return (key, false);
        }
        tracing::warn!(%sender, "update without a known session, creating one");
        (self.create(sender), true)
    }

    /// Stop transition. When nothing resolves, every active session is
    /// finished: the plain form of the protocol carries no identifier, and
    /// there is no better guess to make.
    pub fn stop(&mut self, sender: IpAddr, ident: Option<&str>) -> StopOutcome {
        if let Some(key) = self.resolve(sender, ident) {
            if let Some(session) = self.sessions.get_mut(&key) {
                session.done = true;
                let elapsed = (Utc::now() - session.started_at).num_seconds();
                tracing::info!(session = %key, ident = ?session.ident, elapsed_secs = elapsed, "session finished");
            }
            return StopOutcome::Stopped(key);
        }
        let mut stopped = 0;
        for session in self.sessions.values_mut() {
            if !session.done {
                session.done = true;
                stopped += 1;
            }
        }
        tracing::info!(count = stopped, "unresolvable stop finished every active session");
        StopOutcome::StoppedAll(stopped)
    }

    pub fn append_points(&mut self, key: Uuid, points: &[Point]) {
        if let Some(session) = self.sessions.get_mut(&key) {
            session.points.extend_from_slice(points);
        }
    }

    /// Record the identifier the authoritative destination handed out and
    /// make the session reachable by it. A second assignment is ignored.
    pub fn assign_ident(&mut self, key: Uuid, ident: &str) {
        if let Some(session) = self.sessions.get_mut(&key) {
            if session.ident.is_none() {
                session.ident = Some(ident.to_string());
                self.by_ident.insert(ident.to_string(), key);
            }
        }
    }

    fn create(&mut self, sender: IpAddr) -> Uuid {
        self.evict_done_for(sender);
        let session = TrackingSession::new(sender);
        let key = session.key;
        tracing::info!(%sender, session = %key, "new session");
        self.sessions.insert(key, session);
        self.by_addr.insert(sender, key);
        key
    }

    /// Drop every finished session this sender left behind, from the store
    /// and both indexes. Runs whenever the sender gets a new session, which
    /// bounds growth from repeated start/stop cycles.
    fn evict_done_for(&mut self, sender: IpAddr) {
        let stale: Vec<Uuid> = self
            .sessions
            .values()
            .filter(|s| s.sender == sender && s.done)
            .map(|s| s.key)
            .collect();
        for key in &stale {
            if let Some(session) = self.sessions.remove(key) {
                if let Some(ident) = session.ident.as_deref() {
                    self.by_ident.remove(ident);
                }
                tracing::debug!(session = %key, %sender, "evicted stale session");
            }
        }
        // A migrated session can still be indexed under addresses it left
        // behind; none of them may keep pointing at an evicted key.
        self.by_addr.retain(|_, key| !stale.contains(key));
    }
}
