//! Session management — owns the session record in durable storage and the
//! per-process liveness marker in volatile storage.
//!
//! A session is expired when its inactivity deadline has been reached, or when
//! no liveness marker exists for it, meaning no live process has touched it
//! since the last one went away.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use beacon_core::error::TrackerResult;
use beacon_core::types::{Properties, SessionInfo};

use crate::clock::Clock;
use crate::storage::KeyValueStore;

pub const SESSION_KEY: &str = "beacon.session";
const LIVENESS_PREFIX: &str = "beacon.session.live.";

pub struct SessionManager {
    durable: Arc<dyn KeyValueStore>,
    volatile: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    max_inactive_ms: i64,
}

impl SessionManager {
    pub fn new(
        durable: Arc<dyn KeyValueStore>,
        volatile: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        max_inactive_ms: i64,
    ) -> Self {
        Self {
            durable,
            volatile,
            clock,
            max_inactive_ms,
        }
    }

    /// Read the current session. Missing or unparseable records yield `None`.
    pub fn get_session(&self) -> Option<SessionInfo> {
        let raw = self.durable.get(SESSION_KEY)?;
        let mut session: SessionInfo = match serde_json::from_str(&raw) {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "ignoring corrupt session record");
                return None;
            }
        };
        session.is_expired = self.is_expired(&session);
        Some(session)
    }

    /// Start a new session, returning `(session_id, created_at, expired_at)`.
    pub fn create_session(&self, properties: Properties) -> TrackerResult<(String, i64, i64)> {
        let session_id = Uuid::new_v4().to_string();
        let created_at = self.clock.now_ms();
        let expired_at = created_at + self.max_inactive_ms;

        let session = SessionInfo {
            session_id: session_id.clone(),
            created_at,
            expired_at,
            last_activity_at: created_at,
            is_expired: false,
            properties,
        };
        self.durable
            .set(SESSION_KEY, &serde_json::to_string(&session)?)?;
        self.mark_live(&session_id)?;

        metrics::counter!("beacon.sessions.created").increment(1);
        debug!(session_id = %session_id, expired_at, "session created");
        Ok((session_id, created_at, expired_at))
    }

    /// Push the inactivity deadline forward. No-op when there is no record or
    /// the record belongs to another session.
    pub fn update_session(&self, session_id: &str) -> TrackerResult<()> {
        let Some(mut session) = self.get_session() else {
            return Ok(());
        };
        if session.session_id != session_id {
            debug!(
                current = %session.session_id,
                requested = %session_id,
                "skipping update for stale session id"
            );
            return Ok(());
        }

        let now = self.clock.now_ms();
        session.last_activity_at = now;
        session.expired_at = now + self.max_inactive_ms;
        self.durable
            .set(SESSION_KEY, &serde_json::to_string(&session)?)?;
        self.mark_live(session_id)
    }

    pub fn delete_session(&self) -> TrackerResult<()> {
        if let Some(session) = self.get_session() {
            if !session.session_id.is_empty() {
                self.volatile
                    .remove(&Self::liveness_key(&session.session_id))?;
            }
        }
        self.durable.remove(SESSION_KEY)
    }

    fn is_expired(&self, session: &SessionInfo) -> bool {
        if session.session_id.is_empty() {
            return true;
        }
        let live = self
            .volatile
            .get(&Self::liveness_key(&session.session_id))
            .is_some();
        !live || self.clock.now_ms() >= session.expired_at
    }

    fn mark_live(&self, session_id: &str) -> TrackerResult<()> {
        self.volatile.set(&Self::liveness_key(session_id), "1")
    }

    fn liveness_key(session_id: &str) -> String {
        format!("{LIVENESS_PREFIX}{session_id}")
    }
}
