//! Resumable upload state machine.
//!
//! A session is created by the `uploadType=resumable` POST, addressed by
//! an opaque ID, and mutated by chunk PUTs carrying
//! `Content-Range: bytes <first>-<last>/<total|*>`.  Chunks must arrive
//! in order; the accumulated bytes are committed to the backend as one
//! streaming write when the final chunk closes the declared total.
//!
//! The registry is a concurrent map: writer lock on create/delete,
//! per-session mutex on mutation, so chunk handling is serialized per
//! session.  Sessions expire after a configurable period of inactivity
//! (default one week) and are swept by a background task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::backend::types::{ObjectAttrs, Preconditions};
use crate::errors::ApiError;

/// Default session time-to-live: one week of inactivity.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// How often the background sweeper looks for expired sessions.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// -- Content-Range ------------------------------------------------------------

/// A parsed resumable `Content-Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentRange {
    /// `bytes <first>-<last>/<total|*>`: a chunk of payload.
    Chunk {
        first: u64,
        last: u64,
        total: Option<u64>,
    },
    /// `bytes */<total|*>`: no payload; a progress query, or a final
    /// size declaration for a zero-length tail.
    Query { total: Option<u64> },
}

/// Parse a `Content-Range` header of the resumable-upload dialect.
pub fn parse_content_range(value: &str) -> Result<ContentRange, ApiError> {
    let malformed =
        || ApiError::RangeNotSatisfiable(format!("malformed Content-Range header {value:?}"));

    let spec = value.trim().strip_prefix("bytes ").ok_or_else(malformed)?;
    let (range, total) = spec.split_once('/').ok_or_else(malformed)?;

    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse::<u64>().map_err(|_| malformed())?),
    };

    if range.trim() == "*" {
        return Ok(ContentRange::Query { total });
    }

    let (first, last) = range.split_once('-').ok_or_else(malformed)?;
    let first = first.trim().parse::<u64>().map_err(|_| malformed())?;
    let last = last.trim().parse::<u64>().map_err(|_| malformed())?;
    if last < first {
        return Err(malformed());
    }
    if let Some(total) = total {
        if last >= total {
            return Err(malformed());
        }
    }
    Ok(ContentRange::Chunk { first, last, total })
}

// -- Session ------------------------------------------------------------------

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Complete,
    Aborted,
}

/// What happened to a chunk.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// Chunk accepted; the session stays open with this many bytes.
    Incomplete { persisted: u64 },
    /// The final chunk arrived: the session is COMPLETE and the full
    /// content is handed back for the backend commit.
    Complete { content: Bytes },
}

/// One resumable upload in progress.
pub struct UploadSession {
    pub id: String,
    pub bucket: String,
    pub name: String,
    /// Object attributes declared when the session was started.
    pub attrs: ObjectAttrs,
    /// Preconditions applied at commit time.
    pub preconditions: Preconditions,
    pub state: SessionState,
    /// Declared total size; unknown until a chunk arrives with a closed
    /// range.
    pub total: Option<u64>,
    buffer: BytesMut,
    last_activity: Instant,
}

impl UploadSession {
    /// Bytes accumulated so far.
    pub fn persisted(&self) -> u64 {
        self.buffer.len() as u64
    }

    /// Apply one chunk PUT to the session.
    ///
    /// Rejected chunks leave the accumulated size unchanged.
    pub fn apply_chunk(&mut self, range: ContentRange, body: &[u8]) -> Result<ChunkOutcome, ApiError> {
        if self.state != SessionState::Open {
            return Err(ApiError::NotFound(format!(
                "upload session {} is no longer open",
                self.id
            )));
        }
        self.last_activity = Instant::now();
        let persisted = self.persisted();

        let (first, last, total) = match range {
            ContentRange::Query { total } => {
                self.reconcile_total(total)?;
                // A size-only declaration can complete an upload whose
                // bytes have all arrived (including the empty object).
                if self.total == Some(persisted) {
                    return Ok(self.complete());
                }
                return Ok(ChunkOutcome::Incomplete { persisted });
            }
            ContentRange::Chunk { first, last, total } => (first, last, total),
        };

        let expected_len = last - first + 1;
        if body.len() as u64 != expected_len {
            return Err(ApiError::Invalid(format!(
                "Content-Range declares {expected_len} bytes but the body carries {}",
                body.len()
            )));
        }
        self.reconcile_total(total)?;

        if first != persisted {
            // Out of order or overlapping; the client is expected to query
            // for the accumulated size and resume from there.
            return Err(ApiError::RangeNotSatisfiable(format!(
                "chunk starts at byte {first} but the session has {persisted} bytes"
            )));
        }

        self.buffer.extend_from_slice(body);

        if self.total == Some(last + 1) {
            Ok(self.complete())
        } else {
            Ok(ChunkOutcome::Incomplete {
                persisted: self.persisted(),
            })
        }
    }

    fn reconcile_total(&mut self, declared: Option<u64>) -> Result<(), ApiError> {
        match (self.total, declared) {
            (_, None) => Ok(()),
            (None, Some(t)) => {
                self.total = Some(t);
                Ok(())
            }
            (Some(existing), Some(t)) if existing == t => Ok(()),
            (Some(existing), Some(t)) => Err(ApiError::Invalid(format!(
                "declared total size {t} conflicts with previously declared {existing}"
            ))),
        }
    }

    fn complete(&mut self) -> ChunkOutcome {
        self.state = SessionState::Complete;
        let content = std::mem::take(&mut self.buffer).freeze();
        ChunkOutcome::Complete { content }
    }
}

// -- Registry -----------------------------------------------------------------

/// Registry of open resumable sessions.
pub struct UploadManager {
    sessions: RwLock<HashMap<String, Arc<Mutex<UploadSession>>>>,
    ttl: Duration,
}

impl UploadManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Start a session and return its opaque ID.
    pub async fn create(
        &self,
        bucket: &str,
        name: &str,
        attrs: ObjectAttrs,
        preconditions: Preconditions,
        total: Option<u64>,
    ) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let session = UploadSession {
            id: id.clone(),
            bucket: bucket.to_string(),
            name: name.to_string(),
            attrs,
            preconditions,
            state: SessionState::Open,
            total,
            buffer: BytesMut::new(),
            last_activity: Instant::now(),
        };
        self.sessions
            .write()
            .await
            .insert(id.clone(), Arc::new(Mutex::new(session)));
        debug!("started resumable session {id} for {bucket}/{name}");
        id
    }

    pub async fn get(&self, id: &str) -> Result<Arc<Mutex<UploadSession>>, ApiError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("upload session {id} not found")))
    }

    /// Drop a session: used after commit and by explicit aborts.
    pub async fn remove(&self, id: &str) -> Result<(), ApiError> {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(session) => {
                let mut session = session.lock().await;
                if session.state == SessionState::Open {
                    session.state = SessionState::Aborted;
                    session.buffer.clear();
                }
                Ok(())
            }
            None => Err(ApiError::NotFound(format!("upload session {id} not found"))),
        }
    }

    /// Abort every session idle longer than the TTL.
    pub async fn sweep_expired(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let ttl = self.ttl;
        let before = sessions.len();

        let mut expired = Vec::new();
        for (id, session) in sessions.iter() {
            if let Ok(session) = session.try_lock() {
                if session.last_activity.elapsed() > ttl {
                    expired.push(id.clone());
                }
            }
        }
        for id in &expired {
            sessions.remove(id);
        }

        let swept = before - sessions.len();
        if swept > 0 {
            info!("aborted {swept} expired upload sessions");
        }
        swept
    }

    /// Spawn the background TTL sweeper.
    pub fn start_sweeper(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                manager.sweep_expired().await;
            }
        });
    }
}
