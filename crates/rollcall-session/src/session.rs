use crate::config::{Config, ConfigError};
use chrono::{DateTime, Utc};
use rollcall_core::{
    enroll, find_best_match_with, find_duplicate, Embedding, EnrolledRecord, EnrollmentStore,
    MatchResult, SkipReason,
};
use rollcall_store::SqliteStore;
use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("store error: {0}")]
    Store(BoxError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(SkipReason),
    #[error("face already enrolled as {identity} ({similarity:.4} similarity)")]
    DuplicateFace { identity: String, similarity: f32 },
    #[error("failed to spawn session thread: {0}")]
    Spawn(std::io::Error),
    #[error("session thread exited")]
    ChannelClosed,
}

fn store_error<E>(err: E) -> SessionError
where
    E: std::error::Error + Send + Sync + 'static,
{
    SessionError::Store(Box::new(err))
}

/// A confirmed attendance entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceMark {
    pub identity: String,
    pub display_name: Option<String>,
    pub group: Option<String>,
    pub similarity: f32,
    pub marked_at: DateTime<Utc>,
}

/// Result of a check-in attempt.
#[derive(Debug, Clone)]
pub struct CheckInOutcome {
    pub result: MatchResult,
    /// True when this check-in created a new attendance mark.
    pub first_check_in: bool,
}

/// Result of an enrollment.
#[derive(Debug, Clone)]
pub struct EnrollOutcome {
    pub identity: String,
    /// Identities of records evicted to stay within capacity, oldest first.
    pub evicted: Vec<String>,
}

/// Messages sent from callers to the session thread.
enum SessionRequest {
    CheckIn {
        embedding: Embedding,
        group: Option<String>,
        reply: oneshot::Sender<Result<CheckInOutcome, SessionError>>,
    },
    Enroll {
        record: EnrolledRecord,
        reply: oneshot::Sender<Result<EnrollOutcome, SessionError>>,
    },
    Remove {
        identity: String,
        reply: oneshot::Sender<Result<usize, SessionError>>,
    },
    Attendance {
        reply: oneshot::Sender<Vec<AttendanceMark>>,
    },
    Clear {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
}

/// Clone-safe handle to the session thread.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionRequest>,
}

impl SessionHandle {
    /// Match a captured embedding against the enrolled set and mark attendance.
    ///
    /// `group` restricts candidates to one enrollment group.
    pub async fn check_in(
        &self,
        embedding: Embedding,
        group: Option<String>,
    ) -> Result<CheckInOutcome, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionRequest::CheckIn {
            embedding,
            group,
            reply,
        })
        .await?;
        rx.await.map_err(|_| SessionError::ChannelClosed)?
    }

    /// Enroll a face, evicting the oldest records beyond capacity.
    pub async fn enroll(&self, record: EnrolledRecord) -> Result<EnrollOutcome, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionRequest::Enroll { record, reply }).await?;
        rx.await.map_err(|_| SessionError::ChannelClosed)?
    }

    /// Remove every enrolled record of `identity`.
    pub async fn remove(&self, identity: impl Into<String>) -> Result<usize, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionRequest::Remove {
            identity: identity.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SessionError::ChannelClosed)?
    }

    /// Attendance marks in check-in order.
    pub async fn attendance(&self) -> Result<Vec<AttendanceMark>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionRequest::Attendance { reply }).await?;
        rx.await.map_err(|_| SessionError::ChannelClosed)
    }

    /// Drop every enrolled record and attendance mark.
    pub async fn clear(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionRequest::Clear { reply }).await?;
        rx.await.map_err(|_| SessionError::ChannelClosed)?
    }

    async fn send(&self, req: SessionRequest) -> Result<(), SessionError> {
        self.tx
            .send(req)
            .await
            .map_err(|_| SessionError::ChannelClosed)
    }
}

/// Open the SQLite store named by `config` and spawn a session on it.
///
/// Fails fast if the configuration is invalid or the store cannot be opened.
pub fn spawn_from_config(config: Config) -> Result<SessionHandle, SessionError> {
    config.validate()?;
    let store = SqliteStore::open(&config.db_path).map_err(store_error)?;
    spawn_session(store, config)
}

/// Spawn a session on a dedicated OS thread that owns `store`.
///
/// The thread exits once every [`SessionHandle`] has been dropped.
pub fn spawn_session<S>(store: S, config: Config) -> Result<SessionHandle, SessionError>
where
    S: EnrollmentStore + Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    config.validate()?;
    tracing::info!(
        match_threshold = config.match_threshold,
        capacity = config.capacity,
        reject_duplicates = config.reject_duplicates,
        "starting attendance session"
    );

    let (tx, mut rx) = mpsc::channel::<SessionRequest>(16);
    let mut worker = Worker {
        store,
        config,
        roster: Vec::new(),
        marked: HashSet::new(),
    };

    std::thread::Builder::new()
        .name("rollcall-session".into())
        .spawn(move || {
            tracing::info!("session thread started");
            while let Some(req) = rx.blocking_recv() {
                worker.handle(req);
            }
            tracing::info!("session thread exiting");
        })
        .map_err(SessionError::Spawn)?;

    Ok(SessionHandle { tx })
}

struct Worker<S> {
    store: S,
    config: Config,
    roster: Vec<AttendanceMark>,
    marked: HashSet<String>,
}

impl<S> Worker<S>
where
    S: EnrollmentStore,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    fn handle(&mut self, req: SessionRequest) {
        // A dropped reply receiver means the caller gave up; nothing to do.
        match req {
            SessionRequest::CheckIn {
                embedding,
                group,
                reply,
            } => {
                let _ = reply.send(self.check_in(&embedding, group.as_deref()));
            }
            SessionRequest::Enroll { record, reply } => {
                let _ = reply.send(self.enroll(record));
            }
            SessionRequest::Remove { identity, reply } => {
                let result = self.store.remove_identity(&identity).map_err(store_error);
                if let Ok(removed) = &result {
                    tracing::info!(identity = %identity, removed, "identity removed");
                }
                let _ = reply.send(result);
            }
            SessionRequest::Attendance { reply } => {
                let _ = reply.send(self.roster.clone());
            }
            SessionRequest::Clear { reply } => {
                let result = self.store.clear().map_err(store_error);
                if result.is_ok() {
                    self.roster.clear();
                    self.marked.clear();
                }
                let _ = reply.send(result);
            }
        }
    }

    fn check_in(
        &mut self,
        embedding: &Embedding,
        group: Option<&str>,
    ) -> Result<CheckInOutcome, SessionError> {
        if let Err(reason) = embedding.validate() {
            tracing::warn!(%reason, "rejected unusable check-in embedding");
            return Ok(CheckInOutcome {
                result: MatchResult::unusable_query(reason),
                first_check_in: false,
            });
        }

        let candidates = self.store.snapshot(group).map_err(store_error)?;
        let result = find_best_match_with(
            embedding,
            &candidates,
            self.config.match_threshold,
            |skipped| {
                tracing::warn!(
                    index = skipped.index,
                    identity = %skipped.identity,
                    reason = %skipped.reason,
                    "skipped incomparable candidate"
                );
            },
        );

        let mut first_check_in = false;
        if let (true, Some(identity)) = (result.matched, result.best_identity.as_ref()) {
            first_check_in = self.marked.insert(identity.clone());
            if first_check_in {
                let display_name = candidates
                    .iter()
                    .find(|c| &c.identity == identity)
                    .and_then(|c| c.metadata.display_name.clone());
                self.roster.push(AttendanceMark {
                    identity: identity.clone(),
                    display_name,
                    group: group.map(str::to_string),
                    similarity: result.similarity,
                    marked_at: Utc::now(),
                });
            }
            tracing::info!(
                identity = %identity,
                similarity = result.similarity,
                first_check_in,
                "check-in matched"
            );
        } else {
            tracing::debug!(
                candidates = candidates.len(),
                similarity = result.similarity,
                message = %result.message,
                "check-in did not match"
            );
        }

        Ok(CheckInOutcome {
            result,
            first_check_in,
        })
    }

    fn enroll(&mut self, record: EnrolledRecord) -> Result<EnrollOutcome, SessionError> {
        record
            .embedding
            .validate()
            .map_err(SessionError::InvalidEmbedding)?;
        if let Some(expected) = self.config.expected_dim() {
            let actual = record.embedding.dim();
            if actual != expected {
                return Err(SessionError::InvalidEmbedding(SkipReason::LengthMismatch {
                    expected,
                    actual,
                }));
            }
        }

        if self.config.reject_duplicates {
            let existing = self.store.snapshot(None).map_err(store_error)?;
            if let Some((dup, similarity)) = find_duplicate(
                &record.embedding,
                &existing,
                self.config.duplicate_threshold,
                Some(record.identity.as_str()),
            ) {
                tracing::warn!(
                    identity = %record.identity,
                    duplicate_of = %dup.identity,
                    similarity,
                    "rejected duplicate face"
                );
                return Err(SessionError::DuplicateFace {
                    identity: dup.identity.clone(),
                    similarity,
                });
            }
        }

        let identity = record.identity.clone();
        let evicted =
            enroll(&mut self.store, record, self.config.capacity).map_err(store_error)?;
        tracing::info!(identity = %identity, evicted = evicted.len(), "enrolled face");

        Ok(EnrollOutcome { identity, evicted })
    }
}
