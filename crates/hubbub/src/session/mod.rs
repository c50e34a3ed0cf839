//! Conversation sessions for the HTTP backend.
//!
//! A session bundles a tool catalog (discovered once at creation), a
//! conversation owned by its [`worker`], and an event queue. The queue is
//! unbounded and has a single consumer at a time; events produced while
//! nobody is attached wait there until someone attaches or the session is
//! swept.

pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::AgentLoop;
use crate::events::{timestamp, Event, EventSink};
use crate::model::{declarations, ChatModel};
use crate::pool::{self, PoolError, ToolRecord};
use worker::{Command, Worker};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Tool discovery failed: {0}")]
    Discovery(#[from] PoolError),
}

/// Returned by [`SessionManager::create`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub created_at: String,
}

/// The consumer side of a session's event queue.
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

struct SessionEntry {
    created_at: DateTime<Utc>,
    last_active: Instant,
    catalog: Arc<[ToolRecord]>,
    sink: EventSink,
    events: Arc<Mutex<EventReceiver>>,
    mailbox: mpsc::UnboundedSender<Command>,
}

impl SessionEntry {
    fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    fn idle(&self) -> Duration {
        self.last_active.elapsed()
    }
}

/// A handle for reading one session's events.
///
/// [`EventStream::attach`] waits until no other observer holds the queue.
/// Dropping the guard detaches; the session keeps running either way.
pub struct EventStream {
    queue: Arc<Mutex<EventReceiver>>,
}

impl EventStream {
    pub async fn attach(self) -> OwnedMutexGuard<EventReceiver> {
        self.queue.lock_owned().await
    }
}

/// Registry of live sessions.
pub struct SessionManager {
    sessions: DashMap<String, SessionEntry>,
    model: Arc<dyn ChatModel>,
    agent: AgentLoop,
}

impl SessionManager {
    pub fn new(model: Arc<dyn ChatModel>, agent: AgentLoop) -> Self {
        Self {
            sessions: DashMap::new(),
            model,
            agent,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Discover tools, start a conversation and register the session.
    #[tracing::instrument(name = "hubbub.session.create", skip(self), fields(session_id))]
    pub async fn create(&self) -> Result<SessionInfo, SessionError> {
        let catalog = pool::scoped(self.agent.servers(), self.agent.connector(), |pool| {
            Box::pin(async move { pool.list_tools().await })
        })
        .await?;

        let id = Uuid::new_v4().simple().to_string();
        tracing::Span::current().record("session_id", id.as_str());

        let (sink, events) = EventSink::channel();
        let (mailbox, inbox) = mpsc::unbounded_channel();
        let created_at = Utc::now();

        Worker {
            session_id: id.clone(),
            model: self.model.clone(),
            agent: self.agent.clone(),
            declarations: declarations(&catalog).into(),
            sink: sink.clone(),
        }
        .spawn(inbox);

        tracing::info!(tools = catalog.len(), "session created");
        self.sessions.insert(
            id.clone(),
            SessionEntry {
                created_at,
                last_active: Instant::now(),
                catalog: catalog.into(),
                sink,
                events: Arc::new(Mutex::new(events)),
                mailbox,
            },
        );

        Ok(SessionInfo {
            session_id: id,
            created_at: timestamp(created_at),
        })
    }

    fn with_entry<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut SessionEntry) -> T,
    ) -> Result<T, SessionError> {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        entry.touch();
        Ok(f(entry.value_mut()))
    }

    fn send(&self, id: &str, command: Command) -> Result<(), SessionError> {
        self.with_entry(id, |entry| {
            if let Command::Message(text) = &command {
                entry.sink.emit(Event::user_message(text));
            }
            entry.mailbox.send(command)
        })?
        .map_err(|_| SessionError::NotFound(id.to_string()))
    }

    /// Queue a user message. Returns once it is queued, not when answered.
    pub fn post_message(&self, id: &str, text: &str) -> Result<(), SessionError> {
        tracing::debug!(session_id = %id, chars = text.len(), "message queued");
        self.send(id, Command::Message(text.to_string()))
    }

    /// Start a fresh conversation; id and catalog are kept.
    pub fn reset(&self, id: &str) -> Result<(), SessionError> {
        self.send(id, Command::Reset)
    }

    pub fn catalog(&self, id: &str) -> Result<Arc<[ToolRecord]>, SessionError> {
        self.with_entry(id, |entry| entry.catalog.clone())
    }

    pub fn created_at(&self, id: &str) -> Result<DateTime<Utc>, SessionError> {
        self.with_entry(id, |entry| entry.created_at)
    }

    /// The session's event queue, ready to attach.
    pub fn events(&self, id: &str) -> Result<EventStream, SessionError> {
        self.with_entry(id, |entry| EventStream {
            queue: entry.events.clone(),
        })
    }

    pub fn remove(&self, id: &str) -> Result<(), SessionError> {
        self.sessions
            .remove(id)
            .map(|_| tracing::info!(session_id = %id, "session removed"))
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Remove sessions idle longer than `ttl`. Returns how many went.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let mut removed = 0;
        self.sessions.retain(|id, entry| {
            let keep = entry.idle() <= ttl;
            if !keep {
                tracing::info!(session_id = %id, idle_secs = entry.idle().as_secs(), "session expired");
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            tracing::info!(removed, remaining = self.sessions.len(), "session sweep completed");
        }
        removed
    }
}

/// Periodically sweep idle sessions until `cancel` fires.
pub fn spawn_sweeper(
    manager: Arc<SessionManager>,
    interval: Duration,
    ttl: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("session sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    manager.sweep(ttl);
                }
            }
        }
    })
}
