//! Relay orchestration
//!
//! `RelayService` owns ingestion and connection: publishes construct an
//! event, land it in the in-process recent buffer, kick off a best-effort
//! durable append, and fan out to live subscribers before returning. Connects
//! subscribe first, then snapshot history, so nothing published concurrently
//! is missed.
//!
//! One instance per process, built explicitly at startup and injected into
//! the transport layer.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PublishError, StorageError};
use crate::event::{Event, EventKind, LogFamily, SessionKey};
use crate::kv::KvStore;
use crate::log::{collapse_charts, ChartState, DurableLog, LogConfig};
use crate::poll::{run_poller, PollCursors, DEFAULT_POLL_INTERVAL};
use crate::registry::SessionRegistry;
use crate::stream::StreamSession;

const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Producer-facing chart operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartAction {
    Add,
    Update,
    Remove,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub log: LogConfig,
    /// Fixed heartbeat interval for stream sessions
    pub heartbeat: Duration,
    /// Default interval for the polling transport
    pub poll_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            heartbeat: DEFAULT_HEARTBEAT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Snapshot of relay liveness, for health endpoints
#[derive(Debug, Clone, Serialize)]
pub struct RelayHealth {
    pub active_subscribers: usize,
    pub partitions: usize,
    pub storage: &'static str,
}

/// The process-wide relay instance
#[derive(Clone)]
pub struct RelayService<S: KvStore> {
    log: DurableLog<S>,
    registry: SessionRegistry,
    /// Recently published events that may not have reached storage yet,
    /// merged into connect-time history
    recent: Arc<DashMap<(LogFamily, SessionKey), VecDeque<Event>>>,
    config: Arc<RelayConfig>,
}

impl<S: KvStore> RelayService<S> {
    pub fn new(store: S, config: RelayConfig) -> Self {
        info!(storage = store.name(), "Relay starting");
        Self {
            log: DurableLog::new(store, config.log.clone()),
            registry: SessionRegistry::new(),
            recent: Arc::new(DashMap::new()),
            config: Arc::new(config),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Publish a webhook text message to a partition
    pub fn publish_message(
        &self,
        content: impl Into<String>,
        session: SessionKey,
    ) -> Result<Event, PublishError> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(PublishError::EmptyContent);
        }
        Ok(self.ingest(Event::new(EventKind::Message { content }, session)))
    }

    /// Publish a chart operation to a partition.
    ///
    /// `Remove` also initiates a hard delete of stored entries for the id,
    /// on top of the tombstone event delivered on the stream.
    pub fn publish_chart(
        &self,
        action: ChartAction,
        chart_id: impl Into<String>,
        config: Option<serde_json::Value>,
        session: SessionKey,
    ) -> Result<Event, PublishError> {
        let chart_id = chart_id.into();
        if chart_id.trim().is_empty() {
            return Err(PublishError::MissingChartId);
        }
        let kind = match action {
            ChartAction::Add | ChartAction::Update => EventKind::ChartUpsert {
                chart_id,
                config: config.ok_or(PublishError::MissingConfig)?,
            },
            ChartAction::Remove => EventKind::ChartRemove { chart_id },
        };

        let event = self.ingest(Event::new(kind, session));
        if let EventKind::ChartRemove { chart_id } = &event.kind {
            let log = self.log.clone();
            let session = event.session.clone();
            let chart_id = chart_id.clone();
            tokio::spawn(async move {
                if let Err(e) = log.remove_chart(&session, &chart_id).await {
                    warn!(chart_id, error = %e, "Stored chart removal failed");
                }
            });
        }
        Ok(event)
    }

    pub fn remove_chart(
        &self,
        chart_id: impl Into<String>,
        session: SessionKey,
    ) -> Result<Event, PublishError> {
        self.publish_chart(ChartAction::Remove, chart_id, None, session)
    }

    /// Buffer, persist (fire and forget) and fan out. Storage failure
    /// degrades to in-memory delivery; it never rejects the publish.
    fn ingest(&self, event: Event) -> Event {
        self.buffer(&event);

        let log = self.log.clone();
        let persisted = event.clone();
        tokio::spawn(async move {
            if let Err(e) = log.append(&persisted).await {
                warn!(
                    event_id = %persisted.id,
                    error = %e,
                    "Durable append failed, delivery degrades to in-memory"
                );
            }
        });

        let delivered = self.registry.fanout(&event);
        debug!(event_id = %event.id, session = ?event.session.as_option(), delivered, "Event published");
        event
    }

    fn buffer(&self, event: &Event) {
        let family = event.family();
        let mut deque = self
            .recent
            .entry((family, event.session.clone()))
            .or_default();
        if family == LogFamily::Chart {
            if let Some(chart_id) = event.chart_id() {
                deque.retain(|e| e.chart_id() != Some(chart_id));
            }
        }
        deque.push_back(event.clone());
        let cap = match family {
            LogFamily::Chart => self.config.log.chart_cap,
            LogFamily::Message => self.config.log.message_cap,
        };
        while deque.len() > cap {
            deque.pop_front();
        }
    }

    fn recent_events(&self, family: LogFamily, session: &SessionKey) -> Vec<Event> {
        self.recent
            .get(&(family, session.clone()))
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Open a push-transport stream: subscribe first, then snapshot history,
    /// so a concurrent publish lands in at least one of the two (the session
    /// dedups the overlap by id).
    pub async fn connect(&self, session: SessionKey) -> StreamSession {
        let (token, rx) = self.registry.subscribe(session.clone());
        let history = self.history(&session).await;
        info!(session = ?session.as_option(), history = history.len(), "Consumer connected");
        StreamSession::new(
            session,
            history,
            rx,
            self.registry.clone(),
            Some(token),
            self.config.heartbeat,
            CancellationToken::new(),
        )
    }

    /// Open a poll-transport stream: live delivery comes from a fixed-interval
    /// scan of the durable log past a high-water-mark cursor instead of
    /// in-process fan-out.
    pub async fn connect_polling(
        &self,
        session: SessionKey,
        interval: Option<Duration>,
    ) -> StreamSession {
        let history = self.history(&session).await;
        let cursors = PollCursors {
            message: last_id_of(&history, LogFamily::Message),
            chart: last_id_of(&history, LogFamily::Chart),
        };

        let (tx, rx) = mpsc::channel(128);
        let cancel = CancellationToken::new();
        tokio::spawn(run_poller(
            self.log.clone(),
            session.clone(),
            interval.unwrap_or(self.config.poll_interval),
            cursors,
            tx,
            cancel.clone(),
        ));

        info!(session = ?session.as_option(), history = history.len(), "Consumer connected (polling)");
        StreamSession::new(
            session,
            history,
            rx,
            self.registry.clone(),
            None,
            self.config.heartbeat,
            cancel,
        )
    }

    /// Connect-time history: stored events merged with the not-yet-persisted
    /// recent buffer, deduped by id, charts collapsed to their current state,
    /// ordered by publish time.
    async fn history(&self, session: &SessionKey) -> Vec<Event> {
        let mut messages = self
            .log
            .read_recent(LogFamily::Message, session, self.config.log.message_cap)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Message history read failed, serving in-memory only");
                Vec::new()
            });
        let seen: HashSet<String> = messages.iter().map(|e| e.id.clone()).collect();
        messages.extend(
            self.recent_events(LogFamily::Message, session)
                .into_iter()
                .filter(|e| !seen.contains(&e.id)),
        );
        if messages.len() > self.config.log.message_cap {
            messages.drain(0..messages.len() - self.config.log.message_cap);
        }

        let mut combined = messages;
        combined.extend(surviving_chart_events(
            self.merged_chart_events(session).await,
        ));
        // Stable sort: same-millisecond events keep their per-family publish order
        combined.sort_by_key(|e| e.timestamp_ms);
        combined
    }

    /// Stored chart log merged with buffered chart events, replace-on-id
    async fn merged_chart_events(&self, session: &SessionKey) -> Vec<Event> {
        let mut events = self
            .log
            .read_recent(LogFamily::Chart, session, self.config.log.chart_cap)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Chart history read failed, serving in-memory only");
                Vec::new()
            });
        let stored_ids: HashSet<String> = events.iter().map(|e| e.id.clone()).collect();
        for event in self.recent_events(LogFamily::Chart, session) {
            if stored_ids.contains(&event.id) {
                continue;
            }
            if let Some(chart_id) = event.chart_id() {
                events.retain(|e| e.chart_id() != Some(chart_id));
            }
            events.push(event);
        }
        events
    }

    /// Collapsed "currently active charts" view for pull-style clients
    pub async fn snapshot(&self, session: &SessionKey) -> Vec<ChartState> {
        collapse_charts(&self.merged_chart_events(session).await)
    }

    /// Wipe the in-process buffers and subscriber set for a partition.
    /// Returns the number of buffered events removed; a second call is a
    /// no-op returning zero. Durable logs are cleared separately.
    pub fn clear_session(&self, session: &SessionKey) -> usize {
        let removed: usize = [LogFamily::Message, LogFamily::Chart]
            .into_iter()
            .filter_map(|family| self.recent.remove(&(family, session.clone())))
            .map(|(_, deque)| deque.len())
            .sum();
        let dropped = self.registry.drop_partition(session);
        info!(session = ?session.as_option(), removed, dropped, "Session cleared");
        removed
    }

    /// Clear the stored logs for a partition. Idempotent.
    pub async fn clear_durable(&self, session: &SessionKey) -> Result<(), StorageError> {
        self.log.clear_session(session).await
    }

    pub fn health(&self) -> RelayHealth {
        RelayHealth {
            active_subscribers: self.registry.subscriber_count(),
            partitions: self.registry.partition_count(),
            storage: self.log.store_name(),
        }
    }
}

/// Surviving upsert events after applying the tombstone rule, oldest first
fn surviving_chart_events(events: Vec<Event>) -> Vec<Event> {
    let mut current: Vec<Event> = Vec::new();
    for event in events {
        match &event.kind {
            EventKind::ChartUpsert { chart_id, .. } => {
                let chart_id = chart_id.clone();
                current.retain(|e| e.chart_id() != Some(chart_id.as_str()));
                current.push(event);
            }
            EventKind::ChartRemove { chart_id } => {
                current.retain(|e| e.chart_id() != Some(chart_id.as_str()));
            }
            EventKind::Message { .. } => {}
        }
    }
    current
}

fn last_id_of(history: &[Event], family: LogFamily) -> Option<String> {
    history
        .iter()
        .rev()
        .find(|e| e.family() == family)
        .map(|e| e.id.clone())
}
